// =============================================================================
// Replay Engine — dual-mode tick ingestion driving the ledger, recorder,
// ring buffer, and event bus in lockstep
// =============================================================================
//
// File mode: a single playback worker iterates a loaded tick array with
// wall-clock pacing derived from recorded timestamps. The worker is a
// cooperative state machine {Idle, Playing, Paused, Stopping} around a
// condition variable; `pause` freezes the in-flight sleep remainder,
// `resume` restores it, `seek` cancels it, `stop` is observed at every
// suspension point.
//
// Live mode: no backing array. The external feed calls `push_tick`; beyond
// the ring buffer only the most recent tick identity is retained (for
// duplicate dropping).
//
// Both modes share one ingestion path which owns the game-boundary
// bookkeeping: GAME_START and GAME_END are emitted exactly once per game,
// ticks are delivered to the ledger in order, and the per-tick
// STATE_CHANGED goes out only after the trade manager has resolved rug
// liquidation and sidebet expiry for that tick.
// =============================================================================

pub mod source;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, LedgerError, LifecycleError};
use crate::event_bus::{EngineEvent, EventBus};
use crate::history::GameHistory;
use crate::ledger::GameLedger;
use crate::recorder::{RecorderStats, TickRecorder};
use crate::runtime_config::PlaybackConfig;
use crate::trade::{TradeError, TradeManager};
use crate::types::{GameSummary, GameTick, Phase};

use self::source::{load_tick_file, scan_recordings_dir, FileTickSource, TickSource};

// ---------------------------------------------------------------------------
// Modes and playback state
// ---------------------------------------------------------------------------

/// Which feed drives this engine instance. Modes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    File,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopping,
}

// ---------------------------------------------------------------------------
// Shared worker state
// ---------------------------------------------------------------------------

struct PlaybackControl {
    state: PlaybackState,
    ticks: Arc<Vec<GameTick>>,
    cursor: usize,
    seek_to: Option<usize>,
    /// Sleep remainder frozen by `pause`, restored by `resume`.
    pending_sleep: Option<Duration>,
    /// One-shot request to process a single tick while paused.
    step_once: bool,
    playlist: Vec<PathBuf>,
    /// Index of the next playlist entry to load.
    playlist_pos: usize,
    current_file: Option<PathBuf>,
}

struct PlaybackShared {
    control: Mutex<PlaybackControl>,
    cond: Condvar,
}

/// Per-game bookkeeping for boundary detection and summaries.
#[derive(Debug, Default)]
struct GameTracker {
    game_id: Option<String>,
    started: bool,
    ended: bool,
    tick_count: u64,
    peak_price: Decimal,
    rugged_at_tick: Option<u64>,
    rug_seen: bool,
    /// Identity of the last accepted tick, for duplicate dropping.
    last_seen: Option<(String, u64)>,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Serialisable engine-level status for logging and external pollers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: EngineMode,
    pub playback_state: PlaybackState,
    pub current_game_id: Option<String>,
    pub current_file: Option<PathBuf>,
    pub ticks_processed_total: u64,
    pub duplicate_ticks_total: u64,
    pub malformed_ticks_total: u64,
    pub completed_games_held: usize,
    pub events_published: u64,
    pub events_dropped: u64,
    pub recorder: Option<RecorderStats>,
}

// ---------------------------------------------------------------------------
// ReplayEngine
// ---------------------------------------------------------------------------

/// Owns the tick flow from source to consumers. Components arrive by
/// constructor injection; none of them hold a reference back to the engine.
pub struct ReplayEngine {
    mode: EngineMode,
    playback_cfg: PlaybackConfig,
    bus: Arc<EventBus>,
    ledger: Arc<GameLedger>,
    trade: Arc<TradeManager>,
    /// Present in live mode only.
    recorder: Option<Arc<TickRecorder>>,
    history: Arc<GameHistory>,
    shared: Arc<PlaybackShared>,
    tracker: Mutex<GameTracker>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    ticks_processed_total: AtomicU64,
    duplicate_ticks_total: AtomicU64,
    malformed_ticks_total: AtomicU64,
}

impl ReplayEngine {
    pub fn new(
        mode: EngineMode,
        playback_cfg: PlaybackConfig,
        bus: Arc<EventBus>,
        ledger: Arc<GameLedger>,
        trade: Arc<TradeManager>,
        recorder: Option<Arc<TickRecorder>>,
        history: Arc<GameHistory>,
    ) -> Arc<Self> {
        if mode == EngineMode::File && recorder.is_some() {
            warn!("recorder attached in file mode; it will not be driven");
        }
        info!(?mode, "replay engine constructed");
        Arc::new(Self {
            mode,
            playback_cfg,
            bus,
            ledger,
            trade,
            recorder: match mode {
                EngineMode::Live => recorder,
                EngineMode::File => None,
            },
            history,
            shared: Arc::new(PlaybackShared {
                control: Mutex::new(PlaybackControl {
                    state: PlaybackState::Idle,
                    ticks: Arc::new(Vec::new()),
                    cursor: 0,
                    seek_to: None,
                    pending_sleep: None,
                    step_once: false,
                    playlist: Vec::new(),
                    playlist_pos: 0,
                    current_file: None,
                }),
                cond: Condvar::new(),
            }),
            tracker: Mutex::new(GameTracker::default()),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
            ticks_processed_total: AtomicU64::new(0),
            duplicate_ticks_total: AtomicU64::new(0),
            malformed_ticks_total: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // File mode: loading
    // -------------------------------------------------------------------------

    /// Parse one recording and stage it for playback. File mode only;
    /// rejected while playback is running.
    pub fn load(&self, path: &Path) -> Result<usize, EngineError> {
        let mut file_source = FileTickSource::load(path)?;
        let malformed = file_source.loaded().malformed_lines;
        let count = self.load_source(&mut file_source, Some(path.to_path_buf()))?;
        self.malformed_ticks_total
            .fetch_add(malformed, Ordering::Relaxed);
        Ok(count)
    }

    /// Drain any [`TickSource`] into the playback array.
    pub fn load_source(
        &self,
        tick_source: &mut dyn TickSource,
        origin: Option<PathBuf>,
    ) -> Result<usize, EngineError> {
        if self.mode != EngineMode::File {
            return Err(LifecycleError::WrongMode { expected: "file" }.into());
        }

        let mut ticks = Vec::new();
        while let Some(tick) = tick_source.next_tick() {
            ticks.push(tick);
        }
        let count = ticks.len();

        let mut ctl = self.shared.control.lock();
        if matches!(ctl.state, PlaybackState::Playing | PlaybackState::Stopping) {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        ctl.ticks = Arc::new(ticks);
        ctl.cursor = 0;
        ctl.seek_to = None;
        ctl.pending_sleep = None;
        ctl.current_file = origin;

        info!(
            ticks = count,
            file = ?ctl.current_file,
            "playback source loaded"
        );
        Ok(count)
    }

    /// Queue every recording in `dir` (chronological) and start playing the
    /// first loadable one. Returns the number of queued files.
    pub fn play_directory(self: &Arc<Self>, dir: &Path) -> Result<usize, EngineError> {
        let files = scan_recordings_dir(dir).map_err(|source| EngineError::SourceIo {
            path: dir.to_path_buf(),
            source,
        })?;
        if files.is_empty() {
            return Err(EngineError::EmptySource {
                path: dir.to_path_buf(),
            });
        }
        let total = files.len();

        {
            let mut ctl = self.shared.control.lock();
            if matches!(ctl.state, PlaybackState::Playing | PlaybackState::Stopping) {
                return Err(EngineError::Lifecycle(LifecycleError::AlreadyStarted));
            }
            ctl.playlist = files;
            ctl.playlist_pos = 0;
        }

        // Load the first parseable entry; skip broken files with a warning.
        loop {
            let next = {
                let mut ctl = self.shared.control.lock();
                if ctl.playlist_pos >= ctl.playlist.len() {
                    None
                } else {
                    let path = ctl.playlist[ctl.playlist_pos].clone();
                    ctl.playlist_pos += 1;
                    Some(path)
                }
            };
            let Some(path) = next else {
                return Err(EngineError::EmptySource {
                    path: dir.to_path_buf(),
                });
            };
            match self.load(&path) {
                Ok(_) => break,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unloadable recording"),
            }
        }

        self.play()?;
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // File mode: transport controls
    // -------------------------------------------------------------------------

    /// Start (or resume from Idle) the playback worker. File mode only.
    pub fn play(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.mode != EngineMode::File {
            return Err(LifecycleError::WrongMode { expected: "file" }.into());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(LifecycleError::Terminated.into());
        }

        {
            let mut ctl = self.shared.control.lock();
            if ctl.ticks.is_empty() {
                return Err(LifecycleError::NothingLoaded.into());
            }
            ctl.state = PlaybackState::Playing;
        }

        let mut worker = self.worker.lock();
        if worker.is_none() {
            let engine = self.clone();
            *worker = Some(
                std::thread::Builder::new()
                    .name("playback".to_string())
                    .spawn(move || engine.playback_loop())
                    .expect("failed to spawn playback worker"),
            );
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Freeze playback at the next suspension point, preserving the
    /// remainder of any in-flight pacing sleep.
    pub fn pause(&self) {
        let mut ctl = self.shared.control.lock();
        if ctl.state == PlaybackState::Playing {
            ctl.state = PlaybackState::Paused;
            info!("playback paused");
        }
        self.shared.cond.notify_all();
    }

    /// Resume from pause, continuing any frozen sleep remainder.
    pub fn resume(&self) {
        let mut ctl = self.shared.control.lock();
        if ctl.state == PlaybackState::Paused {
            ctl.state = PlaybackState::Playing;
            info!("playback resumed");
        }
        self.shared.cond.notify_all();
    }

    /// Process exactly one tick while paused.
    pub fn step(&self) {
        let mut ctl = self.shared.control.lock();
        if ctl.state == PlaybackState::Paused {
            ctl.step_once = true;
        }
        self.shared.cond.notify_all();
    }

    /// Jump the cursor; cancels the pending pacing sleep.
    pub fn seek(&self, index: usize) {
        let mut ctl = self.shared.control.lock();
        let clamped = index.min(ctl.ticks.len());
        ctl.seek_to = Some(clamped);
        ctl.pending_sleep = None;
        debug!(index = clamped, "seek requested");
        self.shared.cond.notify_all();
    }

    /// Block until the worker has drained the playlist and gone idle.
    pub fn wait_until_idle(&self) {
        let mut ctl = self.shared.control.lock();
        while ctl.state != PlaybackState::Idle {
            self.shared.cond.wait(&mut ctl);
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop everything: the playback worker exits at its next suspension
    /// point, the in-progress game is finalised, the recorder flushes and
    /// closes, and the event bus drains with a timeout. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut ctl = self.shared.control.lock();
            ctl.state = PlaybackState::Stopping;
        }
        self.shared.cond.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("playback worker panicked during shutdown");
            }
        }

        // Finalise whatever game was in flight so recordings get their
        // trailer and the ring buffer its summary.
        {
            let mut tracker = self.tracker.lock();
            self.finish_game_locked(&mut tracker);
        }
        if let Some(recorder) = &self.recorder {
            recorder.stop_recording();
        }

        {
            let mut ctl = self.shared.control.lock();
            ctl.state = PlaybackState::Idle;
        }
        self.shared.cond.notify_all();

        self.bus.stop(Duration::from_secs(2));
        info!("engine stopped");
    }

    // -------------------------------------------------------------------------
    // Live mode
    // -------------------------------------------------------------------------

    /// Ingest one tick pushed by the external feed. Live mode only.
    /// A duplicate `(game_id, tick)` pair is dropped silently.
    pub fn push_tick(&self, tick: GameTick) -> Result<(), EngineError> {
        if self.mode != EngineMode::Live {
            return Err(LifecycleError::WrongMode { expected: "live" }.into());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(LifecycleError::Terminated.into());
        }
        self.process_tick(&tick)
    }

    /// Record a malformed feed line (counted, never fatal).
    pub fn note_malformed_tick(&self) {
        self.malformed_ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        let (playback_state, current_file) = {
            let ctl = self.shared.control.lock();
            (ctl.state, ctl.current_file.clone())
        };
        let current_game_id = self.tracker.lock().game_id.clone();

        EngineStatus {
            mode: self.mode,
            playback_state,
            current_game_id,
            current_file,
            ticks_processed_total: self.ticks_processed_total.load(Ordering::Relaxed),
            duplicate_ticks_total: self.duplicate_ticks_total.load(Ordering::Relaxed),
            malformed_ticks_total: self.malformed_ticks_total.load(Ordering::Relaxed),
            completed_games_held: self.history.len(),
            events_published: self.bus.published_events(),
            events_dropped: self.bus.dropped_events(),
            recorder: self.recorder.as_ref().map(|r| r.stats()),
        }
    }

    // -------------------------------------------------------------------------
    // Playback worker
    // -------------------------------------------------------------------------

    fn playback_loop(self: Arc<Self>) {
        info!("playback worker started");
        enum Next {
            Tick {
                tick: GameTick,
                next_ts: Option<DateTime<Utc>>,
                pace: bool,
            },
            EndOfFile,
            Exit,
        }

        loop {
            let next = {
                let mut ctl = self.shared.control.lock();
                loop {
                    match ctl.state {
                        PlaybackState::Stopping => break Next::Exit,
                        PlaybackState::Idle => {
                            self.shared.cond.wait(&mut ctl);
                        }
                        PlaybackState::Paused if !ctl.step_once => {
                            self.shared.cond.wait(&mut ctl);
                        }
                        PlaybackState::Paused | PlaybackState::Playing => {
                            let stepping = ctl.state == PlaybackState::Paused;
                            ctl.step_once = false;
                            if stepping {
                                // A step consumes any frozen sleep remainder.
                                ctl.pending_sleep = None;
                            }
                            if let Some(ix) = ctl.seek_to.take() {
                                ctl.cursor = ix;
                                ctl.pending_sleep = None;
                            }
                            if ctl.cursor >= ctl.ticks.len() {
                                break Next::EndOfFile;
                            }
                            let tick = ctl.ticks[ctl.cursor].clone();
                            ctl.cursor += 1;
                            let next_ts = ctl.ticks.get(ctl.cursor).map(|t| t.timestamp);
                            break Next::Tick {
                                tick,
                                next_ts,
                                pace: !stepping,
                            };
                        }
                    }
                }
            };

            match next {
                Next::Exit => break,
                Next::EndOfFile => {
                    if !self.advance_file() {
                        // Playlist exhausted (or paused/auto-advance off):
                        // park and wait for new input.
                        let mut ctl = self.shared.control.lock();
                        if ctl.state != PlaybackState::Stopping {
                            ctl.state = PlaybackState::Idle;
                        }
                        drop(ctl);
                        self.shared.cond.notify_all();
                    }
                }
                Next::Tick { tick, next_ts, pace } => {
                    match self.process_tick(&tick) {
                        Err(EngineError::Ledger(LedgerError::InvariantViolation(msg))) => {
                            error!(%msg, "invariant violation; halting playback");
                            self.halt_playback();
                            continue;
                        }
                        Err(e) => {
                            // A lock timeout fails this tick, not the run.
                            warn!(error = %e, tick = tick.tick, "tick failed; continuing");
                        }
                        Ok(()) => {}
                    }
                    if pace {
                        if let Some(interval) = self.interval_for(&tick, next_ts) {
                            self.pace(interval);
                        }
                    }
                }
            }
        }
        info!("playback worker exited");
    }

    /// Inter-tick sleep: recorded timestamp delta, clamped to the configured
    /// bounds, divided by the speed multiplier.
    fn interval_for(&self, tick: &GameTick, next_ts: Option<DateTime<Utc>>) -> Option<Duration> {
        let next = next_ts?;
        let min = Duration::from_millis(self.playback_cfg.min_tick_interval_ms);
        let max = Duration::from_secs_f64(self.playback_cfg.max_tick_interval_s);
        let delta = (next - tick.timestamp).to_std().unwrap_or(Duration::ZERO);
        Some(delta.clamp(min, max).div_f64(self.playback_cfg.speed))
    }

    /// Interruptible sleep. Pause freezes the remainder; resume continues
    /// it; seek and stop cancel it.
    fn pace(&self, interval: Duration) {
        let mut ctl = self.shared.control.lock();
        let mut remaining = ctl.pending_sleep.take().unwrap_or(interval);

        loop {
            match ctl.state {
                PlaybackState::Stopping | PlaybackState::Idle => return,
                PlaybackState::Paused => {
                    if ctl.step_once {
                        // A step while paused skips the rest of this sleep.
                        return;
                    }
                    ctl.pending_sleep = Some(remaining);
                    self.shared.cond.wait(&mut ctl);
                    remaining = ctl.pending_sleep.take().unwrap_or(remaining);
                    continue;
                }
                PlaybackState::Playing => {}
            }
            if ctl.seek_to.is_some() || remaining.is_zero() {
                return;
            }

            let started = Instant::now();
            let deadline = started + remaining;
            let timed_out = self
                .shared
                .cond
                .wait_until(&mut ctl, deadline)
                .timed_out();
            if timed_out {
                return;
            }
            remaining = remaining.saturating_sub(started.elapsed());
        }
    }

    /// Finish the current game and move to the next playlist entry. Returns
    /// `false` when playback should go idle instead.
    fn advance_file(&self) -> bool {
        {
            let mut tracker = self.tracker.lock();
            self.finish_game_locked(&mut tracker);
        }

        loop {
            let next_path = {
                let mut ctl = self.shared.control.lock();
                if ctl.state != PlaybackState::Playing || !self.playback_cfg.auto_advance {
                    return false;
                }
                if ctl.playlist_pos >= ctl.playlist.len() {
                    info!("playlist complete");
                    return false;
                }
                let path = ctl.playlist[ctl.playlist_pos].clone();
                ctl.playlist_pos += 1;
                path
            };

            match load_tick_file(&next_path) {
                Ok(loaded) => {
                    self.malformed_ticks_total
                        .fetch_add(loaded.malformed_lines, Ordering::Relaxed);
                    let mut ctl = self.shared.control.lock();
                    ctl.ticks = Arc::new(loaded.ticks);
                    ctl.cursor = 0;
                    ctl.pending_sleep = None;
                    ctl.current_file = Some(next_path.clone());
                    info!(path = %next_path.display(), "advanced to next recording");
                    return true;
                }
                Err(e) => {
                    warn!(path = %next_path.display(), error = %e, "skipping unloadable recording");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared ingestion path
    // -------------------------------------------------------------------------

    fn process_tick(&self, tick: &GameTick) -> Result<(), EngineError> {
        let mut tracker = self.tracker.lock();

        // Duplicate (game_id, tick) pairs are dropped outright.
        if tracker
            .last_seen
            .as_ref()
            .is_some_and(|(g, t)| g == &tick.game_id && *t == tick.tick)
        {
            self.duplicate_ticks_total.fetch_add(1, Ordering::Relaxed);
            debug!(game_id = %tick.game_id, tick = tick.tick, "duplicate tick dropped");
            return Ok(());
        }

        // A regression inside a game is malformed input, not a new state.
        if tracker.game_id.as_deref() == Some(tick.game_id.as_str()) {
            if tracker.ended {
                // Trailing frames (cooldown) after GAME_END; the next game
                // announces itself with a fresh game_id.
                debug!(game_id = %tick.game_id, tick = tick.tick, "tick after game end ignored");
                return Ok(());
            }
            if let Some((_, last)) = &tracker.last_seen {
                if tick.tick < *last {
                    self.malformed_ticks_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        game_id = %tick.game_id,
                        tick = tick.tick,
                        last = *last,
                        "tick index regressed; skipping"
                    );
                    return Ok(());
                }
            }
        }

        // Game boundary: finish the previous game, rotate the ring buffer,
        // reset the ledger, open a recording, announce the start.
        if tracker.game_id.as_deref() != Some(tick.game_id.as_str()) {
            self.finish_game_locked(&mut tracker);

            self.history.start_game(&tick.game_id);
            self.ledger.reset(self.mode == EngineMode::Live)?;

            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.start_game(&tick.game_id, tick.timestamp) {
                    // Recorder trouble never stops the engine.
                    warn!(error = %e, "recorder could not start game file");
                    self.bus.publish(EngineEvent::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }

            *tracker = GameTracker {
                game_id: Some(tick.game_id.clone()),
                started: true,
                ..GameTracker::default()
            };

            self.bus.publish(EngineEvent::GameStart {
                game_id: tick.game_id.clone(),
                timestamp: tick.timestamp,
            });
            info!(game_id = %tick.game_id, "game started");
        }

        tracker.last_seen = Some((tick.game_id.clone(), tick.tick));
        tracker.tick_count += 1;
        tracker.peak_price = tracker.peak_price.max(tick.price);
        let newly_rugged = tick.rugged && !tracker.rug_seen;
        if newly_rugged {
            tracker.rug_seen = true;
            tracker.rugged_at_tick = Some(tick.tick);
        }

        // Ledger first, then per-tick trade resolution, in tick order.
        self.ledger.apply_tick(tick)?;
        if let Err(e) = self.trade.on_tick(tick) {
            match e {
                TradeError::EngineHalted => {
                    return Err(LedgerError::InvariantViolation(
                        "trade resolution hit a halted ledger".to_string(),
                    )
                    .into());
                }
                other => warn!(error = %other, tick = tick.tick, "trade resolution failed"),
            }
        }

        if let Some(recorder) = &self.recorder {
            recorder.record_tick(tick);
        }
        self.history.ingest_tick(tick);
        self.ticks_processed_total.fetch_add(1, Ordering::Relaxed);

        self.bus.publish(EngineEvent::GameTick { tick: tick.clone() });
        match self.ledger.snapshot() {
            Ok(snapshot) => self.bus.publish(EngineEvent::StateChanged { snapshot }),
            Err(e) => warn!(error = %e, "snapshot for STATE_CHANGED failed"),
        }

        if newly_rugged {
            self.bus.publish(EngineEvent::RugDetected {
                game_id: tick.game_id.clone(),
                tick: tick.tick,
                price: tick.price,
            });
        }

        // Entering RUG_EVENT terminates the game.
        if tick.phase == Phase::RugEvent && !tracker.ended {
            self.finish_game_locked(&mut tracker);
        }

        Ok(())
    }

    /// Emit GAME_END (once), close the recording, and finalise the ring
    /// buffer session for the game tracked by `tracker`.
    fn finish_game_locked(&self, tracker: &mut GameTracker) {
        if !tracker.started || tracker.ended {
            return;
        }
        let Some(game_id) = tracker.game_id.clone() else {
            return;
        };
        tracker.ended = true;

        let summary = GameSummary {
            game_id,
            total_ticks: tracker.tick_count,
            peak_price: tracker.peak_price,
            rugged_at_tick: tracker.rugged_at_tick,
        };

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.finish_game(&summary) {
                warn!(error = %e, "recorder failed to close game file");
                self.bus.publish(EngineEvent::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
        self.history.complete_game(&summary);

        info!(
            game_id = %summary.game_id,
            total_ticks = summary.total_ticks,
            peak = %summary.peak_price,
            rugged_at = ?summary.rugged_at_tick,
            "game ended"
        );
        self.bus.publish(EngineEvent::GameEnd { summary });
    }

    /// Invariant breach: freeze playback and seal the recording. Commands
    /// stay refused by the halted ledger until `reset`.
    fn halt_playback(&self) {
        {
            let mut ctl = self.shared.control.lock();
            if ctl.state != PlaybackState::Stopping {
                ctl.state = PlaybackState::Idle;
            }
        }
        self.shared.cond.notify_all();
        if let Some(recorder) = &self.recorder {
            recorder.stop_recording();
        }
    }
}
