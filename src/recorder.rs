// =============================================================================
// Recorder Sink — durable JSON-lines persistence of the live tick stream
// =============================================================================
//
// One `<game_id>.jsonl` file per game under the recordings directory. Lines
// buffer in memory and flush (write + fsync) when the buffer crosses the
// threshold, the flush interval elapses, or the game ends.
//
// Failure discipline:
//   - a failed flush is retried once after 50 ms;
//   - if the retry fails and the buffer has hit its ceiling, the oldest 25%
//     of lines are dropped (never the newest, which carry the game end);
//   - after `max_consecutive_failures` failed flushes recording stops and
//     `record_tick` returns `false` without buffering.
//
// The file handle lives inside the state mutex and is released on every
// exit path: game end, explicit `stop_recording`, and `Drop`.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::Disks;
use tracing::{debug, error, info, warn};

use crate::error::RecorderError;
use crate::runtime_config::RecorderConfig;
use crate::types::{GameSummary, GameTick, RecordLine};

/// Delay before the single flush retry.
const RETRY_DELAY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters exposed in the engine status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderStats {
    pub recorded_ticks_total: u64,
    pub dropped_ticks_total: u64,
    pub flush_failures_total: u64,
    pub games_recorded: u64,
    pub recording: bool,
}

// ---------------------------------------------------------------------------
// Internal state (behind the mutex)
// ---------------------------------------------------------------------------

struct RecState {
    file: Option<File>,
    path: Option<PathBuf>,
    game_id: Option<String>,
    buffer: Vec<String>,
    last_flush: Instant,
    consecutive_failures: u32,
    /// Cleared by repeated flush failure or `stop_recording`.
    active: bool,
    stats: RecorderStats,
}

// ---------------------------------------------------------------------------
// TickRecorder
// ---------------------------------------------------------------------------

/// Bounded, backpressure-aware writer persisting each live game to its own
/// JSON-lines file.
pub struct TickRecorder {
    dir: PathBuf,
    cfg: RecorderConfig,
    state: Mutex<RecState>,
}

impl TickRecorder {
    /// Create a recorder writing under `dir` (created if missing).
    pub fn new(dir: impl Into<PathBuf>, cfg: RecorderConfig) -> Result<Self, RecorderError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "recorder initialised");
        Ok(Self {
            dir,
            cfg,
            state: Mutex::new(RecState {
                file: None,
                path: None,
                game_id: None,
                buffer: Vec::new(),
                last_flush: Instant::now(),
                consecutive_failures: 0,
                active: true,
                stats: RecorderStats {
                    recording: true,
                    ..RecorderStats::default()
                },
            }),
        })
    }

    /// Begin a new `<game_id>.jsonl` file, closing any file left open by an
    /// unterminated game. Refuses to start when free disk space is below the
    /// configured floor.
    pub fn start_game(
        &self,
        game_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), RecorderError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(RecorderError::Stopped);
        }

        if state.file.is_some() {
            warn!(
                game_id = state.game_id.as_deref().unwrap_or("?"),
                "previous game file still open; flushing and closing"
            );
            let _ = self.flush_locked(&mut state);
            self.close_file_locked(&mut state);
        }

        if let Some(available) = available_disk_bytes(&self.dir) {
            if available < self.cfg.min_free_disk_bytes {
                return Err(RecorderError::InsufficientDiskSpace {
                    available,
                    required: self.cfg.min_free_disk_bytes,
                });
            }
        }

        let path = self.dir.join(format!("{game_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;

        let header = serde_json::to_string(&RecordLine::GameStart {
            game_id: game_id.to_string(),
            timestamp,
        })?;

        state.file = Some(file);
        state.path = Some(path.clone());
        state.game_id = Some(game_id.to_string());
        state.buffer.push(header);
        state.last_flush = Instant::now();

        info!(game_id, path = %path.display(), "recording game");
        Ok(())
    }

    /// Buffer one tick line. Returns `false` (without buffering) when
    /// recording has stopped, no game file is open, or the tick is rejected.
    pub fn record_tick(&self, tick: &GameTick) -> bool {
        let mut state = self.state.lock();
        if !state.active || state.file.is_none() {
            return false;
        }

        let line = match serde_json::to_string(&RecordLine::Tick { tick: tick.clone() }) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "tick serialisation failed; dropping");
                state.stats.dropped_ticks_total += 1;
                return false;
            }
        };
        if line.len() > self.cfg.max_tick_bytes {
            warn!(
                size = line.len(),
                limit = self.cfg.max_tick_bytes,
                "oversized tick rejected"
            );
            state.stats.dropped_ticks_total += 1;
            return false;
        }

        state.buffer.push(line);
        state.stats.recorded_ticks_total += 1;

        let interval = Duration::from_secs_f64(self.cfg.flush_interval_s);
        if state.buffer.len() >= self.cfg.flush_threshold_ticks
            || state.last_flush.elapsed() >= interval
        {
            let _ = self.flush_locked(&mut state);
        }
        true
    }

    /// Write the `game_end` trailer, flush everything, and close the file.
    pub fn finish_game(&self, summary: &GameSummary) -> Result<(), RecorderError> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            debug!(game_id = %summary.game_id, "finish_game without an open file");
            return Ok(());
        }

        let trailer = serde_json::to_string(&RecordLine::GameEnd {
            game_id: summary.game_id.clone(),
            total_ticks: summary.total_ticks,
            peak_price: summary.peak_price,
            rugged_at_tick: summary.rugged_at_tick,
        })?;
        state.buffer.push(trailer);

        let result = self.flush_locked(&mut state);
        self.close_file_locked(&mut state);
        state.stats.games_recorded += 1;
        info!(game_id = %summary.game_id, total_ticks = summary.total_ticks, "game file closed");
        result
    }

    /// Flush what can be flushed and release the file handle. Subsequent
    /// `record_tick` calls return `false`. Idempotent.
    pub fn stop_recording(&self) {
        let mut state = self.state.lock();
        if !state.active && state.file.is_none() {
            return;
        }
        let _ = self.flush_locked(&mut state);
        self.close_file_locked(&mut state);
        state.active = false;
        state.stats.recording = false;
        info!("recording stopped");
    }

    /// Current counters.
    pub fn stats(&self) -> RecorderStats {
        self.state.lock().stats.clone()
    }

    /// Path of the file currently being written, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Write + fsync the buffered lines. On failure: retry once after 50 ms;
    /// then trim the oldest 25% if the buffer hit its ceiling; stop
    /// recording entirely after too many consecutive failures.
    fn flush_locked(&self, state: &mut RecState) -> Result<(), RecorderError> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let payload = {
            let mut s = state.buffer.join("\n");
            s.push('\n');
            s
        };
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };

        let attempt = |file: &mut File| -> std::io::Result<()> {
            file.write_all(payload.as_bytes())?;
            file.sync_data()
        };

        let mut result = attempt(file);
        if let Err(ref e) = result {
            warn!(error = %e, "flush failed; retrying once");
            std::thread::sleep(RETRY_DELAY);
            result = attempt(file);
        }

        match result {
            Ok(()) => {
                state.buffer.clear();
                state.last_flush = Instant::now();
                state.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.stats.flush_failures_total += 1;
                error!(
                    error = %e,
                    consecutive = state.consecutive_failures,
                    buffered = state.buffer.len(),
                    "flush retry failed"
                );

                if state.buffer.len() >= self.cfg.max_buffer_size {
                    // Drop the oldest quarter; the newest lines likely carry
                    // the game end and must survive.
                    let drop_count = (state.buffer.len() / 4).max(1);
                    state.buffer.drain(..drop_count);
                    state.stats.dropped_ticks_total += drop_count as u64;
                    warn!(dropped = drop_count, "buffer ceiling hit; oldest lines dropped");
                }

                if state.consecutive_failures >= self.cfg.max_consecutive_failures {
                    error!(
                        failures = state.consecutive_failures,
                        "too many consecutive flush failures; stopping recording"
                    );
                    self.close_file_locked(state);
                    state.active = false;
                    state.stats.recording = false;
                }

                Err(RecorderError::WriteFailed(e))
            }
        }
    }

    fn close_file_locked(&self, state: &mut RecState) {
        if let Some(file) = state.file.take() {
            drop(file);
        }
        state.path = None;
        state.game_id = None;
        state.buffer.clear();
    }
}

impl Drop for TickRecorder {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

// ---------------------------------------------------------------------------
// Disk-space probe
// ---------------------------------------------------------------------------

/// Best-effort free-space lookup for the disk holding `path`. `None` when
/// the mount point cannot be identified.
fn available_disk_bytes(path: &Path) -> Option<u64> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_tick;
    use crate::types::Phase;
    use rust_decimal_macros::dec;

    fn summary(game_id: &str, total: u64) -> GameSummary {
        GameSummary {
            game_id: game_id.to_string(),
            total_ticks: total,
            peak_price: dec!(2.5),
            rugged_at_tick: Some(total - 1),
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn records_header_ticks_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TickRecorder::new(dir.path(), RecorderConfig::default()).unwrap();

        recorder.start_game("game-a", Utc::now()).unwrap();
        for i in 0..5 {
            let tick = sample_tick("game-a", i, dec!(1.5), Phase::ActiveGameplay);
            assert!(recorder.record_tick(&tick));
        }
        recorder.finish_game(&summary("game-a", 5)).unwrap();

        let lines = read_lines(&dir.path().join("game-a.jsonl"));
        assert_eq!(lines.len(), 7);
        assert!(lines[0].contains(r#""event":"game_start""#));
        assert!(lines[1].contains(r#""event":"tick""#));
        assert!(lines[6].contains(r#""event":"game_end""#));

        // Every line parses back.
        for line in &lines {
            serde_json::from_str::<RecordLine>(line).unwrap();
        }

        let stats = recorder.stats();
        assert_eq!(stats.recorded_ticks_total, 5);
        assert_eq!(stats.games_recorded, 1);
        assert_eq!(stats.dropped_ticks_total, 0);
    }

    #[test]
    fn threshold_triggers_intermediate_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig {
            flush_threshold_ticks: 3,
            ..RecorderConfig::default()
        };
        let recorder = TickRecorder::new(dir.path(), cfg).unwrap();

        recorder.start_game("game-b", Utc::now()).unwrap();
        for i in 0..3 {
            recorder.record_tick(&sample_tick("game-b", i, dec!(1.0), Phase::ActiveGameplay));
        }

        // The buffer (header + 2 ticks) hit the threshold and flushed; the
        // third tick is still buffered.
        let lines = read_lines(&dir.path().join("game-b.jsonl"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn record_after_stop_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TickRecorder::new(dir.path(), RecorderConfig::default()).unwrap();
        recorder.start_game("game-c", Utc::now()).unwrap();
        recorder.stop_recording();

        let tick = sample_tick("game-c", 1, dec!(1.0), Phase::ActiveGameplay);
        assert!(!recorder.record_tick(&tick));
        assert!(matches!(
            recorder.start_game("game-d", Utc::now()),
            Err(RecorderError::Stopped)
        ));
        assert!(!recorder.stats().recording);
    }

    #[test]
    fn stop_recording_twice_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TickRecorder::new(dir.path(), RecorderConfig::default()).unwrap();
        recorder.stop_recording();
        recorder.stop_recording();
        assert!(!recorder.stats().recording);
    }

    #[test]
    fn oversized_tick_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig {
            max_tick_bytes: 64,
            ..RecorderConfig::default()
        };
        let recorder = TickRecorder::new(dir.path(), cfg).unwrap();
        recorder.start_game("game-e", Utc::now()).unwrap();

        let tick = sample_tick(
            "game-with-an-id-long-enough-to-blow-the-sixty-four-byte-cap",
            1,
            dec!(1.0),
            Phase::ActiveGameplay,
        );
        assert!(!recorder.record_tick(&tick));
        assert_eq!(recorder.stats().dropped_ticks_total, 1);
        assert_eq!(recorder.stats().recorded_ticks_total, 0);
    }

    #[test]
    fn record_without_open_file_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TickRecorder::new(dir.path(), RecorderConfig::default()).unwrap();
        let tick = sample_tick("game-f", 1, dec!(1.0), Phase::ActiveGameplay);
        assert!(!recorder.record_tick(&tick));
    }

    #[test]
    fn new_game_closes_a_leftover_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TickRecorder::new(dir.path(), RecorderConfig::default()).unwrap();

        recorder.start_game("game-g", Utc::now()).unwrap();
        recorder.record_tick(&sample_tick("game-g", 1, dec!(1.0), Phase::ActiveGameplay));
        // No finish_game: the next start must flush and close the old file.
        recorder.start_game("game-h", Utc::now()).unwrap();

        let old_lines = read_lines(&dir.path().join("game-g.jsonl"));
        assert_eq!(old_lines.len(), 2);
        assert_eq!(
            recorder.current_path().unwrap(),
            dir.path().join("game-h.jsonl")
        );
    }

    #[test]
    fn disk_floor_refuses_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig {
            min_free_disk_bytes: u64::MAX,
            ..RecorderConfig::default()
        };
        let recorder = TickRecorder::new(dir.path(), cfg).unwrap();
        match recorder.start_game("game-i", Utc::now()) {
            Err(RecorderError::InsufficientDiskSpace { .. }) => {}
            // The probe is best-effort: an unidentifiable mount point skips
            // the check rather than blocking recording.
            Ok(()) => assert!(available_disk_bytes(dir.path()).is_none()),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
