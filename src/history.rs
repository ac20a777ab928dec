// =============================================================================
// Live Ring Buffer — the last N completed games kept in memory
// =============================================================================
//
// Pure data sink: rotation, per-session tick caps, and copy-on-read
// snapshots, with no event emission. Bots read recent games from here for
// context; `warm_start` pre-populates the ring from the most recent
// recordings after a restart.
// =============================================================================

use std::collections::VecDeque;
use std::path::Path;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::replay::source::{load_tick_file, scan_recordings_dir};
use crate::runtime_config::RingBufferConfig;
use crate::types::{sol, GameSummary, GameTick};

// ---------------------------------------------------------------------------
// GameSession
// ---------------------------------------------------------------------------

/// One game's worth of ticks plus its summary metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GameSession {
    pub game_id: String,
    pub start_tick: u64,
    pub end_tick: u64,
    #[serde(with = "sol")]
    pub peak_price: Decimal,
    pub rugged_at_tick: Option<u64>,
    /// Set when the per-session tick cap forced the oldest ticks out.
    pub truncated: bool,
    pub ticks: Vec<GameTick>,
}

impl GameSession {
    fn new(game_id: String) -> Self {
        Self {
            game_id,
            start_tick: 0,
            end_tick: 0,
            peak_price: Decimal::ZERO,
            rugged_at_tick: None,
            truncated: false,
            ticks: Vec::new(),
        }
    }

    fn absorb(&mut self, tick: &GameTick, max_ticks: usize) {
        if self.ticks.is_empty() {
            self.start_tick = tick.tick;
        }
        self.end_tick = tick.tick;
        self.peak_price = self.peak_price.max(tick.price);
        if tick.rugged && self.rugged_at_tick.is_none() {
            self.rugged_at_tick = Some(tick.tick);
        }

        self.ticks.push(tick.clone());
        while self.ticks.len() > max_ticks {
            self.ticks.remove(0);
            self.truncated = true;
        }
    }
}

// ---------------------------------------------------------------------------
// GameHistory
// ---------------------------------------------------------------------------

struct HistoryInner {
    current: Option<GameSession>,
    completed: VecDeque<GameSession>,
}

/// Fixed-capacity deque of completed sessions plus at most one in-progress
/// session.
pub struct GameHistory {
    inner: RwLock<HistoryInner>,
    capacity: usize,
    max_ticks: usize,
}

impl GameHistory {
    pub fn new(cfg: &RingBufferConfig) -> Self {
        Self {
            inner: RwLock::new(HistoryInner {
                current: None,
                completed: VecDeque::with_capacity(cfg.capacity + 1),
            }),
            capacity: cfg.capacity.max(1),
            max_ticks: cfg.max_ticks_per_session.max(1),
        }
    }

    /// Rotate: any in-progress session moves into the deque, the oldest
    /// beyond capacity falls off, and a fresh session opens for `game_id`.
    pub fn start_game(&self, game_id: &str) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.current.take() {
            warn!(
                game_id = %session.game_id,
                "session rotated without completion"
            );
            push_completed(&mut inner, session, self.capacity);
        }
        inner.current = Some(GameSession::new(game_id.to_string()));
        debug!(game_id, "history session opened");
    }

    /// Append one tick to the in-progress session, respecting the
    /// per-session cap.
    pub fn ingest_tick(&self, tick: &GameTick) {
        let mut inner = self.inner.write();
        let session = inner
            .current
            .get_or_insert_with(|| GameSession::new(tick.game_id.clone()));
        session.absorb(tick, self.max_ticks);
    }

    /// Finalise the in-progress session with the authoritative summary and
    /// move it into the deque.
    pub fn complete_game(&self, summary: &GameSummary) {
        let mut inner = self.inner.write();
        let Some(mut session) = inner.current.take() else {
            debug!(game_id = %summary.game_id, "complete_game without a session");
            return;
        };
        session.peak_price = session.peak_price.max(summary.peak_price);
        session.rugged_at_tick = summary.rugged_at_tick.or(session.rugged_at_tick);
        push_completed(&mut inner, session, self.capacity);
    }

    /// Snapshot of the most recent `count` completed sessions, newest first.
    pub fn last_games(&self, count: usize) -> Vec<GameSession> {
        let inner = self.inner.read();
        inner
            .completed
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    /// Number of completed sessions currently held.
    pub fn len(&self) -> usize {
        self.inner.read().completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-populate the deque from the most recent `.jsonl` recordings in
    /// `dir`, oldest first so the newest game ends up at the head.
    /// Best-effort: malformed files are skipped with a warning. Returns how
    /// many sessions were loaded.
    pub fn warm_start(&self, dir: &Path) -> usize {
        let files = match scan_recordings_dir(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "warm start skipped");
                return 0;
            }
        };

        let recent = files
            .iter()
            .skip(files.len().saturating_sub(self.capacity));

        let mut loaded = 0;
        for path in recent {
            let file = match load_tick_file(path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "warm start skipping file");
                    continue;
                }
            };

            let game_id = file
                .game_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let mut session = GameSession::new(game_id);
            for tick in &file.ticks {
                session.absorb(tick, self.max_ticks);
            }
            if let Some(end) = file.end {
                session.peak_price = session.peak_price.max(end.peak_price);
                session.rugged_at_tick = end.rugged_at_tick.or(session.rugged_at_tick);
            }

            let mut inner = self.inner.write();
            push_completed(&mut inner, session, self.capacity);
            loaded += 1;
        }

        info!(dir = %dir.display(), loaded, "warm start complete");
        loaded
    }
}

fn push_completed(inner: &mut HistoryInner, session: GameSession, capacity: usize) {
    inner.completed.push_back(session);
    while inner.completed.len() > capacity {
        inner.completed.pop_front();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::source::tests::write_game_file;
    use crate::types::tests::sample_tick;
    use crate::types::Phase;
    use rust_decimal_macros::dec;

    fn history(capacity: usize, max_ticks: usize) -> GameHistory {
        GameHistory::new(&RingBufferConfig {
            capacity,
            max_ticks_per_session: max_ticks,
        })
    }

    fn summary(game_id: &str, rugged_at: Option<u64>) -> GameSummary {
        GameSummary {
            game_id: game_id.to_string(),
            total_ticks: 3,
            peak_price: dec!(2.0),
            rugged_at_tick: rugged_at,
        }
    }

    fn run_game(h: &GameHistory, game_id: &str) {
        h.start_game(game_id);
        for i in 0..3 {
            h.ingest_tick(&sample_tick(game_id, i, dec!(1.0), Phase::ActiveGameplay));
        }
        h.complete_game(&summary(game_id, Some(2)));
    }

    #[test]
    fn capacity_evicts_oldest_completed_game() {
        let h = history(2, 100);
        run_game(&h, "g1");
        run_game(&h, "g2");
        run_game(&h, "g3");

        assert_eq!(h.len(), 2);
        let games = h.last_games(10);
        assert_eq!(games[0].game_id, "g3");
        assert_eq!(games[1].game_id, "g2");
    }

    #[test]
    fn last_games_returns_newest_first_copies() {
        let h = history(5, 100);
        run_game(&h, "g1");
        run_game(&h, "g2");

        let games = h.last_games(1);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].game_id, "g2");
        assert_eq!(games[0].ticks.len(), 3);
        assert_eq!(games[0].rugged_at_tick, Some(2));
    }

    #[test]
    fn per_session_cap_truncates_oldest_ticks() {
        let h = history(2, 5);
        h.start_game("g1");
        for i in 0..8 {
            h.ingest_tick(&sample_tick("g1", i, dec!(1.0), Phase::ActiveGameplay));
        }
        h.complete_game(&summary("g1", None));

        let games = h.last_games(1);
        assert!(games[0].truncated);
        assert_eq!(games[0].ticks.len(), 5);
        assert_eq!(games[0].ticks[0].tick, 3);
        // Start/end metadata still reflect the full session.
        assert_eq!(games[0].start_tick, 0);
        assert_eq!(games[0].end_tick, 7);
    }

    #[test]
    fn peak_price_and_rug_tick_are_tracked() {
        let h = history(2, 100);
        h.start_game("g1");
        h.ingest_tick(&sample_tick("g1", 0, dec!(1.0), Phase::ActiveGameplay));
        h.ingest_tick(&sample_tick("g1", 1, dec!(3.5), Phase::ActiveGameplay));
        h.ingest_tick(&sample_tick("g1", 2, dec!(0.02), Phase::RugEvent));
        h.complete_game(&GameSummary {
            game_id: "g1".to_string(),
            total_ticks: 3,
            peak_price: dec!(3.5),
            rugged_at_tick: Some(2),
        });

        let games = h.last_games(1);
        assert_eq!(games[0].peak_price, dec!(3.5));
        assert_eq!(games[0].rugged_at_tick, Some(2));
    }

    #[test]
    fn unfinished_session_is_rotated_on_next_start() {
        let h = history(3, 100);
        h.start_game("g1");
        h.ingest_tick(&sample_tick("g1", 0, dec!(1.0), Phase::ActiveGameplay));
        // No complete_game: g2 must still rotate g1 into the deque.
        h.start_game("g2");

        assert_eq!(h.len(), 1);
        assert_eq!(h.last_games(1)[0].game_id, "g1");
    }

    #[test]
    fn warm_start_loads_recent_files_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for (i, game_id) in ["old", "mid", "new"].into_iter().enumerate() {
            let ticks: Vec<_> = (0..3)
                .map(|t| sample_tick(game_id, t, dec!(1.0) + Decimal::from(i as u64), Phase::ActiveGameplay))
                .collect();
            write_game_file(dir.path(), game_id, &ticks, true);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let h = history(2, 100);
        let loaded = h.warm_start(dir.path());

        assert_eq!(loaded, 2);
        assert_eq!(h.len(), 2);
        let games = h.last_games(10);
        assert_eq!(games[0].game_id, "new");
        assert_eq!(games[1].game_id, "mid");
    }

    #[test]
    fn warm_start_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jsonl"), "not json at all\n").unwrap();
        let ticks: Vec<_> = (0..3)
            .map(|t| sample_tick("ok", t, dec!(1.0), Phase::ActiveGameplay))
            .collect();
        write_game_file(dir.path(), "ok", &ticks, true);

        let h = history(5, 100);
        assert_eq!(h.warm_start(dir.path()), 1);
        assert_eq!(h.last_games(1)[0].game_id, "ok");
    }

    #[test]
    fn warm_start_on_missing_dir_is_best_effort() {
        let h = history(5, 100);
        assert_eq!(h.warm_start(Path::new("/nonexistent/definitely/not")), 0);
        assert!(h.is_empty());
    }
}
