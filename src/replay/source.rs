// =============================================================================
// Tick sources — the adapter boundary between feeds and the replay engine
// =============================================================================
//
// File mode pulls ticks through the `TickSource` trait; live mode pushes
// ticks into the engine out-of-band (`ReplayEngine::push_tick`). The JSON-
// lines loader is shared with the ring buffer's warm start.
//
// Per-line failure never aborts a file: malformed lines are logged, counted,
// and skipped; unknown event tags are ignored with a warning.
// =============================================================================

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::types::{classify_bad_line, GameSummary, GameTick, LineDefect, RecordLine};

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// A pull-based tick feed. `None` means end of stream.
pub trait TickSource {
    fn next_tick(&mut self) -> Option<GameTick>;
}

// ---------------------------------------------------------------------------
// JSON-lines file loading
// ---------------------------------------------------------------------------

/// A fully-parsed recording file.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    /// From the `game_start` header when present, else the first tick.
    pub game_id: Option<String>,
    pub ticks: Vec<GameTick>,
    /// From the `game_end` trailer when present.
    pub end: Option<GameSummary>,
    pub malformed_lines: u64,
    pub unknown_events: u64,
}

/// Parse one `.jsonl` recording into memory.
///
/// Fails only on unreadable files or files with no ticks at all; individual
/// bad lines are skipped.
pub fn load_tick_file(path: &Path) -> Result<LoadedFile, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|source| EngineError::SourceIo {
        path: path.to_path_buf(),
        source,
    })?;

    let mut loaded = LoadedFile {
        path: path.to_path_buf(),
        game_id: None,
        ticks: Vec::new(),
        end: None,
        malformed_lines: 0,
        unknown_events: 0,
    };

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<RecordLine>(line) {
            Ok(RecordLine::GameStart { game_id, .. }) => {
                loaded.game_id.get_or_insert(game_id);
            }
            Ok(RecordLine::Tick { tick }) => {
                loaded.game_id.get_or_insert_with(|| tick.game_id.clone());
                loaded.ticks.push(tick);
            }
            Ok(RecordLine::GameEnd {
                game_id,
                total_ticks,
                peak_price,
                rugged_at_tick,
            }) => {
                loaded.end = Some(GameSummary {
                    game_id,
                    total_ticks,
                    peak_price,
                    rugged_at_tick,
                });
            }
            Err(e) => match classify_bad_line(line, &e) {
                LineDefect::UnknownEvent(event) => {
                    warn!(
                        path = %path.display(),
                        line = idx + 1,
                        %event,
                        "unknown event in recording; ignored"
                    );
                    loaded.unknown_events += 1;
                }
                LineDefect::Malformed(message) => {
                    warn!(
                        path = %path.display(),
                        line = idx + 1,
                        %message,
                        "malformed line in recording; skipped"
                    );
                    loaded.malformed_lines += 1;
                }
            },
        }
    }

    if loaded.ticks.is_empty() {
        return Err(EngineError::EmptySource {
            path: path.to_path_buf(),
        });
    }

    debug!(
        path = %path.display(),
        ticks = loaded.ticks.len(),
        malformed = loaded.malformed_lines,
        "recording loaded"
    );
    Ok(loaded)
}

/// File-backed implementation of [`TickSource`].
pub struct FileTickSource {
    loaded: LoadedFile,
    pos: usize,
}

impl FileTickSource {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        Ok(Self {
            loaded: load_tick_file(path)?,
            pos: 0,
        })
    }

    pub fn loaded(&self) -> &LoadedFile {
        &self.loaded
    }
}

impl TickSource for FileTickSource {
    fn next_tick(&mut self) -> Option<GameTick> {
        let tick = self.loaded.ticks.get(self.pos).cloned();
        if tick.is_some() {
            self.pos += 1;
        }
        tick
    }
}

// ---------------------------------------------------------------------------
// Directory scan
// ---------------------------------------------------------------------------

/// All `.jsonl` files under `dir` in chronological order (modification time,
/// ties broken by name).
pub fn scan_recordings_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        files.push((modified, path));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::tests::sample_tick;
    use crate::types::Phase;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::io::Write;

    pub(crate) fn write_game_file(
        dir: &Path,
        game_id: &str,
        ticks: &[GameTick],
        with_end: bool,
    ) -> PathBuf {
        let path = dir.join(format!("{game_id}.jsonl"));
        let mut file = std::fs::File::create(&path).unwrap();

        let header = RecordLine::GameStart {
            game_id: game_id.to_string(),
            timestamp: Utc::now(),
        };
        writeln!(file, "{}", serde_json::to_string(&header).unwrap()).unwrap();

        for tick in ticks {
            let line = RecordLine::Tick { tick: tick.clone() };
            writeln!(file, "{}", serde_json::to_string(&line).unwrap()).unwrap();
        }

        if with_end {
            let peak = ticks.iter().map(|t| t.price).max().unwrap_or_default();
            let rugged_at = ticks.iter().find(|t| t.rugged).map(|t| t.tick);
            let end = RecordLine::GameEnd {
                game_id: game_id.to_string(),
                total_ticks: ticks.len() as u64,
                peak_price: peak,
                rugged_at_tick: rugged_at,
            };
            writeln!(file, "{}", serde_json::to_string(&end).unwrap()).unwrap();
        }
        path
    }

    fn three_ticks(game_id: &str) -> Vec<GameTick> {
        vec![
            sample_tick(game_id, 0, dec!(1.0), Phase::ActiveGameplay),
            sample_tick(game_id, 1, dec!(2.0), Phase::ActiveGameplay),
            sample_tick(game_id, 2, dec!(0.02), Phase::RugEvent),
        ]
    }

    #[test]
    fn loads_header_ticks_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_game_file(dir.path(), "g1", &three_ticks("g1"), true);

        let loaded = load_tick_file(&path).unwrap();
        assert_eq!(loaded.game_id.as_deref(), Some("g1"));
        assert_eq!(loaded.ticks.len(), 3);
        assert_eq!(loaded.malformed_lines, 0);

        let end = loaded.end.unwrap();
        assert_eq!(end.total_ticks, 3);
        assert_eq!(end.peak_price, dec!(2.0));
        assert_eq!(end.rugged_at_tick, Some(2));
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_game_file(dir.path(), "g2", &three_ticks("g2"), false);
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            writeln!(file, "this is not json").unwrap();
            writeln!(file, r#"{{"event":"heartbeat","seq":1}}"#).unwrap();
        }

        let loaded = load_tick_file(&path).unwrap();
        assert_eq!(loaded.ticks.len(), 3);
        assert_eq!(loaded.malformed_lines, 1);
        assert_eq!(loaded.unknown_events, 1);
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_tick_file(&path),
            Err(EngineError::EmptySource { .. })
        ));
    }

    #[test]
    fn file_source_drains_in_order_then_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_game_file(dir.path(), "g3", &three_ticks("g3"), true);

        let mut source = FileTickSource::load(&path).unwrap();
        assert_eq!(source.next_tick().unwrap().tick, 0);
        assert_eq!(source.next_tick().unwrap().tick, 1);
        assert_eq!(source.next_tick().unwrap().tick, 2);
        assert!(source.next_tick().is_none());
        assert!(source.next_tick().is_none());
    }

    #[test]
    fn directory_scan_is_chronological_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_game_file(dir.path(), "older", &three_ticks("older"), true);
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_game_file(dir.path(), "newer", &three_ticks("newer"), true);

        let files = scan_recordings_dir(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("older.jsonl"));
        assert!(files[1].ends_with("newer.jsonl"));
    }
}
