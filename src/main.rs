// =============================================================================
// Rugs Replay Engine — Main Entry Point
// =============================================================================
//
// Two modes, mutually exclusive per run:
//   file  (default) — replay every recording in the recordings directory
//                     with wall-clock pacing, resetting the wallet per game.
//   live            — ingest a JSON-lines tick stream from stdin (piped in
//                     by the external feed bridge), recording each game to
//                     disk and carrying the wallet across games.
// =============================================================================

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rugs_replay::event_bus::EventBus;
use rugs_replay::history::GameHistory;
use rugs_replay::ledger::GameLedger;
use rugs_replay::recorder::TickRecorder;
use rugs_replay::replay::{EngineMode, ReplayEngine};
use rugs_replay::runtime_config::RuntimeConfig;
use rugs_replay::trade::TradeManager;
use rugs_replay::types::{classify_bad_line, LineDefect, RecordLine};

fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Rugs Replay Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("RUGS_CONFIG").unwrap_or_else(|_| "runtime_config.json".to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(dir) = std::env::var("RUGS_RECORDINGS_DIR") {
        config.recordings_dir = dir;
    }
    config.validate()?;

    let mode_arg = std::env::args().nth(1).unwrap_or_else(|| "file".to_string());
    let recordings_dir = PathBuf::from(&config.recordings_dir);

    info!(
        mode = %mode_arg,
        recordings_dir = %recordings_dir.display(),
        "configuration ready"
    );

    // ── 2. Build the component graph ─────────────────────────────────────
    let bus = Arc::new(EventBus::new(config.event_bus.queue_capacity));
    let ledger = Arc::new(GameLedger::new(
        bus.clone(),
        &config.wallet,
        config.trade.clone(),
    ));
    let trade = Arc::new(TradeManager::new(ledger.clone()));
    let history = Arc::new(GameHistory::new(&config.ring_buffer));

    // Warm the ring buffer from the most recent recordings.
    history.warm_start(&recordings_dir);

    // ── 3. Run the selected mode ─────────────────────────────────────────
    let engine = match mode_arg.as_str() {
        "live" => {
            let recorder = Arc::new(TickRecorder::new(
                &recordings_dir,
                config.recorder.clone(),
            )?);
            let engine = ReplayEngine::new(
                EngineMode::Live,
                config.playback.clone(),
                bus.clone(),
                ledger.clone(),
                trade,
                Some(recorder),
                history.clone(),
            );
            info!("live mode: reading tick stream from stdin until EOF");
            run_live_feed(&engine)?;
            engine
        }
        "file" => {
            let engine = ReplayEngine::new(
                EngineMode::File,
                config.playback.clone(),
                bus.clone(),
                ledger.clone(),
                trade,
                None,
                history.clone(),
            );
            let queued = engine.play_directory(&recordings_dir)?;
            info!(files = queued, "file mode: replaying recordings");
            engine.wait_until_idle();
            engine
        }
        other => anyhow::bail!("unknown mode {other:?}; expected \"file\" or \"live\""),
    };

    // ── 4. Shut down and report ──────────────────────────────────────────
    engine.stop();

    let status = engine.status();
    info!(
        ticks = status.ticks_processed_total,
        duplicates = status.duplicate_ticks_total,
        malformed = status.malformed_ticks_total,
        games_held = status.completed_games_held,
        events_published = status.events_published,
        events_dropped = status.events_dropped,
        "session complete"
    );
    if let Ok(metrics) = ledger.metrics() {
        info!(
            trades = metrics.trades,
            win_rate = %metrics.win_rate,
            roi = %metrics.roi,
            max_drawdown = %metrics.max_drawdown,
            "session metrics"
        );
    }

    Ok(())
}

/// Drive the engine from a JSON-lines stream on stdin. Boundary lines
/// (`game_start` / `game_end`) are informational — the engine derives game
/// boundaries from the ticks themselves. Malformed lines are counted and
/// skipped; unknown events are ignored with a warning.
fn run_live_feed(engine: &Arc<ReplayEngine>) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RecordLine>(trimmed) {
            Ok(RecordLine::Tick { tick }) => {
                if let Err(e) = engine.push_tick(tick) {
                    warn!(error = %e, "tick rejected");
                }
            }
            Ok(_) => {}
            Err(e) => match classify_bad_line(trimmed, &e) {
                LineDefect::UnknownEvent(event) => {
                    warn!(%event, "unknown feed event ignored");
                }
                LineDefect::Malformed(message) => {
                    engine.note_malformed_tick();
                    warn!(%message, "malformed feed line skipped");
                }
            },
        }
    }
    info!("feed closed (EOF)");
    Ok(())
}
