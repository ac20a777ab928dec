// =============================================================================
// Rugs Replay Engine — core library
// =============================================================================
//
// Dual-mode market-replay and live-ingestion engine for Rugs.fun rounds.
// A tick source (recorded file or live feed) drives, in lockstep:
//
//   - the game-state ledger (wallet, positions, sidebet, phase),
//   - the trade manager (BUY / SELL / SIDEBET plus rug and expiry
//     resolution),
//   - the durable per-game JSON-lines recorder (live mode),
//   - the fixed-capacity ring buffer of completed games,
//   - the typed event bus external consumers subscribe to.
//
// External collaborators (GUI, feed bridge, bots) construct the components,
// wire them into a `ReplayEngine`, and interact only through commands and
// event subscriptions.
// =============================================================================

pub mod error;
pub mod event_bus;
pub mod history;
pub mod ledger;
pub mod recorder;
pub mod replay;
pub mod runtime_config;
pub mod trade;
pub mod types;

pub use error::{EngineError, LedgerError, LifecycleError, RecorderError};
pub use event_bus::{EngineEvent, EventBus, EventKind, SubscriptionId};
pub use history::{GameHistory, GameSession};
pub use ledger::{GameLedger, LedgerMetrics, LedgerSnapshot};
pub use recorder::{RecorderStats, TickRecorder};
pub use replay::{EngineMode, EngineStatus, PlaybackState, ReplayEngine};
pub use runtime_config::RuntimeConfig;
pub use trade::{TradeError, TradeManager, TradeReceipt};
pub use types::{GameSummary, GameTick, Phase};
