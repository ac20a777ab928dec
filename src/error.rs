// =============================================================================
// Error taxonomy for the replay engine
// =============================================================================
//
// Five families, matching who gets to handle them:
//   SourceError    — tick file parse / truncated line problems
//   ConfigError    — startup validation failures (see runtime_config.rs)
//   LedgerError    — state-store failures (lock timeout, invariant breach)
//   RecorderError  — durable-sink failures (disk, write, oversized tick)
//   LifecycleError — start/stop protocol misuse
//
// Tick ingestion never propagates SourceError per-line: malformed lines are
// logged, counted, and skipped. The variants here cover the whole-file and
// command paths where the caller can actually react.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error for engine operations (load, push, start, stop).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to read tick file {path}: {source}")]
    SourceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tick file {path} contains no ticks")]
    EmptySource { path: PathBuf },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Failures of the game-state ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger lock could not be acquired within the timeout. Fatal for
    /// the individual operation, not for the engine.
    #[error("ledger lock timed out after {0:?}")]
    LockTimeout(Duration),

    /// A post-condition check failed. The ledger refuses further mutation
    /// until `reset` is called.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    /// A previous invariant breach halted the ledger.
    #[error("ledger halted by an earlier invariant violation; reset required")]
    Halted,

    #[error("no active position")]
    NoActivePosition,

    #[error("no active sidebet")]
    NoActiveSidebet,

    #[error("a sidebet is already active")]
    SidebetActive,

    #[error("insufficient balance: need {required} SOL, have {available} SOL")]
    InsufficientBalance { required: String, available: String },
}

/// Failures of the durable tick recorder.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("insufficient disk space: {available} bytes free, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("tick serialises to {size} bytes, exceeding the {limit} byte cap")]
    OversizedTick { size: usize, limit: usize },

    #[error("write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Recording was stopped (explicitly or after repeated flush failures).
    #[error("recording stopped")]
    Stopped,
}

impl RecorderError {
    /// Stable machine-readable kind, published in `ERROR` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientDiskSpace { .. } => "InsufficientDiskSpace",
            Self::OversizedTick { .. } => "OversizedTick",
            Self::WriteFailed(_) => "WriteFailed",
            Self::Serialize(_) => "SerializeFailed",
            Self::Stopped => "RecorderStopped",
        }
    }
}

/// Start/stop protocol misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("playback already started")]
    AlreadyStarted,

    #[error("playback not started")]
    NotStarted,

    #[error("no tick file loaded")]
    NothingLoaded,

    #[error("operation only valid in {expected} mode")]
    WrongMode { expected: &'static str },

    #[error("engine already stopped")]
    Terminated,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_error_kinds_are_stable() {
        let e = RecorderError::InsufficientDiskSpace {
            available: 1,
            required: 2,
        };
        assert_eq!(e.kind(), "InsufficientDiskSpace");
        assert_eq!(
            RecorderError::OversizedTick { size: 9, limit: 1 }.kind(),
            "OversizedTick"
        );
        assert_eq!(RecorderError::Stopped.kind(), "RecorderStopped");
    }

    #[test]
    fn engine_error_wraps_ledger_error() {
        let e: EngineError = LedgerError::NoActivePosition.into();
        assert!(matches!(e, EngineError::Ledger(LedgerError::NoActivePosition)));
        assert!(e.to_string().contains("no active position"));
    }

    #[test]
    fn lock_timeout_formats_duration() {
        let e = LedgerError::LockTimeout(Duration::from_secs(5));
        assert!(e.to_string().contains("5s"));
    }
}
