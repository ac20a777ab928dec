// =============================================================================
// Runtime Configuration — engine settings with validation and atomic save
// =============================================================================
//
// Every tunable of the replay engine lives here, grouped into the sections
// the components consume (recorder, playback, wallet, trade, ring buffer,
// event bus).
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  `validate()` runs at startup;
// any out-of-range value fails startup with the offending key named.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::sol;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_recordings_dir() -> String {
    "recordings".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ring_capacity() -> usize {
    10
}

fn default_max_ticks_per_session() -> usize {
    10_000
}

fn default_flush_threshold_ticks() -> usize {
    100
}

fn default_flush_interval_s() -> f64 {
    10.0
}

fn default_max_buffer_size() -> usize {
    5_000
}

fn default_min_free_disk_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_max_tick_bytes() -> usize {
    1024 * 1024
}

fn default_min_tick_interval_ms() -> u64 {
    50
}

fn default_max_tick_interval_s() -> f64 {
    5.0
}

fn default_playback_speed() -> f64 {
    1.0
}

fn default_initial_balance() -> Decimal {
    dec!(0.100)
}

fn default_min_bet() -> Decimal {
    dec!(0.001)
}

fn default_max_bet() -> Decimal {
    dec!(1.0)
}

fn default_sidebet_window_ticks() -> u64 {
    40
}

fn default_sidebet_cooldown_ticks() -> u64 {
    5
}

fn default_sidebet_multiplier() -> Decimal {
    dec!(5.0)
}

fn default_rug_liquidation_price() -> Decimal {
    dec!(0.02)
}

fn default_queue_capacity() -> usize {
    256
}

// =============================================================================
// Validation error
// =============================================================================

/// A config value that failed startup validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid config value for `{key}`: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        key,
        reason: reason.into(),
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Ring-buffer sizing for completed game history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBufferConfig {
    /// How many completed games to retain in memory.
    #[serde(default = "default_ring_capacity")]
    pub capacity: usize,

    /// Per-session tick cap; older ticks are dropped and the session is
    /// flagged truncated.
    #[serde(default = "default_max_ticks_per_session")]
    pub max_ticks_per_session: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_ring_capacity(),
            max_ticks_per_session: default_max_ticks_per_session(),
        }
    }
}

/// Durable recorder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Flush once this many lines are buffered.
    #[serde(default = "default_flush_threshold_ticks")]
    pub flush_threshold_ticks: usize,

    /// Flush at least this often regardless of buffer size.
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: f64,

    /// Hard ceiling on buffered lines; beyond it the oldest 25% are dropped
    /// when flushing keeps failing.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Refuse to start a new file when the disk has less free space.
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,

    /// Stop recording after this many consecutive flush failures.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Reject any single tick that serialises larger than this.
    #[serde(default = "default_max_tick_bytes")]
    pub max_tick_bytes: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_threshold_ticks: default_flush_threshold_ticks(),
            flush_interval_s: default_flush_interval_s(),
            max_buffer_size: default_max_buffer_size(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_tick_bytes: default_max_tick_bytes(),
        }
    }
}

/// File-mode playback pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Floor for the inter-tick sleep.
    #[serde(default = "default_min_tick_interval_ms")]
    pub min_tick_interval_ms: u64,

    /// Ceiling for the inter-tick sleep (recorded gaps can span minutes).
    #[serde(default = "default_max_tick_interval_s")]
    pub max_tick_interval_s: f64,

    /// Playback speed multiplier; 1.0 = real time.
    #[serde(default = "default_playback_speed")]
    pub speed: f64,

    /// After a file's final tick, load the next file in the directory.
    #[serde(default = "default_true")]
    pub auto_advance: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_tick_interval_ms: default_min_tick_interval_ms(),
            max_tick_interval_s: default_max_tick_interval_s(),
            speed: default_playback_speed(),
            auto_advance: true,
        }
    }
}

/// Wallet initialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_initial_balance", with = "sol")]
    pub initial_balance_sol: Decimal,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_balance_sol: default_initial_balance(),
        }
    }
}

/// Trade-command limits and sidebet rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeConfig {
    #[serde(default = "default_min_bet", with = "sol")]
    pub min_bet_sol: Decimal,

    #[serde(default = "default_max_bet", with = "sol")]
    pub max_bet_sol: Decimal,

    /// A sidebet wins if the rug lands within this many ticks of placement.
    #[serde(default = "default_sidebet_window_ticks")]
    pub sidebet_window_ticks: u64,

    /// Minimum ticks between a sidebet resolution and the next placement.
    #[serde(default = "default_sidebet_cooldown_ticks")]
    pub sidebet_cooldown_ticks: u64,

    /// Total credit on a winning sidebet, as a multiple of the stake.
    #[serde(default = "default_sidebet_multiplier", with = "sol")]
    pub sidebet_multiplier: Decimal,

    /// Forced exit price for positions open when the rug lands.
    #[serde(default = "default_rug_liquidation_price", with = "sol")]
    pub rug_liquidation_price: Decimal,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            min_bet_sol: default_min_bet(),
            max_bet_sol: default_max_bet(),
            sidebet_window_ticks: default_sidebet_window_ticks(),
            sidebet_cooldown_ticks: default_sidebet_cooldown_ticks(),
            sidebet_multiplier: default_sidebet_multiplier(),
            rug_liquidation_price: default_rug_liquidation_price(),
        }
    }
}

/// Event-bus queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bounded per-subscriber queue depth; oldest events are dropped when a
    /// queue is full so publishers never block.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the replay engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Where `.jsonl` recordings live (read in file mode, written in live).
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,

    #[serde(default)]
    pub ring_buffer: RingBufferConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub trade: TradeConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            ring_buffer: RingBufferConfig::default(),
            recorder: RecorderConfig::default(),
            playback: PlaybackConfig::default(),
            wallet: WalletConfig::default(),
            trade: TradeConfig::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            recordings_dir = %config.recordings_dir,
            ring_capacity = config.ring_buffer.capacity,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Validate every tunable. Called once at startup; the first violation
    /// aborts with the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recordings_dir.is_empty() {
            return Err(invalid("recordings_dir", "must not be empty"));
        }
        if self.ring_buffer.capacity < 1 {
            return Err(invalid("ring_buffer.capacity", "must be >= 1"));
        }
        if self.ring_buffer.max_ticks_per_session < 1 {
            return Err(invalid("ring_buffer.max_ticks_per_session", "must be >= 1"));
        }
        if self.recorder.flush_threshold_ticks < 1 {
            return Err(invalid("recorder.flush_threshold_ticks", "must be >= 1"));
        }
        if !(self.recorder.flush_interval_s > 0.0) {
            return Err(invalid("recorder.flush_interval_s", "must be > 0"));
        }
        if self.recorder.max_buffer_size < self.recorder.flush_threshold_ticks {
            return Err(invalid(
                "recorder.max_buffer_size",
                "must be >= recorder.flush_threshold_ticks",
            ));
        }
        if self.recorder.max_consecutive_failures < 1 {
            return Err(invalid("recorder.max_consecutive_failures", "must be >= 1"));
        }
        if self.recorder.max_tick_bytes < 1 {
            return Err(invalid("recorder.max_tick_bytes", "must be >= 1"));
        }
        if !(self.playback.max_tick_interval_s > 0.0) {
            return Err(invalid("playback.max_tick_interval_s", "must be > 0"));
        }
        if (self.playback.min_tick_interval_ms as f64) / 1000.0 > self.playback.max_tick_interval_s
        {
            return Err(invalid(
                "playback.min_tick_interval_ms",
                "must not exceed playback.max_tick_interval_s",
            ));
        }
        if !(self.playback.speed > 0.0) {
            return Err(invalid("playback.speed", "must be > 0"));
        }
        if self.wallet.initial_balance_sol < Decimal::ZERO {
            return Err(invalid("wallet.initial_balance_sol", "must be >= 0"));
        }
        if self.trade.min_bet_sol <= Decimal::ZERO {
            return Err(invalid("trade.min_bet_sol", "must be > 0"));
        }
        if self.trade.max_bet_sol < self.trade.min_bet_sol {
            return Err(invalid("trade.max_bet_sol", "must be >= trade.min_bet_sol"));
        }
        if self.trade.sidebet_window_ticks < 1 {
            return Err(invalid("trade.sidebet_window_ticks", "must be >= 1"));
        }
        if self.trade.sidebet_multiplier <= Decimal::ONE {
            return Err(invalid("trade.sidebet_multiplier", "must be > 1"));
        }
        if self.trade.rug_liquidation_price < Decimal::ZERO {
            return Err(invalid("trade.rug_liquidation_price", "must be >= 0"));
        }
        if self.event_bus.queue_capacity < 1 {
            return Err(invalid("event_bus.queue_capacity", "must be >= 1"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.recordings_dir, "recordings");
        assert_eq!(cfg.ring_buffer.capacity, 10);
        assert_eq!(cfg.ring_buffer.max_ticks_per_session, 10_000);
        assert_eq!(cfg.recorder.flush_threshold_ticks, 100);
        assert_eq!(cfg.recorder.max_buffer_size, 5_000);
        assert_eq!(cfg.recorder.min_free_disk_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.playback.min_tick_interval_ms, 50);
        assert!(cfg.playback.auto_advance);
        assert_eq!(cfg.wallet.initial_balance_sol, dec!(0.100));
        assert_eq!(cfg.trade.min_bet_sol, dec!(0.001));
        assert_eq!(cfg.trade.max_bet_sol, dec!(1.0));
        assert_eq!(cfg.trade.sidebet_window_ticks, 40);
        assert_eq!(cfg.trade.sidebet_cooldown_ticks, 5);
        assert_eq!(cfg.trade.sidebet_multiplier, dec!(5.0));
        assert_eq!(cfg.trade.rug_liquidation_price, dec!(0.02));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ring_buffer.capacity, 10);
        assert_eq!(cfg.trade.sidebet_cooldown_ticks, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "recordings_dir": "/tmp/rugs",
                        "trade": { "max_bet_sol": "0.5" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.recordings_dir, "/tmp/rugs");
        assert_eq!(cfg.trade.max_bet_sol, dec!(0.5));
        assert_eq!(cfg.trade.min_bet_sol, dec!(0.001));
        assert_eq!(cfg.recorder.flush_threshold_ticks, 100);
    }

    #[test]
    fn decimals_accept_numbers_too() {
        let json = r#"{ "wallet": { "initial_balance_sol": 0.25 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.wallet.initial_balance_sol, dec!(0.25));
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.recordings_dir, cfg2.recordings_dir);
        assert_eq!(cfg.trade.max_bet_sol, cfg2.trade.max_bet_sol);
        assert_eq!(
            cfg.recorder.min_free_disk_bytes,
            cfg2.recorder.min_free_disk_bytes
        );
    }

    #[test]
    fn validation_names_the_offending_key() {
        let mut cfg = RuntimeConfig::default();
        cfg.ring_buffer.capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.key, "ring_buffer.capacity");

        let mut cfg = RuntimeConfig::default();
        cfg.trade.min_bet_sol = dec!(2.0);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.key, "trade.max_bet_sol");

        let mut cfg = RuntimeConfig::default();
        cfg.playback.speed = 0.0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.key, "playback.speed");
    }
}
