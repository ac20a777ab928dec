// =============================================================================
// Trade Manager — validates and issues ledger commands
// =============================================================================
//
// Stateless coordinator: every rule lives here, every mutation lives in the
// ledger.  Commands validate against a snapshot and return a typed receipt
// or a `TradeError`; per-tick resolution (`on_tick`) force-closes positions
// on a rug and settles sidebets on rug or expiry.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::ledger::{CloseReason, GameLedger, SidebetOutcome};
use crate::types::{sol, sol_opt, GameTick, Phase};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a trade command was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradeError {
    #[error("command not allowed during {phase}")]
    WrongPhase { phase: Phase },

    #[error("amount {amount} outside [{min}, {max}] SOL")]
    AmountOutOfRange {
        amount: String,
        min: String,
        max: String,
    },

    #[error("insufficient balance: need {required} SOL, have {available} SOL")]
    InsufficientBalance { required: String, available: String },

    #[error("no active position")]
    NoActivePosition,

    #[error("no active sidebet")]
    NoActiveSidebet,

    #[error("a sidebet is already active")]
    SidebetActive,

    #[error("sidebet cooldown: {ticks_remaining} tick(s) remaining")]
    SidebetCooldown { ticks_remaining: u64 },

    #[error("ledger lock timed out")]
    LedgerLockTimeout,

    #[error("partial close is not supported; sell the full position")]
    PartialCloseUnsupported,

    #[error("engine halted by an invariant violation; reset required")]
    EngineHalted,
}

impl From<LedgerError> for TradeError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::LockTimeout(_) => Self::LedgerLockTimeout,
            LedgerError::Halted | LedgerError::InvariantViolation(_) => Self::EngineHalted,
            LedgerError::NoActivePosition => Self::NoActivePosition,
            LedgerError::NoActiveSidebet => Self::NoActiveSidebet,
            LedgerError::SidebetActive => Self::SidebetActive,
            LedgerError::InsufficientBalance {
                required,
                available,
            } => Self::InsufficientBalance {
                required,
                available,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Sidebet,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Sidebet => write!(f, "sidebet"),
        }
    }
}

/// Confirmation of an executed command.
#[derive(Debug, Clone, Serialize)]
pub struct TradeReceipt {
    pub action: TradeAction,
    #[serde(with = "sol")]
    pub amount_sol: Decimal,
    #[serde(with = "sol")]
    pub price: Decimal,
    pub tick: u64,
    #[serde(with = "sol")]
    pub balance_after: Decimal,
    #[serde(with = "sol_opt")]
    pub realized_pnl_sol: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// TradeManager
// ---------------------------------------------------------------------------

/// Validates BUY / SELL / SIDEBET commands and resolves rug liquidation and
/// sidebet expiry each tick.
pub struct TradeManager {
    ledger: Arc<GameLedger>,
}

impl TradeManager {
    pub fn new(ledger: Arc<GameLedger>) -> Self {
        Self { ledger }
    }

    fn amount_in_range(&self, amount: Decimal) -> Result<(), TradeError> {
        let cfg = self.ledger.trade_config();
        if amount < cfg.min_bet_sol || amount > cfg.max_bet_sol {
            return Err(TradeError::AmountOutOfRange {
                amount: amount.to_string(),
                min: cfg.min_bet_sol.to_string(),
                max: cfg.max_bet_sol.to_string(),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Buy `amount` SOL at the current price: opens a position, or adds to
    /// the active one with a weighted-average entry.
    pub fn buy(&self, amount: Decimal) -> Result<TradeReceipt, TradeError> {
        let snap = self.ledger.snapshot()?;
        if snap.halted {
            return Err(TradeError::EngineHalted);
        }
        // A zero price means no market yet for this round; entry prices
        // must stay strictly positive.
        if matches!(snap.current_phase, Phase::Cooldown | Phase::RugEvent)
            || snap.current_price <= Decimal::ZERO
        {
            return Err(TradeError::WrongPhase {
                phase: snap.current_phase,
            });
        }
        self.amount_in_range(amount)?;
        if amount > snap.wallet.balance_sol {
            return Err(TradeError::InsufficientBalance {
                required: amount.to_string(),
                available: snap.wallet.balance_sol.to_string(),
            });
        }

        let position =
            self.ledger
                .open_or_add_position(amount, snap.current_price, snap.current_tick)?;
        debug!(id = %position.id, amount = %amount, "buy executed");

        Ok(TradeReceipt {
            action: TradeAction::Buy,
            amount_sol: amount,
            price: snap.current_price,
            tick: snap.current_tick,
            balance_after: snap.wallet.balance_sol - amount,
            realized_pnl_sol: None,
        })
    }

    /// Sell the active position at the current price. Only a full close
    /// (`fraction == 1`) is supported.
    pub fn sell(&self, fraction: Decimal) -> Result<TradeReceipt, TradeError> {
        if fraction != Decimal::ONE {
            return Err(TradeError::PartialCloseUnsupported);
        }

        let snap = self.ledger.snapshot()?;
        if snap.halted {
            return Err(TradeError::EngineHalted);
        }
        if snap.position.is_none() {
            return Err(TradeError::NoActivePosition);
        }

        let closed = self.ledger.close_position(
            snap.current_tick,
            snap.current_price,
            CloseReason::Manual,
        )?;
        let realized = closed.realized_pnl_sol.unwrap_or(Decimal::ZERO);
        info!(id = %closed.id, realized = %realized, "sell executed");

        Ok(TradeReceipt {
            action: TradeAction::Sell,
            amount_sol: closed.amount_sol,
            price: snap.current_price,
            tick: snap.current_tick,
            balance_after: snap.wallet.balance_sol
                + (closed.amount_sol + realized).max(Decimal::ZERO),
            realized_pnl_sol: Some(realized),
        })
    }

    /// Wager that the rug lands within the configured window. One active
    /// sidebet at a time, with a cooldown after each resolution.
    pub fn sidebet(&self, amount: Decimal) -> Result<TradeReceipt, TradeError> {
        let snap = self.ledger.snapshot()?;
        if snap.halted {
            return Err(TradeError::EngineHalted);
        }
        if matches!(snap.current_phase, Phase::Cooldown | Phase::RugEvent) {
            return Err(TradeError::WrongPhase {
                phase: snap.current_phase,
            });
        }
        self.amount_in_range(amount)?;
        if amount > snap.wallet.balance_sol {
            return Err(TradeError::InsufficientBalance {
                required: amount.to_string(),
                available: snap.wallet.balance_sol.to_string(),
            });
        }
        if snap.sidebet.is_some() {
            return Err(TradeError::SidebetActive);
        }

        let cooldown = self.ledger.trade_config().sidebet_cooldown_ticks;
        if let Some(last) = snap.last_sidebet_resolved_tick {
            // A smaller current tick means the counter restarted with a new
            // game; the cooldown has long elapsed in wall-clock terms.
            if last <= snap.current_tick {
                let elapsed = snap.current_tick - last;
                if elapsed < cooldown {
                    return Err(TradeError::SidebetCooldown {
                        ticks_remaining: cooldown - elapsed,
                    });
                }
            }
        }

        let bet = self
            .ledger
            .place_sidebet(amount, snap.current_tick, snap.current_price)?;
        debug!(amount = %amount, expires_at = bet.expires_at_tick, "sidebet executed");

        Ok(TradeReceipt {
            action: TradeAction::Sidebet,
            amount_sol: amount,
            price: snap.current_price,
            tick: snap.current_tick,
            balance_after: snap.wallet.balance_sol - amount,
            realized_pnl_sol: None,
        })
    }

    // -------------------------------------------------------------------------
    // Per-tick resolution
    // -------------------------------------------------------------------------

    /// Called by the engine for every tick after `apply_tick`:
    /// 1. a rug force-closes the active position at the liquidation price;
    /// 2. a rug settles the active sidebet (won iff within its window);
    /// 3. without a rug, an expired sidebet is settled as lost.
    pub fn on_tick(&self, tick: &GameTick) -> Result<(), TradeError> {
        let snap = self.ledger.snapshot()?;
        let cfg = self.ledger.trade_config();

        if tick.rugged {
            if snap.position.is_some() {
                let closed = self.ledger.close_position(
                    tick.tick,
                    cfg.rug_liquidation_price,
                    CloseReason::Rug,
                )?;
                info!(
                    id = %closed.id,
                    realized = %closed.realized_pnl_sol.unwrap_or(Decimal::ZERO),
                    "position liquidated by rug"
                );
            }
            if let Some(bet) = snap.sidebet {
                let outcome = if tick.tick <= bet.expires_at_tick {
                    SidebetOutcome::Won
                } else {
                    SidebetOutcome::Lost
                };
                self.ledger.resolve_sidebet(tick.tick, outcome)?;
            }
        } else if let Some(bet) = snap.sidebet {
            if tick.tick > bet.expires_at_tick {
                self.ledger.resolve_sidebet(tick.tick, SidebetOutcome::Lost)?;
            }
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
    use crate::event_bus::EventBus;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::tests::sample_tick;
    use rust_decimal_macros::dec;

    fn manager() -> (Arc<GameLedger>, TradeManager) {
        let cfg = RuntimeConfig::default();
        let bus = Arc::new(EventBus::new(cfg.event_bus.queue_capacity));
        let ledger = Arc::new(GameLedger::new(bus, &cfg.wallet, cfg.trade.clone()));
        let tm = TradeManager::new(ledger.clone());
        (ledger, tm)
    }

    fn at_phase(ledger: &GameLedger, tick: u64, price: Decimal, phase: Phase) {
        ledger
            .apply_tick(&sample_tick("g1", tick, price, phase))
            .unwrap();
    }

    #[test]
    fn buy_rejected_during_cooldown_and_rug() {
        let (ledger, tm) = manager();

        at_phase(&ledger, 1, dec!(1.0), Phase::Cooldown);
        assert!(matches!(
            tm.buy(dec!(0.01)),
            Err(TradeError::WrongPhase {
                phase: Phase::Cooldown
            })
        ));

        at_phase(&ledger, 2, dec!(1.0), Phase::Presale);
        at_phase(&ledger, 3, dec!(1.0), Phase::ActiveGameplay);
        at_phase(&ledger, 4, dec!(0.02), Phase::RugEvent);
        assert!(matches!(
            tm.buy(dec!(0.01)),
            Err(TradeError::WrongPhase {
                phase: Phase::RugEvent
            })
        ));
    }

    #[test]
    fn buy_allowed_during_presale() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 1, dec!(1.0), Phase::Presale);
        assert!(tm.buy(dec!(0.01)).is_ok());
    }

    #[test]
    fn amount_bounds_are_inclusive() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 1, dec!(1.0), Phase::ActiveGameplay);

        // Exactly the minimum is accepted.
        assert!(tm.buy(dec!(0.001)).is_ok());
        // A hair under is rejected.
        assert!(matches!(
            tm.buy(dec!(0.0009999)),
            Err(TradeError::AmountOutOfRange { .. })
        ));
        assert!(matches!(
            tm.buy(dec!(1.0000001)),
            Err(TradeError::AmountOutOfRange { .. })
        ));
    }

    #[test]
    fn balance_exactly_equal_is_accepted() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 1, dec!(1.0), Phase::ActiveGameplay);

        let receipt = tm.buy(dec!(0.100)).unwrap();
        assert_eq!(receipt.balance_after, Decimal::ZERO);
    }

    #[test]
    fn one_satoshi_over_balance_is_rejected() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 1, dec!(1.0), Phase::ActiveGameplay);

        assert!(matches!(
            tm.buy(dec!(0.100000000001)),
            Err(TradeError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn sell_requires_a_position_and_full_fraction() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 1, dec!(1.0), Phase::ActiveGameplay);

        assert!(matches!(
            tm.sell(Decimal::ONE),
            Err(TradeError::NoActivePosition)
        ));

        tm.buy(dec!(0.010)).unwrap();
        assert!(matches!(
            tm.sell(dec!(0.5)),
            Err(TradeError::PartialCloseUnsupported)
        ));

        at_phase(&ledger, 5, dec!(2.5), Phase::ActiveGameplay);
        let receipt = tm.sell(Decimal::ONE).unwrap();
        assert_eq!(receipt.realized_pnl_sol.unwrap(), dec!(0.015));
        assert_eq!(receipt.balance_after, dec!(0.115));
    }

    #[test]
    fn rug_liquidates_position_at_floor_price() {
        // Buy at 1.0, price triples, rug lands: exit at 0.02 leaves 0.0902.
        let (ledger, tm) = manager();
        at_phase(&ledger, 10, dec!(1.0), Phase::ActiveGameplay);
        tm.buy(dec!(0.010)).unwrap();

        at_phase(&ledger, 50, dec!(3.0), Phase::ActiveGameplay);
        tm.on_tick(&sample_tick("g1", 50, dec!(3.0), Phase::ActiveGameplay))
            .unwrap();
        assert!(ledger.snapshot().unwrap().position.is_some());

        let rug = sample_tick("g1", 90, dec!(0.02), Phase::RugEvent);
        ledger.apply_tick(&rug).unwrap();
        tm.on_tick(&rug).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert!(snap.position.is_none());
        assert_eq!(snap.wallet.balance_sol, dec!(0.0902));
    }

    #[test]
    fn sidebet_window_boundary_decides_outcome() {
        // Placed at 100 with a 40-tick window: rug at exactly 140 wins.
        let (ledger, tm) = manager();
        at_phase(&ledger, 100, dec!(5.0), Phase::ActiveGameplay);
        tm.sidebet(dec!(0.002)).unwrap();

        let rug = sample_tick("g1", 140, dec!(0.02), Phase::RugEvent);
        ledger.apply_tick(&rug).unwrap();
        tm.on_tick(&rug).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap.wallet.balance_sol, dec!(0.108));
        assert_eq!(snap.wallet.session_pnl_sol, dec!(0.008));
    }

    #[test]
    fn sidebet_rug_one_tick_late_loses() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 100, dec!(5.0), Phase::ActiveGameplay);
        tm.sidebet(dec!(0.002)).unwrap();

        let rug = sample_tick("g1", 141, dec!(0.02), Phase::RugEvent);
        ledger.apply_tick(&rug).unwrap();
        tm.on_tick(&rug).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap.wallet.balance_sol, dec!(0.098));
        assert_eq!(snap.wallet.session_pnl_sol, dec!(-0.002));
    }

    #[test]
    fn sidebet_expires_without_rug_and_cooldown_applies() {
        // Timeout at tick 141, then the 5-tick cooldown holds until 146.
        let (ledger, tm) = manager();
        at_phase(&ledger, 100, dec!(5.0), Phase::ActiveGameplay);
        tm.sidebet(dec!(0.002)).unwrap();

        let t141 = sample_tick("g1", 141, dec!(5.5), Phase::ActiveGameplay);
        ledger.apply_tick(&t141).unwrap();
        tm.on_tick(&t141).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert!(snap.sidebet.is_none());
        assert_eq!(snap.wallet.balance_sol, dec!(0.098));
        assert_eq!(snap.wallet.session_pnl_sol, dec!(-0.002));

        at_phase(&ledger, 145, dec!(5.5), Phase::ActiveGameplay);
        assert!(matches!(
            tm.sidebet(dec!(0.002)),
            Err(TradeError::SidebetCooldown { ticks_remaining: 1 })
        ));

        at_phase(&ledger, 146, dec!(5.5), Phase::ActiveGameplay);
        assert!(tm.sidebet(dec!(0.002)).is_ok());
    }

    #[test]
    fn second_sidebet_rejected_while_one_is_active() {
        let (ledger, tm) = manager();
        at_phase(&ledger, 100, dec!(5.0), Phase::ActiveGameplay);
        tm.sidebet(dec!(0.002)).unwrap();
        assert!(matches!(
            tm.sidebet(dec!(0.002)),
            Err(TradeError::SidebetActive)
        ));
    }

    #[test]
    fn on_tick_without_exposure_is_a_noop() {
        let (ledger, tm) = manager();
        let t = sample_tick("g1", 10, dec!(1.0), Phase::ActiveGameplay);
        ledger.apply_tick(&t).unwrap();
        tm.on_tick(&t).unwrap();
        assert_eq!(ledger.snapshot().unwrap().wallet.balance_sol, dec!(0.100));
    }
}
