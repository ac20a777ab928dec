// =============================================================================
// Game State Ledger — the single authoritative model of wallet, positions,
// sidebet, and game phase
// =============================================================================
//
// One writer at a time, many readers. All state lives in `LedgerInner`
// behind a `parking_lot::Mutex` acquired with a 5-second timeout; a timeout
// fails the individual operation, never the engine. Public methods lock
// exactly once and private helpers take `&mut LedgerInner`, so the lock is
// never re-entered.
//
// Mutations collect typed events under the lock and publish them after the
// guard is released; handlers therefore receive snapshots and can never
// re-enter the ledger through the bus.
//
// Post-condition checks run after every mutation. A detected breach (balance
// below zero, broken session-PnL identity) halts the ledger: further
// mutations are refused until `reset` is called.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::event_bus::{EngineEvent, EventBus};
use crate::runtime_config::{TradeConfig, WalletConfig};
use crate::types::{sol, sol_opt, GameTick, Phase};

/// How long a caller may wait for the ledger lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    Rug,
    SidebetIgnored,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Rug => write!(f, "rug"),
            Self::SidebetIgnored => write!(f, "sidebet_ignored"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    Closed,
}

/// A single tracked position. At most one is active per wallet; additive
/// buys fold into it with a weighted-average entry price.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    #[serde(with = "sol")]
    pub amount_sol: Decimal,
    /// Weighted-average entry price across all adds.
    #[serde(with = "sol")]
    pub entry_price: Decimal,
    pub entry_tick: u64,
    pub status: PositionStatus,
    pub exit_tick: Option<u64>,
    #[serde(with = "sol_opt")]
    pub exit_price: Option<Decimal>,
    #[serde(with = "sol_opt")]
    pub realized_pnl_sol: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
}

// ---------------------------------------------------------------------------
// Sidebet model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidebetStatus {
    Active,
    Won,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidebetOutcome {
    Won,
    Lost,
}

impl std::fmt::Display for SidebetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Won => write!(f, "won"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

/// A wager that the rug lands within the configured window of placement.
#[derive(Debug, Clone, Serialize)]
pub struct Sidebet {
    #[serde(with = "sol")]
    pub amount_sol: Decimal,
    pub placed_tick: u64,
    #[serde(with = "sol")]
    pub placed_price: Decimal,
    pub expires_at_tick: u64,
    pub status: SidebetStatus,
    /// Signed outcome once resolved: `(multiplier − 1) × stake` on a win,
    /// `−stake` on a loss.
    #[serde(with = "sol_opt")]
    pub pnl_sol: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Wallet {
    #[serde(with = "sol")]
    pub balance_sol: Decimal,
    #[serde(with = "sol")]
    pub starting_balance_sol: Decimal,
    /// Σ realized position PnL + Σ sidebet outcomes for the session.
    #[serde(with = "sol")]
    pub session_pnl_sol: Decimal,
}

// ---------------------------------------------------------------------------
// Snapshot & metrics
// ---------------------------------------------------------------------------

/// Immutable copy of the ledger state, handed to event subscribers and
/// external readers.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub game_id: Option<String>,
    pub current_tick: u64,
    #[serde(with = "sol")]
    pub current_price: Decimal,
    pub current_phase: Phase,
    pub game_active: bool,
    pub rugged: bool,
    pub wallet: Wallet,
    pub position: Option<Position>,
    pub sidebet: Option<Sidebet>,
    pub closed_positions: usize,
    pub resolved_sidebets: usize,
    pub last_sidebet_resolved_tick: Option<u64>,
    pub halted: bool,
}

/// Aggregate statistics over **closed positions only** — never derived from
/// balance deltas, so sidebet flow cannot contaminate them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerMetrics {
    pub trades: usize,
    /// Fraction of closed positions with positive realized PnL.
    pub win_rate: Decimal,
    /// Mean realized PnL of winning positions (0 when there are none).
    pub avg_win: Decimal,
    /// Mean realized PnL of losing positions (≤ 0; 0 when there are none).
    pub avg_loss: Decimal,
    /// Total realized PnL over total staked amount.
    pub roi: Decimal,
    /// Largest peak-to-trough drop of the cumulative realized PnL curve.
    pub max_drawdown: Decimal,
}

impl LedgerMetrics {
    fn empty() -> Self {
        Self {
            trades: 0,
            win_rate: Decimal::ZERO,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            roi: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Inner mutable state (behind the lock)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LedgerInner {
    wallet: Wallet,
    position: Option<Position>,
    closed_positions: Vec<Position>,
    sidebet: Option<Sidebet>,
    resolved_sidebets: Vec<Sidebet>,
    /// Σ sidebet outcomes, tracked separately for the accounting identity.
    sidebet_pnl_sol: Decimal,
    last_sidebet_resolved_tick: Option<u64>,
    game_id: Option<String>,
    current_tick: u64,
    current_price: Decimal,
    current_phase: Phase,
    game_active: bool,
    rugged: bool,
    halted: bool,
    /// Set on any mutation; cleared by `reset` so that a second reset is a
    /// no-op.
    dirty: bool,
}

impl LedgerInner {
    fn fresh(initial_balance: Decimal) -> Self {
        Self {
            wallet: Wallet {
                balance_sol: initial_balance,
                starting_balance_sol: initial_balance,
                session_pnl_sol: Decimal::ZERO,
            },
            position: None,
            closed_positions: Vec::new(),
            sidebet: None,
            resolved_sidebets: Vec::new(),
            sidebet_pnl_sol: Decimal::ZERO,
            last_sidebet_resolved_tick: None,
            game_id: None,
            current_tick: 0,
            current_price: Decimal::ZERO,
            current_phase: Phase::Unknown,
            game_active: false,
            rugged: false,
            halted: false,
            dirty: false,
        }
    }
}

// ---------------------------------------------------------------------------
// GameLedger
// ---------------------------------------------------------------------------

/// The canonical state store. Holds a one-directional reference to the event
/// bus; the bus never references the ledger back.
pub struct GameLedger {
    inner: Mutex<LedgerInner>,
    bus: Arc<EventBus>,
    trade_cfg: TradeConfig,
    initial_balance: Decimal,
    lock_timeout: Duration,
}

impl GameLedger {
    pub fn new(bus: Arc<EventBus>, wallet_cfg: &WalletConfig, trade_cfg: TradeConfig) -> Self {
        Self::with_lock_timeout(bus, wallet_cfg, trade_cfg, LOCK_TIMEOUT)
    }

    pub(crate) fn with_lock_timeout(
        bus: Arc<EventBus>,
        wallet_cfg: &WalletConfig,
        trade_cfg: TradeConfig,
        lock_timeout: Duration,
    ) -> Self {
        info!(
            initial_balance = %wallet_cfg.initial_balance_sol,
            "ledger initialised"
        );
        Self {
            inner: Mutex::new(LedgerInner::fresh(wallet_cfg.initial_balance_sol)),
            bus,
            trade_cfg,
            initial_balance: wallet_cfg.initial_balance_sol,
            lock_timeout,
        }
    }

    /// Limits and sidebet rules this ledger was built with.
    pub fn trade_config(&self) -> &TradeConfig {
        &self.trade_cfg
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerInner>, LedgerError> {
        self.inner
            .try_lock_for(self.lock_timeout)
            .ok_or(LedgerError::LockTimeout(self.lock_timeout))
    }

    /// Lock for a mutation: refused while halted.
    fn lock_mut(&self) -> Result<MutexGuard<'_, LedgerInner>, LedgerError> {
        let guard = self.lock()?;
        if guard.halted {
            return Err(LedgerError::Halted);
        }
        Ok(guard)
    }

    fn publish_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let guard = self.lock()?;
        Ok(snapshot_of(&guard))
    }

    /// Aggregate statistics over closed positions.
    pub fn metrics(&self) -> Result<LedgerMetrics, LedgerError> {
        let guard = self.lock()?;
        Ok(compute_metrics(&guard.closed_positions))
    }

    // -------------------------------------------------------------------------
    // Tick ingestion
    // -------------------------------------------------------------------------

    /// Absorb one tick: update tick/price/phase/activity fields, validating
    /// the phase transition (an impermissible one is logged and the phase is
    /// clamped to the new value anyway).
    ///
    /// Returns whether any field changed. The caller publishes the per-tick
    /// `STATE_CHANGED` once trade resolution for the same tick is finished.
    pub fn apply_tick(&self, tick: &GameTick) -> Result<bool, LedgerError> {
        let (changed, events) = {
            let mut g = self.lock_mut()?;

            if !g.current_phase.can_transition_to(tick.phase) {
                warn!(
                    from = %g.current_phase,
                    to = %tick.phase,
                    game_id = %tick.game_id,
                    tick = tick.tick,
                    "impermissible phase transition; clamping to new phase"
                );
            }

            let changed = g.game_id.as_deref() != Some(tick.game_id.as_str())
                || g.current_tick != tick.tick
                || g.current_price != tick.price
                || g.current_phase != tick.phase
                || g.game_active != tick.active
                || g.rugged != tick.rugged;

            g.game_id = Some(tick.game_id.clone());
            g.current_tick = tick.tick;
            g.current_price = tick.price;
            g.current_phase = tick.phase;
            g.game_active = tick.active;
            g.rugged = tick.rugged;
            g.dirty = true;

            let mut events = Vec::new();
            check_invariants(&mut g, &mut events);
            (changed, events)
        };

        let halted = events
            .iter()
            .any(|e| matches!(e, EngineEvent::Error { .. }));
        self.publish_all(events);
        if halted {
            return Err(LedgerError::InvariantViolation(
                "post-condition breach while applying tick".to_string(),
            ));
        }
        Ok(changed)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Open a position, or fold `amount` into the active one with a
    /// weighted-average entry price. Debits the wallet.
    pub fn open_or_add_position(
        &self,
        amount: Decimal,
        price: Decimal,
        tick: u64,
    ) -> Result<Position, LedgerError> {
        let (position, events) = {
            let mut g = self.lock_mut()?;

            if g.wallet.balance_sol < amount {
                return Err(LedgerError::InsufficientBalance {
                    required: amount.to_string(),
                    available: g.wallet.balance_sol.to_string(),
                });
            }

            let old_balance = g.wallet.balance_sol;
            g.wallet.balance_sol -= amount;
            g.dirty = true;

            let position = match g.position.as_mut() {
                Some(pos) => {
                    let total = pos.amount_sol + amount;
                    pos.entry_price =
                        (pos.amount_sol * pos.entry_price + amount * price) / total;
                    pos.amount_sol = total;
                    info!(
                        id = %pos.id,
                        added = %amount,
                        total = %pos.amount_sol,
                        entry = %pos.entry_price,
                        tick,
                        "position increased"
                    );
                    pos.clone()
                }
                None => {
                    let pos = Position {
                        id: Uuid::new_v4().to_string(),
                        amount_sol: amount,
                        entry_price: price,
                        entry_tick: tick,
                        status: PositionStatus::Active,
                        exit_tick: None,
                        exit_price: None,
                        realized_pnl_sol: None,
                        close_reason: None,
                    };
                    info!(
                        id = %pos.id,
                        amount = %amount,
                        entry = %price,
                        tick,
                        "position opened"
                    );
                    g.position = Some(pos.clone());
                    pos
                }
            };

            let mut events = vec![
                EngineEvent::PositionOpened {
                    position: position.clone(),
                },
                EngineEvent::BalanceChanged {
                    old: old_balance,
                    new: g.wallet.balance_sol,
                },
            ];
            check_invariants(&mut g, &mut events);
            events.push(EngineEvent::StateChanged {
                snapshot: snapshot_of(&g),
            });
            (position, events)
        };

        self.publish_all(events);
        Ok(position)
    }

    /// Close the active position at `price`, realising
    /// `amount × (price/entry − 1)`. The wallet is credited with
    /// `amount + realized_pnl`, clamped at zero.
    pub fn close_position(
        &self,
        tick: u64,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<Position, LedgerError> {
        let (position, events) = {
            let mut g = self.lock_mut()?;
            let mut pos = g.position.take().ok_or(LedgerError::NoActivePosition)?;

            let realized = pos.amount_sol * (price / pos.entry_price - Decimal::ONE);
            let credit = (pos.amount_sol + realized).max(Decimal::ZERO);

            let old_balance = g.wallet.balance_sol;
            g.wallet.balance_sol += credit;
            g.wallet.session_pnl_sol += realized;
            g.dirty = true;

            pos.status = PositionStatus::Closed;
            pos.exit_tick = Some(tick);
            pos.exit_price = Some(price);
            pos.realized_pnl_sol = Some(realized);
            pos.close_reason = Some(reason);
            g.closed_positions.push(pos.clone());

            info!(
                id = %pos.id,
                reason = %reason,
                exit_price = %price,
                realized_pnl = %realized,
                balance = %g.wallet.balance_sol,
                "position closed"
            );

            let mut events = vec![
                EngineEvent::PositionClosed {
                    position: pos.clone(),
                    reason,
                },
                EngineEvent::BalanceChanged {
                    old: old_balance,
                    new: g.wallet.balance_sol,
                },
            ];
            check_invariants(&mut g, &mut events);
            events.push(EngineEvent::StateChanged {
                snapshot: snapshot_of(&g),
            });
            (pos, events)
        };

        self.publish_all(events);
        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Sidebets
    // -------------------------------------------------------------------------

    /// Place a sidebet expiring `sidebet_window_ticks` after `tick`. Debits
    /// the stake.
    pub fn place_sidebet(
        &self,
        amount: Decimal,
        tick: u64,
        price: Decimal,
    ) -> Result<Sidebet, LedgerError> {
        let (sidebet, events) = {
            let mut g = self.lock_mut()?;

            if g.sidebet.is_some() {
                return Err(LedgerError::SidebetActive);
            }
            if g.wallet.balance_sol < amount {
                return Err(LedgerError::InsufficientBalance {
                    required: amount.to_string(),
                    available: g.wallet.balance_sol.to_string(),
                });
            }

            let old_balance = g.wallet.balance_sol;
            g.wallet.balance_sol -= amount;
            g.dirty = true;

            let sidebet = Sidebet {
                amount_sol: amount,
                placed_tick: tick,
                placed_price: price,
                expires_at_tick: tick + self.trade_cfg.sidebet_window_ticks,
                status: SidebetStatus::Active,
                pnl_sol: None,
            };
            g.sidebet = Some(sidebet.clone());

            info!(
                amount = %amount,
                tick,
                expires_at = sidebet.expires_at_tick,
                "sidebet placed"
            );

            let mut events = vec![
                EngineEvent::SidebetPlaced {
                    sidebet: sidebet.clone(),
                },
                EngineEvent::BalanceChanged {
                    old: old_balance,
                    new: g.wallet.balance_sol,
                },
            ];
            check_invariants(&mut g, &mut events);
            events.push(EngineEvent::StateChanged {
                snapshot: snapshot_of(&g),
            });
            (sidebet, events)
        };

        self.publish_all(events);
        Ok(sidebet)
    }

    /// Resolve the active sidebet. A win credits `multiplier × stake` back
    /// to the wallet (the stake was debited at placement, so the net gain is
    /// `(multiplier − 1) × stake`); a loss credits nothing.
    pub fn resolve_sidebet(
        &self,
        tick: u64,
        outcome: SidebetOutcome,
    ) -> Result<Sidebet, LedgerError> {
        let (sidebet, events) = {
            let mut g = self.lock_mut()?;
            let mut bet = g.sidebet.take().ok_or(LedgerError::NoActiveSidebet)?;

            let old_balance = g.wallet.balance_sol;
            let pnl = match outcome {
                SidebetOutcome::Won => {
                    let credit = bet.amount_sol * self.trade_cfg.sidebet_multiplier;
                    g.wallet.balance_sol += credit;
                    bet.status = SidebetStatus::Won;
                    bet.amount_sol * (self.trade_cfg.sidebet_multiplier - Decimal::ONE)
                }
                SidebetOutcome::Lost => {
                    bet.status = SidebetStatus::Lost;
                    -bet.amount_sol
                }
            };
            bet.pnl_sol = Some(pnl);

            g.wallet.session_pnl_sol += pnl;
            g.sidebet_pnl_sol += pnl;
            g.last_sidebet_resolved_tick = Some(tick);
            g.resolved_sidebets.push(bet.clone());
            g.dirty = true;

            info!(
                outcome = %outcome,
                pnl = %pnl,
                tick,
                balance = %g.wallet.balance_sol,
                "sidebet resolved"
            );

            let mut events = vec![EngineEvent::SidebetResolved {
                sidebet: bet.clone(),
                outcome,
            }];
            if g.wallet.balance_sol != old_balance {
                events.push(EngineEvent::BalanceChanged {
                    old: old_balance,
                    new: g.wallet.balance_sol,
                });
            }
            check_invariants(&mut g, &mut events);
            events.push(EngineEvent::StateChanged {
                snapshot: snapshot_of(&g),
            });
            (bet, events)
        };

        self.publish_all(events);
        Ok(sidebet)
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Rebuild initial state. With `keep_balance` the wallet, session
    /// history, and sidebet cooldown marker carry across games (live mode);
    /// without it everything returns to the configured initial state (file
    /// mode). Clears a halt. Calling `reset` on an already-pristine ledger
    /// is a no-op.
    pub fn reset(&self, keep_balance: bool) -> Result<(), LedgerError> {
        let events = {
            // Deliberately not `lock_mut`: reset is the cure for a halt.
            let mut g = self.lock()?;
            if !g.dirty {
                debug!("reset on pristine ledger is a no-op");
                return Ok(());
            }

            let mut events = Vec::new();

            // A position still open at a game boundary means the game ended
            // without a rug (truncated recording). Close it at the last
            // price rather than dropping the stake.
            if let Some(pos) = g.position.take() {
                warn!(id = %pos.id, "position still open at reset; closing at last price");
                let price = g.current_price;
                let realized = pos.amount_sol * (price / pos.entry_price - Decimal::ONE);
                let credit = (pos.amount_sol + realized).max(Decimal::ZERO);
                let old_balance = g.wallet.balance_sol;
                g.wallet.balance_sol += credit;
                g.wallet.session_pnl_sol += realized;

                let mut closed = pos;
                closed.status = PositionStatus::Closed;
                closed.exit_tick = Some(g.current_tick);
                closed.exit_price = Some(price);
                closed.realized_pnl_sol = Some(realized);
                closed.close_reason = Some(CloseReason::Manual);
                g.closed_positions.push(closed.clone());

                events.push(EngineEvent::PositionClosed {
                    position: closed,
                    reason: CloseReason::Manual,
                });
                events.push(EngineEvent::BalanceChanged {
                    old: old_balance,
                    new: g.wallet.balance_sol,
                });
            }

            // A sidebet still active at a game boundary can no longer win.
            if let Some(mut bet) = g.sidebet.take() {
                warn!(
                    placed_tick = bet.placed_tick,
                    "sidebet still active at reset; resolving as lost"
                );
                bet.status = SidebetStatus::Lost;
                bet.pnl_sol = Some(-bet.amount_sol);
                g.wallet.session_pnl_sol -= bet.amount_sol;
                g.sidebet_pnl_sol -= bet.amount_sol;
                g.last_sidebet_resolved_tick = Some(g.current_tick);
                g.resolved_sidebets.push(bet.clone());
                events.push(EngineEvent::SidebetResolved {
                    sidebet: bet,
                    outcome: SidebetOutcome::Lost,
                });
            }

            if keep_balance {
                // Wallet, history, cooldown marker, and the rug flag carry.
                g.game_id = None;
                g.current_tick = 0;
                g.current_price = Decimal::ZERO;
                g.current_phase = Phase::Unknown;
                g.game_active = false;
            } else {
                *g = LedgerInner::fresh(self.initial_balance);
            }
            g.halted = false;
            g.dirty = false;

            events.push(EngineEvent::StateChanged {
                snapshot: snapshot_of(&g),
            });
            events
        };

        self.publish_all(events);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers over the inner state
// ---------------------------------------------------------------------------

fn snapshot_of(g: &LedgerInner) -> LedgerSnapshot {
    LedgerSnapshot {
        game_id: g.game_id.clone(),
        current_tick: g.current_tick,
        current_price: g.current_price,
        current_phase: g.current_phase,
        game_active: g.game_active,
        rugged: g.rugged,
        wallet: g.wallet.clone(),
        position: g.position.clone(),
        sidebet: g.sidebet.clone(),
        closed_positions: g.closed_positions.len(),
        resolved_sidebets: g.resolved_sidebets.len(),
        last_sidebet_resolved_tick: g.last_sidebet_resolved_tick,
        halted: g.halted,
    }
}

/// Post-condition checks. A breach halts the ledger and appends an `ERROR`
/// event for the engine to act on.
fn check_invariants(g: &mut LedgerInner, events: &mut Vec<EngineEvent>) {
    let mut breach: Option<String> = None;

    if g.wallet.balance_sol < Decimal::ZERO {
        breach = Some(format!(
            "balance below zero: {}",
            g.wallet.balance_sol
        ));
    } else {
        let position_pnl: Decimal = g
            .closed_positions
            .iter()
            .filter_map(|p| p.realized_pnl_sol)
            .sum();
        let expected = position_pnl + g.sidebet_pnl_sol;
        if g.wallet.session_pnl_sol != expected {
            breach = Some(format!(
                "session PnL identity broken: recorded {} != derived {}",
                g.wallet.session_pnl_sol, expected
            ));
        }
    }

    if let Some(message) = breach {
        error!(%message, "ledger invariant violated; halting");
        g.halted = true;
        events.push(EngineEvent::Error {
            kind: "InvariantViolation".to_string(),
            message,
        });
    }
}

fn compute_metrics(closed: &[Position]) -> LedgerMetrics {
    let realized: Vec<Decimal> = closed
        .iter()
        .filter_map(|p| p.realized_pnl_sol)
        .collect();
    if realized.is_empty() {
        return LedgerMetrics::empty();
    }

    let trades = realized.len();
    let wins: Vec<Decimal> = realized
        .iter()
        .copied()
        .filter(|p| *p > Decimal::ZERO)
        .collect();
    let losses: Vec<Decimal> = realized
        .iter()
        .copied()
        .filter(|p| *p < Decimal::ZERO)
        .collect();

    let total: Decimal = realized.iter().copied().sum();
    let staked: Decimal = closed.iter().map(|p| p.amount_sol).sum();

    let mut peak = Decimal::ZERO;
    let mut max_drawdown = Decimal::ZERO;
    let mut cumulative = Decimal::ZERO;
    for pnl in &realized {
        cumulative += *pnl;
        peak = peak.max(cumulative);
        max_drawdown = max_drawdown.max(peak - cumulative);
    }

    LedgerMetrics {
        trades,
        win_rate: Decimal::from(wins.len() as u64) / Decimal::from(trades as u64),
        avg_win: if wins.is_empty() {
            Decimal::ZERO
        } else {
            wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u64)
        },
        avg_loss: if losses.is_empty() {
            Decimal::ZERO
        } else {
            losses.iter().copied().sum::<Decimal>() / Decimal::from(losses.len() as u64)
        },
        roi: if staked.is_zero() {
            Decimal::ZERO
        } else {
            total / staked
        },
        max_drawdown,
    }
}
