// =============================================================================
// Shared types — game ticks, phases, and the JSON-lines wire envelope
// =============================================================================
//
// Monetary values are `rust_decimal::Decimal` end to end. The backend emits
// prices as JSON strings or floats; either way the value is converted through
// its string form so binary floating-point never touches a balance.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Decimal wire helpers
// ---------------------------------------------------------------------------

/// Serde adapter for SOL-denominated decimals.
///
/// Serialises as a string (preserving precision in recorded files) and
/// deserialises from either a string or a JSON number, converting numbers via
/// their string representation.
pub mod sol {
    use super::*;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Decimal, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_string())
    }

    struct SolVisitor;

    impl Visitor<'_> for SolVisitor {
        type Value = Decimal;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a decimal as a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Decimal, E> {
            Decimal::from_str(v).map_err(|e| E::custom(format!("invalid decimal {v:?}: {e}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Decimal, E> {
            // Through the string form, never through the bit pattern.
            self.visit_str(&v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Decimal, E> {
            Ok(Decimal::from(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Decimal, E> {
            Ok(Decimal::from(v))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Decimal, D::Error> {
        de.deserialize_any(SolVisitor)
    }
}

/// `Option<Decimal>` variant of [`sol`]. Missing and `null` both map to `None`.
pub mod sol_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Decimal>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&d.to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Decimal>, D::Error> {
        #[derive(Deserialize)]
        struct Wrap(#[serde(with = "sol")] Decimal);
        Ok(Option::<Wrap>::deserialize(de)?.map(|w| w.0))
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Coarse state of a game round as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Cooldown,
    Presale,
    GameActivation,
    ActiveGameplay,
    RugEvent,
    /// Anything the backend sends that we do not recognise.
    #[serde(other)]
    Unknown,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown => write!(f, "COOLDOWN"),
            Self::Presale => write!(f, "PRESALE"),
            Self::GameActivation => write!(f, "GAME_ACTIVATION"),
            Self::ActiveGameplay => write!(f, "ACTIVE_GAMEPLAY"),
            Self::RugEvent => write!(f, "RUG_EVENT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl Phase {
    /// Whether `self → next` is a permitted transition.
    ///
    /// Permitted: the round cycle COOLDOWN → PRESALE → {GAME_ACTIVATION |
    /// ACTIVE_GAMEPLAY} → ACTIVE_GAMEPLAY → RUG_EVENT → COOLDOWN, staying in
    /// the same phase, and leaving `Unknown` (the pre-first-tick state).
    /// Everything else is logged by the ledger and the phase is clamped to
    /// the new value anyway.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        if self == next || self == Unknown {
            return true;
        }
        matches!(
            (self, next),
            (Cooldown, Presale)
                | (Presale, GameActivation)
                | (Presale, ActiveGameplay)
                | (GameActivation, ActiveGameplay)
                | (ActiveGameplay, RugEvent)
                | (RugEvent, Cooldown)
        )
    }
}

// ---------------------------------------------------------------------------
// GameTick
// ---------------------------------------------------------------------------

/// One immutable frame of game state emitted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameTick {
    /// Opaque round identifier.
    pub game_id: String,
    /// Tick index; monotonically non-decreasing within a game.
    pub tick: u64,
    /// Frame timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Current multiplier price. Always ≥ 0.
    #[serde(with = "sol")]
    pub price: Decimal,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub rugged: bool,
    #[serde(default)]
    pub cooldown_timer_ms: u64,
    #[serde(default)]
    pub trade_count: u64,
}

/// End-of-game summary: the payload of `GAME_END` events and the trailer
/// line of recorded files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSummary {
    pub game_id: String,
    pub total_ticks: u64,
    #[serde(with = "sol")]
    pub peak_price: Decimal,
    pub rugged_at_tick: Option<u64>,
}

// ---------------------------------------------------------------------------
// JSON-lines wire envelope
// ---------------------------------------------------------------------------

/// One line of a recorded `.jsonl` game file.
///
/// Files open with an optional `game_start` line, carry one `tick` line per
/// frame, and close with a `game_end` summary. Unknown `event` values are
/// ignored with a warning at the parse site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordLine {
    GameStart {
        game_id: String,
        timestamp: DateTime<Utc>,
    },
    Tick {
        #[serde(flatten)]
        tick: GameTick,
    },
    GameEnd {
        game_id: String,
        total_ticks: u64,
        #[serde(with = "sol")]
        peak_price: Decimal,
        #[serde(default)]
        rugged_at_tick: Option<u64>,
    },
}

/// Outcome of classifying a raw line that failed to parse as a [`RecordLine`].
#[derive(Debug, PartialEq, Eq)]
pub enum LineDefect {
    /// Valid JSON carrying an `event` tag we do not know. Ignored.
    UnknownEvent(String),
    /// Not valid JSON, or a known event with bad fields. Counted as malformed.
    Malformed(String),
}

/// Classify a line that `serde_json::from_str::<RecordLine>` rejected.
pub fn classify_bad_line(line: &str, parse_err: &serde_json::Error) -> LineDefect {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => match value.get("event").and_then(|v| v.as_str()) {
            Some(event) if !matches!(event, "game_start" | "tick" | "game_end") => {
                LineDefect::UnknownEvent(event.to_string())
            }
            _ => LineDefect::Malformed(parse_err.to_string()),
        },
        Err(_) => LineDefect::Malformed(parse_err.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_tick(game_id: &str, tick: u64, price: Decimal, phase: Phase) -> GameTick {
        GameTick {
            game_id: game_id.to_string(),
            tick,
            timestamp: DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + chrono::Duration::milliseconds(tick as i64 * 250),
            price,
            phase,
            active: phase == Phase::ActiveGameplay,
            rugged: phase == Phase::RugEvent,
            cooldown_timer_ms: 0,
            trade_count: 0,
        }
    }

    #[test]
    fn phase_cycle_is_permitted() {
        use Phase::*;
        assert!(Cooldown.can_transition_to(Presale));
        assert!(Presale.can_transition_to(GameActivation));
        assert!(Presale.can_transition_to(ActiveGameplay));
        assert!(GameActivation.can_transition_to(ActiveGameplay));
        assert!(ActiveGameplay.can_transition_to(RugEvent));
        assert!(RugEvent.can_transition_to(Cooldown));
        assert!(ActiveGameplay.can_transition_to(ActiveGameplay));
    }

    #[test]
    fn backwards_transitions_are_rejected() {
        use Phase::*;
        assert!(!RugEvent.can_transition_to(ActiveGameplay));
        assert!(!ActiveGameplay.can_transition_to(Presale));
        assert!(!Cooldown.can_transition_to(ActiveGameplay));
        assert!(!Presale.can_transition_to(Unknown));
    }

    #[test]
    fn unknown_is_a_universal_origin() {
        assert!(Phase::Unknown.can_transition_to(Phase::ActiveGameplay));
        assert!(Phase::Unknown.can_transition_to(Phase::Cooldown));
    }

    #[test]
    fn tick_price_accepts_string_and_float() {
        let from_string: GameTick = serde_json::from_str(
            r#"{"game_id":"g1","tick":3,"timestamp":"2025-06-01T12:00:00Z",
                "price":"1.2345","phase":"ACTIVE_GAMEPLAY","active":true}"#,
        )
        .unwrap();
        assert_eq!(from_string.price, dec!(1.2345));

        let from_float: GameTick = serde_json::from_str(
            r#"{"game_id":"g1","tick":3,"timestamp":"2025-06-01T12:00:00Z",
                "price":1.25,"phase":"ACTIVE_GAMEPLAY"}"#,
        )
        .unwrap();
        assert_eq!(from_float.price, dec!(1.25));
    }

    #[test]
    fn tick_price_serialises_as_string() {
        let tick = sample_tick("g1", 7, dec!(0.123456789012), Phase::ActiveGameplay);
        let json = serde_json::to_string(&tick).unwrap();
        assert!(json.contains(r#""price":"0.123456789012""#));
    }

    #[test]
    fn unrecognised_phase_maps_to_unknown() {
        let tick: GameTick = serde_json::from_str(
            r#"{"game_id":"g1","tick":0,"timestamp":"2025-06-01T12:00:00Z",
                "price":"1.0","phase":"SOMETHING_NEW"}"#,
        )
        .unwrap();
        assert_eq!(tick.phase, Phase::Unknown);
    }

    #[test]
    fn record_line_roundtrip() {
        let line = RecordLine::Tick {
            tick: sample_tick("g9", 42, dec!(2.5), Phase::ActiveGameplay),
        };
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains(r#""event":"tick""#));
        let back: RecordLine = serde_json::from_str(&json).unwrap();
        assert_eq!(back, line);
    }

    #[test]
    fn game_end_line_parses() {
        let line: RecordLine = serde_json::from_str(
            r#"{"event":"game_end","game_id":"g1","total_ticks":200,
                "peak_price":"3.117","rugged_at_tick":138}"#,
        )
        .unwrap();
        match line {
            RecordLine::GameEnd {
                total_ticks,
                peak_price,
                rugged_at_tick,
                ..
            } => {
                assert_eq!(total_ticks, 200);
                assert_eq!(peak_price, dec!(3.117));
                assert_eq!(rugged_at_tick, Some(138));
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_distinguished_from_garbage() {
        let unknown = r#"{"event":"heartbeat","seq":9}"#;
        let err = serde_json::from_str::<RecordLine>(unknown).unwrap_err();
        assert_eq!(
            classify_bad_line(unknown, &err),
            LineDefect::UnknownEvent("heartbeat".to_string())
        );

        let garbage = r#"{"event":"tick","game_id":1}"#;
        let err = serde_json::from_str::<RecordLine>(garbage).unwrap_err();
        assert!(matches!(
            classify_bad_line(garbage, &err),
            LineDefect::Malformed(_)
        ));

        let not_json = "}{";
        let err = serde_json::from_str::<RecordLine>(not_json).unwrap_err();
        assert!(matches!(
            classify_bad_line(not_json, &err),
            LineDefect::Malformed(_)
        ));
    }
}
