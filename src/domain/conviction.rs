use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::domain::Symbol;

/// Execution urgency of a conviction.
///
/// Each level carries its execution parameters; orders generated from a
/// conviction are tagged with the level's participation rate and duration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn participation_rate(&self) -> f64 {
        match self {
            Self::High => 0.30,
            Self::Medium => 0.15,
            Self::Low => 0.05,
        }
    }

    pub fn max_duration_hours(&self) -> u32 {
        match self {
            Self::High => 4,
            Self::Medium => 8,
            Self::Low => 24,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// A trade intent expressing desired exposure rather than a concrete order.
///
/// Exactly one of `target_weight`, `target_notional` or `score` is expected;
/// the alpha processor normalises all three to a weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conviction {
    pub conviction_id: String,
    pub symbol: Symbol,
    pub target_weight: Option<f64>,
    pub target_notional: Option<f64>,
    pub score: Option<f64>,
    pub urgency: Urgency,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn urgency_table() {
        assert_eq!(Urgency::High.participation_rate(), 0.30);
        assert_eq!(Urgency::High.max_duration_hours(), 4);
        assert_eq!(Urgency::Medium.participation_rate(), 0.15);
        assert_eq!(Urgency::Medium.max_duration_hours(), 8);
        assert_eq!(Urgency::Low.participation_rate(), 0.05);
        assert_eq!(Urgency::Low.max_duration_hours(), 24);
    }

    #[test]
    fn urgency_parses_wire_names() {
        assert_eq!(Urgency::from_str("HIGH").unwrap(), Urgency::High);
        assert!(Urgency::from_str("urgent").is_err());
    }
}
