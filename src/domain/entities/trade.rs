//! Ledger-side enumerations for trade rows.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "LONG",
            TradeDirection::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(TradeDirection::Long),
            "SHORT" => Some(TradeDirection::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(TradeStatus::Open),
            "CLOSED" => Some(TradeStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a ledger row came into existence. Stored as a real column so that
/// analytics can filter orphans and partial remainders without pattern
/// matching on note text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOrigin {
    /// Created by an entry deal observed in order.
    Normal,
    /// Exit deal arrived with no entry on record; entry price unknown.
    OrphanExit,
    /// Open remainder split off by a partial close.
    PartialRemainder,
}

impl TradeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOrigin::Normal => "normal",
            TradeOrigin::OrphanExit => "orphan_exit",
            TradeOrigin::PartialRemainder => "partial_remainder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(TradeOrigin::Normal),
            "orphan_exit" => Some(TradeOrigin::OrphanExit),
            "partial_remainder" => Some(TradeOrigin::PartialRemainder),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trip() {
        assert_eq!(TradeDirection::parse("LONG"), Some(TradeDirection::Long));
        assert_eq!(TradeDirection::parse("short"), None);
        assert_eq!(TradeDirection::Short.as_str(), "SHORT");
    }

    #[test]
    fn test_origin_round_trip() {
        for origin in [
            TradeOrigin::Normal,
            TradeOrigin::OrphanExit,
            TradeOrigin::PartialRemainder,
        ] {
            assert_eq!(TradeOrigin::parse(origin.as_str()), Some(origin));
        }
    }
}
