//! Deal events as reported by terminal Expert Advisors.
//!
//! A deal is a single broker execution: an entry fill, an exit fill, or a
//! combined in/out fill on netting accounts. Deals sharing a `position_id`
//! belong to one broker position, which is the unit the ledger tracks.

use serde::{Deserialize, Serialize};

use crate::domain::entities::trade::TradeDirection;
use crate::domain::services::terminal_time::TimeField;

/// MT5 deal entry type codes: 0 = IN, 1 = OUT, 2 = INOUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealEntryType {
    Entry,
    Exit,
    InOut,
}

impl DealEntryType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DealEntryType::Entry),
            1 => Some(DealEntryType::Exit),
            2 => Some(DealEntryType::InOut),
            _ => None,
        }
    }
}

/// Which telemetry channel produced a ledger write. Recorded on the trade
/// row on first write and immutable afterwards; a deal from the other
/// source for the same position is a conflict, never a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    LocalEa,
    Metaapi,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::LocalEa => "local_ea",
            SyncSource::Metaapi => "metaapi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local_ea" => Some(SyncSource::LocalEa),
            "metaapi" => Some(SyncSource::Metaapi),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broker-reported execution event, as posted by the terminal EA.
///
/// Field names follow the EA wire format. Optional fields are genuinely
/// optional on the wire; EA builds differ in what they attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealEvent {
    pub ticket: i64,
    pub symbol: String,
    /// "BUY" or "SELL". Kept as text so an unknown value degrades to a
    /// per-deal failure instead of rejecting the whole batch.
    #[serde(rename = "type")]
    pub side: String,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub open_price: Option<f64>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub open_time: Option<TimeField>,
    #[serde(default)]
    pub close_time: Option<TimeField>,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub swap: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub position_id: Option<i64>,
    #[serde(default)]
    pub magic: Option<i64>,
    #[serde(default)]
    pub entry_type: Option<i64>,
    #[serde(default)]
    pub reason: Option<i64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub contract_size: Option<f64>,
}

impl DealEvent {
    /// Direction of the position this deal opened: BUY opens LONG.
    pub fn direction(&self) -> TradeDirection {
        if self.side.eq_ignore_ascii_case("BUY") {
            TradeDirection::Long
        } else {
            TradeDirection::Short
        }
    }

    /// Direction of the position this deal *closed*: an exit SELL closes a
    /// LONG position, an exit BUY closes a SHORT one.
    pub fn inverted_direction(&self) -> TradeDirection {
        if self.side.eq_ignore_ascii_case("SELL") {
            TradeDirection::Long
        } else {
            TradeDirection::Short
        }
    }

    pub fn position_id_string(&self) -> Option<String> {
        self.position_id.map(|id| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_codes() {
        assert_eq!(DealEntryType::from_code(0), Some(DealEntryType::Entry));
        assert_eq!(DealEntryType::from_code(1), Some(DealEntryType::Exit));
        assert_eq!(DealEntryType::from_code(2), Some(DealEntryType::InOut));
        assert_eq!(DealEntryType::from_code(7), None);
    }

    #[test]
    fn test_direction_inversion() {
        let deal: DealEvent = serde_json::from_value(serde_json::json!({
            "ticket": 1, "symbol": "EURUSD", "type": "SELL"
        }))
        .unwrap();
        assert_eq!(deal.direction(), TradeDirection::Short);
        assert_eq!(deal.inverted_direction(), TradeDirection::Long);
    }

    #[test]
    fn test_wire_field_names() {
        let deal: DealEvent = serde_json::from_value(serde_json::json!({
            "ticket": 42,
            "symbol": "XAUUSD",
            "type": "BUY",
            "positionId": 9001,
            "entryType": 0,
            "stopLoss": 1900.0,
            "contractSize": 100.0
        }))
        .unwrap();
        assert_eq!(deal.position_id, Some(9001));
        assert_eq!(deal.entry_type, Some(0));
        assert_eq!(deal.contract_size, Some(100.0));
        assert_eq!(deal.position_id_string().as_deref(), Some("9001"));
    }

    #[test]
    fn test_sync_source_round_trip() {
        assert_eq!(SyncSource::parse("local_ea"), Some(SyncSource::LocalEa));
        assert_eq!(SyncSource::parse("metaapi"), Some(SyncSource::Metaapi));
        assert_eq!(SyncSource::parse("csv_import"), None);
        assert_eq!(SyncSource::Metaapi.as_str(), "metaapi");
    }
}
