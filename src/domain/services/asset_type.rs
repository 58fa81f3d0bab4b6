//! Symbol classification.
//!
//! Brokers decorate symbols with house suffixes (`EURUSD.i`, `XAUUSD_SB`,
//! `GBPJPY.raw`), so classification strips those first and then applies
//! substring heuristics. Pure function, no state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Forex,
    Crypto,
    Commodities,
    Indices,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Forex => "FOREX",
            AssetType::Crypto => "CRYPTO",
            AssetType::Commodities => "COMMODITIES",
            AssetType::Indices => "INDICES",
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const MAJOR_CURRENCIES: [&str; 8] = ["EUR", "USD", "GBP", "JPY", "AUD", "NZD", "CAD", "CHF"];

const CRYPTO_TICKERS: [&str; 7] = ["BTC", "ETH", "LTC", "XRP", "ADA", "SOL", "DOGE"];

const COMMODITY_TICKERS: [&str; 11] = [
    "XAU", "GOLD", "XAG", "SILVER", "OIL", "BRENT", "WTI", "USOIL", "UKOIL", "NGAS", "COPPER",
];

const INDEX_TICKERS: [&str; 18] = [
    "US30", "DJ30", "NAS100", "NDX", "USTEC", "SPX", "SP500", "US500", "GER30", "GER40", "DE30",
    "DE40", "UK100", "JP225", "JPN225", "AUS200", "FRA40", "HK50",
];

const BROKER_SUFFIXES: [&str; 14] = [
    ".I", ".M", ".SB", ".RAW", ".PRO", ".ECN", ".STD", "_I", "_M", "_SB", "_RAW", "_PRO", "_ECN",
    "_STD",
];

fn strip_broker_suffix(symbol: &str) -> &str {
    for suffix in BROKER_SUFFIXES {
        if let Some(stripped) = symbol.strip_suffix(suffix) {
            return stripped;
        }
    }
    symbol
}

/// Classify a broker symbol into an asset class. Defaults to FOREX when no
/// heuristic matches, which is the dominant class on MT5 retail accounts.
pub fn detect_asset_type(symbol: &str) -> AssetType {
    let upper = symbol.to_uppercase();
    let upper = strip_broker_suffix(&upper);

    // A pair of major currency codes in a short symbol is a forex pair.
    let currency_hits = MAJOR_CURRENCIES.iter().filter(|c| upper.contains(*c)).count();
    if currency_hits >= 2 && upper.len() <= 7 {
        return AssetType::Forex;
    }

    if CRYPTO_TICKERS.iter().any(|c| upper.contains(c)) {
        return AssetType::Crypto;
    }

    if COMMODITY_TICKERS.iter().any(|c| upper.contains(c)) {
        return AssetType::Commodities;
    }

    if INDEX_TICKERS.iter().any(|i| upper.contains(i)) {
        return AssetType::Indices;
    }

    AssetType::Forex
}
