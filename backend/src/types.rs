// =============================================================================
// Shared types used across the candle pipeline
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Bucket width of a candle series. Only the intervals the chart offers are
/// representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Every selectable timeframe, shortest first.
    pub const ALL: [Timeframe; 6] = [
        Self::M1,
        Self::M5,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    /// Binance interval code (`1m`, `4h`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| PipelineError::InvalidSelection(format!("unsupported timeframe '{s}'")))
    }
}

/// The (symbol, timeframe) pair the chart is currently showing. Replaced
/// wholesale on every user action.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl Selection {
    /// Build a selection, normalising the symbol to Binance's upper-case form.
    pub fn new(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            timeframe,
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::new("BTCUSDT", Timeframe::M1)
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// One selectable instrument: the identifier sent to the provider plus the
/// icon the chart header shows next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default)]
    pub image_url: String,
}

impl SymbolInfo {
    pub fn new(name: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_url: image_url.into(),
        }
    }
}

/// Instruments offered when the config file does not list any.
pub fn default_catalog() -> Vec<SymbolInfo> {
    const ICON_BASE: &str = "https://s2.coinmarketcap.com/static/img/coins/64x64";
    [
        ("BTCUSDT", 1),
        ("ETHUSDT", 1027),
        ("BNBUSDT", 1839),
        ("XRPUSDT", 52),
        ("SOLUSDT", 5426),
    ]
    .into_iter()
    .map(|(name, id)| SymbolInfo::new(name, format!("{ICON_BASE}/{id}.png")))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_every_offered_interval() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn timeframe_rejects_unoffered_interval() {
        let err = "15m".parse::<Timeframe>().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSelection(_)));
    }

    #[test]
    fn timeframe_serde_uses_interval_codes() {
        assert_eq!(serde_json::to_string(&Timeframe::H4).unwrap(), "\"4h\"");
        let tf: Timeframe = serde_json::from_str("\"30m\"").unwrap();
        assert_eq!(tf, Timeframe::M30);
    }

    #[test]
    fn selection_normalises_symbol() {
        let sel = Selection::new(" ethusdt ", Timeframe::M5);
        assert_eq!(sel.symbol, "ETHUSDT");
        assert_eq!(sel.to_string(), "ETHUSDT@5m");
    }

    #[test]
    fn default_catalog_starts_with_bitcoin() {
        let catalog = default_catalog();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog[0].name, "BTCUSDT");
        assert!(catalog[0].image_url.ends_with("/1.png"));
    }
}
