use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Derivatives venues the robots trade on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Binance,
    Okx,
    Gate,
    Bitget,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Binance,
        Platform::Okx,
        Platform::Gate,
        Platform::Bitget,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Binance => "binance",
            Platform::Okx => "okx",
            Platform::Gate => "gate",
            Platform::Bitget => "bitget",
        }
    }

    /// Suffix used for per-platform environment overrides, e.g. `POLL_INTERVAL_SECONDS_OKX`
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Platform::Binance => "BINANCE",
            Platform::Okx => "OKX",
            Platform::Gate => "GATE",
            Platform::Bitget => "BITGET",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Platform::Binance),
            "okx" | "okex" => Ok(Platform::Okx),
            "gate" | "gateio" | "gate.io" => Ok(Platform::Gate),
            "bitget" => Ok(Platform::Bitget),
            other => Err(ValidationError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Venue-independent symbol form: `BTC-USDT-SWAP`, `BTC_USDT` and `btcusdt` all map to `BTCUSDT`.
pub fn canonical_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    let base = upper
        .strip_suffix("-SWAP")
        .or_else(|| upper.strip_suffix("_UMCBL"))
        .unwrap_or(&upper);
    base.chars()
        .filter(|c| !matches!(c, '-' | '_' | '/'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trip_names() {
        for platform in Platform::ALL {
            assert_eq!(platform.name().parse::<Platform>().unwrap(), platform);
        }
        assert_eq!("GateIO".parse::<Platform>().unwrap(), Platform::Gate);
        assert!("kraken".parse::<Platform>().is_err());
    }

    #[test]
    fn test_canonical_symbol() {
        assert_eq!(canonical_symbol("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(canonical_symbol("BTC_USDT"), "BTCUSDT");
        assert_eq!(canonical_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(canonical_symbol("ETH/USDT"), "ETHUSDT");
        assert_eq!(canonical_symbol("BTCUSDT_UMCBL"), "BTCUSDT");
    }
}
