//! Core market data types shared by live feeds and replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grid::errors::{GridError, GridResult};

const KNOWN_QUOTES: [&str; 4] = ["USDT", "USDC", "BUSD", "BTC"];

/// Trading pair, e.g. ETH / USDT
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Parse "ETHUSDT", "ETH/USDT" or "eth-usdt"
    pub fn parse(raw: &str) -> GridResult<Self> {
        let upper = raw.trim().to_uppercase();
        if let Some((base, quote)) = upper.split_once(|c: char| c == '/' || c == '-' || c == '_') {
            if !base.is_empty() && !quote.is_empty() {
                return Ok(Self::new(base, quote));
            }
        }

        KNOWN_QUOTES
            .iter()
            .find_map(|quote| {
                upper
                    .strip_suffix(quote)
                    .filter(|base| !base.is_empty())
                    .map(|base| Self::new(base, *quote))
            })
            .ok_or_else(|| GridError::InvalidConfig(format!("cannot parse symbol '{}'", raw)))
    }

    /// Exchange-style concatenated name, e.g. "ETHUSDT"
    pub fn binance(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Kline stream name, e.g. "ethusdt@kline_1m"
    pub fn kline_stream(&self, timeframe: &str) -> String {
        format!("{}@kline_{}", self.binance(), timeframe).to_lowercase()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Convert an interval such as "5m", "4h", "1d" or "1w" to milliseconds.
///
/// Unknown or malformed intervals fall back to one minute.
pub fn timeframe_ms(timeframe: &str) -> i64 {
    const MINUTE: i64 = 60 * 1000;
    let tf = timeframe.trim();
    if tf.len() < 2 {
        return MINUTE;
    }
    let (count, unit) = tf.split_at(tf.len() - 1);
    let Ok(count) = count.parse::<i64>() else {
        return MINUTE;
    };
    match unit {
        "m" => count * MINUTE,
        "h" => count * 60 * MINUTE,
        "d" => count * 24 * 60 * MINUTE,
        "w" => count * 7 * 24 * 60 * MINUTE,
        _ => MINUTE,
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: Symbol,
    pub timeframe: String,
    /// Bar open time in milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bar interval is complete
    pub finished: bool,
}

impl Kline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timeframe: impl Into<String>,
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        finished: bool,
    ) -> Self {
        Self {
            symbol,
            timeframe: timeframe.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            finished,
        }
    }

    /// Bar close time in milliseconds
    pub fn close_time(&self) -> i64 {
        self.timestamp + timeframe_ms(&self.timeframe)
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}
