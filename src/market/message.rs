//! Kline stream message in the exchange WebSocket wire shape.
//!
//! Replay produces exactly the same JSON a live combined stream delivers, so
//! strategy tasks parse one format regardless of where bars come from.

use serde::{Deserialize, Serialize};

use super::types::{Kline, Symbol};
use crate::grid::errors::{GridError, GridResult};

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineMessage {
    pub stream: String,
    pub data: KlineEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Bar body; prices and volumes travel as decimal strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "f", default)]
    pub first_trade_id: i64,
    #[serde(rename = "L", default)]
    pub last_trade_id: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n", default)]
    pub trade_count: i64,
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q", default)]
    pub quote_volume: String,
    #[serde(rename = "V", default)]
    pub taker_buy_volume: String,
    #[serde(rename = "Q", default)]
    pub taker_buy_quote_volume: String,
    #[serde(rename = "B", default)]
    pub ignore: String,
}

impl KlineMessage {
    /// Build the wire message for a bar
    pub fn from_kline(kline: &Kline) -> Self {
        let symbol = kline.symbol.binance();
        let quote_volume = (kline.volume * kline.close).to_string();
        Self {
            stream: kline.symbol.kline_stream(&kline.timeframe),
            data: KlineEvent {
                event_type: "kline".to_string(),
                event_time: kline.close_time(),
                symbol: symbol.clone(),
                kline: KlinePayload {
                    open_time: kline.timestamp,
                    close_time: kline.close_time(),
                    symbol,
                    interval: kline.timeframe.clone(),
                    first_trade_id: 100,
                    last_trade_id: 200,
                    open: kline.open.to_string(),
                    close: kline.close.to_string(),
                    high: kline.high.to_string(),
                    low: kline.low.to_string(),
                    volume: kline.volume.to_string(),
                    trade_count: 100,
                    is_closed: kline.finished,
                    quote_volume: quote_volume.clone(),
                    taker_buy_volume: kline.volume.to_string(),
                    taker_buy_quote_volume: quote_volume,
                    ignore: "0".to_string(),
                },
            },
        }
    }

    pub fn parse(raw: &str) -> GridResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> GridResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload back into a bar
    pub fn to_kline(&self) -> GridResult<Kline> {
        let k = &self.data.kline;
        Ok(Kline::new(
            Symbol::parse(&k.symbol)?,
            k.interval.clone(),
            k.open_time,
            parse_decimal("o", &k.open)?,
            parse_decimal("h", &k.high)?,
            parse_decimal("l", &k.low)?,
            parse_decimal("c", &k.close)?,
            parse_decimal("v", &k.volume)?,
            k.is_closed,
        ))
    }
}

fn parse_decimal(field: &str, value: &str) -> GridResult<f64> {
    value
        .parse::<f64>()
        .map_err(|e| GridError::JsonParse(format!("field '{}' = '{}': {}", field, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar() -> Kline {
        Kline::new(
            Symbol::new("ETH", "USDT"),
            "1m",
            1_700_000_000_000,
            100.0,
            101.5,
            99.25,
            100.75,
            12.5,
            true,
        )
    }

    #[test]
    fn test_wire_shape() {
        let json = KlineMessage::from_kline(&bar()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["stream"], "ethusdt@kline_1m");
        assert_eq!(value["data"]["e"], "kline");
        assert_eq!(value["data"]["s"], "ETHUSDT");
        let k = &value["data"]["k"];
        assert_eq!(k["t"], 1_700_000_000_000i64);
        assert_eq!(k["T"], 1_700_000_060_000i64);
        assert_eq!(k["i"], "1m");
        assert_eq!(k["c"], "100.75");
        assert_eq!(k["x"], true);
        assert_eq!(k["B"], "0");
    }

    #[test]
    fn test_decode_live_message() {
        let raw = r#"{"stream":"btcusdt@kline_5m","data":{"e":"kline","E":1,"s":"BTCUSDT",
            "k":{"t":0,"T":300000,"s":"BTCUSDT","i":"5m","o":"1.0","c":"2.0","h":"3.0",
            "l":"0.5","v":"7","x":false}}}"#;
        let kline = KlineMessage::parse(raw).unwrap().to_kline().unwrap();
        assert_eq!(kline.symbol.binance(), "BTCUSDT");
        assert_eq!(kline.timeframe, "5m");
        assert_eq!(kline.close, 2.0);
        assert!(!kline.finished);
    }

    #[test]
    fn test_decode_rejects_bad_price() {
        let mut message = KlineMessage::from_kline(&bar());
        message.data.kline.close = "n/a".into();
        assert!(matches!(message.to_kline(), Err(GridError::JsonParse(_))));
    }
}
