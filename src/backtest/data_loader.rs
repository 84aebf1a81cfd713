//! Historical bar files: CSV (`timestamp,open,high,low,close,volume`) or a
//! JSON array of the same fields.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::grid::errors::{GridError, GridResult};
use crate::market::types::{Kline, Symbol};

#[derive(Debug, Deserialize)]
struct BarRecord {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl BarRecord {
    fn into_kline(self, symbol: &Symbol, timeframe: &str) -> Kline {
        Kline::new(
            symbol.clone(),
            timeframe,
            self.timestamp,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            true,
        )
    }
}

fn finish(records: Vec<BarRecord>, symbol: &Symbol, timeframe: &str) -> Vec<Kline> {
    let mut klines: Vec<Kline> = records
        .into_iter()
        .map(|r| r.into_kline(symbol, timeframe))
        .collect();
    klines.sort_by_key(|k| k.timestamp);
    klines.dedup_by_key(|k| k.timestamp);
    klines
}

/// Read CSV bars from any reader
pub fn read_csv<R: Read>(reader: R, symbol: &Symbol, timeframe: &str) -> GridResult<Vec<Kline>> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let records = csv
        .deserialize()
        .collect::<Result<Vec<BarRecord>, _>>()?;
    Ok(finish(records, symbol, timeframe))
}

pub fn load_csv(path: impl AsRef<Path>, symbol: &Symbol, timeframe: &str) -> GridResult<Vec<Kline>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GridError::DataLoad(format!("{}: {}", path.display(), e)))?;
    let klines = read_csv(file, symbol, timeframe)?;
    info!("Loaded {} {} bars from {:?}", klines.len(), timeframe, path);
    Ok(klines)
}

pub fn load_json(path: impl AsRef<Path>, symbol: &Symbol, timeframe: &str) -> GridResult<Vec<Kline>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| GridError::DataLoad(format!("{}: {}", path.display(), e)))?;
    let records: Vec<BarRecord> = serde_json::from_str(&content)?;
    let klines = finish(records, symbol, timeframe);
    info!("Loaded {} {} bars from {:?}", klines.len(), timeframe, path);
    Ok(klines)
}

/// Pick the loader from the file extension
pub fn load_bars(path: impl AsRef<Path>, symbol: &Symbol, timeframe: &str) -> GridResult<Vec<Kline>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => load_csv(path, symbol, timeframe),
        Some(ext) if ext.eq_ignore_ascii_case("json") => load_json(path, symbol, timeframe),
        _ => Err(GridError::DataLoad(format!(
            "unsupported bar file {}",
            path.display()
        ))),
    }
}
