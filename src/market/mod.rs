//! Market data and execution
//!
//! - [`types`] - symbols, timeframes and bars
//! - [`message`] - kline stream message shared by live feeds and replay
//! - [`backtest_market`] - matching simulator implementing `ExchangeGateway`

pub mod backtest_market;
pub mod message;
pub mod types;

pub use backtest_market::{BacktestSimulator, BacktestSimulatorInput};
pub use message::KlineMessage;
pub use types::{timeframe_ms, Kline, Symbol};
