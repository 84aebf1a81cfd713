//! Signal-driven grid order engine with a deterministic backtest replay
//!
//! - [`grid`] - order lifecycle engine, persistence, signals and rotation
//! - [`market`] - bar types, the stream wire format and the matching simulator
//! - [`backtest`] - data loading, task dispatch and the replay driver
//! - [`config`] / [`runner`] - settings file and the backtest runner

#![deny(unreachable_pub)]
pub mod backtest;
pub mod config;
pub mod grid;
pub mod market;
pub mod runner;

pub use backtest::{Dispatcher, ReplayDriver};
pub use grid::{GridConfig, GridEngine, GridError, GridResult, SignalRegistry};
pub use market::{BacktestSimulator, Kline, KlineMessage, Symbol};
pub use runner::{BacktestRunner, BacktestSummary};
