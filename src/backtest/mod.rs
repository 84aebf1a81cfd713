//! Backtest plumbing: bar files, task dispatch and replay

pub mod data_loader;
pub mod dispatcher;
pub mod replay;

pub use dispatcher::{BarTask, DispatchHandle, Dispatcher};
pub use replay::{ReplayDriver, ReplayStart};
