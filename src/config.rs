use std::collections::BTreeMap;
use std::path::PathBuf;

use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::config::GridConfig;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::rotation::DEFAULT_ROTATION_INCREMENT;
use crate::grid::types::PositionSide;
use crate::market::backtest_market::BacktestSimulatorInput;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Replay data and simulator parameters
    pub backtest: BacktestConfig,
    /// Independent grids, one strategy task each
    #[serde(default)]
    pub grids: Vec<GridConfig>,
    /// Optional long/short rotation pair
    #[serde(default)]
    pub rotation: Option<RotationConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestConfig {
    /// Market replayed, e.g. "ETHUSDT"
    pub symbol: String,
    /// Bar file per timeframe, e.g. `1m = "data/ethusdt_1m.csv"`
    pub data_files: BTreeMap<String, PathBuf>,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    /// Start offset applied to every series (default 300)
    #[serde(default)]
    pub start_index: Option<usize>,
    /// Multi-timeframe start time per series; wins over `start_index`
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_maker_fee() -> f64 {
    0.0002
}

fn default_taker_fee() -> f64 {
    0.0004
}

fn default_workers() -> usize {
    5
}

impl BacktestConfig {
    pub fn simulator_input(&self) -> BacktestSimulatorInput {
        BacktestSimulatorInput {
            initial_balance: self.initial_balance,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            ..BacktestSimulatorInput::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    pub long: GridConfig,
    pub short: GridConfig,
    #[serde(default = "default_rotation_increment")]
    pub rotation_increment: u32,
    /// Where the active side is remembered between runs
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Side to start with when nothing is persisted yet
    #[serde(default)]
    pub default_side: Option<PositionSide>,
}

fn default_rotation_increment() -> u32 {
    DEFAULT_ROTATION_INCREMENT
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // e.g. APP__BACKTEST__INITIAL_BALANCE=5000
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Check that there is something to replay and something to run
    pub fn validate(&self) -> GridResult<()> {
        if self.backtest.data_files.is_empty() {
            return Err(GridError::InvalidConfig("backtest.data_files is empty".into()));
        }
        if self.grids.is_empty() && self.rotation.is_none() {
            return Err(GridError::InvalidConfig(
                "configure at least one grid or a rotation".into(),
            ));
        }
        for grid in &self.grids {
            grid.validate()?;
            if !self.backtest.data_files.contains_key(&grid.timeframe) {
                return Err(GridError::InvalidConfig(format!(
                    "no data file for grid timeframe {}",
                    grid.timeframe
                )));
            }
        }
        if let Some(rotation) = &self.rotation {
            rotation.long.validate()?;
            rotation.short.validate()?;
        }
        Ok(())
    }
}
