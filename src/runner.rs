use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::backtest::data_loader::load_bars;
use crate::backtest::dispatcher::Dispatcher;
use crate::backtest::replay::{ReplayDriver, ReplayStart, DEFAULT_START_INDEX};
use crate::config::Settings;
use crate::grid::config::GridConfig;
use crate::grid::engine::GridEngine;
use crate::grid::errors::GridResult;
use crate::grid::executor::ExchangeGateway;
use crate::grid::rotation::{BidirectionalRotation, RotationRunner};
use crate::grid::runner::GridRunner;
use crate::grid::signal::SignalRegistry;
use crate::market::backtest_market::BacktestSimulator;
use crate::market::types::Symbol;

/// Outcome of one replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestSummary {
    pub initial_balance: f64,
    pub final_balance: f64,
    pub trade_count: usize,
    pub total_fees: f64,
    pub realized_pnl: f64,
    pub bars_replayed: usize,
    pub open_positions: usize,
}

/// Runner for a configured backtest
pub struct BacktestRunner {
    settings: Settings,
    registry: SignalRegistry,
}

impl BacktestRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>, registry: SignalRegistry) -> GridResult<Self> {
        let path = config_path.as_ref().to_string_lossy();
        let settings = Settings::new(&path)?;
        Self::from_settings(settings, registry)
    }

    pub fn from_settings(settings: Settings, registry: SignalRegistry) -> GridResult<Self> {
        settings.validate()?;
        Ok(Self { settings, registry })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn build_engine(&self, config: &GridConfig, gateway: Arc<dyn ExchangeGateway>) -> GridResult<GridEngine> {
        let signal = self.registry.create(&config.signal, config.master_side)?;
        GridEngine::new(config.clone(), gateway, signal)
    }

    /// Load data, wire every grid to the simulator and replay to completion
    pub async fn run(self) -> GridResult<BacktestSummary> {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.settings.log.level);
        }
        env_logger::try_init().ok();

        info!("Starting backtest...");
        let backtest = &self.settings.backtest;
        let symbol = Symbol::parse(&backtest.symbol)?;

        let simulator = Arc::new(BacktestSimulator::new(backtest.simulator_input()));
        let mut series = Vec::with_capacity(backtest.data_files.len());
        for (timeframe, path) in &backtest.data_files {
            let bars = load_bars(path, &symbol, timeframe)?;
            simulator
                .load_historical_data(&backtest.symbol, timeframe, bars.clone())
                .await;
            series.push(bars);
        }

        let gateway: Arc<dyn ExchangeGateway> = simulator.clone();
        let mut dispatcher = Dispatcher::new(backtest.workers);

        for grid in &self.settings.grids {
            let engine = self.build_engine(grid, Arc::clone(&gateway))?;
            info!("Grid '{}' ready with signal '{}'", engine.name(), grid.signal);
            dispatcher.register(Arc::new(GridRunner::new(engine)?));
        }

        if let Some(rotation) = &self.settings.rotation {
            let long = self.build_engine(&rotation.long, Arc::clone(&gateway))?;
            let short = self.build_engine(&rotation.short, Arc::clone(&gateway))?;
            let pair = BidirectionalRotation::new(
                long,
                short,
                rotation.rotation_increment,
                rotation.state_path.clone(),
                rotation.default_side,
            )
            .await?;
            info!("Rotation ready, {} side active", pair.active_side().as_str());
            dispatcher.register(Arc::new(RotationRunner::new(pair)?));
        }

        let driver = if series.len() == 1 {
            ReplayDriver::single(series.remove(0), backtest.start_index, dispatcher)
        } else {
            let start = match (backtest.start_timestamp, backtest.start_index) {
                (Some(ts), _) => ReplayStart::Timestamp(ts),
                (None, Some(index)) => ReplayStart::Index(index),
                (None, None) => ReplayStart::Index(DEFAULT_START_INDEX),
            };
            ReplayDriver::multi(series, start, dispatcher)
        };
        let driver = driver
            .with_simulator(Arc::clone(&simulator))
            .with_progress(Box::new(log_progress));

        let bars_replayed = driver.run().await;

        let summary = BacktestSummary {
            initial_balance: simulator.initial_balance(),
            final_balance: simulator.get_final_balance().await,
            trade_count: simulator.get_trade_history().await.len(),
            total_fees: simulator.total_fees().await,
            realized_pnl: simulator.realized_pnl().await,
            bars_replayed,
            open_positions: simulator
                .positions()
                .await
                .iter()
                .filter(|p| p.quantity > 0.0)
                .count(),
        };
        info!(
            "Backtest finished: {} bars, {} trades, balance {:.2} -> {:.2}, fees {:.4}, realized {:.4}",
            summary.bars_replayed,
            summary.trade_count,
            summary.initial_balance,
            summary.final_balance,
            summary.total_fees,
            summary.realized_pnl
        );
        Ok(summary)
    }
}

fn log_progress(done: usize, total: usize) {
    let step = (total / 10).max(1);
    if done % step == 0 || done == total {
        info!(
            "Replay progress {}/{} ({:.0}%)",
            done,
            total,
            done as f64 * 100.0 / total.max(1) as f64
        );
    }
}
