//! Grid strategy task - feeds wire-format bars into one engine

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::Mutex;

use super::engine::{BarReport, GridEngine};
use super::errors::{GridError, GridResult};
use crate::backtest::dispatcher::BarTask;
use crate::market::message::KlineMessage;
use crate::market::types::{Kline, Symbol};

/// Strategy task for one grid.
///
/// Finished bars wait for the engine; in-progress bars are dropped when the
/// engine is still busy with the previous bar.
pub struct GridRunner {
    name: String,
    symbol: Symbol,
    timeframe: String,
    engine: Arc<Mutex<GridEngine>>,
}

impl GridRunner {
    pub fn new(engine: GridEngine) -> GridResult<Self> {
        Self::from_shared(Arc::new(Mutex::new(engine)))
    }

    /// Wrap an engine that is also driven from elsewhere
    pub fn from_shared(engine: Arc<Mutex<GridEngine>>) -> GridResult<Self> {
        let (name, symbol, timeframe) = {
            let guard = engine.try_lock().map_err(|_| GridError::InconsistentState {
                order_id: String::new(),
                detail: "engine locked while building its runner".into(),
            })?;
            let config = guard.config();
            (
                guard.name(),
                Symbol::parse(&config.symbol)?,
                config.timeframe.clone(),
            )
        };
        Ok(Self {
            name,
            symbol,
            timeframe,
            engine,
        })
    }

    pub fn engine(&self) -> Arc<Mutex<GridEngine>> {
        Arc::clone(&self.engine)
    }

    pub fn accepts(&self, kline: &Kline) -> bool {
        kline.symbol == self.symbol && kline.timeframe == self.timeframe
    }

    /// Parse a stream message and run the engine on it.
    ///
    /// Returns `None` for bars of another market or skipped ticks.
    pub async fn handle_message(&self, message: &str) -> GridResult<Option<BarReport>> {
        let kline = KlineMessage::parse(message)?.to_kline()?;
        if !self.accepts(&kline) {
            return Ok(None);
        }

        if kline.finished {
            let mut engine = self.engine.lock().await;
            return engine.on_kline(&kline).await.map(Some);
        }

        match self.engine.try_lock() {
            Ok(mut engine) => engine.on_kline(&kline).await.map(Some),
            Err(_) => {
                debug!("{} busy, skipping tick at {}", self.name, kline.close);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl BarTask for GridRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, message: &str) {
        if let Err(e) = self.handle_message(message).await {
            error!("{} failed to handle bar: {}", self.name, e);
        }
    }
}
