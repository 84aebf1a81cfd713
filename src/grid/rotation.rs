//! Long/short grid pair where only one side accepts new levels at a time

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::engine::GridEngine;
use super::errors::{GridError, GridResult};
use super::types::{OrderSide, PositionSide};
use crate::backtest::dispatcher::BarTask;
use crate::market::message::KlineMessage;
use crate::market::types::{Kline, Symbol};

pub const DEFAULT_ROTATION_INCREMENT: u32 = 10;

/// Persisted active side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    pub current_strategy: PositionSide,
}

impl RotationState {
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| GridError::CorruptPersistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Two opposite grids on one bar stream.
///
/// The active engine's max_order is its order count plus
/// `rotation_increment`; the idle engine runs with max_order 0 and only
/// drains. When the active engine saturates, the roles swap.
pub struct BidirectionalRotation {
    long: GridEngine,
    short: GridEngine,
    active: PositionSide,
    rotation_increment: u32,
    state_path: Option<PathBuf>,
}

impl BidirectionalRotation {
    /// Pair two engines. The persisted side wins, then `default_side`;
    /// otherwise the side holding fewer orders starts active (long on a tie).
    pub async fn new(
        mut long: GridEngine,
        mut short: GridEngine,
        rotation_increment: u32,
        state_path: Option<PathBuf>,
        default_side: Option<PositionSide>,
    ) -> GridResult<Self> {
        if long.config().master_side != OrderSide::Buy || short.config().master_side != OrderSide::Sell {
            return Err(GridError::InvalidConfig(
                "rotation needs a BUY long grid and a SELL short grid".into(),
            ));
        }
        if rotation_increment == 0 {
            return Err(GridError::InvalidConfig("rotation_increment must be positive".into()));
        }

        let long_count = long.recover_orders().await;
        let short_count = short.recover_orders().await;

        let persisted = state_path.as_deref().and_then(|path| {
            if !path.exists() {
                return None;
            }
            match RotationState::load_from_file(path) {
                Ok(state) => Some(state.current_strategy),
                Err(e) => {
                    error!("Ignoring rotation state: {}", e);
                    None
                }
            }
        });
        let active = persisted.or(default_side).unwrap_or(if long_count > short_count {
            PositionSide::Short
        } else {
            PositionSide::Long
        });

        let mut rotation = Self {
            long,
            short,
            active,
            rotation_increment,
            state_path,
        };
        rotation.activate(active).await;
        Ok(rotation)
    }

    pub fn active_side(&self) -> PositionSide {
        self.active
    }

    pub fn rotation_increment(&self) -> u32 {
        self.rotation_increment
    }

    pub fn long(&self) -> &GridEngine {
        &self.long
    }

    pub fn short(&self) -> &GridEngine {
        &self.short
    }

    pub fn long_mut(&mut self) -> &mut GridEngine {
        &mut self.long
    }

    pub fn short_mut(&mut self) -> &mut GridEngine {
        &mut self.short
    }

    fn engine_mut(&mut self, side: PositionSide) -> &mut GridEngine {
        match side {
            PositionSide::Long => &mut self.long,
            PositionSide::Short => &mut self.short,
        }
    }

    /// Make `side` the active engine
    async fn activate(&mut self, side: PositionSide) {
        let increment = self.rotation_increment;
        let target = self.engine_mut(side);
        let count = target.order_count().await as u32;
        target.set_max_order(count + increment);
        self.engine_mut(opposite(side)).set_max_order(0);
        self.active = side;
        self.save_state();
    }

    async fn is_full(&self) -> bool {
        let engine = match self.active {
            PositionSide::Long => &self.long,
            PositionSide::Short => &self.short,
        };
        engine.order_count().await >= engine.max_order() as usize
    }

    /// Hand the new levels over to the other side
    pub async fn rotate(&mut self) {
        let next = opposite(self.active);
        info!(
            "Rotating grid from {} to {}",
            self.active.as_str(),
            next.as_str()
        );
        self.activate(next).await;
    }

    /// Shrink the active max_order back to count + increment
    pub async fn balance_max_order(&mut self) {
        let increment = self.rotation_increment as i64;
        let engine = self.engine_mut(self.active);
        let count = engine.order_count().await as i64;
        let max_order = engine.max_order() as i64;
        let diff = max_order - count - increment;
        if diff > 0 {
            debug!("Balancing {} max_order by {}", engine.name(), diff);
            engine.set_max_order((max_order - diff) as u32);
        }
    }

    /// Rotate if saturated, run both engines, then rebalance
    pub async fn on_kline(&mut self, kline: &Kline) -> GridResult<()> {
        if kline.finished && self.is_full().await {
            self.rotate().await;
        }

        let long = self.long.on_kline(kline).await;
        let short = self.short.on_kline(kline).await;

        if kline.finished {
            self.balance_max_order().await;
        }
        long.and(short).map(|_| ())
    }

    fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = RotationState {
            current_strategy: self.active,
        };
        if let Err(e) = state.save_to_file_atomic(path) {
            error!("Failed to save rotation state to {:?}: {}", path, e);
        }
    }
}

fn opposite(side: PositionSide) -> PositionSide {
    match side {
        PositionSide::Long => PositionSide::Short,
        PositionSide::Short => PositionSide::Long,
    }
}

/// Bar task driving a rotation pair
pub struct RotationRunner {
    name: String,
    symbol: Symbol,
    timeframe: String,
    rotation: Mutex<BidirectionalRotation>,
}

impl RotationRunner {
    pub fn new(rotation: BidirectionalRotation) -> GridResult<Self> {
        let config = rotation.long().config();
        if config.symbol != rotation.short().config().symbol
            || config.timeframe != rotation.short().config().timeframe
        {
            return Err(GridError::InvalidConfig(
                "rotation grids must share symbol and timeframe".into(),
            ));
        }
        let name = format!("{}_{}_rotation", config.symbol, config.timeframe);
        let symbol = Symbol::parse(&config.symbol)?;
        let timeframe = config.timeframe.clone();
        Ok(Self {
            name,
            symbol,
            timeframe,
            rotation: Mutex::new(rotation),
        })
    }

    pub fn rotation(&self) -> &Mutex<BidirectionalRotation> {
        &self.rotation
    }

    pub async fn handle_message(&self, message: &str) -> GridResult<bool> {
        let kline = KlineMessage::parse(message)?.to_kline()?;
        if kline.symbol != self.symbol || kline.timeframe != self.timeframe {
            return Ok(false);
        }

        if kline.finished {
            self.rotation.lock().await.on_kline(&kline).await?;
            return Ok(true);
        }
        match self.rotation.try_lock() {
            Ok(mut rotation) => {
                rotation.on_kline(&kline).await?;
                Ok(true)
            }
            Err(_) => {
                debug!("{} busy, skipping tick at {}", self.name, kline.close);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl BarTask for RotationRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, message: &str) {
        if let Err(e) = self.handle_message(message).await {
            warn!("{} failed to handle bar: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::GridConfig;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::signal::NoneSignal;
    use crate::grid::types::GridOrder;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn engine(side: OrderSide, gateway: Arc<MockGateway>) -> GridEngine {
        let config = GridConfig::new("ETHUSDT", "1m", side, 1.0, 0.01, 5, 10.0, 1000.0);
        GridEngine::new(config, gateway, Box::new(NoneSignal::new(side))).unwrap()
    }

    fn bar(ts: i64, close: f64) -> Kline {
        Kline::new(Symbol::new("ETH", "USDT"), "1m", ts * 60_000, close, close, close, close, 1.0, true)
    }

    async fn pair(increment: u32, state_path: Option<PathBuf>) -> BidirectionalRotation {
        let gateway = Arc::new(MockGateway::new());
        BidirectionalRotation::new(
            engine(OrderSide::Buy, gateway.clone()),
            engine(OrderSide::Sell, gateway),
            increment,
            state_path,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_side() {
        let rotation = pair(10, None).await;
        assert_eq!(rotation.active_side(), PositionSide::Long);
        assert_eq!(rotation.long().max_order(), 10);
        assert_eq!(rotation.short().max_order(), 0);
    }

    #[tokio::test]
    async fn test_fewer_orders_side_starts_active() {
        let gateway = Arc::new(MockGateway::new());
        let long = engine(OrderSide::Buy, gateway.clone());
        for (id, price) in [("BUY1", 100.0), ("BUY2", 99.0)] {
            long.order_manager()
                .add_order(GridOrder::new(id, OrderSide::Buy, price, 1.0))
                .await;
        }
        let rotation = BidirectionalRotation::new(long, engine(OrderSide::Sell, gateway), 3, None, None)
            .await
            .unwrap();
        assert_eq!(rotation.active_side(), PositionSide::Short);
        assert_eq!(rotation.short().max_order(), 3);
        assert_eq!(rotation.long().max_order(), 0);
    }

    #[tokio::test]
    async fn test_rotates_when_saturated() {
        let mut rotation = pair(2, None).await;

        rotation.on_kline(&bar(1, 100.0)).await.unwrap();
        rotation.on_kline(&bar(2, 98.0)).await.unwrap();
        assert_eq!(rotation.long().order_count().await, 2);
        assert_eq!(rotation.active_side(), PositionSide::Long);

        rotation.on_kline(&bar(3, 97.0)).await.unwrap();
        assert_eq!(rotation.active_side(), PositionSide::Short);
        assert_eq!(rotation.long().max_order(), 0);
        assert_eq!(rotation.long().order_count().await, 2);
        assert_eq!(rotation.short().order_count().await, 1);
        assert_eq!(rotation.short().max_order(), 2);
    }

    #[tokio::test]
    async fn test_balance_shrinks_max_order() {
        let mut rotation = pair(4, None).await;
        rotation.long_mut().set_max_order(20);
        rotation.balance_max_order().await;
        assert_eq!(rotation.long().max_order(), 4);

        // Never grows
        rotation.long_mut().set_max_order(2);
        rotation.balance_max_order().await;
        assert_eq!(rotation.long().max_order(), 2);
    }

    #[tokio::test]
    async fn test_persisted_side_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotation.json");

        let mut rotation = pair(2, Some(path.clone())).await;
        rotation.rotate().await;
        assert_eq!(
            RotationState::load_from_file(&path).unwrap().current_strategy,
            PositionSide::Short
        );

        let restored = pair(2, Some(path)).await;
        assert_eq!(restored.active_side(), PositionSide::Short);
    }

    #[tokio::test]
    async fn test_default_side() {
        let gateway = Arc::new(MockGateway::new());
        let rotation = BidirectionalRotation::new(
            engine(OrderSide::Buy, gateway.clone()),
            engine(OrderSide::Sell, gateway),
            10,
            None,
            Some(PositionSide::Short),
        )
        .await
        .unwrap();
        assert_eq!(rotation.active_side(), PositionSide::Short);
        assert_eq!(rotation.long().max_order(), 0);
    }

    #[tokio::test]
    async fn test_rejects_same_direction_pair() {
        let gateway = Arc::new(MockGateway::new());
        let result = BidirectionalRotation::new(
            engine(OrderSide::Buy, gateway.clone()),
            engine(OrderSide::Buy, gateway),
            10,
            None,
            None,
        )
        .await;
        assert!(matches!(result, Err(GridError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_runner_filters_and_runs() {
        let runner = RotationRunner::new(pair(2, None).await).unwrap();
        let message = KlineMessage::from_kline(&bar(1, 100.0)).to_json().unwrap();
        assert!(runner.handle_message(&message).await.unwrap());
        assert_eq!(runner.rotation().lock().await.long().order_count().await, 1);

        let other = Kline::new(Symbol::new("BTC", "USDT"), "1m", 0, 1.0, 1.0, 1.0, 1.0, 1.0, true);
        let message = KlineMessage::from_kline(&other).to_json().unwrap();
        assert!(!runner.handle_message(&message).await.unwrap());
    }
}
