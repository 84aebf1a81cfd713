//! Backtest matching simulator
//!
//! Stands in for a live exchange during replay: every order fills in full
//! the moment it is placed, market orders at the last known price with the
//! taker fee and limit orders at their own price with the maker fee. There
//! is no book depth, partial fill or price impact, so a replay of the same
//! bars always yields the same fills, fees and balance.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::types::{Kline, Symbol};
use crate::grid::config::SymbolInfo;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::{ExchangeGateway, PlaceOrderRequest, PlacedOrder};
use crate::grid::types::{ExchangeOrderStatus, OrderSide, PositionSide};

/// Input configuration for creating a BacktestSimulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSimulatorInput {
    /// Initial balance in quote currency
    pub initial_balance: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Precision reported for symbols without an explicit override
    pub symbol_info: SymbolInfo,
}

impl Default for BacktestSimulatorInput {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            maker_fee: 0.0002,
            taker_fee: 0.0004,
            symbol_info: SymbolInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacktestOrderType {
    Market,
    Limit,
}

/// Simulated order with its fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestOrder {
    pub custom_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: BacktestOrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: ExchangeOrderStatus,
    pub filled_qty: f64,
    pub filled_price: f64,
    pub fee: f64,
    /// Replay clock at placement (ms)
    pub timestamp: i64,
}

impl BacktestOrder {
    /// Signed cash flow of this fill: negative for buys, positive for sells
    pub fn cash_flow(&self) -> f64 {
        let notional = self.filled_price * self.filled_qty;
        match self.side {
            OrderSide::Buy => -(notional + self.fee),
            OrderSide::Sell => notional - self.fee,
        }
    }
}

/// One running position per (symbol, position side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestPosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Always non-negative; direction comes from `side`
    pub quantity: f64,
    pub entry_price: f64,
    pub realized_pnl: f64,
}

impl BacktestPosition {
    fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity: 0.0,
            entry_price: 0.0,
            realized_pnl: 0.0,
        }
    }

    /// Update position after a fill; returns the quantity that could not be
    /// closed because the position was smaller than the fill
    fn apply_fill(&mut self, qty: f64, price: f64, order_side: OrderSide) -> f64 {
        if order_side == self.side.opening_side() {
            // Adding to position
            let total_value = self.entry_price * self.quantity + price * qty;
            self.quantity += qty;
            self.entry_price = total_value / self.quantity;
            return 0.0;
        }

        // Reducing or closing position
        let close_qty = qty.min(self.quantity);
        let pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * close_qty,
            PositionSide::Short => (self.entry_price - price) * close_qty,
        };
        self.realized_pnl += pnl;
        self.quantity -= close_qty;
        if self.quantity <= f64::EPSILON {
            self.quantity = 0.0;
            self.entry_price = 0.0;
        }
        qty - close_qty
    }

    /// Calculate unrealized PnL at current price
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (current_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - current_price) * self.quantity,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    balance: f64,
    total_fees: f64,
    realized_pnl: f64,
    /// Replay clock (ms)
    clock: i64,
    prices: HashMap<String, f64>,
    orders: HashMap<String, BacktestOrder>,
    history: Vec<BacktestOrder>,
    positions: HashMap<(String, PositionSide), BacktestPosition>,
    klines: HashMap<(String, String), Vec<Kline>>,
    symbol_info: HashMap<String, SymbolInfo>,
    close_seq: u64,
}

/// Normalise "ETH/USDT", "ethusdt" etc. to "ETHUSDT"
fn symbol_key(symbol: &str) -> String {
    Symbol::parse(symbol)
        .map(|s| s.binance())
        .unwrap_or_else(|_| symbol.to_uppercase())
}

/// Deterministic in-memory exchange for replay
pub struct BacktestSimulator {
    state: Mutex<SimState>,
    initial_balance: f64,
    maker_fee: f64,
    taker_fee: f64,
    default_symbol_info: SymbolInfo,
}

impl BacktestSimulator {
    pub fn new(input: BacktestSimulatorInput) -> Self {
        info!(
            "Backtest simulator created: balance={}, maker={}, taker={}",
            input.initial_balance, input.maker_fee, input.taker_fee
        );
        Self {
            state: Mutex::new(SimState {
                balance: input.initial_balance,
                ..SimState::default()
            }),
            initial_balance: input.initial_balance,
            maker_fee: input.maker_fee,
            taker_fee: input.taker_fee,
            default_symbol_info: input.symbol_info,
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    /// Set the last traded price used for market fills
    pub async fn update_current_price(&self, symbol: &str, price: f64) {
        self.state.lock().await.prices.insert(symbol_key(symbol), price);
    }

    pub async fn current_price(&self, symbol: &str) -> Option<f64> {
        self.state.lock().await.prices.get(&symbol_key(symbol)).copied()
    }

    /// Advance the replay clock that bounds `fetch_ohlcv`
    pub async fn update_current_timestamp(&self, timestamp: i64) {
        self.state.lock().await.clock = timestamp;
    }

    pub async fn current_timestamp(&self) -> i64 {
        self.state.lock().await.clock
    }

    /// Register the full bar history of one symbol/timeframe
    pub async fn load_historical_data(&self, symbol: &str, timeframe: &str, mut klines: Vec<Kline>) {
        klines.sort_by_key(|k| k.timestamp);
        debug!("Loaded {} {} bars for {}", klines.len(), timeframe, symbol);
        self.state
            .lock()
            .await
            .klines
            .insert((symbol_key(symbol), timeframe.to_string()), klines);
    }

    /// Override precision for one symbol
    pub async fn set_symbol_info(&self, symbol: &str, info: SymbolInfo) {
        self.state.lock().await.symbol_info.insert(symbol_key(symbol), info);
    }

    pub async fn balance(&self) -> f64 {
        self.state.lock().await.balance
    }

    pub async fn get_final_balance(&self) -> f64 {
        self.balance().await
    }

    pub async fn total_fees(&self) -> f64 {
        self.state.lock().await.total_fees
    }

    pub async fn realized_pnl(&self) -> f64 {
        self.state.lock().await.realized_pnl
    }

    /// All filled orders in fill order
    pub async fn get_trade_history(&self) -> Vec<BacktestOrder> {
        self.state.lock().await.history.clone()
    }

    /// Open positions
    pub async fn positions(&self) -> Vec<BacktestPosition> {
        let state = self.state.lock().await;
        let mut positions: Vec<_> = state
            .positions
            .values()
            .filter(|p| p.quantity > 0.0)
            .cloned()
            .collect();
        positions.sort_by(|a, b| (&a.symbol, a.side.as_str()).cmp(&(&b.symbol, b.side.as_str())));
        positions
    }

    pub async fn position(&self, symbol: &str, side: PositionSide) -> Option<BacktestPosition> {
        self.state
            .lock()
            .await
            .positions
            .get(&(symbol_key(symbol), side))
            .filter(|p| p.quantity > 0.0)
            .cloned()
    }

    /// Flatten one position with a market order at the current price
    pub async fn close_position(&self, symbol: &str, side: PositionSide) -> GridResult<Option<BacktestOrder>> {
        let key = symbol_key(symbol);
        let (qty, id) = {
            let mut state = self.state.lock().await;
            let qty = match state.positions.get(&(key.clone(), side)) {
                Some(p) if p.quantity > 0.0 => p.quantity,
                _ => return Ok(None),
            };
            state.close_seq += 1;
            (qty, format!("close_{}_{}", state.clock, state.close_seq))
        };

        let request = PlaceOrderRequest::market(id.clone(), key, side.opening_side().opposite(), qty, side);
        self.place_order(&request).await?;
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    fn fill(&self, state: &mut SimState, request: &PlaceOrderRequest, key: String, current_price: f64) -> BacktestOrder {
        let (order_type, filled_price, fee_rate) = match request.price {
            Some(limit) => (BacktestOrderType::Limit, limit, self.maker_fee),
            None => (BacktestOrderType::Market, current_price, self.taker_fee),
        };

        let order = BacktestOrder {
            custom_id: request.custom_id.clone(),
            symbol: key.clone(),
            side: request.side,
            position_side: request.position_side,
            order_type,
            quantity: request.quantity,
            price: request.price,
            status: ExchangeOrderStatus::Closed,
            filled_qty: request.quantity,
            filled_price,
            fee: filled_price * request.quantity * fee_rate,
            timestamp: state.clock,
        };

        state.balance += order.cash_flow();
        state.total_fees += order.fee;

        let position = state
            .positions
            .entry((key.clone(), request.position_side))
            .or_insert_with(|| BacktestPosition::new(key.clone(), request.position_side));
        let before = position.realized_pnl;
        let unmatched = position.apply_fill(order.filled_qty, order.filled_price, order.side);
        state.realized_pnl += position.realized_pnl - before;
        if unmatched > 0.0 {
            warn!(
                "Insufficient {} position for {}: {} left unmatched",
                request.position_side.as_str(),
                key,
                unmatched
            );
        }

        debug!(
            "Order {} filled: {} {} @ {} (fee {:.6})",
            order.custom_id,
            order.side.as_str(),
            order.filled_qty,
            order.filled_price,
            order.fee
        );

        state.orders.insert(order.custom_id.clone(), order.clone());
        state.history.push(order.clone());
        order
    }
}

impl Default for BacktestSimulator {
    fn default() -> Self {
        Self::new(BacktestSimulatorInput::default())
    }
}

#[async_trait]
impl ExchangeGateway for BacktestSimulator {
    async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<PlacedOrder> {
        let key = symbol_key(&request.symbol);
        let mut state = self.state.lock().await;

        let Some(current_price) = state.prices.get(&key).copied() else {
            return Err(GridError::unavailable(
                "place_order",
                format!("no current price for {}", key),
            ));
        };

        if state.orders.contains_key(&request.custom_id) {
            return Err(GridError::InconsistentState {
                order_id: request.custom_id.clone(),
                detail: "duplicate client order id".into(),
            });
        }

        if request.quantity <= 0.0 {
            return Err(GridError::InvalidConfig(format!(
                "order {} has non-positive quantity",
                request.custom_id
            )));
        }

        let order = self.fill(&mut state, request, key, current_price);
        Ok(PlacedOrder {
            id: order.custom_id,
            price: Some(order.filled_price),
            status: order.status,
        })
    }

    async fn cancel_order(&self, id: &str, _symbol: &str) -> GridResult<()> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(id)
            .ok_or_else(|| GridError::OrderNotFound(id.to_string()))?;
        if order.status == ExchangeOrderStatus::Open {
            order.status = ExchangeOrderStatus::Canceled;
            debug!("Order {} canceled", id);
        }
        Ok(())
    }

    async fn query_order(&self, id: &str, _symbol: &str) -> GridResult<ExchangeOrderStatus> {
        self.state
            .lock()
            .await
            .orders
            .get(id)
            .map(|o| o.status)
            .ok_or_else(|| GridError::OrderNotFound(id.to_string()))
    }

    async fn symbol_info(&self, symbol: &str) -> GridResult<SymbolInfo> {
        Ok(self
            .state
            .lock()
            .await
            .symbol_info
            .get(&symbol_key(symbol))
            .copied()
            .unwrap_or(self.default_symbol_info))
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> GridResult<Vec<Kline>> {
        let state = self.state.lock().await;
        let Some(klines) = state.klines.get(&(symbol_key(symbol), timeframe.to_string())) else {
            return Ok(Vec::new());
        };
        let end = klines.partition_point(|k| k.timestamp <= state.clock);
        let start = end.saturating_sub(limit);
        Ok(klines[start..end].to_vec())
    }
}
