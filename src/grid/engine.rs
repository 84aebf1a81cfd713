//! Per-bar grid decision loop
//!
//! One `GridEngine` owns one grid: its configuration, its signal source and
//! its `OrderManager`. Every finished bar runs reload → reconcile → open →
//! close → ratchet → persist; in-progress bars only ratchet trailing stops
//! and fire stops that were crossed.

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::config::{GridConfig, SymbolInfo};
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, PlaceOrderRequest};
use super::signal::SignalSource;
use super::state::OrderManager;
use super::types::{
    new_custom_id, ExchangeOrderStatus, ExitReason, GridOrder, OrderSide, OrderState,
    PlaceOrderBehavior, ProfitLevel,
};
use crate::market::types::Kline;

/// Longest exit retry back-off, in finished bars
const MAX_RETRY_BACKOFF_BARS: u64 = 64;

/// What happened on one bar
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarReport {
    /// Entry id of the level opened on this bar
    pub opened: Option<String>,
    /// Entry ids removed from the active set on this bar
    pub closed: Vec<String>,
    pub stop_all: bool,
    pub reloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenOutcome {
    Opened(String),
    Skipped,
    /// Opening would fill the last slot; flatten everything instead
    MaxOrderStopLoss,
}

/// Gateway's view of one order id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Filled,
    Gone(OrderState),
    Working,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct CloseCheck {
    stop_all: bool,
    exit_signal: bool,
    /// Only stop prices are evaluated (in-progress bars)
    stops_only: bool,
}

pub struct GridEngine {
    config: GridConfig,
    gateway: Arc<dyn ExchangeGateway>,
    signal: Box<dyn SignalSource>,
    orders: OrderManager,
    symbol_info: Option<SymbolInfo>,
    klines: Vec<Kline>,
    /// Finished bars processed so far
    bar_index: u64,
    paused: bool,
    close_all_requested: bool,
    recovered: bool,
}

impl GridEngine {
    /// Create an engine; fails on an invalid configuration
    pub fn new(
        config: GridConfig,
        gateway: Arc<dyn ExchangeGateway>,
        signal: Box<dyn SignalSource>,
    ) -> GridResult<Self> {
        config.validate()?;
        let orders = OrderManager::new(config.order_file_path.clone());
        Ok(Self {
            config,
            gateway,
            signal,
            orders,
            symbol_info: None,
            klines: Vec::new(),
            bar_index: 0,
            paused: false,
            close_all_requested: false,
            recovered: false,
        })
    }

    /// Human-readable id, e.g. "ETHUSDT_1m_BUY"
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.config.symbol,
            self.config.timeframe,
            self.config.master_side.as_str()
        )
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn order_manager(&self) -> &OrderManager {
        &self.orders
    }

    pub async fn orders(&self) -> Vec<GridOrder> {
        self.orders.orders().await
    }

    pub async fn order_count(&self) -> usize {
        self.orders.count().await
    }

    pub fn max_order(&self) -> u32 {
        self.config.max_order
    }

    pub fn set_max_order(&mut self, max_order: u32) {
        if max_order != self.config.max_order {
            info!("{} max_order {} -> {}", self.name(), self.config.max_order, max_order);
            self.config.max_order = max_order;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Allow new entries again after a stop-loss pause
    pub fn resume(&mut self) {
        if self.paused {
            info!("{} resumed", self.name());
            self.paused = false;
        }
    }

    /// Flatten every level on the next finished bar
    pub fn request_close_all(&mut self) {
        warn!("{} close-all requested", self.name());
        self.close_all_requested = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.symbol_info.is_some()
    }

    /// Bars currently in the signal window
    pub fn klines(&self) -> &[Kline] {
        &self.klines
    }

    /// Adopt the persisted order snapshot once; returns the active count
    pub async fn recover_orders(&mut self) -> usize {
        if !self.recovered {
            self.recovered = true;
            if let Some(orders) = self.orders.load_orders(true).await {
                info!("{} recovered {} orders", self.name(), orders.len());
            }
        }
        self.orders.count().await
    }

    /// Fetch symbol precision, recover persisted orders and bootstrap the
    /// bar window. Runs once; later calls are no-ops.
    pub async fn initialize(&mut self) -> GridResult<()> {
        if self.symbol_info.is_some() {
            return Ok(());
        }

        let info = self.gateway.symbol_info(&self.config.symbol).await?;
        info.validate()?;

        self.recover_orders().await;

        match self
            .gateway
            .fetch_ohlcv(&self.config.symbol, &self.config.timeframe, self.config.history_limit)
            .await
        {
            Ok(history) => self.klines = history,
            Err(e) => warn!("{} history bootstrap failed: {}", self.name(), e),
        }

        info!(
            "{} initialized: tick={}, step={}, {} bars of history",
            self.name(),
            info.tick_size,
            info.step_size,
            self.klines.len()
        );
        self.symbol_info = Some(info);
        Ok(())
    }

    /// Handle one bar. Gateway failures are logged and retried on later
    /// bars; only initialization errors are returned.
    pub async fn on_kline(&mut self, kline: &Kline) -> GridResult<BarReport> {
        self.initialize().await?;
        if kline.finished {
            Ok(self.on_finished_bar(kline).await)
        } else {
            Ok(self.on_tick(kline).await)
        }
    }

    async fn on_finished_bar(&mut self, kline: &Kline) -> BarReport {
        let close = kline.close;
        self.push_history(kline);
        self.bar_index += 1;

        let mut report = BarReport::default();
        if self.orders.load_orders(false).await.is_some() {
            report.reloaded = true;
            self.resume();
        }

        let (mut closed, mut changed) = self.reconcile(close, kline.timestamp).await;

        match self.check_open_order(kline).await {
            OpenOutcome::Opened(id) => {
                report.opened = Some(id);
                changed = true;
            }
            outcome => {
                let stop_loss_sweep = outcome == OpenOutcome::MaxOrderStopLoss;
                let stop_all = stop_loss_sweep || self.close_all_requested;
                report.stop_all = stop_all;

                let exit_signal = self.config.enable_exit_signal && self.signal.is_exit(&self.klines);
                let check = CloseCheck {
                    stop_all,
                    exit_signal,
                    stops_only: false,
                };
                let (more, moved) = self.check_close_order(close, kline.timestamp, check).await;
                closed.extend(more);
                changed |= moved;

                if stop_all {
                    if self.active_count().await == 0 {
                        self.close_all_requested = false;
                    }
                    if stop_loss_sweep && self.config.paused_after_stop_loss {
                        warn!("{} paused after max-order stop loss", self.name());
                        self.paused = true;
                    }
                }
            }
        }

        if self.config.enable_limit_take_profit {
            let (more, moved) = self.place_limit_take_profits(kline.timestamp).await;
            closed.extend(more);
            changed |= moved;
        }

        changed |= self.ratchet_stops(close).await;
        report.closed = closed.iter().map(|o| o.entry_id.clone()).collect();
        self.persist(closed, changed).await;
        report
    }

    async fn on_tick(&mut self, kline: &Kline) -> BarReport {
        let mut changed = self.ratchet_stops(kline.close).await;
        let check = CloseCheck {
            stop_all: false,
            exit_signal: false,
            stops_only: true,
        };
        let (closed, moved) = self.check_close_order(kline.close, kline.timestamp, check).await;
        changed |= moved;

        let report = BarReport {
            closed: closed.iter().map(|o| o.entry_id.clone()).collect(),
            ..BarReport::default()
        };
        self.persist(closed, changed).await;
        report
    }

    fn push_history(&mut self, kline: &Kline) {
        match self.klines.last_mut() {
            Some(last) if last.timestamp == kline.timestamp => *last = kline.clone(),
            Some(last) if last.timestamp > kline.timestamp => {
                debug!("{} ignoring out-of-order bar {}", self.name(), kline.timestamp);
                return;
            }
            _ => self.klines.push(kline.clone()),
        }
        if self.klines.len() > self.config.history_limit {
            let excess = self.klines.len() - self.config.history_limit;
            self.klines.drain(..excess);
        }
    }

    async fn active_count(&self) -> usize {
        self.orders
            .orders()
            .await
            .iter()
            .filter(|o| o.is_active())
            .count()
    }

    fn info(&self) -> SymbolInfo {
        self.symbol_info.unwrap_or_default()
    }

    fn exit_behavior(&self) -> PlaceOrderBehavior {
        match self.config.place_order_behavior {
            PlaceOrderBehavior::Chaser => PlaceOrderBehavior::Chaser,
            _ => PlaceOrderBehavior::Normal,
        }
    }

    async fn resolve(&self, id: &str) -> Resolution {
        match self.gateway.query_order(id, &self.config.symbol).await {
            Ok(ExchangeOrderStatus::Closed) => Resolution::Filled,
            Ok(ExchangeOrderStatus::Open) => Resolution::Working,
            Ok(ExchangeOrderStatus::Expired) => Resolution::Gone(OrderState::Expired),
            Ok(_) => Resolution::Gone(OrderState::Canceled),
            Err(GridError::OrderNotFound(_)) => {
                warn!("{} order {} unknown to exchange", self.name(), id);
                Resolution::Gone(OrderState::Canceled)
            }
            Err(e) => {
                warn!("{} could not query {}: {}", self.name(), id, e);
                Resolution::Unknown
            }
        }
    }

    async fn cancel_and_confirm(&self, id: &str) -> Resolution {
        if let Err(e) = self.gateway.cancel_order(id, &self.config.symbol).await {
            warn!("{} cancel of {} failed: {}", self.name(), id, e);
        }
        self.resolve(id).await
    }

    /// Apply `f` to the order with `entry_id` and return its new state
    async fn modify<F>(&self, entry_id: &str, f: F) -> Option<GridOrder>
    where
        F: FnOnce(&mut GridOrder),
    {
        self.orders
            .update(|orders| {
                orders.iter_mut().find(|o| o.entry_id == entry_id).map(|o| {
                    f(o);
                    o.clone()
                })
            })
            .await
    }

    /// Mark an order as leaving the active set
    async fn finish(
        &self,
        entry_id: &str,
        state: OrderState,
        exit_price: Option<f64>,
        reason: Option<ExitReason>,
        timestamp: i64,
    ) -> Option<GridOrder> {
        self.modify(entry_id, |o| {
            o.status = state;
            if exit_price.is_some() {
                o.exit_price = exit_price;
            }
            if reason.is_some() {
                o.exit_reason = reason;
            }
            o.closed_at = Some(timestamp);
        })
        .await
    }

    /// Bring local order states in line with the gateway. Gateway wins.
    async fn reconcile(&self, close: f64, timestamp: i64) -> (Vec<GridOrder>, bool) {
        let mut closed = Vec::new();
        let mut changed = false;

        for order in self.orders.orders().await {
            match order.status {
                OrderState::Open => match self.resolve(&order.entry_id).await {
                    Resolution::Filled => {
                        debug!("{} entry {} confirmed filled", self.name(), order.entry_id);
                        self.modify(&order.entry_id, |o| o.status = OrderState::Closed).await;
                        changed = true;
                    }
                    Resolution::Gone(state) => {
                        warn!("{} entry {} did not fill ({:?})", self.name(), order.entry_id, state);
                        closed.extend(self.finish(&order.entry_id, state, None, None, timestamp).await);
                    }
                    Resolution::Working | Resolution::Unknown => {}
                },
                OrderState::ExitPlaced => {
                    let Some(exit_id) = order.exit_id.clone() else {
                        self.modify(&order.entry_id, |o| o.status = OrderState::Closed).await;
                        changed = true;
                        continue;
                    };
                    match self.resolve(&exit_id).await {
                        Resolution::Filled => {
                            let price = self.info().round_price(order.take_profit_price());
                            info!(
                                "{} limit take profit {} filled @ {}",
                                self.name(),
                                order.entry_id,
                                price
                            );
                            closed.extend(
                                self.finish(
                                    &order.entry_id,
                                    OrderState::ExitFilled,
                                    Some(price),
                                    Some(ExitReason::LimitTakeProfit),
                                    timestamp,
                                )
                                .await,
                            );
                        }
                        Resolution::Gone(_) => {
                            self.modify(&order.entry_id, |o| {
                                o.status = OrderState::Closed;
                                o.exit_id = None;
                            })
                            .await;
                            changed = true;
                        }
                        Resolution::Working | Resolution::Unknown => {}
                    }
                }
                OrderState::Closed => {
                    // A held exit id means an earlier exit attempt failed mid-flight
                    let Some(exit_id) = order.exit_id.clone() else {
                        continue;
                    };
                    match self.resolve(&exit_id).await {
                        Resolution::Filled => {
                            warn!(
                                "{} exit {} for {} filled after reported failure",
                                self.name(),
                                exit_id,
                                order.entry_id
                            );
                            let price = order.exit_price.unwrap_or(close);
                            closed.extend(
                                self.finish(&order.entry_id, OrderState::ExitFilled, Some(price), None, timestamp)
                                    .await,
                            );
                        }
                        Resolution::Gone(_) => {
                            self.modify(&order.entry_id, |o| o.exit_id = None).await;
                            changed = true;
                        }
                        Resolution::Working | Resolution::Unknown => {}
                    }
                }
                _ => {}
            }
        }

        (closed, changed)
    }

    async fn check_open_order(&mut self, kline: &Kline) -> OpenOutcome {
        let close = kline.close;
        if self.paused {
            debug!("{} paused, no new levels", self.name());
            return OpenOutcome::Skipped;
        }

        let orders = self.orders.orders().await;
        let active: Vec<&GridOrder> = orders.iter().filter(|o| o.is_active()).collect();
        let count = active.len();
        let max_order = self.config.max_order as usize;
        if count >= max_order {
            return OpenOutcome::Skipped;
        }

        if !self.signal.is_entry(&self.klines) {
            return OpenOutcome::Skipped;
        }

        if close < self.config.lowest_price || close > self.config.highest_price {
            debug!(
                "{} close {} outside [{}, {}]",
                self.name(),
                close,
                self.config.lowest_price,
                self.config.highest_price
            );
            return OpenOutcome::Skipped;
        }

        let side = self.config.master_side;
        let extreme = active
            .iter()
            .map(|o| o.entry_price)
            .reduce(|a, b| match side {
                OrderSide::Buy => a.min(b),
                OrderSide::Sell => a.max(b),
            });

        if let Some(extreme) = extreme {
            let ratio = match side {
                OrderSide::Buy => (close - extreme) / extreme,
                OrderSide::Sell => (extreme - close) / extreme,
            };
            if ratio > -self.config.grid_spacing_rate {
                return OpenOutcome::Skipped;
            }
        }

        if self.config.enable_max_order_stop_loss && count + 1 >= max_order {
            warn!(
                "{} would fill its last slot ({}/{}) at {}, stopping out",
                self.name(),
                count,
                max_order,
                close
            );
            return OpenOutcome::MaxOrderStopLoss;
        }

        self.open_order(kline).await
    }

    async fn open_order(&self, kline: &Kline) -> OpenOutcome {
        let config = &self.config;
        let qty = self.info().round_qty(config.per_order_qty);
        if qty <= 0.0 {
            warn!("{} per_order_qty rounds to zero", self.name());
            return OpenOutcome::Skipped;
        }

        let side = config.master_side;
        let id = new_custom_id(side);
        let request = PlaceOrderRequest::market(&id, &config.symbol, side, qty, config.position_side())
            .with_behavior(config.place_order_behavior);

        match self.gateway.place_order(&request).await {
            Ok(placed) if placed.status.is_dead() => {
                warn!("{} entry {} was {:?}", self.name(), id, placed.status);
                OpenOutcome::Skipped
            }
            Ok(placed) => {
                let price = placed.price.unwrap_or(kline.close);
                let mut order = GridOrder::new(&id, side, price, qty)
                    .with_take_profit(config.fixed_take_profit_rate, config.signal_min_take_profit_rate)
                    .with_created_at(kline.timestamp);
                if config.enable_order_stop_loss {
                    order = order.with_stop_loss(config.order_stop_loss_rate);
                }
                if config.enable_trailing_stop {
                    order = order.with_trailing_stop(
                        config.trailing_stop_rate,
                        config.trailing_stop_activation_profit_rate,
                    );
                }
                if placed.status == ExchangeOrderStatus::Closed {
                    order.status = OrderState::Closed;
                }

                info!(
                    "{} opened level {} {} {} @ {}",
                    self.name(),
                    id,
                    side.as_str(),
                    qty,
                    price
                );
                self.orders.add_order(order).await;
                OpenOutcome::Opened(id)
            }
            Err(e) => {
                error!("{} failed to open grid level: {}", self.name(), e);
                OpenOutcome::Skipped
            }
        }
    }

    fn exit_reason(&self, order: &GridOrder, close: f64, check: CloseCheck) -> Option<ExitReason> {
        if check.stop_all {
            return Some(ExitReason::StopAll);
        }
        if order.is_stop_triggered(close) {
            return Some(order.stop_reason());
        }
        if check.stops_only || order.status != OrderState::Closed {
            return None;
        }

        let level = order.profit_level(close);
        if level == ProfitLevel::AboveTakeProfit && self.config.enable_fixed_profit_taking {
            return Some(ExitReason::FixedTakeProfit);
        }
        if level == ProfitLevel::Profitable && check.exit_signal {
            return Some(ExitReason::Signal);
        }
        None
    }

    async fn check_close_order(&self, close: f64, timestamp: i64, check: CloseCheck) -> (Vec<GridOrder>, bool) {
        let mut closed = Vec::new();
        let mut changed = false;
        let mut candidates: Vec<(GridOrder, ExitReason)> = Vec::new();

        for order in self.orders.orders().await.into_iter().filter(|o| o.is_active()) {
            if order.status == OrderState::Open {
                // Unconfirmed entries are never counted as profitable
                if !check.stop_all {
                    continue;
                }
                match self.cancel_and_confirm(&order.entry_id).await {
                    Resolution::Filled => {
                        if let Some(filled) = self
                            .modify(&order.entry_id, |o| o.status = OrderState::Closed)
                            .await
                        {
                            candidates.push((filled, ExitReason::StopAll));
                        }
                        changed = true;
                    }
                    Resolution::Gone(state) => {
                        info!("{} canceled unfilled entry {}", self.name(), order.entry_id);
                        closed.extend(self.finish(&order.entry_id, state, None, None, timestamp).await);
                    }
                    Resolution::Working | Resolution::Unknown => {}
                }
                continue;
            }

            let Some(reason) = self.exit_reason(&order, close, check) else {
                continue;
            };

            if order.retry_after_bar > self.bar_index {
                if order.exit_stuck {
                    error!(
                        "{} exit for {} is stuck after {} attempts",
                        self.name(),
                        order.entry_id,
                        order.exit_attempts
                    );
                }
                continue;
            }

            if order.status == OrderState::ExitPlaced {
                let Some(exit_id) = order.exit_id.clone() else {
                    continue;
                };
                match self.cancel_and_confirm(&exit_id).await {
                    Resolution::Filled => {
                        let price = self.info().round_price(order.take_profit_price());
                        closed.extend(
                            self.finish(
                                &order.entry_id,
                                OrderState::ExitFilled,
                                Some(price),
                                Some(ExitReason::LimitTakeProfit),
                                timestamp,
                            )
                            .await,
                        );
                        continue;
                    }
                    Resolution::Gone(_) => {
                        let reopened = self
                            .modify(&order.entry_id, |o| {
                                o.status = OrderState::Closed;
                                o.exit_id = None;
                            })
                            .await;
                        changed = true;
                        if let Some(reopened) = reopened {
                            candidates.push((reopened, reason));
                        }
                        continue;
                    }
                    Resolution::Working | Resolution::Unknown => continue,
                }
            }

            if order.exit_id.is_some() {
                // Held exit still unresolved; reconcile settles it first
                continue;
            }

            candidates.push((order, reason));
        }

        if !candidates.is_empty() {
            let (more, moved) = self.flatten(candidates, close, timestamp).await;
            closed.extend(more);
            changed |= moved;
        }

        (closed, changed)
    }

    /// Close the selected levels with one aggregated market order
    async fn flatten(
        &self,
        candidates: Vec<(GridOrder, ExitReason)>,
        close: f64,
        timestamp: i64,
    ) -> (Vec<GridOrder>, bool) {
        let total: f64 = candidates.iter().map(|(o, _)| o.quantity).sum();
        let qty = self.info().round_qty(total * self.config.close_position_ratio);
        if qty <= 0.0 {
            warn!(
                "{} exit quantity {} rounds to zero, keeping {} levels",
                self.name(),
                total,
                candidates.len()
            );
            return (Vec::new(), false);
        }

        let side = self.config.master_side.opposite();
        let exit_id = new_custom_id(side);
        for (order, reason) in &candidates {
            let reason = *reason;
            self.modify(&order.entry_id, |o| {
                o.exit_id = Some(exit_id.clone());
                o.exit_reason = Some(reason);
            })
            .await;
        }

        let request = PlaceOrderRequest::market(
            &exit_id,
            &self.config.symbol,
            side,
            qty,
            self.config.position_side(),
        )
        .with_behavior(self.exit_behavior());

        let failure = match self.gateway.place_order(&request).await {
            Ok(placed) if placed.status == ExchangeOrderStatus::Closed => {
                let price = placed.price.unwrap_or(close);
                let mut closed = Vec::with_capacity(candidates.len());
                for (order, reason) in &candidates {
                    info!(
                        "{} closed level {} entry {} exit {} ({:?})",
                        self.name(),
                        order.entry_id,
                        order.entry_price,
                        price,
                        reason
                    );
                    closed.extend(
                        self.finish(&order.entry_id, OrderState::ExitFilled, Some(price), Some(*reason), timestamp)
                            .await,
                    );
                }
                info!(
                    "{} exit {} {} {} @ {} for {} levels",
                    self.name(),
                    exit_id,
                    side.as_str(),
                    qty,
                    price,
                    closed.len()
                );
                return (closed, true);
            }
            Ok(placed) if placed.status == ExchangeOrderStatus::Open => {
                // Accepted but not yet filled; reconcile confirms it next bar
                info!("{} exit {} working", self.name(), exit_id);
                for (order, _) in &candidates {
                    self.modify(&order.entry_id, |o| o.exit_price = placed.price.or(Some(close)))
                        .await;
                }
                return (Vec::new(), true);
            }
            Ok(placed) => format!("exit {} was {:?}", exit_id, placed.status),
            Err(e) => e.to_string(),
        };

        error!("{} exit of {} levels failed: {}", self.name(), candidates.len(), failure);
        let bar_index = self.bar_index;
        let max_retries = self.config.max_exit_retries;
        for (order, _) in &candidates {
            self.modify(&order.entry_id, |o| {
                o.exit_attempts += 1;
                o.retry_after_bar = bar_index + retry_backoff(o.exit_attempts);
                if o.exit_attempts >= max_retries {
                    o.exit_stuck = true;
                }
            })
            .await;
        }
        (Vec::new(), true)
    }

    /// Rest a limit exit at the take-profit price for every filled entry
    async fn place_limit_take_profits(&self, timestamp: i64) -> (Vec<GridOrder>, bool) {
        let mut closed = Vec::new();
        let mut changed = false;
        let info = self.info();
        let side = self.config.master_side.opposite();

        for order in self.orders.orders().await {
            if order.status != OrderState::Closed || order.exit_id.is_some() {
                continue;
            }
            let price = info.round_price(order.take_profit_price());
            let qty = info.round_qty(order.quantity);
            let exit_id = new_custom_id(side);
            let request = PlaceOrderRequest::market(
                &exit_id,
                &self.config.symbol,
                side,
                qty,
                self.config.position_side(),
            )
            .with_price(price)
            .with_behavior(self.exit_behavior());

            match self.gateway.place_order(&request).await {
                Ok(placed) if placed.status == ExchangeOrderStatus::Closed => {
                    let fill = placed.price.unwrap_or(price);
                    info!("{} limit take profit {} filled @ {}", self.name(), order.entry_id, fill);
                    closed.extend(
                        self.finish(
                            &order.entry_id,
                            OrderState::ExitFilled,
                            Some(fill),
                            Some(ExitReason::LimitTakeProfit),
                            timestamp,
                        )
                        .await,
                    );
                }
                Ok(placed) if placed.status == ExchangeOrderStatus::Open => {
                    debug!("{} limit take profit for {} resting @ {}", self.name(), order.entry_id, price);
                    self.modify(&order.entry_id, |o| {
                        o.status = OrderState::ExitPlaced;
                        o.exit_id = Some(exit_id.clone());
                    })
                    .await;
                    changed = true;
                }
                Ok(placed) => warn!(
                    "{} limit take profit for {} was {:?}",
                    self.name(),
                    order.entry_id,
                    placed.status
                ),
                Err(e) => error!(
                    "{} failed to place limit take profit for {}: {}",
                    self.name(),
                    order.entry_id,
                    e
                ),
            }
        }

        (closed, changed)
    }

    /// Move trailing stops with the current price; true when any stop moved
    async fn ratchet_stops(&self, price: f64) -> bool {
        self.orders
            .update(|orders| {
                orders
                    .iter_mut()
                    .filter(|o| matches!(o.status, OrderState::Closed | OrderState::ExitPlaced))
                    .map(|o| o.update_trailing_stop(price))
                    .fold(false, |moved, m| moved | m)
            })
            .await
    }

    async fn persist(&self, closed: Vec<GridOrder>, changed: bool) {
        if let Err(e) = self.orders.record_orders(closed, changed).await {
            error!("{} failed to persist orders: {}", self.name(), e);
        }
    }
}

/// Bars to wait before exit attempt `attempts + 1`
fn retry_backoff(attempts: u32) -> u64 {
    let exp = attempts.saturating_sub(1).min(6);
    (1u64 << exp).min(MAX_RETRY_BACKOFF_BARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::signal::NoneSignal;
    use crate::grid::state::OrderSnapshot;
    use crate::market::types::Symbol;
    use tempfile::tempdir;

    fn config(max_order: u32) -> GridConfig {
        GridConfig::new("ETHUSDT", "1m", OrderSide::Buy, 1.0, 0.01, max_order, 10.0, 1000.0)
    }

    fn engine(config: GridConfig, gateway: Arc<MockGateway>) -> GridEngine {
        let signal = Box::new(NoneSignal::new(config.master_side));
        GridEngine::new(config, gateway, signal).unwrap()
    }

    fn bar(ts: i64, close: f64, finished: bool) -> Kline {
        Kline::new(Symbol::new("ETH", "USDT"), "1m", ts * 60_000, close, close, close, close, 1.0, finished)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_retry_backoff() {
        assert_eq!(retry_backoff(1), 1);
        assert_eq!(retry_backoff(2), 2);
        assert_eq!(retry_backoff(4), 8);
        assert_eq!(retry_backoff(30), 64);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let gateway = Arc::new(MockGateway::new());
        let mut bad = config(2);
        bad.lowest_price = 2000.0;
        let signal = Box::new(NoneSignal::new(OrderSide::Buy));
        assert!(matches!(
            GridEngine::new(bad, gateway, signal),
            Err(GridError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_precision_fails_initialization() {
        let gateway = Arc::new(MockGateway::new());
        gateway
            .set_symbol_info(SymbolInfo {
                step_size: 0.0,
                ..SymbolInfo::default()
            })
            .await;
        let mut engine = engine(config(2), gateway);
        assert!(engine.on_kline(&bar(1, 100.0, true)).await.is_err());
        assert!(!engine.is_initialized());
    }

    #[tokio::test]
    async fn test_grid_spacing() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(2), gateway.clone());

        assert!(engine.on_kline(&bar(1, 100.0, true)).await.unwrap().opened.is_some());
        assert!(engine.on_kline(&bar(2, 100.5, true)).await.unwrap().opened.is_none());
        assert!(engine.on_kline(&bar(3, 99.0, true)).await.unwrap().opened.is_some());
        assert_eq!(engine.order_count().await, 2);

        let placed = gateway.placed().await;
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|r| r.side == OrderSide::Buy && r.is_market()));
    }

    #[tokio::test]
    async fn test_sell_grid_spacing_is_mirrored() {
        let gateway = Arc::new(MockGateway::new());
        let mut sell = config(3);
        sell.master_side = OrderSide::Sell;
        let mut engine = engine(sell, gateway.clone());

        assert!(engine.on_kline(&bar(1, 100.0, true)).await.unwrap().opened.is_some());
        assert!(engine.on_kline(&bar(2, 99.0, true)).await.unwrap().opened.is_none());
        assert!(engine.on_kline(&bar(3, 101.0, true)).await.unwrap().opened.is_some());
        assert_eq!(gateway.placed().await[0].position_side, crate::grid::types::PositionSide::Short);
    }

    #[tokio::test]
    async fn test_negative_spacing_pyramids_into_gains() {
        let gateway = Arc::new(MockGateway::new());
        let mut cfg = config(3);
        cfg.grid_spacing_rate = -0.01;
        let mut engine = engine(cfg, gateway);

        assert!(engine.on_kline(&bar(1, 100.0, true)).await.unwrap().opened.is_some());
        // Above the last entry but within 1% of the lowest one
        assert!(engine.on_kline(&bar(2, 100.5, true)).await.unwrap().opened.is_some());
        // More than 1% above the lowest entry
        assert!(engine.on_kline(&bar(3, 102.0, true)).await.unwrap().opened.is_none());
        assert_eq!(engine.order_count().await, 2);
    }

    #[tokio::test]
    async fn test_price_range_and_max_order() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(2), gateway);

        // Outside [10, 1000]
        assert!(engine.on_kline(&bar(1, 1500.0, true)).await.unwrap().opened.is_none());

        for (i, price) in [100.0, 98.0, 96.0, 94.0, 92.0].iter().enumerate() {
            engine.on_kline(&bar(i as i64 + 2, *price, true)).await.unwrap();
            assert!(engine.order_count().await <= 2);
        }
        assert_eq!(engine.order_count().await, 2);
    }

    #[tokio::test]
    async fn test_fixed_take_profit_exit() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(2).with_fixed_take_profit(0.01), gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        let order = engine.orders().await.remove(0);
        assert_eq!(order.profit_level(101.5).as_i8(), 2);

        let report = engine.on_kline(&bar(2, 101.5, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(engine.order_count().await, 0);

        let exit = gateway.placed().await.pop().unwrap();
        assert_eq!(exit.side, OrderSide::Sell);
        assert!(approx(exit.quantity, 1.0));

        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_price, Some(101.5));
        assert_eq!(history[0].exit_reason, Some(ExitReason::FixedTakeProfit));
        assert_eq!(history[0].status, OrderState::ExitFilled);
    }

    #[tokio::test]
    async fn test_signal_exit_requires_profit() {
        let gateway = Arc::new(MockGateway::new());
        let mut cfg = config(1).with_exit_signal(0.005);
        cfg.fixed_take_profit_rate = 0.02;
        let mut engine = engine(cfg, gateway);

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        // Breakeven only: kept
        assert!(engine.on_kline(&bar(2, 100.2, true)).await.unwrap().closed.is_empty());
        // Above the signal minimum with an exit hint: closed
        let report = engine.on_kline(&bar(3, 100.8, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_reason, Some(ExitReason::Signal));
    }

    #[tokio::test]
    async fn test_signal_exit_ignores_orders_above_take_profit() {
        let gateway = Arc::new(MockGateway::new());
        let mut cfg = config(1).with_exit_signal(0.005);
        cfg.fixed_take_profit_rate = 0.01;
        let mut engine = engine(cfg, gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        // Level 2 with fixed take profit off: the exit hint alone does not close it
        let report = engine.on_kline(&bar(2, 101.5, true)).await.unwrap();
        assert!(report.closed.is_empty());
        assert_eq!(engine.order_count().await, 1);
        assert_eq!(
            engine.orders().await[0].profit_level(101.5),
            ProfitLevel::AboveTakeProfit
        );
        assert_eq!(gateway.placed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_order_stop_loss() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(1).with_order_stop_loss(0.05), gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        assert!(approx(engine.orders().await[0].current_stop_price.unwrap(), 95.0));

        let report = engine.on_kline(&bar(2, 94.0, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_price, Some(94.0));
        assert_eq!(history[0].exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(gateway.placed().await.len(), 2);
    }

    #[tokio::test]
    async fn test_trailing_stop_on_unfinished_bars() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(1).with_trailing_stop(0.02, 0.01), gateway);

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        engine.on_kline(&bar(2, 102.0, false)).await.unwrap();
        assert!(approx(engine.orders().await[0].current_stop_price.unwrap(), 99.96));

        // Pullback above the stop keeps the level
        assert!(engine.on_kline(&bar(2, 100.5, false)).await.unwrap().closed.is_empty());

        let report = engine.on_kline(&bar(2, 99.9, false)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_reason, Some(ExitReason::TrailingStop));
    }

    #[tokio::test]
    async fn test_trailing_stop_follows_close_not_wicks() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(1).with_trailing_stop(0.02, 0.01), gateway);

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        let wick = Kline::new(Symbol::new("ETH", "USDT"), "1m", 2 * 60_000, 100.0, 110.0, 99.0, 102.0, 1.0, true);
        engine.on_kline(&wick).await.unwrap();

        let orders = engine.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].extreme_price, Some(102.0));
        assert!(approx(orders[0].current_stop_price.unwrap(), 99.96));
    }

    #[tokio::test]
    async fn test_close_position_ratio_aggregates() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(2).with_close_position_ratio(0.95), gateway.clone());
        engine.initialize().await.unwrap();

        for (id, price, qty) in [("BUY1", 100.0, 100.0), ("BUY2", 98.0, 50.0)] {
            let mut order = GridOrder::new(id, OrderSide::Buy, price, qty);
            order.status = OrderState::Closed;
            engine.order_manager().add_order(order).await;
        }

        engine.request_close_all();
        let report = engine.on_kline(&bar(1, 97.0, true)).await.unwrap();
        assert!(report.stop_all);
        assert_eq!(report.closed.len(), 2);

        let placed = gateway.placed().await;
        assert_eq!(placed.len(), 1);
        assert!(approx(placed[0].quantity, 142.5));
        assert_eq!(placed[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_unconfirmed_entries_are_canceled() {
        let gateway = Arc::new(MockGateway::new());
        let mut cfg = config(1).with_fixed_take_profit(0.01);
        cfg.highest_price = 120.0;
        let mut engine = engine(cfg, gateway.clone());
        engine.initialize().await.unwrap();

        engine
            .order_manager()
            .add_order(GridOrder::new("BUY_DEAD", OrderSide::Buy, 100.0, 1.0).with_take_profit(0.01, 0.0))
            .await;
        gateway.set_status("BUY_DEAD", ExchangeOrderStatus::Expired).await;

        // Far above take profit (and the grid range), but the entry never filled
        let report = engine.on_kline(&bar(1, 150.0, true)).await.unwrap();
        assert_eq!(report.closed, vec!["BUY_DEAD".to_string()]);
        assert!(gateway.placed().await.is_empty());
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].status, OrderState::Expired);
        assert!(history[0].exit_price.is_none());
    }

    #[tokio::test]
    async fn test_close_all_cancels_resting_entry() {
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(1), gateway.clone());
        engine.initialize().await.unwrap();

        engine
            .order_manager()
            .add_order(GridOrder::new("BUY_REST", OrderSide::Buy, 100.0, 1.0))
            .await;
        gateway.set_status("BUY_REST", ExchangeOrderStatus::Open).await;

        engine.request_close_all();
        let report = engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(*gateway.cancelled_ids.lock().await, vec!["BUY_REST".to_string()]);
        assert!(gateway.placed().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_exit_backs_off_and_retries() {
        let gateway = Arc::new(MockGateway::new());
        let cfg = config(1).with_fixed_take_profit(0.01).with_max_exit_retries(2);
        let mut engine = engine(cfg, gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        gateway.set_should_fail(true).await;

        // Bar 2: first failure, retry allowed from bar 3
        assert!(engine.on_kline(&bar(2, 102.0, true)).await.unwrap().closed.is_empty());
        let order = engine.orders().await.remove(0);
        assert_eq!(order.exit_attempts, 1);
        assert_eq!(order.retry_after_bar, 3);
        assert!(order.exit_id.is_some());

        // Bar 3: second failure, now flagged stuck and deferred two bars
        engine.on_kline(&bar(3, 102.0, true)).await.unwrap();
        let order = engine.orders().await.remove(0);
        assert_eq!(order.exit_attempts, 2);
        assert_eq!(order.retry_after_bar, 5);
        assert!(order.exit_stuck);

        gateway.set_should_fail(false).await;
        assert!(engine.on_kline(&bar(4, 102.0, true)).await.unwrap().closed.is_empty());
        assert_eq!(engine.on_kline(&bar(5, 102.0, true)).await.unwrap().closed.len(), 1);

        let exits: Vec<_> = gateway
            .placed()
            .await
            .into_iter()
            .filter(|r| r.side == OrderSide::Sell)
            .collect();
        assert_eq!(exits.len(), 1);
    }

    #[tokio::test]
    async fn test_max_order_stop_loss_pauses() {
        let gateway = Arc::new(MockGateway::new());
        let cfg = config(3).with_max_order_stop_loss(true);
        let mut engine = engine(cfg, gateway.clone());

        assert!(engine.on_kline(&bar(1, 100.0, true)).await.unwrap().opened.is_some());
        assert!(engine.on_kline(&bar(2, 99.0, true)).await.unwrap().opened.is_some());

        let report = engine.on_kline(&bar(3, 98.0, true)).await.unwrap();
        assert!(report.stop_all);
        assert!(report.opened.is_none());
        assert_eq!(report.closed.len(), 2);
        assert_eq!(engine.order_count().await, 0);
        assert!(engine.is_paused());

        assert!(engine.on_kline(&bar(4, 97.0, true)).await.unwrap().opened.is_none());
        engine.resume();
        assert!(engine.on_kline(&bar(5, 97.0, true)).await.unwrap().opened.is_some());
    }

    #[tokio::test]
    async fn test_limit_take_profit_lifecycle() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_fill_status(ExchangeOrderStatus::Open).await;
        let mut engine = engine(config(1).with_limit_take_profit(0.01), gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        let order = engine.orders().await.remove(0);
        assert_eq!(order.status, OrderState::ExitPlaced);
        let exit_id = order.exit_id.clone().unwrap();

        let limit = gateway.placed().await.pop().unwrap();
        assert_eq!(limit.price, Some(101.0));

        // Still resting
        assert!(engine.on_kline(&bar(2, 100.5, true)).await.unwrap().closed.is_empty());

        gateway.set_status(&exit_id, ExchangeOrderStatus::Closed).await;
        let report = engine.on_kline(&bar(3, 101.2, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_reason, Some(ExitReason::LimitTakeProfit));
        assert_eq!(history[0].exit_price, Some(101.0));
    }

    #[tokio::test]
    async fn test_stop_cancels_resting_exit_before_market_exit() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_fill_status(ExchangeOrderStatus::Open).await;
        let cfg = config(1).with_limit_take_profit(0.01).with_order_stop_loss(0.05);
        let mut engine = engine(cfg, gateway.clone());

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        let exit_id = engine.orders().await[0].exit_id.clone().unwrap();

        let report = engine.on_kline(&bar(2, 94.0, true)).await.unwrap();
        assert_eq!(report.closed.len(), 1);
        assert!(gateway.cancelled_ids.lock().await.contains(&exit_id));

        let market_exit = gateway.placed().await.pop().unwrap();
        assert!(market_exit.is_market());
        assert_eq!(market_exit.side, OrderSide::Sell);
        let history = engine.order_manager().history().await;
        assert_eq!(history[0].exit_reason, Some(ExitReason::StopLoss));
    }

    #[tokio::test]
    async fn test_hot_reload_between_bars() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid_orders.json");
        let gateway = Arc::new(MockGateway::new());
        let mut engine = engine(config(3).with_order_file(&path), gateway);

        engine.on_kline(&bar(1, 100.0, true)).await.unwrap();
        let mut snapshot = OrderSnapshot::load_from_file(&path).unwrap();
        assert_eq!(snapshot.orders.len(), 1);

        snapshot.orders.clear();
        snapshot.is_reload = true;
        snapshot.save_to_file_atomic(&path).unwrap();

        let report = engine.on_kline(&bar(2, 100.2, true)).await.unwrap();
        assert!(report.reloaded);
        // Reload emptied the book, so a new level opens immediately
        assert!(report.opened.is_some());
        assert_eq!(engine.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_history_window_is_bounded() {
        let gateway = Arc::new(MockGateway::new());
        let mut cfg = config(1);
        cfg.history_limit = 3;
        let mut engine = engine(cfg, gateway);
        for i in 0..5 {
            engine.on_kline(&bar(i, 100.0, true)).await.unwrap();
        }
        // Same-timestamp update replaces the tail
        engine.on_kline(&bar(4, 101.0, true)).await.unwrap();
        assert_eq!(engine.klines().len(), 3);
        assert_eq!(engine.klines().last().unwrap().close, 101.0);
    }
}
