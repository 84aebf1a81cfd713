//! Exchange abstraction for the grid engine - enables mocking for tests

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::config::SymbolInfo;
use super::errors::{GridError, GridResult};
use super::types::{ExchangeOrderStatus, OrderSide, PlaceOrderBehavior, PositionSide};
use crate::market::types::Kline;

/// Order submitted through an `ExchangeGateway`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Client-assigned id; used for later cancel/query
    pub custom_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// Limit price; `None` places a market order
    pub price: Option<f64>,
    pub position_side: PositionSide,
    pub behavior: PlaceOrderBehavior,
}

impl PlaceOrderRequest {
    pub fn market(
        custom_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        position_side: PositionSide,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
            position_side,
            behavior: PlaceOrderBehavior::Normal,
        }
    }

    /// Builder: make this a limit order
    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_behavior(mut self, behavior: PlaceOrderBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn is_market(&self) -> bool {
        self.price.is_none()
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    /// Fill or resting price when known
    pub price: Option<f64>,
    pub status: ExchangeOrderStatus,
}

/// Exchange operations trait - can be mocked for testing
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a market or limit order
    async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<PlacedOrder>;

    /// Cancel an order by client id
    async fn cancel_order(&self, id: &str, symbol: &str) -> GridResult<()>;

    /// Current status of an order by client id
    async fn query_order(&self, id: &str, symbol: &str) -> GridResult<ExchangeOrderStatus>;

    /// Tick/step precision and limits for a symbol
    async fn symbol_info(&self, symbol: &str) -> GridResult<SymbolInfo>;

    /// Most recent `limit` bars of `timeframe`
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> GridResult<Vec<Kline>>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock gateway for exercising the engine without a matching simulator.
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    /// Scriptable in-memory gateway
    pub struct MockGateway {
        pub orders: Arc<Mutex<Vec<PlaceOrderRequest>>>,
        pub cancelled_ids: Arc<Mutex<Vec<String>>>,
        pub statuses: Arc<Mutex<HashMap<String, ExchangeOrderStatus>>>,
        /// Status assigned to newly placed orders
        pub fill_status: Arc<Mutex<ExchangeOrderStatus>>,
        pub symbol_info: Arc<Mutex<SymbolInfo>>,
        pub klines: Arc<Mutex<Vec<Kline>>>,
        pub should_fail: Arc<Mutex<bool>>,
        pub fail_queries: Arc<Mutex<bool>>,
    }

    impl MockGateway {
        /// Gateway that fills every order immediately
        pub fn new() -> Self {
            Self {
                orders: Arc::new(Mutex::new(Vec::new())),
                cancelled_ids: Arc::new(Mutex::new(Vec::new())),
                statuses: Arc::new(Mutex::new(HashMap::new())),
                fill_status: Arc::new(Mutex::new(ExchangeOrderStatus::Closed)),
                symbol_info: Arc::new(Mutex::new(SymbolInfo::default())),
                klines: Arc::new(Mutex::new(Vec::new())),
                should_fail: Arc::new(Mutex::new(false)),
                fail_queries: Arc::new(Mutex::new(false)),
            }
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn set_fail_queries(&self, fail: bool) {
            *self.fail_queries.lock().await = fail;
        }

        pub async fn set_fill_status(&self, status: ExchangeOrderStatus) {
            *self.fill_status.lock().await = status;
        }

        pub async fn set_status(&self, id: &str, status: ExchangeOrderStatus) {
            self.statuses.lock().await.insert(id.to_string(), status);
        }

        pub async fn set_symbol_info(&self, info: SymbolInfo) {
            *self.symbol_info.lock().await = info;
        }

        pub async fn set_klines(&self, klines: Vec<Kline>) {
            *self.klines.lock().await = klines;
        }

        pub async fn placed(&self) -> Vec<PlaceOrderRequest> {
            self.orders.lock().await.clone()
        }
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<PlacedOrder> {
            if *self.should_fail.lock().await {
                return Err(GridError::unavailable("place_order", "mock failure"));
            }

            self.orders.lock().await.push(request.clone());
            let status = if request.is_market() {
                ExchangeOrderStatus::Closed
            } else {
                *self.fill_status.lock().await
            };
            self.statuses
                .lock()
                .await
                .insert(request.custom_id.clone(), status);

            Ok(PlacedOrder {
                id: request.custom_id.clone(),
                price: request.price,
                status,
            })
        }

        async fn cancel_order(&self, id: &str, _symbol: &str) -> GridResult<()> {
            if *self.should_fail.lock().await {
                return Err(GridError::unavailable("cancel_order", "mock failure"));
            }
            self.cancelled_ids.lock().await.push(id.to_string());
            let mut statuses = self.statuses.lock().await;
            if let Some(status) = statuses.get_mut(id) {
                if *status == ExchangeOrderStatus::Open {
                    *status = ExchangeOrderStatus::Canceled;
                }
            }
            Ok(())
        }

        async fn query_order(&self, id: &str, _symbol: &str) -> GridResult<ExchangeOrderStatus> {
            if *self.fail_queries.lock().await {
                return Err(GridError::unavailable("query_order", "mock failure"));
            }
            self.statuses
                .lock()
                .await
                .get(id)
                .copied()
                .ok_or_else(|| GridError::OrderNotFound(id.to_string()))
        }

        async fn symbol_info(&self, _symbol: &str) -> GridResult<SymbolInfo> {
            Ok(*self.symbol_info.lock().await)
        }

        async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, limit: usize) -> GridResult<Vec<Kline>> {
            let klines = self.klines.lock().await;
            let start = klines.len().saturating_sub(limit);
            Ok(klines[start..].to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockGateway;
    use super::*;

    #[tokio::test]
    async fn test_mock_fills_market_orders() {
        let gateway = MockGateway::new();
        gateway.set_fill_status(ExchangeOrderStatus::Open).await;

        let market = PlaceOrderRequest::market("BUY1", "ETHUSDT", OrderSide::Buy, 1.0, PositionSide::Long);
        let placed = gateway.place_order(&market).await.unwrap();
        assert_eq!(placed.status, ExchangeOrderStatus::Closed);

        let limit = PlaceOrderRequest::market("SELL1", "ETHUSDT", OrderSide::Sell, 1.0, PositionSide::Long)
            .with_price(110.0);
        let placed = gateway.place_order(&limit).await.unwrap();
        assert_eq!(placed.status, ExchangeOrderStatus::Open);

        gateway.cancel_order("SELL1", "ETHUSDT").await.unwrap();
        assert_eq!(
            gateway.query_order("SELL1", "ETHUSDT").await.unwrap(),
            ExchangeOrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_should_fail(true).await;
        let request = PlaceOrderRequest::market("BUY1", "ETHUSDT", OrderSide::Buy, 1.0, PositionSide::Long);
        let err = gateway.place_order(&request).await.unwrap_err();
        assert!(err.is_retryable());

        assert!(matches!(
            gateway.query_order("missing", "ETHUSDT").await,
            Err(GridError::OrderNotFound(_))
        ));
    }
}
