//! Signal grid order lifecycle
//!
//! A grid opens one market entry per `grid_spacing_rate` of adverse move,
//! gated by a signal source, and flattens levels on take-profit, signal
//! exit, stop-loss, trailing stop or a stop-all sweep.
//!
//! - [`config`] - grid configuration, symbol precision and validation
//! - [`types`] - order records, sides and lifecycle states
//! - [`errors`] - grid error taxonomy
//! - [`state`] - active order registry with JSON snapshot and hot reload
//! - [`executor`] - exchange gateway trait (mockable for testing)
//! - [`signal`] - entry/exit hint sources and their registry
//! - [`engine`] - per-bar decision loop
//! - [`runner`] - bar task feeding one engine
//! - [`rotation`] - long/short pair that swaps the active side
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use signal_grid::grid::{GridConfig, GridEngine, OrderSide, SignalRegistry};
//!
//! let config = GridConfig::new("ETHUSDT", "1m", OrderSide::Buy, 0.1, 0.01, 10, 1000.0, 5000.0)
//!     .with_fixed_take_profit(0.01)
//!     .with_order_file("grid_orders.json");
//! let signal = SignalRegistry::with_defaults().create(&config.signal, config.master_side)?;
//! let mut engine = GridEngine::new(config, gateway, signal)?;
//!
//! engine.on_kline(&kline).await?;
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod rotation;
pub mod runner;
pub mod signal;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::{GridConfig, SymbolInfo};
pub use engine::{BarReport, GridEngine};
pub use errors::{GridError, GridResult};
pub use executor::{ExchangeGateway, PlaceOrderRequest, PlacedOrder};
pub use rotation::{BidirectionalRotation, RotationRunner};
pub use runner::GridRunner;
pub use signal::{SignalRegistry, SignalSource};
pub use state::{OrderManager, OrderSnapshot};
pub use types::{
    ExchangeOrderStatus, ExitReason, GridOrder, OrderSide, OrderState, PlaceOrderBehavior,
    PositionSide, ProfitLevel,
};
