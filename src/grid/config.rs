//! Grid engine configuration

use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::errors::{GridError, GridResult};
use super::types::{OrderSide, PlaceOrderBehavior, PositionSide};

/// Symbol precision and limits reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub tick_size: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
}

impl SymbolInfo {
    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let ticks = (price / self.tick_size).round();
        round_to_decimals(ticks * self.tick_size, decimals_of(self.tick_size))
    }

    /// Round a quantity down to the step size
    pub fn round_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        // Nudge before flooring so 0.3 / 0.1 does not become 2.999...
        let steps = (qty / self.step_size + 1e-9).floor();
        round_to_decimals(steps * self.step_size, decimals_of(self.step_size))
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.tick_size <= 0.0 || self.step_size <= 0.0 {
            return Err(GridError::InvalidConfig(format!(
                "symbol precision must be positive (tick_size={}, step_size={})",
                self.tick_size, self.step_size
            )));
        }
        if self.min_price > self.max_price || self.min_qty > self.max_qty {
            return Err(GridError::InvalidConfig(
                "symbol min limits exceed max limits".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SymbolInfo {
    fn default() -> Self {
        Self {
            tick_size: 0.01,
            min_price: 0.01,
            max_price: 1_000_000.0,
            step_size: 0.001,
            min_qty: 0.001,
            max_qty: 100_000.0,
        }
    }
}

fn decimals_of(step: f64) -> i32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

fn round_to_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Configuration of one signal-driven grid engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Exchange symbol, e.g. "ETHUSDT"
    pub symbol: String,

    /// Bar interval driving decisions, e.g. "1m", "15m"
    pub timeframe: String,

    /// Entry direction; exits always use the opposite side
    pub master_side: OrderSide,

    /// Hedge-mode position bucket (defaults from master_side)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_side: Option<PositionSide>,

    /// Quantity of each grid entry
    pub per_order_qty: f64,

    /// Adverse move required before another level opens
    pub grid_spacing_rate: f64,

    /// Maximum number of simultaneously active levels
    pub max_order: u32,

    /// Entries are only opened inside [lowest_price, highest_price]
    pub lowest_price: f64,
    pub highest_price: f64,

    /// Name of the entry/exit hint source (see `SignalRegistry`)
    #[serde(default = "default_signal")]
    pub signal: String,

    /// Close profitable levels when the signal asks for an exit
    #[serde(default)]
    pub enable_exit_signal: bool,

    #[serde(default)]
    pub signal_min_take_profit_rate: f64,

    #[serde(default)]
    pub enable_fixed_profit_taking: bool,

    #[serde(default)]
    pub fixed_take_profit_rate: f64,

    /// Rest a limit exit at the take-profit price once the entry fills
    #[serde(default)]
    pub enable_limit_take_profit: bool,

    /// Fraction of the aggregated quantity sent on exits
    #[serde(default = "default_close_position_ratio")]
    pub close_position_ratio: f64,

    /// Flatten everything instead of filling the last free slot
    #[serde(default)]
    pub enable_max_order_stop_loss: bool,

    /// Stop opening levels after a max-order stop-loss sweep
    #[serde(default)]
    pub paused_after_stop_loss: bool,

    #[serde(default)]
    pub enable_order_stop_loss: bool,

    #[serde(default)]
    pub order_stop_loss_rate: f64,

    #[serde(default)]
    pub enable_trailing_stop: bool,

    #[serde(default)]
    pub trailing_stop_rate: f64,

    #[serde(default)]
    pub trailing_stop_activation_profit_rate: f64,

    #[serde(default)]
    pub place_order_behavior: PlaceOrderBehavior,

    /// Order snapshot path; no persistence when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_file_path: Option<PathBuf>,

    /// Number of bars kept for the signal window
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Exit placement failures before an order is flagged stuck
    #[serde(default = "default_max_exit_retries")]
    pub max_exit_retries: u32,
}

fn default_signal() -> String {
    "none".to_string()
}

fn default_close_position_ratio() -> f64 {
    1.0
}

fn default_history_limit() -> usize {
    300
}

fn default_max_exit_retries() -> u32 {
    8
}

impl GridConfig {
    /// Create a configuration with the required grid parameters
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        master_side: OrderSide,
        per_order_qty: f64,
        grid_spacing_rate: f64,
        max_order: u32,
        lowest_price: f64,
        highest_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            master_side,
            position_side: None,
            per_order_qty,
            grid_spacing_rate,
            max_order,
            lowest_price,
            highest_price,
            signal: default_signal(),
            enable_exit_signal: false,
            signal_min_take_profit_rate: 0.0,
            enable_fixed_profit_taking: false,
            fixed_take_profit_rate: 0.0,
            enable_limit_take_profit: false,
            close_position_ratio: default_close_position_ratio(),
            enable_max_order_stop_loss: false,
            paused_after_stop_loss: false,
            enable_order_stop_loss: false,
            order_stop_loss_rate: 0.0,
            enable_trailing_stop: false,
            trailing_stop_rate: 0.0,
            trailing_stop_activation_profit_rate: 0.0,
            place_order_behavior: PlaceOrderBehavior::default(),
            order_file_path: None,
            history_limit: default_history_limit(),
            max_exit_retries: default_max_exit_retries(),
        }
    }

    /// Position bucket, falling back to the one the master side opens
    pub fn position_side(&self) -> PositionSide {
        self.position_side.unwrap_or(match self.master_side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        })
    }

    /// Builder: set hedge-mode position side
    pub fn with_position_side(mut self, side: PositionSide) -> Self {
        self.position_side = Some(side);
        self
    }

    /// Builder: take profit at a fixed rate
    pub fn with_fixed_take_profit(mut self, rate: f64) -> Self {
        self.enable_fixed_profit_taking = true;
        self.fixed_take_profit_rate = rate;
        self
    }

    /// Builder: close on exit signal once `min_rate` profit is reached
    pub fn with_exit_signal(mut self, min_rate: f64) -> Self {
        self.enable_exit_signal = true;
        self.signal_min_take_profit_rate = min_rate;
        self
    }

    /// Builder: rest limit exits at the fixed take-profit price
    pub fn with_limit_take_profit(mut self, rate: f64) -> Self {
        self.enable_limit_take_profit = true;
        self.fixed_take_profit_rate = rate;
        self
    }

    /// Builder: per-order stop loss
    pub fn with_order_stop_loss(mut self, rate: f64) -> Self {
        self.enable_order_stop_loss = true;
        self.order_stop_loss_rate = rate;
        self
    }

    /// Builder: trailing stop
    pub fn with_trailing_stop(mut self, rate: f64, activation_profit_rate: f64) -> Self {
        self.enable_trailing_stop = true;
        self.trailing_stop_rate = rate;
        self.trailing_stop_activation_profit_rate = activation_profit_rate;
        self
    }

    /// Builder: flatten all levels instead of filling the last slot
    pub fn with_max_order_stop_loss(mut self, pause_after: bool) -> Self {
        self.enable_max_order_stop_loss = true;
        self.paused_after_stop_loss = pause_after;
        self
    }

    /// Builder: partial close ratio for exits
    pub fn with_close_position_ratio(mut self, ratio: f64) -> Self {
        self.close_position_ratio = ratio;
        self
    }

    /// Builder: signal source name
    pub fn with_signal(mut self, name: impl Into<String>) -> Self {
        self.signal = name.into();
        self
    }

    /// Builder: order snapshot path
    pub fn with_order_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.order_file_path = Some(path.into());
        self
    }

    /// Builder: placement behavior passed to the gateway
    pub fn with_place_order_behavior(mut self, behavior: PlaceOrderBehavior) -> Self {
        self.place_order_behavior = behavior;
        self
    }

    /// Builder: exit retry bound
    pub fn with_max_exit_retries(mut self, retries: u32) -> Self {
        self.max_exit_retries = retries;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.timeframe.is_empty() {
            return Err(GridError::InvalidConfig("timeframe cannot be empty".into()));
        }

        if self.lowest_price <= 0.0 || self.lowest_price >= self.highest_price {
            return Err(GridError::InvalidConfig(format!(
                "price range [{}, {}] is invalid",
                self.lowest_price, self.highest_price
            )));
        }

        if self.per_order_qty <= 0.0 {
            return Err(GridError::InvalidConfig(
                "per_order_qty must be positive".into(),
            ));
        }

        // Zero or negative spacing pyramids into moves in the grid's favor
        if !self.grid_spacing_rate.is_finite() {
            return Err(GridError::InvalidConfig(
                "grid_spacing_rate must be a finite number".into(),
            ));
        }

        if self.enable_max_order_stop_loss && self.max_order <= 1 {
            warn!(
                "{} {}: max-order stop loss with max_order={} stops out before any level opens",
                self.symbol, self.timeframe, self.max_order
            );
        }

        if !(self.close_position_ratio > 0.0 && self.close_position_ratio <= 1.0) {
            return Err(GridError::InvalidConfig(
                "close_position_ratio must be in (0, 1]".into(),
            ));
        }

        let rates = [
            ("signal_min_take_profit_rate", self.signal_min_take_profit_rate),
            ("fixed_take_profit_rate", self.fixed_take_profit_rate),
            ("order_stop_loss_rate", self.order_stop_loss_rate),
            ("trailing_stop_rate", self.trailing_stop_rate),
            (
                "trailing_stop_activation_profit_rate",
                self.trailing_stop_activation_profit_rate,
            ),
        ];
        for (name, rate) in rates {
            if rate < 0.0 || !rate.is_finite() {
                return Err(GridError::InvalidConfig(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }

        if (self.enable_fixed_profit_taking || self.enable_limit_take_profit)
            && self.fixed_take_profit_rate <= 0.0
        {
            return Err(GridError::InvalidConfig(
                "fixed_take_profit_rate must be positive when take profit is enabled".into(),
            ));
        }

        if self.enable_order_stop_loss && self.order_stop_loss_rate <= 0.0 {
            return Err(GridError::InvalidConfig(
                "order_stop_loss_rate must be positive when stop loss is enabled".into(),
            ));
        }

        if self.enable_trailing_stop && self.trailing_stop_rate <= 0.0 {
            return Err(GridError::InvalidConfig(
                "trailing_stop_rate must be positive when trailing stop is enabled".into(),
            ));
        }

        Ok(())
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to JSON file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> GridResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
