//! Core data types for the grid engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side for entries and exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Hedge-mode position bucket an order belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// Side of the order that grows this position
    pub fn opening_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

/// How the gateway should work an order onto the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaceOrderBehavior {
    #[default]
    Normal,
    /// Chase the best price for both entries and exits
    Chaser,
    /// Chase the best price for entries only
    ChaserOpen,
}

/// Lifecycle state of one grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Entry sent, fill not yet confirmed
    Open,
    /// Entry filled, position held
    Closed,
    /// A resting exit order is working
    ExitPlaced,
    ExitFilled,
    Expired,
    Canceled,
}

impl OrderState {
    /// States in which the order still occupies a grid slot
    pub fn is_active(&self) -> bool {
        matches!(self, OrderState::Open | OrderState::Closed | OrderState::ExitPlaced)
    }
}

/// Why a grid level was flattened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopAll,
    FixedTakeProfit,
    Signal,
    StopLoss,
    TrailingStop,
    LimitTakeProfit,
}

/// Profit classification of an order at a given price
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfitLevel {
    Loss = -1,
    Breakeven = 0,
    Profitable = 1,
    AboveTakeProfit = 2,
}

impl ProfitLevel {
    pub fn as_i8(&self) -> i8 {
        *self as i8
    }
}

/// Order status as reported by an exchange gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
    Expired,
}

impl ExchangeOrderStatus {
    /// The order is gone without having filled
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Rejected | ExchangeOrderStatus::Expired
        )
    }
}

/// Build a client order id: side prefix followed by 10 hex characters
pub fn new_custom_id(side: OrderSide) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", side.as_str(), &hex[..10])
}

/// One grid level: an entry order and its (eventual) exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    /// Client id of the entry order
    pub entry_id: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub fixed_take_profit_rate: f64,
    #[serde(default)]
    pub signal_min_take_profit_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    /// Client id of the single outstanding exit order, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_id: Option<String>,
    pub status: OrderState,

    #[serde(default)]
    pub enable_stop_loss: bool,
    #[serde(default)]
    pub stop_loss_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stop_price: Option<f64>,
    #[serde(default)]
    pub enable_trailing_stop: bool,
    #[serde(default)]
    pub trailing_stop_rate: f64,
    #[serde(default)]
    pub trailing_stop_activation_profit_rate: f64,
    /// Most favorable price seen since entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extreme_price: Option<f64>,

    /// Bar timestamp (ms) of the entry
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,

    #[serde(default)]
    pub exit_attempts: u32,
    /// Finished-bar counter before which no exit is retried
    #[serde(default)]
    pub retry_after_bar: u64,
    #[serde(default)]
    pub exit_stuck: bool,
}

impl GridOrder {
    /// Create a new open entry with no take-profit or stop settings
    pub fn new(entry_id: impl Into<String>, side: OrderSide, entry_price: f64, quantity: f64) -> Self {
        Self {
            entry_id: entry_id.into(),
            side,
            entry_price,
            quantity,
            fixed_take_profit_rate: 0.0,
            signal_min_take_profit_rate: 0.0,
            exit_price: None,
            exit_id: None,
            status: OrderState::Open,
            enable_stop_loss: false,
            stop_loss_rate: 0.0,
            current_stop_price: None,
            enable_trailing_stop: false,
            trailing_stop_rate: 0.0,
            trailing_stop_activation_profit_rate: 0.0,
            extreme_price: None,
            created_at: 0,
            closed_at: None,
            exit_reason: None,
            exit_attempts: 0,
            retry_after_bar: 0,
            exit_stuck: false,
        }
    }

    /// Builder: set take-profit rates
    pub fn with_take_profit(mut self, fixed_rate: f64, signal_min_rate: f64) -> Self {
        self.fixed_take_profit_rate = fixed_rate;
        self.signal_min_take_profit_rate = signal_min_rate;
        self
    }

    /// Builder: enable a fixed stop at `rate` away from the entry
    pub fn with_stop_loss(mut self, rate: f64) -> Self {
        self.enable_stop_loss = true;
        self.stop_loss_rate = rate;
        self.current_stop_price = Some(self.offset_against(rate));
        self
    }

    /// Builder: enable the trailing stop
    pub fn with_trailing_stop(mut self, rate: f64, activation_profit_rate: f64) -> Self {
        self.enable_trailing_stop = true;
        self.trailing_stop_rate = rate;
        self.trailing_stop_activation_profit_rate = activation_profit_rate;
        self
    }

    /// Builder: stamp the entry bar time
    pub fn with_created_at(mut self, timestamp: i64) -> Self {
        self.created_at = timestamp;
        self
    }

    fn offset_in_favor(&self, rate: f64) -> f64 {
        match self.side {
            OrderSide::Buy => self.entry_price * (1.0 + rate),
            OrderSide::Sell => self.entry_price * (1.0 - rate),
        }
    }

    fn offset_against(&self, rate: f64) -> f64 {
        match self.side {
            OrderSide::Buy => self.entry_price * (1.0 - rate),
            OrderSide::Sell => self.entry_price * (1.0 + rate),
        }
    }

    /// `a` is strictly better than `b` for this order's direction
    fn better(&self, a: f64, b: f64) -> bool {
        match self.side {
            OrderSide::Buy => a > b,
            OrderSide::Sell => a < b,
        }
    }

    pub fn take_profit_price(&self) -> f64 {
        self.offset_in_favor(self.fixed_take_profit_rate)
    }

    pub fn signal_take_profit_price(&self) -> f64 {
        self.offset_in_favor(self.signal_min_take_profit_rate)
    }

    pub fn profit_level(&self, price: f64) -> ProfitLevel {
        if self.better(price, self.take_profit_price()) {
            ProfitLevel::AboveTakeProfit
        } else if self.better(price, self.signal_take_profit_price()) {
            ProfitLevel::Profitable
        } else if self.better(price, self.entry_price) {
            ProfitLevel::Breakeven
        } else {
            ProfitLevel::Loss
        }
    }

    /// Signed return of `price` relative to the entry, positive when in profit
    pub fn profit_ratio(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        match self.side {
            OrderSide::Buy => (price - self.entry_price) / self.entry_price,
            OrderSide::Sell => (self.entry_price - price) / self.entry_price,
        }
    }

    /// Ratchet the trailing stop; returns true when the stop moved
    pub fn update_trailing_stop(&mut self, price: f64) -> bool {
        if !self.enable_trailing_stop {
            return false;
        }

        let extreme = match self.extreme_price {
            Some(e) if !self.better(price, e) => e,
            Some(_) => price,
            None if self.better(price, self.entry_price) => price,
            None => self.entry_price,
        };
        self.extreme_price = Some(extreme);

        if self.profit_ratio(extreme) < self.trailing_stop_activation_profit_rate {
            return false;
        }

        let candidate = match self.side {
            OrderSide::Buy => extreme * (1.0 - self.trailing_stop_rate),
            OrderSide::Sell => extreme * (1.0 + self.trailing_stop_rate),
        };

        match self.current_stop_price {
            Some(stop) if !self.better(candidate, stop) => false,
            _ => {
                self.current_stop_price = Some(candidate);
                true
            }
        }
    }

    /// Current price has crossed the stop price
    pub fn is_stop_triggered(&self, price: f64) -> bool {
        if !self.enable_stop_loss && !self.enable_trailing_stop {
            return false;
        }
        match (self.current_stop_price, self.side) {
            (Some(stop), OrderSide::Buy) => price <= stop,
            (Some(stop), OrderSide::Sell) => price >= stop,
            (None, _) => false,
        }
    }

    /// Stop reason to record when the stop fires
    pub fn stop_reason(&self) -> ExitReason {
        match self.extreme_price {
            Some(_) if self.enable_trailing_stop && self.stop_moved_by_trailing() => {
                ExitReason::TrailingStop
            }
            _ => ExitReason::StopLoss,
        }
    }

    fn stop_moved_by_trailing(&self) -> bool {
        match (self.current_stop_price, self.enable_stop_loss) {
            (Some(stop), true) => self.better(stop, self.offset_against(self.stop_loss_rate)),
            (Some(_), false) => true,
            (None, _) => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
