//! Entry/exit hint sources and the registry that builds them by name

use std::collections::HashMap;

use super::errors::{GridError, GridResult};
use super::types::OrderSide;
use crate::market::types::Kline;

/// Source of entry/exit hints computed from a window of bars.
///
/// `run` returns 1 for a long hint, -1 for a short hint and 0 for none.
/// Entry and exit are judged against the side the source was built for:
/// a BUY source enters on 1 and exits on -1.
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Side the hints are interpreted for
    fn side(&self) -> OrderSide;

    fn run(&mut self, klines: &[Kline]) -> i8;

    fn is_entry(&mut self, klines: &[Kline]) -> bool {
        let hint = self.run(klines);
        match self.side() {
            OrderSide::Buy => hint == 1,
            OrderSide::Sell => hint == -1,
        }
    }

    fn is_exit(&mut self, klines: &[Kline]) -> bool {
        let hint = self.run(klines);
        match self.side() {
            OrderSide::Buy => hint == -1,
            OrderSide::Sell => hint == 1,
        }
    }
}

/// Always allows both entries and exits
pub struct NoneSignal {
    side: OrderSide,
}

impl NoneSignal {
    pub fn new(side: OrderSide) -> Self {
        Self { side }
    }
}

impl SignalSource for NoneSignal {
    fn name(&self) -> &str {
        "none"
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn run(&mut self, _klines: &[Kline]) -> i8 {
        1
    }

    fn is_entry(&mut self, _klines: &[Kline]) -> bool {
        true
    }

    fn is_exit(&mut self, _klines: &[Kline]) -> bool {
        true
    }
}

/// Allows entries, never asks for a signal exit
pub struct AlwaysEntrySignal {
    side: OrderSide,
}

impl AlwaysEntrySignal {
    pub fn new(side: OrderSide) -> Self {
        Self { side }
    }
}

impl SignalSource for AlwaysEntrySignal {
    fn name(&self) -> &str {
        "always_entry"
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn run(&mut self, _klines: &[Kline]) -> i8 {
        match self.side {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

/// Direction-agnostic wrapper: any hint from the inner source counts as
/// both an entry and an exit.
pub struct EitherDirectionSignal {
    inner: Box<dyn SignalSource>,
    name: String,
}

impl EitherDirectionSignal {
    pub fn new(inner: Box<dyn SignalSource>) -> Self {
        let name = format!("either_direction:{}", inner.name());
        Self { inner, name }
    }
}

impl SignalSource for EitherDirectionSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> OrderSide {
        self.inner.side()
    }

    fn run(&mut self, klines: &[Kline]) -> i8 {
        self.inner.run(klines)
    }

    fn is_entry(&mut self, klines: &[Kline]) -> bool {
        self.run(klines) != 0
    }

    fn is_exit(&mut self, klines: &[Kline]) -> bool {
        self.run(klines) != 0
    }
}

/// Signal driven by a closure; handy for tests and ad-hoc rules
pub struct FnSignal<F>
where
    F: FnMut(&[Kline]) -> i8 + Send + Sync,
{
    name: String,
    side: OrderSide,
    f: F,
}

impl<F> FnSignal<F>
where
    F: FnMut(&[Kline]) -> i8 + Send + Sync,
{
    pub fn new(name: impl Into<String>, side: OrderSide, f: F) -> Self {
        Self {
            name: name.into(),
            side,
            f,
        }
    }
}

impl<F> SignalSource for FnSignal<F>
where
    F: FnMut(&[Kline]) -> i8 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn run(&mut self, klines: &[Kline]) -> i8 {
        (self.f)(klines)
    }
}

/// Factory trait for creating signal sources
pub trait SignalFactory: Send + Sync {
    fn create(&self, side: OrderSide) -> Box<dyn SignalSource>;
}

impl<F> SignalFactory for F
where
    F: Fn(OrderSide) -> Box<dyn SignalSource> + Send + Sync,
{
    fn create(&self, side: OrderSide) -> Box<dyn SignalSource> {
        self(side)
    }
}

/// Registry for signal factories
pub struct SignalRegistry {
    factories: HashMap<String, Box<dyn SignalFactory>>,
}

impl SignalRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in sources
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("none", |side: OrderSide| Box::new(NoneSignal::new(side)) as Box<dyn SignalSource>);
        registry.register("always_entry", |side: OrderSide| {
            Box::new(AlwaysEntrySignal::new(side)) as Box<dyn SignalSource>
        });
        registry
    }

    /// Register a signal factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: SignalFactory + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Create a signal by name; `either_direction:<name>` wraps another source
    pub fn create(&self, name: &str, side: OrderSide) -> GridResult<Box<dyn SignalSource>> {
        if let Some(inner) = name.strip_prefix("either_direction:") {
            let inner = self.create(inner, side)?;
            return Ok(Box::new(EitherDirectionSignal::new(inner)));
        }

        self.factories
            .get(name)
            .map(|f| f.create(side))
            .ok_or_else(|| GridError::InvalidConfig(format!("unknown signal '{}'", name)))
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
