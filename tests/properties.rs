//! Property tests for grid invariants.
//!
//! 1. Level cap: active levels never exceed `max_order`
//! 2. Ratchet monotonicity: a trailing stop only tightens
//! 3. Cash accounting: simulator balance equals initial balance plus every fill's cash flow

use std::sync::Arc;

use proptest::prelude::*;
use tokio::runtime::Runtime;

use signal_grid::grid::executor::mock::MockGateway;
use signal_grid::grid::executor::{ExchangeGateway, PlaceOrderRequest};
use signal_grid::grid::signal::NoneSignal;
use signal_grid::grid::{GridConfig, GridEngine, GridOrder, OrderSide, PositionSide};
use signal_grid::market::{BacktestSimulator, Kline, Symbol};

// ── Strategies ───────────────────────────────────────────────────────

fn arb_closes() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec((50.0..150.0_f64).prop_map(|p| (p * 100.0).round() / 100.0), 1..60)
}

fn arb_fills() -> impl Strategy<Value = Vec<(bool, f64, f64)>> {
    prop::collection::vec(
        (
            any::<bool>(),
            (0.01..5.0_f64).prop_map(|q| (q * 1000.0).round() / 1000.0),
            (10.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0),
        ),
        1..40,
    )
}

fn bar(index: usize, close: f64, finished: bool) -> Kline {
    Kline::new(
        Symbol::new("ETH", "USDT"),
        "1m",
        index as i64 * 60_000,
        close,
        close,
        close,
        close,
        1.0,
        finished,
    )
}

// ── 1. Level cap ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn active_levels_never_exceed_max_order(
        closes in arb_closes(),
        max_order in 1u32..6,
        take_profit in prop::option::of(0.002..0.05_f64),
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = GridConfig::new("ETHUSDT", "1m", OrderSide::Buy, 1.0, 0.005, max_order, 10.0, 1000.0);
            if let Some(rate) = take_profit {
                config = config.with_fixed_take_profit(rate);
            }
            let gateway = Arc::new(MockGateway::new());
            let mut engine = GridEngine::new(config, gateway, Box::new(NoneSignal::new(OrderSide::Buy))).unwrap();

            for (i, close) in closes.iter().enumerate() {
                engine.on_kline(&bar(i, *close, i % 3 != 2)).await.unwrap();
                let active = engine.orders().await.iter().filter(|o| o.is_active()).count();
                assert!(active <= max_order as usize);
            }
        });
    }
}

// ── 2. Ratchet monotonicity ──────────────────────────────────────────

proptest! {
    #[test]
    fn buy_trailing_stop_only_rises(
        prices in prop::collection::vec(50.0..200.0_f64, 1..80),
        rate in 0.001..0.1_f64,
        activation in 0.0..0.05_f64,
    ) {
        let mut order = GridOrder::new("BUY_T", OrderSide::Buy, 100.0, 1.0)
            .with_trailing_stop(rate, activation);

        let mut last_stop: Option<f64> = None;
        for price in prices {
            order.update_trailing_stop(price);
            if let (Some(prev), Some(now)) = (last_stop, order.current_stop_price) {
                prop_assert!(now >= prev);
            }
            if last_stop.is_some() {
                prop_assert!(order.current_stop_price.is_some());
            }
            last_stop = order.current_stop_price;
        }
    }

    #[test]
    fn sell_trailing_stop_only_falls(
        prices in prop::collection::vec(50.0..200.0_f64, 1..80),
        rate in 0.001..0.1_f64,
    ) {
        let mut order = GridOrder::new("SELL_T", OrderSide::Sell, 100.0, 1.0)
            .with_stop_loss(0.05)
            .with_trailing_stop(rate, 0.0);

        let mut last_stop = order.current_stop_price;
        for price in prices {
            order.update_trailing_stop(price);
            let now = order.current_stop_price.unwrap();
            prop_assert!(now <= last_stop.unwrap());
            last_stop = Some(now);
        }
    }
}

// ── 3. Cash accounting ───────────────────────────────────────────────

proptest! {
    #[test]
    fn balance_matches_fill_cash_flows(fills in arb_fills()) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let simulator = BacktestSimulator::default();
            for (i, (is_buy, qty, price)) in fills.iter().enumerate() {
                simulator.update_current_price("ETHUSDT", *price).await;
                let side = if *is_buy { OrderSide::Buy } else { OrderSide::Sell };
                let request = PlaceOrderRequest::market(format!("fill_{}", i), "ETHUSDT", side, *qty, PositionSide::Long);
                simulator.place_order(&request).await.unwrap();
            }

            let history = simulator.get_trade_history().await;
            assert_eq!(history.len(), fills.len());

            let expected_balance = simulator.initial_balance() + history.iter().map(|o| o.cash_flow()).sum::<f64>();
            let expected_fees: f64 = history.iter().map(|o| o.fee).sum();
            assert!((simulator.balance().await - expected_balance).abs() < 1e-6);
            assert!((simulator.total_fees().await - expected_fees).abs() < 1e-9);
        });
    }
}
