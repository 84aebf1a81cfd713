//! Historical bar replay in the live wire format

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use super::dispatcher::Dispatcher;
use crate::market::backtest_market::BacktestSimulator;
use crate::market::message::KlineMessage;
use crate::market::types::Kline;

/// Bars skipped by default so signals start with a warm window
pub const DEFAULT_START_INDEX: usize = 300;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const PAUSE_POLL: Duration = Duration::from_millis(10);

/// Called after each dispatched bar with (dispatched, total)
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Where a multi-timeframe replay begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayStart {
    #[default]
    Beginning,
    Index(usize),
    /// First bar whose open time is at or after this timestamp
    Timestamp(i64),
}

/// Steps through a time-sorted bar sequence, one dispatch at a time.
///
/// Each bar waits for every registered task before the next is sent, so a
/// replay is deterministic for a given input.
pub struct ReplayDriver {
    bars: Vec<Kline>,
    start_index: usize,
    cursor: AtomicUsize,
    paused: AtomicBool,
    stopped: AtomicBool,
    dispatcher: Dispatcher,
    simulator: Option<Arc<BacktestSimulator>>,
    on_progress: Option<ProgressCallback>,
}

impl ReplayDriver {
    /// Replay one timeframe from `start_index` (default 300, clamped)
    pub fn single(mut bars: Vec<Kline>, start_index: Option<usize>, dispatcher: Dispatcher) -> Self {
        bars.sort_by_key(|k| k.timestamp);
        let start = start_index
            .unwrap_or(DEFAULT_START_INDEX)
            .min(bars.len().saturating_sub(1));
        Self::with_bars(bars, start, dispatcher)
    }

    /// Merge several timeframes into one finished-bar sequence.
    ///
    /// `start` applies to each series on its own, so every timeframe skips
    /// its own warm-up window; an index is clamped to the series' last bar.
    /// Skipped bars are not dispatched. Bars sharing a timestamp keep the
    /// order in which their series were given.
    pub fn multi(series: Vec<Vec<Kline>>, start: ReplayStart, dispatcher: Dispatcher) -> Self {
        let mut bars: Vec<Kline> = series
            .into_iter()
            .flat_map(|mut series| {
                series.retain(|k| k.finished);
                series.sort_by_key(|k| k.timestamp);
                let from = match start {
                    ReplayStart::Beginning => 0,
                    ReplayStart::Index(i) => i.min(series.len().saturating_sub(1)),
                    ReplayStart::Timestamp(ts) => series.partition_point(|k| k.timestamp < ts),
                };
                series.into_iter().skip(from)
            })
            .collect();
        bars.sort_by_key(|k| k.timestamp);
        Self::with_bars(bars, 0, dispatcher)
    }

    fn with_bars(bars: Vec<Kline>, start_index: usize, dispatcher: Dispatcher) -> Self {
        Self {
            bars,
            start_index,
            cursor: AtomicUsize::new(start_index),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            dispatcher,
            simulator: None,
            on_progress: None,
        }
    }

    /// Advance this simulator's clock and price before each dispatch
    pub fn with_simulator(mut self, simulator: Arc<BacktestSimulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// Index of the next bar to dispatch
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::SeqCst).min(self.bars.len())
    }

    pub fn is_completed(&self) -> bool {
        self.position() >= self.bars.len()
    }

    /// Fraction of bars dispatched since the start offset
    pub fn progress(&self) -> f64 {
        let total = self.bars.len().saturating_sub(self.start_index);
        if total == 0 {
            return 1.0;
        }
        let done = self.position().saturating_sub(self.start_index);
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Last dispatched bar
    pub fn current_kline(&self) -> Option<&Kline> {
        self.position().checked_sub(1).and_then(|i| self.bars.get(i))
    }

    pub fn pause(&self) {
        info!("Replay paused at {}", self.position());
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("Replay resumed at {}", self.position());
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn seek_to_index(&self, index: usize) {
        let index = index.min(self.bars.len());
        debug!("Replay seek to index {}", index);
        self.cursor.store(index, Ordering::SeqCst);
    }

    /// Move to the first bar opening at or after `timestamp`
    pub fn seek_to_timestamp(&self, timestamp: i64) {
        self.seek_to_index(self.bars.partition_point(|k| k.timestamp < timestamp));
    }

    /// Dispatch the next bar regardless of pause; `None` once exhausted
    pub async fn step(&self) -> Option<&Kline> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(kline) = self.bars.get(index) else {
            self.cursor.store(self.bars.len(), Ordering::SeqCst);
            return None;
        };
        self.dispatch(kline).await;
        if let Some(callback) = &self.on_progress {
            callback(
                (index + 1).saturating_sub(self.start_index),
                self.bars.len().saturating_sub(self.start_index),
            );
        }
        Some(kline)
    }

    async fn dispatch(&self, kline: &Kline) {
        if let Some(simulator) = &self.simulator {
            simulator.update_current_timestamp(kline.timestamp).await;
            simulator
                .update_current_price(&kline.symbol.binance(), kline.close)
                .await;
        }

        let message = match KlineMessage::from_kline(kline).to_json() {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode bar {}: {}", kline.timestamp, e);
                return;
            }
        };
        self.dispatcher.dispatch(&message).join().await;
    }

    /// Replay until exhausted or stopped; returns the bars dispatched
    pub async fn run(&self) -> usize {
        info!(
            "Replay started: {} bars from index {} to {} tasks",
            self.bars.len(),
            self.position(),
            self.dispatcher.task_count()
        );

        let mut dispatched = 0;
        while !self.stopped.load(Ordering::SeqCst) {
            if self.is_paused() {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }
            if self.step().await.is_none() {
                info!("Replay completed after {} bars", dispatched);
                return dispatched;
            }
            dispatched += 1;
        }

        info!("Replay stopped at {} after {} bars", self.position(), dispatched);
        dispatched
    }

    /// Run on a background task
    pub fn start(self: &Arc<Self>) -> JoinHandle<usize> {
        let driver = Arc::clone(self);
        tokio::spawn(async move { driver.run().await })
    }

    /// Ask a running replay to stop after the current bar
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Stop and wait (bounded) for the replay task. Open orders are left as they are.
    pub async fn stop(&self, handle: JoinHandle<usize>) -> Option<usize> {
        self.request_stop();
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(dispatched)) => Some(dispatched),
            Ok(Err(e)) => {
                error!("Replay task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Replay did not stop within {:?}", STOP_TIMEOUT);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::dispatcher::BarTask;
    use crate::market::types::Symbol;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        closes: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl BarTask for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn run(&self, message: &str) {
            let kline = KlineMessage::parse(message).unwrap().to_kline().unwrap();
            self.closes.lock().await.push(kline.close);
        }
    }

    fn bars(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Kline::new(Symbol::new("ETH", "USDT"), "1m", i as i64 * 60_000, close, close, close, close, 1.0, true)
            })
            .collect()
    }

    fn driver(n: usize, start: Option<usize>) -> (ReplayDriver, Arc<Collector>) {
        let collector = Arc::new(Collector::default());
        let mut dispatcher = Dispatcher::default();
        dispatcher.register(collector.clone());
        (ReplayDriver::single(bars(n), start, dispatcher), collector)
    }

    #[tokio::test]
    async fn test_single_replay_from_offset() {
        let (driver, collector) = driver(10, Some(7));
        assert_eq!(driver.progress(), 0.0);
        assert_eq!(driver.run().await, 3);
        assert!(driver.is_completed());
        assert_eq!(driver.progress(), 1.0);
        assert_eq!(*collector.closes.lock().await, vec![107.0, 108.0, 109.0]);
        assert_eq!(driver.current_kline().unwrap().close, 109.0);
    }

    #[tokio::test]
    async fn test_default_offset_is_clamped() {
        let (driver, collector) = driver(10, None);
        assert_eq!(driver.start_index(), 9);
        driver.run().await;
        assert_eq!(collector.closes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_step_and_seek() {
        let (driver, collector) = driver(10, Some(0));
        driver.step().await;
        driver.step().await;
        assert_eq!(driver.position(), 2);

        driver.seek_to_timestamp(5 * 60_000);
        assert_eq!(driver.step().await.unwrap().close, 105.0);

        driver.seek_to_index(100);
        assert!(driver.is_completed());
        assert!(driver.step().await.is_none());
        assert_eq!(*collector.closes.lock().await, vec![100.0, 101.0, 105.0]);
    }

    #[tokio::test]
    async fn test_progress_callback() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let (driver, _collector) = driver(5, Some(2));
        let driver = driver.with_progress(Box::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        }));
        driver.run().await;
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_pause_and_stop() {
        let (driver, collector) = driver(10, Some(0));
        let driver = Arc::new(driver);
        driver.pause();
        let handle = driver.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(collector.closes.lock().await.is_empty());

        assert_eq!(driver.stop(handle).await, Some(0));
        assert_eq!(driver.position(), 0);
    }

    #[tokio::test]
    async fn test_simulator_clock_follows_replay() {
        let simulator = Arc::new(BacktestSimulator::default());
        let (driver, _collector) = driver(4, Some(0));
        let driver = driver.with_simulator(simulator.clone());
        driver.run().await;
        assert_eq!(simulator.current_timestamp().await, 3 * 60_000);
        assert_eq!(simulator.current_price("ETHUSDT").await, Some(103.0));
    }

    #[tokio::test]
    async fn test_multi_start_by_timestamp() {
        let collector = Arc::new(Collector::default());
        let mut dispatcher = Dispatcher::default();
        dispatcher.register(collector.clone());

        let mut unfinished = bars(1);
        unfinished[0].finished = false;
        unfinished[0].timestamp = 9 * 60_000;

        let driver = ReplayDriver::multi(vec![bars(5), unfinished], ReplayStart::Timestamp(3 * 60_000), dispatcher);
        assert_eq!(driver.len(), 2);
        assert_eq!(driver.run().await, 2);
        assert_eq!(*collector.closes.lock().await, vec![103.0, 104.0]);
    }
}
