//! Active order registry with JSON snapshot persistence and hot reload

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::errors::{GridError, GridResult};
use super::types::GridOrder;

/// Closed orders kept in memory and in the snapshot
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// On-disk order snapshot.
///
/// Operators edit `orders` and set `is_reload` to have a running engine
/// pick the file up on its next finished bar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default)]
    pub order_file_path: String,
    /// Bumped on every write
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub orders: Vec<GridOrder>,
    #[serde(default)]
    pub history_orders: Vec<GridOrder>,
    #[serde(default)]
    pub is_reload: bool,
    /// Milliseconds since epoch of the last write
    #[serde(default)]
    pub updated_at: i64,
}

impl OrderSnapshot {
    /// Load snapshot from file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| GridError::CorruptPersistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Save snapshot to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

#[derive(Debug, Default)]
struct OrderBook {
    orders: Vec<GridOrder>,
    history: Vec<GridOrder>,
    version: u64,
    /// Active count at the last write; drives write coalescing
    persisted_count: usize,
}

impl OrderBook {
    /// Drop the oldest closed orders beyond `limit`
    fn trim_history(&mut self, limit: usize) {
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    fn snapshot(&self, path: &Path) -> OrderSnapshot {
        OrderSnapshot {
            order_file_path: path.display().to_string(),
            version: self.version,
            orders: self.orders.clone(),
            history_orders: self.history.clone(),
            is_reload: false,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn persist(&mut self, path: &Path) -> GridResult<()> {
        self.version += 1;
        self.snapshot(path).save_to_file_atomic(path)?;
        self.persisted_count = self.orders.len();
        debug!("Order snapshot v{} saved to {:?}", self.version, path);
        Ok(())
    }
}

/// Registry of one engine's active grid orders.
///
/// The lock only guards the in-memory set and the persist decision; callers
/// never hold it across a gateway call.
pub struct OrderManager {
    book: Arc<RwLock<OrderBook>>,
    save_path: Option<PathBuf>,
    history_limit: usize,
}

impl OrderManager {
    /// Create an empty manager; `save_path = None` disables persistence
    pub fn new(save_path: Option<PathBuf>) -> Self {
        Self {
            book: Arc::new(RwLock::new(OrderBook::default())),
            save_path,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Builder: cap the closed-order history
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    /// Register a new order
    pub async fn add_order(&self, order: GridOrder) {
        let mut book = self.book.write().await;
        info!(
            "Order added: {} {} {} @ {}",
            order.entry_id,
            order.side.as_str(),
            order.quantity,
            order.entry_price
        );
        book.orders.push(order);
    }

    /// Copy of the active orders
    pub async fn orders(&self) -> Vec<GridOrder> {
        self.book.read().await.orders.clone()
    }

    /// Copy of the closed-order history
    pub async fn history(&self) -> Vec<GridOrder> {
        self.book.read().await.history.clone()
    }

    pub async fn count(&self) -> usize {
        self.book.read().await.orders.len()
    }

    pub async fn version(&self) -> u64 {
        self.book.read().await.version
    }

    /// Mutate the active orders in place without persisting
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<GridOrder>) -> R,
    {
        let mut book = self.book.write().await;
        f(&mut book.orders)
    }

    /// Read the snapshot and adopt its orders.
    ///
    /// Without `force` the snapshot is adopted only when its reload flag is
    /// set and its version is not older than ours. A missing or unreadable
    /// file leaves the in-memory set untouched and returns `None`.
    pub async fn load_orders(&self, force: bool) -> Option<Vec<GridOrder>> {
        let path = self.save_path.as_ref()?;
        if !path.exists() {
            debug!("No order snapshot at {:?}", path);
            return None;
        }

        let snapshot = match OrderSnapshot::load_from_file(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Skipping order reload, keeping in-memory orders: {}", e);
                return None;
            }
        };

        if !force && !snapshot.is_reload {
            return None;
        }

        let mut book = self.book.write().await;
        if !force && snapshot.version < book.version {
            warn!(
                "Ignoring reload of stale snapshot v{} (current v{})",
                snapshot.version, book.version
            );
            return None;
        }

        book.orders = snapshot.orders;
        book.history = snapshot.history_orders;
        book.trim_history(self.history_limit);
        book.version = book.version.max(snapshot.version);
        warn!(
            "Reloaded {} orders from {:?} (v{})",
            book.orders.len(),
            path,
            book.version
        );

        // Clear the reload flag so the same edit is not applied twice
        if let Err(e) = book.persist(path) {
            error!("Failed to acknowledge order reload: {}", e);
        }

        Some(book.orders.clone())
    }

    /// Move `closed` orders into history and persist if anything changed.
    ///
    /// Writes only when the active count changed since the last write,
    /// something closed, or `refresh` is set. Returns whether a write happened.
    pub async fn record_orders(&self, closed: Vec<GridOrder>, refresh: bool) -> GridResult<bool> {
        let mut book = self.book.write().await;

        let has_closed = !closed.is_empty();
        if has_closed {
            let ids: HashSet<&str> = closed.iter().map(|o| o.entry_id.as_str()).collect();
            book.orders.retain(|o| !ids.contains(o.entry_id.as_str()));
            book.history.extend(closed);
            book.trim_history(self.history_limit);
        }

        let should_save = has_closed || refresh || book.orders.len() != book.persisted_count;
        if !should_save {
            return Ok(false);
        }

        match &self.save_path {
            Some(path) => {
                book.persist(path)?;
                Ok(true)
            }
            None => {
                book.persisted_count = book.orders.len();
                Ok(false)
            }
        }
    }

    /// Force save the current set
    pub async fn force_save(&self) -> GridResult<()> {
        if let Some(path) = &self.save_path {
            self.book.write().await.persist(path)?;
        }
        Ok(())
    }
}
