//! Fan-out of bar messages to registered tasks on a bounded worker pool

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, error};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Consumer of wire-format bar messages
#[async_trait]
pub trait BarTask: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one message. Errors are the task's own to log.
    async fn run(&self, message: &str);
}

/// Handles of one dispatched message
#[must_use = "join the handle to wait for the tasks"]
pub struct DispatchHandle {
    handles: Vec<JoinHandle<()>>,
}

impl DispatchHandle {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task spawned for the message
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Bar task failed: {}", e);
            }
        }
    }
}

/// Runs every registered task for each message, at most `max_workers` at once
pub struct Dispatcher {
    tasks: Vec<Arc<dyn BarTask>>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl Dispatcher {
    pub const DEFAULT_WORKERS: usize = 5;

    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            tasks: Vec::new(),
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn register(&mut self, task: Arc<dyn BarTask>) {
        debug!("Registered bar task {}", task.name());
        self.tasks.push(task);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn one run per task; the handle resolves when all have finished
    pub fn dispatch(&self, message: &str) -> DispatchHandle {
        let message: Arc<str> = Arc::from(message);
        let handles = self
            .tasks
            .iter()
            .map(|task| {
                let task = Arc::clone(task);
                let semaphore = Arc::clone(&self.semaphore);
                let message = Arc::clone(&message);
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    task.run(&message).await;
                })
            })
            .collect();
        DispatchHandle { handles }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BarTask for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, message: &str) {
            self.seen.lock().await.push(message.to_string());
        }
    }

    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl BarTask for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn run(&self, _message: &str) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_every_task_sees_message() {
        let a = Arc::new(Recorder {
            name: "a".into(),
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Recorder {
            name: "b".into(),
            seen: Mutex::new(Vec::new()),
        });

        let mut dispatcher = Dispatcher::default();
        dispatcher.register(a.clone());
        dispatcher.register(b.clone());

        dispatcher.dispatch("one").join().await;
        dispatcher.dispatch("two").join().await;

        assert_eq!(*a.seen.lock().await, vec!["one", "two"]);
        assert_eq!(*b.seen.lock().await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_worker_limit() {
        let gauge = Arc::new(Gauge {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut dispatcher = Dispatcher::new(2);
        for _ in 0..6 {
            dispatcher.register(gauge.clone());
        }
        let handle = dispatcher.dispatch("bar");
        assert_eq!(handle.len(), 6);
        handle.join().await;

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_dispatch() {
        let dispatcher = Dispatcher::new(0);
        assert_eq!(dispatcher.max_workers(), 1);
        let handle = dispatcher.dispatch("bar");
        assert!(handle.is_empty());
        handle.join().await;
    }
}
