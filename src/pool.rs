use crate::metrics::PANICS_RECOVERED;
use futures::FutureExt;
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Unbounded multi-producer multi-consumer queue.
///
/// Push never blocks, pop waits for an item. Depth and the number of waiting
/// consumers are tracked for the self-monitor.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    depth: AtomicUsize,
    idle: AtomicUsize,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct IdleGuard<'a>(&'a AtomicUsize);

impl<'a> IdleGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> WorkQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
            depth: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        }
    }

    /// Returns `false` once the queue is closed
    pub fn push(&self, item: T) -> bool {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        if sender.send(item).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Wait for the next item, `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<T> {
        let item = {
            let _idle = IdleGuard::enter(&self.idle);
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };

        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Stop accepting items, consumers drain what is left
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Consumers currently waiting in [`WorkQueue::pop`]
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub depth: usize,
}

impl PoolStats {
    /// Share of busy tasks, between 0 and 1
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.size.saturating_sub(self.idle) as f64 / self.size as f64
    }

    #[must_use]
    pub const fn fully_busy(&self) -> bool {
        self.idle == 0
    }

    #[must_use]
    pub const fn saturated(&self) -> bool {
        self.depth > 0
    }
}

/// Fixed number of tasks consuming one [`WorkQueue`]
#[derive(Debug)]
pub struct Pool<T> {
    name: &'static str,
    size: usize,
    queue: Arc<WorkQueue<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Pool<T>
where
    T: Send + 'static,
{
    /// Spawn `size` tasks running `handler` on every popped item.
    ///
    /// A panicking handler is logged and counted, the task keeps going.
    pub fn start<F, Fut>(name: &'static str, size: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = Arc::new(WorkQueue::new());
        let handler = Arc::new(handler);

        let handles = (0..size)
            .map(|index| {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    while let Some(item) = queue.pop().await {
                        let result = AssertUnwindSafe(handler(item)).catch_unwind().await;
                        if let Err(panic_info) = result {
                            error!(
                                pool = name,
                                task = index,
                                "recovered from panic: {}",
                                panic_message(panic_info.as_ref())
                            );
                            PANICS_RECOVERED.inc();
                        }
                    }
                    debug!(pool = name, task = index, "queue closed, task exiting");
                })
            })
            .collect();

        Self {
            name,
            size,
            queue,
            handles: Mutex::new(handles),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `false` once the pool is stopped
    pub fn push(&self, item: T) -> bool {
        self.queue.push(item)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            idle: self.queue.idle(),
            depth: self.queue.depth(),
        }
    }

    /// Close the queue and wait for every task to drain it
    pub async fn stop(&self) {
        self.queue.close();

        let handles = self
            .handles
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = self.name, "task failed: {e}");
            }
        }
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(message) = panic_info.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic_info.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
