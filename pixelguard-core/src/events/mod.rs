//! ## pixelguard-core::events
//! **Bounded FIFO queues between pipeline stages**
//!
//! Each stage of the pipeline reads from exactly one inbound queue. Queues are
//! bounded (backpressure instead of unbounded growth) and every read takes a
//! timeout so a worker can observe the shutdown flag promptly.
//!
//! The queue is a thin layer over `tokio::sync::mpsc` that adds a shared depth
//! counter for the status surface.

pub mod change;

pub use change::{is_significant_line, significant_lines, ChangeEvent};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

/// Event queue error conditions.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Event queue capacity exceeded")]
    QueueFull,
    #[error("Event queue closed")]
    Closed,
    #[error("Invalid capacity (must be a power of two)")]
    InvalidCapacity,
}

/// Result of a bounded-wait read.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    Timeout,
    Closed,
}

/// Producer half. Cloneable; one clone per producing task.
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

/// Consumer half. A queue has exactly one consumer, which keeps FIFO order.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

/// Handle for reading the depth of a queue without owning either end.
#[derive(Clone, Debug)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Creates a bounded queue.
///
/// # Arguments
///
/// * `capacity` - Must be a power of two, matching the sizing rules of the config layer.
pub fn bounded<T>(capacity: usize) -> Result<(QueueSender<T>, QueueReceiver<T>), EventError> {
    if !capacity.is_power_of_two() {
        return Err(EventError::InvalidCapacity);
    }
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    Ok((
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver { rx, depth },
    ))
}

impl<T> QueueSender<T> {
    /// Enqueues without waiting.
    pub fn try_send(&self, item: T) -> Result<(), EventError> {
        // Counted before the hand-off so a fast consumer never observes a negative depth.
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.try_send(item).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => EventError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => EventError::Closed,
            }
        })
    }

    /// Enqueues, waiting for capacity. Fails only when the consumer is gone.
    pub async fn send(&self, item: T) -> Result<(), EventError> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(item).await.map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            EventError::Closed
        })
    }

    /// Enqueues, waiting at most `wait` for capacity.
    pub async fn send_timeout(&self, item: T, wait: Duration) -> Result<(), EventError> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send_timeout(item, wait).await.map_err(|e| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            match e {
                mpsc::error::SendTimeoutError::Timeout(_) => EventError::QueueFull,
                mpsc::error::SendTimeoutError::Closed(_) => EventError::Closed,
            }
        })
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.depth))
    }
}

impl<T> QueueReceiver<T> {
    /// Waits up to `wait` for the next item.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Recv<T> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(item)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Recv::Item(item)
            }
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    /// Takes the next item if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(item)
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.depth))
    }
}
