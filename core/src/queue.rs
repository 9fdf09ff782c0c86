// Dispatch queue between the broker subscriber and the fan-out loop
//
// Backpressure policy: the queue is unbounded. The producer (broker receive
// loop) never blocks and never drops; memory is the only bound. Queue depth is
// exported through `depth()` so operators can watch it from outside.
use crate::event::PowerEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Enqueue failed because the consumer side is gone
#[derive(Debug, thiserror::Error)]
#[error("dispatch queue closed")]
pub struct QueueClosed(pub PowerEvent);

/// Create a connected producer/consumer pair
pub fn dispatch_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: depth.clone(),
        },
        QueueReceiver { rx, depth },
    )
}

/// Producer half. Cloning is allowed but the relay keeps a single producer.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<PowerEvent>,
    depth: Arc<AtomicUsize>,
}

impl QueueSender {
    /// Non-blocking enqueue
    pub fn enqueue(&self, event: PowerEvent) -> Result<(), QueueClosed> {
        // Count before sending so the consumer can never observe a negative depth
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(event).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            QueueClosed(e.0)
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Shared depth gauge for probes
    pub fn depth_gauge(&self) -> QueueDepth {
        QueueDepth(self.depth.clone())
    }
}

/// Consumer half, owned by the fan-out loop
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<PowerEvent>,
    depth: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Next event in FIFO order. `None` once the queue is closed and drained.
    pub async fn dequeue(&mut self) -> Option<PowerEvent> {
        let event = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(event)
    }

    /// Refuse further enqueues; already queued events are still delivered.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Read-only view of the current queue depth
#[derive(Clone, Debug)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
