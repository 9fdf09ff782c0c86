// Stream fan-out: replicates every dispatched power event to all registered clients
//
// The registry is the only shared mutable state in the relay. Registration,
// removal and delivery all go through the same lock, so a client is never
// delivered to while it is being removed.
use crate::event::PowerEvent;
use crate::queue::QueueReceiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opaque bookkeeping id, never exposed outside the relay
pub type SubscriptionId = u64;

/// Delivery to one client failed; the client is considered gone
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Something that can accept power events on behalf of one client.
///
/// `deliver` is called with the registry lock held and must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: PowerEvent) -> Result<(), SinkError>;
}

/// Default sink backing a [`Subscription`]
struct ChannelSink(mpsc::UnboundedSender<PowerEvent>);

impl EventSink for ChannelSink {
    fn deliver(&self, event: PowerEvent) -> Result<(), SinkError> {
        self.0.send(event).map_err(|_| SinkError::Disconnected)
    }
}

struct Registered {
    id: SubscriptionId,
    sink: Box<dyn EventSink>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    // Registration order is delivery order
    entries: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

impl Registry {
    fn insert(&self, sink: Box<dyn EventSink>, alive: Arc<AtomicBool>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Registered { id, sink, alive });
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(idx) => {
                let entry = entries.remove(idx);
                entry.alive.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Outcome of replicating one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Fan-out registry and dispatcher
#[derive(Clone, Default)]
pub struct StreamFanout {
    registry: Arc<Registry>,
}

impl StreamFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client. It only sees events dispatched after this call.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let id = self
            .registry
            .insert(Box::new(ChannelSink(tx)), alive.clone());
        info!(target: "fanout", subscription_id = id, "Client subscribed");
        Subscription {
            id,
            rx,
            alive,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a caller-provided sink
    pub fn subscribe_sink<S: EventSink + 'static>(&self, sink: S) -> SubscriptionId {
        let id = self
            .registry
            .insert(Box::new(sink), Arc::new(AtomicBool::new(true)));
        info!(target: "fanout", subscription_id = id, "Sink subscribed");
        id
    }

    /// Remove a client. Returns whether it was still registered; repeated calls are no-ops.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            info!(target: "fanout", subscription_id = id, "Client unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.entries.lock().len()
    }

    /// Deliver one event to every registered client in registration order.
    /// Clients whose sink fails are removed; the rest still get the event.
    pub fn dispatch(&self, event: &PowerEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut entries = self.registry.entries.lock();
        entries.retain(|entry| match entry.sink.deliver(event.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(e) => {
                entry.alive.store(false, Ordering::SeqCst);
                report.dropped += 1;
                warn!(target: "fanout", subscription_id = entry.id, error = %e, "Dropping client after failed delivery");
                false
            }
        });
        debug!(
            target: "fanout",
            state = %event.state(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Event dispatched"
        );
        report
    }

    /// Dispatch loop: runs until the queue is closed and drained
    pub async fn run(self, mut queue: QueueReceiver) {
        info!(target: "fanout", "Dispatch loop started");
        while let Some(event) = queue.dequeue().await {
            self.dispatch(&event);
        }
        info!(target: "fanout", "Dispatch queue drained, loop stopped");
    }

    /// Drop every registration so each client's stream ends
    pub fn close_all(&self) -> usize {
        let drained: Vec<Registered> = self.registry.entries.lock().drain(..).collect();
        for entry in &drained {
            entry.alive.store(false, Ordering::SeqCst);
        }
        if !drained.is_empty() {
            info!(target: "fanout", count = drained.len(), "Closed all client subscriptions");
        }
        drained.len()
    }
}

/// One live client stream. Dropping it unregisters the client.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<PowerEvent>,
    alive: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next delivered event; `None` once the fan-out has let go of this client
    pub async fn recv(&mut self) -> Option<PowerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PowerEvent> {
        self.rx.try_recv().ok()
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(target: "fanout", subscription_id = self.id, "Subscription dropped");
            }
        }
    }
}
