// Powerwatch Core Library
// Relays host power-state events from an MQTT topic to any number of live stream clients

pub mod broker;
pub mod config;
pub mod event;
pub mod fanout;
pub mod queue;
pub mod telemetry;

// Export core types
pub use broker::{BrokerLiveness, BrokerSubscriber};
pub use config::{BrokerConfig, HttpConfig, RelayConfig};
pub use event::{DecodeError, PowerEvent, PowerState};
pub use fanout::{DispatchReport, EventSink, SinkError, StreamFanout, Subscription};
pub use queue::{dispatch_queue, QueueDepth, QueueReceiver, QueueSender};

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

// Error types
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Broker connection failed: {0}")]
    BrokerConnect(String),

    #[error("Broker at {addr} did not accept the connection within {timeout:?}")]
    BrokerTimeout { addr: String, timeout: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, RelayError>;

/// Point-in-time view of relay health
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub broker_connected: bool,
    pub subscribers: usize,
    pub queue_depth: usize,
}

/// Cheap, cloneable access to a running relay for request handlers
#[derive(Clone)]
pub struct RelayHandle {
    pub fanout: StreamFanout,
    pub liveness: BrokerLiveness,
    pub queue_depth: QueueDepth,
}

impl RelayHandle {
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            broker_connected: self.liveness.is_connected(),
            subscribers: self.fanout.subscriber_count(),
            queue_depth: self.queue_depth.get(),
        }
    }
}

/// Core runtime: broker receive loop + dispatch loop
pub struct PowerRelay {
    handle: RelayHandle,
    broker: BrokerSubscriber,
    dispatcher: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl PowerRelay {
    /// Connect to the broker and start dispatching. A broker that is not
    /// reachable within the configured timeout is an error, not a retry.
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        tracing::info!(target: "relay", topic = %config.broker.topic, "Starting power relay...");
        config.validate()?;

        let (producer, consumer) = dispatch_queue();
        let queue_depth = producer.depth_gauge();
        let broker = BrokerSubscriber::connect(&config.broker, producer).await?;

        let fanout = StreamFanout::new();
        let dispatcher = tokio::spawn(fanout.clone().run(consumer));

        tracing::info!(target: "relay", "Power relay started successfully");
        Ok(Self {
            handle: RelayHandle {
                fanout,
                liveness: broker.liveness(),
                queue_depth,
            },
            broker,
            dispatcher,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn fanout(&self) -> &StreamFanout {
        &self.handle.fanout
    }

    pub fn liveness(&self) -> BrokerLiveness {
        self.handle.liveness.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.handle.queue_depth.get()
    }

    /// Disconnect from the broker, drain the queue, then end every client
    /// stream. Bounded by `shutdown_grace`.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(target: "relay", "Shutting down power relay...");
        let Self {
            handle,
            broker,
            dispatcher,
            shutdown_grace,
        } = self;

        let abort = dispatcher.abort_handle();
        let drained = tokio::time::timeout(shutdown_grace, async move {
            // Stopping the broker drops the only queue producer
            broker.shutdown().await;
            let _ = dispatcher.await;
        })
        .await;

        handle.fanout.close_all();

        match drained {
            Ok(()) => {
                tracing::info!(target: "relay", "Power relay shut down successfully");
                Ok(())
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    target: "relay",
                    pending = handle.queue_depth.get(),
                    "Shutdown grace period elapsed before the queue drained"
                );
                Err(RelayError::ShutdownTimeout(shutdown_grace))
            }
        }
    }
}
