// Broker subscriber: one MQTT connection, one topic, for the life of the process
//
// The receive loop only decodes and enqueues. It never touches clients, so a
// slow stream can not stall broker I/O.
use crate::config::BrokerConfig;
use crate::event::{self, DecodeError, PowerEvent, PowerState};
use crate::queue::{QueueClosed, QueueSender};
use crate::{RelayError, Result};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queryable broker liveness. False whenever the subscription is not known to be live.
#[derive(Clone, Debug, Default)]
pub struct BrokerLiveness(Arc<AtomicBool>);

impl BrokerLiveness {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, connected: bool) -> bool {
        self.0.swap(connected, Ordering::SeqCst)
    }
}

/// Why a single broker message did not make it into the queue
#[derive(Error, Debug)]
pub enum MessageError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// Decode one broker payload and hand it to the dispatch queue.
/// Never blocks.
pub fn handle_payload(payload: &[u8], queue: &QueueSender) -> std::result::Result<PowerEvent, MessageError> {
    let event = event::decode(payload)?;
    queue.enqueue(event.clone())?;
    Ok(event)
}

/// Running subscriber
pub struct BrokerSubscriber {
    client: AsyncClient,
    liveness: BrokerLiveness,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BrokerSubscriber {
    /// Connect and subscribe. Fails if the broker does not accept the
    /// connection within `connect_timeout`; the caller should treat that as fatal.
    pub async fn connect(config: &BrokerConfig, queue: QueueSender) -> Result<Self> {
        let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
        opts.set_keep_alive(config.keep_alive);
        opts.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(opts, config.channel_capacity);

        info!(
            target: "broker",
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );

        let addr = format!("{}:{}", config.host, config.port);
        // CONNACK and SUBACK share one startup deadline
        let deadline = tokio::time::Instant::now() + config.connect_timeout;
        let timed_out = || RelayError::BrokerTimeout {
            addr: addr.clone(),
            timeout: config.connect_timeout,
        };

        tokio::time::timeout_at(deadline, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| RelayError::BrokerConnect(format!("{addr}: {e}")))?;
        info!(target: "broker", host = %config.host, port = config.port, "Connected to MQTT broker");

        client
            .subscribe(config.topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| RelayError::BrokerConnect(e.to_string()))?;

        let suback = tokio::time::timeout_at(deadline, wait_for_suback(&mut event_loop, &queue))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| RelayError::BrokerConnect(format!("{addr}: {e}")))?;
        if !subscription_granted(&suback) {
            return Err(RelayError::BrokerConnect(format!(
                "{addr}: subscription to {:?} refused: {:?}",
                config.topic, suback.return_codes
            )));
        }
        info!(target: "broker", topic = %config.topic, "Subscribed to power event topic");

        let liveness = BrokerLiveness::new(true);
        let cancel = CancellationToken::new();

        let receive_loop = ReceiveLoop {
            client: client.clone(),
            topic: config.topic.clone(),
            reconnect_delay: config.reconnect_delay,
            liveness: liveness.clone(),
            queue,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(receive_loop.run(event_loop));

        Ok(Self {
            client,
            liveness,
            cancel,
            task,
        })
    }

    pub fn liveness(&self) -> BrokerLiveness {
        self.liveness.clone()
    }

    /// Stop the receive loop and disconnect. Dropping the loop also drops its
    /// queue producer, which lets the dispatch loop drain and finish.
    pub async fn shutdown(self) {
        info!(target: "broker", "Disconnecting from MQTT broker");
        if let Err(e) = self.client.try_disconnect() {
            debug!(target: "broker", error = %e, "Disconnect request not queued");
        }
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(target: "broker", error = %e, "Receive loop panicked");
        }
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

// Publishes racing ahead of the SUBACK are still relayed
async fn wait_for_suback(
    event_loop: &mut EventLoop,
    queue: &QueueSender,
) -> std::result::Result<SubAck, ConnectionError> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::SubAck(ack)) => return Ok(ack),
            Event::Incoming(Packet::Publish(publish)) => {
                if let Err(e) = handle_payload(&publish.payload, queue) {
                    warn!(target: "broker", error = %e, "Dropping message received before SUBACK");
                }
            }
            _ => {}
        }
    }
}

/// True when the broker granted every requested filter
pub fn subscription_granted(ack: &SubAck) -> bool {
    !ack.return_codes.is_empty()
        && ack
            .return_codes
            .iter()
            .all(|code| !matches!(code, SubscribeReasonCode::Failure))
}

/// Drive the event loop until the queued DISCONNECT has gone out, or 200ms pass
async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flushed = tokio::time::timeout(std::time::Duration::from_millis(200), async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!(target: "broker", error = %e, "Connection closed while flushing DISCONNECT");
                    return false;
                }
            }
        }
    })
    .await;
    if !matches!(flushed, Ok(true)) {
        debug!(target: "broker", "DISCONNECT not confirmed before shutdown");
    }
}

struct ReceiveLoop {
    client: AsyncClient,
    topic: String,
    reconnect_delay: std::time::Duration,
    liveness: BrokerLiveness,
    queue: QueueSender,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(self, mut event_loop: EventLoop) {
        info!(target: "broker", topic = %self.topic, "Receive loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = event_loop.poll() => {
                    match polled {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.on_publish(&publish.topic, &publish.payload);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            // Clean sessions lose subscriptions on reconnect; live again only after SUBACK
                            info!(target: "broker", topic = %self.topic, "Reconnected to MQTT broker, resubscribing");
                            if let Err(e) = self.client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce) {
                                warn!(target: "broker", error = %e, "Resubscribe request failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::SubAck(ack))) => {
                            if subscription_granted(&ack) {
                                if !self.liveness.set(true) {
                                    info!(target: "broker", topic = %self.topic, "Subscription restored");
                                }
                            } else {
                                self.liveness.set(false);
                                error!(
                                    target: "broker",
                                    topic = %self.topic,
                                    return_codes = ?ack.return_codes,
                                    "Broker refused subscription"
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if self.liveness.set(false) {
                                warn!(target: "broker", error = %e, "MQTT connection lost");
                            } else {
                                debug!(target: "broker", error = %e, "MQTT reconnect attempt failed");
                            }
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                }
            }
        }
        self.liveness.set(false);
        if self.cancel.is_cancelled() {
            flush_disconnect(&mut event_loop).await;
        }
        info!(target: "broker", "Receive loop stopped");
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        debug!(target: "broker", topic = %topic, payload = %event::preview(payload), "MQTT message received");
        match handle_payload(payload, &self.queue) {
            Ok(event) => {
                if event.state() == PowerState::Unknown {
                    debug!(target: "broker", payload = %event::preview(payload), "Unrecognised power state relayed as Unknown");
                }
                debug!(target: "broker", state = %event.state(), time_generated = %event.time_generated(), "Power event enqueued");
            }
            Err(MessageError::Decode(e)) => {
                warn!(target: "broker", error = %e, payload = %event::preview(payload), "Dropping undecodable message");
            }
            Err(MessageError::QueueClosed(_)) => {
                debug!(target: "broker", "Dispatch queue closed; message discarded");
            }
        }
    }
}
