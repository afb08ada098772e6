//! MQTT broker session, edge publisher and subscriber plumbing
//!
//! ## Overview
//!
//! Both processes talk to the broker through `rumqttc`, whose event loop
//! must be polled continuously to keep the connection alive. The polling
//! loop is the connection-management task: it reconnects after errors and
//! turns raw notifications into [`SessionEvent`]s.
//!
//! ```text
//!            ┌──────────────┐  observe   ┌──────────────┐  dispatch   ┌────────────────┐
//! rumqttc ──▶│ notification │──────────▶│ SessionState │───────────▶│ SessionHandler │
//!            └──────────────┘            └──────────────┘             └────────────────┘
//!                                         connected, reconnects        on_connect → topics
//!                                                                      on_message / on_ack
//! ```
//!
//! All handler state lives in the handler value passed to the driver, so
//! reconnect behaviour can be driven with synthetic notification sequences
//! in tests. Two drivers exist: [`drive_blocking`] for the edge node's
//! dedicated thread over `Connection::iter()`, and [`drive_async`] for the
//! relay's tokio task over an `EventLoop`.
//!
//! ## Publish Acknowledgement
//!
//! The edge publishes at QoS 1. [`MqttPublisher::publish`] waits until the
//! session reports the outgoing packet id and then its `PubAck`, bounded by
//! the publish timeout. Publishing while the session is down fails fast
//! with [`PublishError::NotConnected`]; the caller never retries.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ripeline_core::config::BrokerConfig;
use ripeline_core::ClassificationEvent;
use rumqttc::{
    AsyncClient, Client, ClientError, ConnectReturnCode, Connection, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS,
};
use thiserror::Error;

use crate::ConnectionStats;

/// Request channel capacity between client handles and the event loop
pub const CHANNEL_CAPACITY: usize = 10;

/// Edge-side publish failures
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no broker acknowledgement within {0:?}")]
    AckTimeout(Duration),
}

/// Client options for a broker config
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    options
}

/// What one broker notification means for the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected { reconnected: bool },
    /// Broker rejected the connection
    Refused(String),
    /// Connection error; the next poll attempts a reconnect
    Down { reason: String, was_connected: bool },
    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// Outgoing publish written with this packet id
    Sent(u16),
    /// Broker acknowledged this packet id
    Acked(u16),
    Other,
}

/// Connection bookkeeping for one broker session
#[derive(Debug, Default)]
pub struct SessionState {
    connected: bool,
    connects: u32,
    last_error: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one notification into the session and classify it
    pub fn observe(&mut self, notification: Result<Event, ConnectionError>) -> SessionEvent {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                self.connected = true;
                self.connects += 1;
                SessionEvent::Connected {
                    reconnected: self.connects > 1,
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                self.connected = false;
                let reason = format!("{:?}", ack.code);
                self.last_error = Some(reason.clone());
                SessionEvent::Refused(reason)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => SessionEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::PubAck(ack))) => SessionEvent::Acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => SessionEvent::Sent(pkid),
            Ok(_) => SessionEvent::Other,
            Err(ConnectionError::ConnectionRefused(code)) => {
                self.connected = false;
                let reason = format!("{code:?}");
                self.last_error = Some(reason.clone());
                SessionEvent::Refused(reason)
            }
            Err(e) => {
                let was_connected = std::mem::replace(&mut self.connected, false);
                let reason = e.to_string();
                self.last_error = Some(reason.clone());
                SessionEvent::Down { reason, was_connected }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Successful connects after the first
    pub fn reconnections(&self) -> u32 {
        self.connects.saturating_sub(1)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Callbacks for a blocking session driver
pub trait SessionHandler {
    /// Connection (re)established; returns the topics to subscribe
    fn on_connect(&mut self, reconnected: bool) -> Vec<String>;

    fn on_disconnect(&mut self, _reason: &str) {}

    fn on_message(&mut self, _topic: &str, _payload: &[u8]) {}

    fn on_sent(&mut self, _pkid: u16) {}

    fn on_ack(&mut self, _pkid: u16) {}
}

/// Callbacks for the async session driver
#[async_trait::async_trait]
pub trait AsyncSessionHandler: Send {
    /// Connection (re)established; returns the topics to subscribe
    fn on_connect(&mut self, reconnected: bool) -> Vec<String>;

    fn on_disconnect(&mut self, _reason: &str) {}

    /// Awaited before the next notification is polled
    async fn on_message(&mut self, topic: &str, payload: &[u8]);
}

/// Issues subscribe requests without waiting for the event loop
pub trait TopicSubscriber {
    fn request_subscription(&self, topic: &str) -> Result<(), ClientError>;
}

impl TopicSubscriber for Client {
    fn request_subscription(&self, topic: &str) -> Result<(), ClientError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
    }
}

impl TopicSubscriber for AsyncClient {
    fn request_subscription(&self, topic: &str) -> Result<(), ClientError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
    }
}

fn resubscribe<S: TopicSubscriber + ?Sized>(subscriber: &S, topics: &[String]) {
    for topic in topics {
        match subscriber.request_subscription(topic) {
            Ok(()) => log::info!("subscribed to topic: {topic}"),
            Err(e) => log::error!("failed to subscribe to {topic}: {e}"),
        }
    }
}

/// Poll a blocking notification stream until it ends or shutdown is set
///
/// The stream is usually `connection.iter()`, which reconnects on the poll
/// after an error and ends once every client handle is dropped.
pub fn drive_blocking<I, H, S>(
    notifications: I,
    session: &mut SessionState,
    handler: &mut H,
    subscriber: &S,
    reconnect_delay: Duration,
    shutdown: &AtomicBool,
) where
    I: IntoIterator<Item = Result<Event, ConnectionError>>,
    H: SessionHandler,
    S: TopicSubscriber + ?Sized,
{
    for notification in notifications {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match session.observe(notification) {
            SessionEvent::Connected { reconnected } => {
                log::info!("connected to MQTT broker");
                let topics = handler.on_connect(reconnected);
                resubscribe(subscriber, &topics);
            }
            SessionEvent::Refused(reason) => {
                log::error!("broker refused connection: {reason}");
                pause(reconnect_delay);
            }
            SessionEvent::Down { reason, was_connected } => {
                if was_connected {
                    log::warn!("disconnected from MQTT broker: {reason}");
                    handler.on_disconnect(&reason);
                } else {
                    log::debug!("broker connect attempt failed: {reason}");
                }
                pause(reconnect_delay);
            }
            SessionEvent::Message { topic, payload } => handler.on_message(&topic, &payload),
            SessionEvent::Sent(pkid) => handler.on_sent(pkid),
            SessionEvent::Acked(pkid) => handler.on_ack(pkid),
            SessionEvent::Other => {}
        }
    }
    log::info!("broker session loop stopped");
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Async source of broker notifications
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<Event, ConnectionError>;
}

#[async_trait::async_trait]
impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }
}

/// Poll an async notification source until shutdown or until every client
/// handle is gone
///
/// Message handling is awaited inline, so messages are processed strictly
/// in delivery order and a slow handler delays later deliveries.
pub async fn drive_async<E, H, S, F>(
    source: &mut E,
    session: &mut SessionState,
    handler: &mut H,
    subscriber: &S,
    reconnect_delay: Duration,
    shutdown: F,
) where
    E: EventSource + ?Sized,
    H: AsyncSessionHandler + ?Sized,
    S: TopicSubscriber + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let notification = tokio::select! {
            _ = &mut shutdown => {
                log::info!("shutdown requested");
                break;
            }
            notification = source.next_event() => notification,
        };
        if matches!(notification, Err(ConnectionError::RequestsDone)) {
            break;
        }

        match session.observe(notification) {
            SessionEvent::Connected { reconnected } => {
                log::info!("connected to MQTT broker");
                let topics = handler.on_connect(reconnected);
                resubscribe(subscriber, &topics);
            }
            SessionEvent::Refused(reason) => {
                log::error!("broker refused connection: {reason}");
                tokio::time::sleep(reconnect_delay).await;
            }
            SessionEvent::Down { reason, was_connected } => {
                if was_connected {
                    log::warn!("disconnected from MQTT broker: {reason}");
                    handler.on_disconnect(&reason);
                } else {
                    log::debug!("broker connect attempt failed: {reason}");
                }
                tokio::time::sleep(reconnect_delay).await;
            }
            SessionEvent::Message { topic, payload } => handler.on_message(&topic, &payload).await,
            SessionEvent::Sent(_) | SessionEvent::Acked(_) | SessionEvent::Other => {}
        }
    }
    log::info!("broker session loop stopped");
}

/// Async client and event loop for a broker config
pub fn connect_async(config: &BrokerConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(config), CHANNEL_CAPACITY)
}

/// Publisher-side view of the delivery pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(u16),
    Acked(u16),
    Lost(String),
}

/// Connection status shared between the session thread and the publisher
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    reconnections: AtomicU32,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnections(&self) -> u32 {
        self.reconnections.load(Ordering::SeqCst)
    }
}

/// Session handler feeding an [`MqttPublisher`]
pub struct PublisherLink {
    status: Arc<LinkStatus>,
    deliveries: Sender<Delivery>,
}

impl SessionHandler for PublisherLink {
    fn on_connect(&mut self, reconnected: bool) -> Vec<String> {
        if reconnected {
            self.status.reconnections.fetch_add(1, Ordering::SeqCst);
            log::info!("publisher link restored");
        }
        self.status.connected.store(true, Ordering::SeqCst);
        Vec::new()
    }

    fn on_disconnect(&mut self, reason: &str) {
        self.status.connected.store(false, Ordering::SeqCst);
        let _ = self.deliveries.send(Delivery::Lost(reason.to_owned()));
    }

    fn on_sent(&mut self, pkid: u16) {
        let _ = self.deliveries.send(Delivery::Sent(pkid));
    }

    fn on_ack(&mut self, pkid: u16) {
        let _ = self.deliveries.send(Delivery::Acked(pkid));
    }
}

/// Hands payloads to the broker client's request queue
pub trait PublishTransport {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    fn close(&self) -> Result<(), PublishError>;
}

impl PublishTransport for Client {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    fn close(&self) -> Result<(), PublishError> {
        self.try_disconnect()
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Edge event publisher
pub struct MqttPublisher<T: PublishTransport> {
    transport: T,
    topic: String,
    ack_timeout: Duration,
    status: Arc<LinkStatus>,
    deliveries: Receiver<Delivery>,
    /// Enqueued publishes whose `Sent` has not been seen yet
    unsent: usize,
    /// Packet ids of publishes that gave up waiting
    stale: HashSet<u16>,
    stats: ConnectionStats,
}

impl<T: PublishTransport> MqttPublisher<T> {
    /// Build a publisher and the session handler that feeds it
    pub fn new(transport: T, topic: impl Into<String>, ack_timeout: Duration) -> (Self, PublisherLink) {
        let status = Arc::new(LinkStatus::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let publisher = Self {
            transport,
            topic: topic.into(),
            ack_timeout,
            status: Arc::clone(&status),
            deliveries: rx,
            unsent: 0,
            stale: HashSet::new(),
            stats: ConnectionStats::default(),
        };
        (publisher, PublisherLink { status, deliveries: tx })
    }

    /// Publish an event; `false` on any failure, which is logged
    pub fn publish(&mut self, event: &ClassificationEvent) -> bool {
        match self.try_publish(event) {
            Ok(()) => {
                log::info!("published {} to {}", event.event_id, self.topic);
                true
            }
            Err(e) => {
                log::error!("failed to publish {}: {e}", event.event_id);
                false
            }
        }
    }

    pub fn try_publish(&mut self, event: &ClassificationEvent) -> Result<(), PublishError> {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_failure(&e);
                return Err(e.into());
            }
        };
        let topic = self.topic.clone();
        self.send_to(&topic, payload)
    }

    fn send_to(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let len = payload.len();
        let result = self.deliver(topic, payload);
        match &result {
            Ok(()) => self.stats.record_success(len),
            Err(e) => self.stats.record_failure(e),
        }
        result
    }

    fn deliver(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.status.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.settle_stale();

        self.transport.enqueue(topic, payload)?;
        self.unsent += 1;
        self.await_ack()
    }

    /// Account for deliveries that belong to earlier timed-out publishes
    fn settle_stale(&mut self) {
        while let Ok(delivery) = self.deliveries.try_recv() {
            match delivery {
                Delivery::Sent(id) => self.mark_stale(id),
                Delivery::Acked(id) => {
                    self.stale.remove(&id);
                }
                Delivery::Lost(_) => {}
            }
        }
    }

    fn mark_stale(&mut self, id: u16) {
        if self.stale.insert(id) {
            self.unsent = self.unsent.saturating_sub(1);
        }
    }

    /// Wait for this publish's `Sent` and the matching `PubAck`
    ///
    /// The request queue is FIFO, so while older publishes are still unsent
    /// the next `Sent` ids belong to them, not to this one.
    fn await_ack(&mut self) -> Result<(), PublishError> {
        let deadline = Instant::now() + self.ack_timeout;
        let mut pkid = None;

        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.deliveries.recv_timeout(remaining) {
                Ok(Delivery::Sent(id)) if pkid.is_none() && !self.stale.contains(&id) => {
                    if self.unsent > 1 {
                        self.mark_stale(id);
                    } else {
                        self.unsent = 0;
                        pkid = Some(id);
                    }
                }
                Ok(Delivery::Acked(id)) if pkid == Some(id) => break Ok(()),
                Ok(Delivery::Acked(id)) => {
                    self.stale.remove(&id);
                }
                Ok(Delivery::Sent(_)) => {}
                Ok(Delivery::Lost(reason)) => break Err(PublishError::Transport(reason)),
                Err(RecvTimeoutError::Timeout) => break Err(PublishError::AckTimeout(self.ack_timeout)),
                Err(RecvTimeoutError::Disconnected) => break Err(PublishError::NotConnected),
            }
        };

        if result.is_err() {
            if let Some(id) = pkid {
                self.stale.insert(id);
            }
        }
        result
    }

    /// Block until the session reports a connection, up to `timeout`
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.status.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            reconnections: self.status.reconnections(),
            ..self.stats.clone()
        }
    }

    /// Ask the broker client to disconnect
    pub fn disconnect(&mut self) {
        if let Err(e) = self.transport.close() {
            log::warn!("broker disconnect failed: {e}");
        }
    }
}

/// Blocking client, publisher and its session handler for a broker config
///
/// The returned [`Connection`] must be driven (see [`drive_blocking`]) on a
/// dedicated thread; the `Client` clone is for [`TopicSubscriber`] use there.
pub fn connect_publisher(config: &BrokerConfig) -> (MqttPublisher<Client>, PublisherLink, Client, Connection) {
    let (client, connection) = Client::new(mqtt_options(config), CHANNEL_CAPACITY);
    let session_client = client.clone();
    let (publisher, link) = MqttPublisher::new(client, &config.topic, config.publish_timeout);
    (publisher, link, session_client, connection)
}
