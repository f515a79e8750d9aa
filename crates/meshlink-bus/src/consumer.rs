//! Address-filtered packet consumer with confirm-on-send.
//!
//! A [`PacketConsumer`] owns one exclusive broker-named queue bound to the
//! raw-frame exchange for each address it subscribes to. Frames arriving on
//! that queue go to a [`PacketHandler`]; replies to its own transmit
//! requests arrive on the same queue and wake the caller waiting in
//! [`send_data_and_confirm`](PacketConsumer::send_data_and_confirm).
//!
//! Two tasks run per consumer. The delivery task decodes every message and
//! resolves pending requests; frames for the handler are queued to a second
//! task that calls the handler one frame at a time. A handler that blocks
//! on a confirm-on-send call therefore never stalls the delivery of its own
//! reply.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshlink_bus::{AmqpBus, PacketConsumer};
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let bus = Arc::new(AmqpBus::connect("amqp://localhost").await?);
//! let node = "00:13:a2:00:40:32:dc:dc".parse().unwrap();
//! let consumer = PacketConsumer::builder().address(node).build(bus).await?;
//! let confirmation = consumer.send_data_and_confirm(node, b"R".to_vec()).await?;
//! println!("delivered after {} retries", confirmation.retries);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use meshlink_core::address::Address;
use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{AtCommand, Command, DeliveryStatus, Frame};
use meshlink_core::link::RadioLink;

use crate::bus::{Deliveries, Delivery, MessageBus, MessageProperties, DEFAULT_EXCHANGE};
use crate::frame_id::next_frame_id;
use crate::pending::PendingTable;
use crate::routing::{address_binding, parse_address, RAW_EXCHANGE, SENSOR_EXCHANGE, TRANSMIT_QUEUE};
use crate::rpc::TransmitRequest;

/// Default window for a confirm-on-send call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Domain logic for frames received from subscribed nodes.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle one frame from `address`.
    ///
    /// Errors and panics are logged; consumption continues either way. The
    /// default implementation only logs the frame.
    async fn handle_packet(
        &self,
        _consumer: &PacketConsumer,
        address: Address,
        frame: Frame,
    ) -> anyhow::Result<()> {
        debug!(%address, kind = frame.kind(), "received packet");
        Ok(())
    }
}

/// A handler that logs every frame and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl PacketHandler for LoggingHandler {}

/// Successful outcome of [`PacketConsumer::send_data_and_confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    /// Frame id the bridge used for the transmission.
    pub frame_id: u8,
    /// Number of retries the radio needed.
    pub retries: u8,
    /// Delivery status (always success here).
    pub delivery_status: DeliveryStatus,
    /// Route discovery status reported by the radio.
    pub discovery_status: u8,
}

fn tx_confirmation(frame: Frame) -> Result<TxConfirmation> {
    match frame {
        Frame::ZbTxStatus {
            frame_id,
            retries,
            delivery_status,
            discovery_status,
            ..
        } => {
            if delivery_status.is_success() {
                Ok(TxConfirmation {
                    frame_id,
                    retries,
                    delivery_status,
                    discovery_status,
                })
            } else {
                Err(Error::DeliveryFailed {
                    status: delivery_status,
                    retries,
                })
            }
        }
        other => Err(Error::Codec(format!(
            "expected zb_tx_status reply, got {}",
            other.kind()
        ))),
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Nodes this consumer receives frames from and may transmit to.
    pub addresses: Vec<Address>,
    /// How long a confirm-on-send call waits for its reply.
    pub rpc_timeout: Duration,
    /// Topic exchange carrying raw frames.
    pub raw_exchange: String,
    /// Topic exchange for derived data.
    pub sensor_exchange: String,
    /// Queue serviced by the packet bridge.
    pub transmit_queue: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            raw_exchange: RAW_EXCHANGE.to_string(),
            sensor_exchange: SENSOR_EXCHANGE.to_string(),
            transmit_queue: TRANSMIT_QUEUE.to_string(),
        }
    }
}

/// Fluent builder for [`PacketConsumer`].
pub struct PacketConsumerBuilder {
    config: ConsumerConfig,
    link: Option<Arc<dyn RadioLink>>,
    handler: Arc<dyn PacketHandler>,
}

impl Default for PacketConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketConsumerBuilder {
    /// A builder with no addresses, the default topology names, and a
    /// [`LoggingHandler`].
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            link: None,
            handler: Arc::new(LoggingHandler),
        }
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to one node.
    pub fn address(mut self, address: Address) -> Self {
        self.config.addresses.push(address);
        self
    }

    /// Subscribe to several nodes.
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.config.addresses.extend(addresses);
        self
    }

    /// Set the confirm-on-send window (default: 10s).
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    /// Radio link used for remote configuration commands.
    ///
    /// Without one, [`PacketConsumer::send_remote_command_and_confirm`]
    /// fails with [`Error::NotConnected`].
    pub fn link(mut self, link: Arc<dyn RadioLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the handler for received frames.
    pub fn handler(mut self, handler: impl PacketHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Declare the topology, bind the subscribed addresses, and start
    /// consuming.
    pub async fn build(self, bus: Arc<dyn MessageBus>) -> Result<PacketConsumer> {
        PacketConsumer::start(bus, self.link, self.handler, self.config).await
    }
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    link: Option<Arc<dyn RadioLink>>,
    config: ConsumerConfig,
    addresses: HashSet<Address>,
    queue: String,
    data_requests: PendingTable<String, Frame>,
    remote_requests: PendingTable<(Address, u8), Frame>,
    cancel: CancellationToken,
    closing: AtomicBool,
}

/// A running packet consumer. Cheap to clone.
#[derive(Clone)]
pub struct PacketConsumer {
    inner: Arc<Inner>,
}

impl PacketConsumer {
    /// Start building a consumer.
    pub fn builder() -> PacketConsumerBuilder {
        PacketConsumerBuilder::new()
    }

    async fn start(
        bus: Arc<dyn MessageBus>,
        link: Option<Arc<dyn RadioLink>>,
        handler: Arc<dyn PacketHandler>,
        config: ConsumerConfig,
    ) -> Result<Self> {
        bus.declare_exchange(&config.raw_exchange).await?;
        bus.declare_exchange(&config.sensor_exchange).await?;
        let queue = bus.declare_queue("", true).await?;
        for address in &config.addresses {
            bus.bind_queue(&queue, &config.raw_exchange, &address_binding(address))
                .await?;
        }
        let deliveries = bus.consume(&queue).await?;

        info!(queue = %queue, addresses = config.addresses.len(), "packet consumer started");

        let consumer = PacketConsumer {
            inner: Arc::new(Inner {
                addresses: config.addresses.iter().copied().collect(),
                bus,
                link,
                config,
                queue: queue.clone(),
                data_requests: PendingTable::new(),
                remote_requests: PendingTable::new(),
                cancel: CancellationToken::new(),
                closing: AtomicBool::new(false),
            }),
        };

        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("consumer", queue = %queue);
        tokio::spawn(
            consumer
                .clone()
                .delivery_loop(deliveries, packets_tx)
                .instrument(span.clone()),
        );
        tokio::spawn(
            consumer
                .clone()
                .handler_loop(handler, packets_rx)
                .instrument(span),
        );

        Ok(consumer)
    }

    /// Name of this consumer's exclusive queue.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    /// The active configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Whether `address` is one this consumer subscribes to.
    pub fn is_subscribed(&self, address: &Address) -> bool {
        self.inner.addresses.contains(address)
    }

    fn check_destination(&self, dest: Address) -> Result<()> {
        if self.is_subscribed(&dest) {
            Ok(())
        } else {
            Err(Error::InvalidDestination(dest))
        }
    }

    /// Transmit `data` to `dest` through the packet bridge and wait for the
    /// radio's delivery report.
    ///
    /// Fails immediately with [`Error::InvalidDestination`] if `dest` is not
    /// subscribed. Returns [`Error::Timeout`] if no report arrives within
    /// the RPC window and [`Error::DeliveryFailed`] if the radio reports a
    /// failure.
    pub async fn send_data_and_confirm(
        &self,
        dest: Address,
        data: impl Into<Vec<u8>>,
    ) -> Result<TxConfirmation> {
        self.check_destination(dest)?;

        let request = TransmitRequest::send_data(dest, data);
        let body = serde_json::to_vec(&request).map_err(|e| Error::Codec(e.to_string()))?;
        let correlation_id = Uuid::new_v4().to_string();

        let rx = self.inner.data_requests.register(correlation_id.clone())?;
        let properties = MessageProperties::request(self.inner.queue.clone(), correlation_id.clone());
        if let Err(e) = self
            .inner
            .bus
            .publish(DEFAULT_EXCHANGE, &self.inner.config.transmit_queue, properties, &body)
            .await
        {
            self.inner.data_requests.remove(&correlation_id);
            return Err(e);
        }
        debug!(%dest, correlation_id = %correlation_id, "transmit request published");

        let reply = self
            .inner
            .data_requests
            .wait(&correlation_id, rx, self.inner.config.rpc_timeout)
            .await;
        if matches!(reply, Err(Error::Timeout)) {
            warn!(%dest, correlation_id = %correlation_id, "no delivery report within {:?}", self.inner.config.rpc_timeout);
        }
        tx_confirmation(reply?)
    }

    /// Run an AT command on the node at `dest` and return its response
    /// parameter.
    ///
    /// Sent straight to the radio link; the response is matched by frame
    /// id against `remote_at_response` frames from that node.
    pub async fn send_remote_command_and_confirm(
        &self,
        dest: Address,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        self.check_destination(dest)?;
        let link = self.inner.link.as_ref().ok_or(Error::NotConnected)?;

        let frame_id = next_frame_id();
        let key = (dest, frame_id);
        let rx = self.inner.remote_requests.register(key)?;
        if let Err(e) = link
            .send(&Command::remote_at(frame_id, dest, command, parameter))
            .await
        {
            self.inner.remote_requests.remove(&key);
            return Err(e);
        }
        debug!(%dest, %command, frame_id, "remote command sent");

        let response = self
            .inner
            .remote_requests
            .wait(&key, rx, self.inner.config.rpc_timeout)
            .await?;
        match response {
            Frame::RemoteAtResponse {
                status, parameter, ..
            } => {
                if status.is_ok() {
                    Ok(parameter)
                } else {
                    Err(Error::RemoteCommand(status))
                }
            }
            other => Err(Error::Codec(format!(
                "expected remote_at_response, got {}",
                other.kind()
            ))),
        }
    }

    /// Publish a derived reading to the sensor exchange as JSON.
    pub async fn publish_derived_data<T>(&self, routing_key: &str, body: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(body).map_err(|e| Error::Codec(e.to_string()))?;
        self.inner
            .bus
            .publish(
                &self.inner.config.sensor_exchange,
                routing_key,
                MessageProperties::default(),
                &body,
            )
            .await
    }

    /// Stop consuming and close the broker connection.
    ///
    /// Outstanding confirm-on-send calls are not woken; they run out their
    /// timeout. Calling this twice is not an error.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        info!(queue = %self.inner.queue, "packet consumer shutting down");
        self.inner.bus.close().await
    }

    /// Whether the consumer has stopped, by [`shutdown`](Self::shutdown) or
    /// because the broker ended the delivery stream.
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until the consumer has stopped.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    async fn delivery_loop(
        self,
        mut deliveries: Deliveries,
        packets: mpsc::UnboundedSender<(Address, Frame)>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = deliveries.recv() => delivery,
            };
            match delivery {
                Some(delivery) => self.on_delivery(delivery, &packets),
                None => {
                    warn!("delivery stream ended");
                    cancel.cancel();
                    break;
                }
            }
        }
        debug!("delivery loop stopped");
    }

    fn on_delivery(&self, delivery: Delivery, packets: &mpsc::UnboundedSender<(Address, Frame)>) {
        let frame: Frame = match serde_json::from_slice(&delivery.body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, "dropping undecodable message: {}", e);
                return;
            }
        };

        if let Some(correlation_id) = &delivery.properties.correlation_id {
            if delivery.routing_key == self.inner.queue {
                if !self.inner.data_requests.resolve(correlation_id, frame) {
                    warn!(correlation_id = %correlation_id, "reply for unknown or expired request dropped");
                }
                return;
            }
        }

        let Some(address) = parse_address(&delivery.routing_key) else {
            warn!(routing_key = %delivery.routing_key, "no address in routing key");
            return;
        };

        if let Frame::RemoteAtResponse { frame_id, .. } = &frame {
            let key = (address, *frame_id);
            if self.inner.remote_requests.contains(&key)
                && self.inner.remote_requests.resolve(&key, frame.clone())
            {
                return;
            }
        }

        if packets.send((address, frame)).is_err() {
            debug!("handler task gone, dropping packet");
        }
    }

    async fn handler_loop(
        self,
        handler: Arc<dyn PacketHandler>,
        mut packets: mpsc::UnboundedReceiver<(Address, Frame)>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            let (address, frame) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            let kind = frame.kind();
            let outcome = AssertUnwindSafe(handler.handle_packet(&self, address, frame))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%address, kind, "packet handler failed: {:#}", e),
                Err(_) => error!(%address, kind, "packet handler panicked"),
            }
        }
        debug!("handler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use meshlink_core::frame::RemoteCommandStatus;
    use meshlink_test_harness::MockLink;

    use crate::memory::MemoryBroker;
    use crate::routing::raw_routing_key;

    fn node_a() -> Address {
        "00:13:a2:00:40:32:dc:dc".parse().unwrap()
    }

    fn node_b() -> Address {
        "00:13:a2:00:40:32:dc:dd".parse().unwrap()
    }

    fn node_c() -> Address {
        "00:13:a2:00:40:99:00:01".parse().unwrap()
    }

    fn tx_status(frame_id: u8, retries: u8, status: u8) -> Frame {
        Frame::ZbTxStatus {
            frame_id,
            dest_addr: 0xFFFE,
            retries,
            delivery_status: DeliveryStatus::from_byte(status),
            discovery_status: 0,
        }
    }

    fn zb_rx(address: Address, data: &[u8]) -> Frame {
        Frame::ZbRx {
            source_addr_long: address,
            source_addr: 0x1234,
            options: 0x01,
            rf_data: data.to_vec(),
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(Address, Frame)>>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(Address, Frame)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PacketHandler for Recorder {
        async fn handle_packet(
            &self,
            _consumer: &PacketConsumer,
            address: Address,
            frame: Frame,
        ) -> anyhow::Result<()> {
            let payload = match &frame {
                Frame::ZbRx { rf_data, .. } => rf_data.clone(),
                _ => Vec::new(),
            };
            self.seen.lock().unwrap().push((address, frame));
            match payload.as_slice() {
                b"fail" => anyhow::bail!("handler rejected packet"),
                b"panic" => panic!("handler blew up"),
                _ => Ok(()),
            }
        }
    }

    /// Stand-in for the packet bridge: answers every transmit request with
    /// `reply(request)` after `delay`.
    async fn spawn_responder<F>(broker: &MemoryBroker, delay: Duration, reply: F)
    where
        F: Fn(&TransmitRequest) -> Frame + Send + 'static,
    {
        let bus = broker.connect();
        bus.declare_queue(TRANSMIT_QUEUE, false).await.unwrap();
        let mut requests = bus.consume(TRANSMIT_QUEUE).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = requests.recv().await {
                let request: TransmitRequest = serde_json::from_slice(&delivery.body).unwrap();
                let frame = reply(&request);
                let reply_to = delivery.properties.reply_to.clone().unwrap();
                let correlation_id = delivery.properties.correlation_id.clone().unwrap();
                let bus = bus.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    bus.publish(
                        DEFAULT_EXCHANGE,
                        &reply_to,
                        MessageProperties::reply(correlation_id),
                        &serde_json::to_vec(&frame).unwrap(),
                    )
                    .await
                    .unwrap();
                });
            }
        });
    }

    async fn consumer_for(broker: &MemoryBroker, handler: Recorder) -> PacketConsumer {
        PacketConsumer::builder()
            .addresses([node_a(), node_b()])
            .handler(handler)
            .build(Arc::new(broker.connect()))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_destination_fails_without_io() {
        let broker = MemoryBroker::new();
        let consumer = consumer_for(&broker, Recorder::default()).await;

        let start = tokio::time::Instant::now();
        let result = consumer.send_data_and_confirm(node_c(), b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::InvalidDestination(a)) if a == node_c()));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(broker.published().is_empty());
        assert!(consumer.inner.data_requests.is_empty());
    }

    #[tokio::test]
    async fn default_handler_accepts_every_frame() {
        let broker = MemoryBroker::new();
        let consumer = consumer_for(&broker, Recorder::default()).await;

        let handler = LoggingHandler;
        for frame in [zb_rx(node_a(), b"#853:0#\r\n"), tx_status(7, 0, 0x00)] {
            handler
                .handle_packet(&consumer, node_a(), frame)
                .await
                .unwrap();
        }
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_returns_retries() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, Duration::from_secs(3), |_| tx_status(7, 2, 0)).await;
        let consumer = consumer_for(&broker, Recorder::default()).await;

        let start = tokio::time::Instant::now();
        let confirmation = consumer
            .send_data_and_confirm(node_a(), b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(confirmation.retries, 2);
        assert_eq!(confirmation.frame_id, 7);
        assert!(confirmation.delivery_status.is_success());
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(consumer.inner.data_requests.is_empty());

        let requests = broker.published_to(DEFAULT_EXCHANGE, TRANSMIT_QUEUE);
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].properties.reply_to.as_deref(),
            Some(consumer.queue_name())
        );
        let request: TransmitRequest = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(request, TransmitRequest::send_data(node_a(), b"payload".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_reply_is_ignored() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, Duration::from_secs(11), |_| tx_status(1, 0, 0)).await;
        let recorder = Recorder::default();
        let consumer = consumer_for(&broker, recorder.clone()).await;

        let start = tokio::time::Instant::now();
        let result = consumer.send_data_and_confirm(node_a(), b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
        assert!(consumer.inner.data_requests.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let replies = broker.published_to(DEFAULT_EXCHANGE, consumer.queue_name());
        assert_eq!(replies.len(), 1);
        assert!(recorder.seen().is_empty());
        assert!(!consumer.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_is_reported() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, Duration::from_millis(50), |_| tx_status(3, 4, 0x21)).await;
        let consumer = consumer_for(&broker, Recorder::default()).await;

        let result = consumer.send_data_and_confirm(node_b(), b"x".to_vec()).await;
        match result {
            Err(Error::DeliveryFailed { status, retries }) => {
                assert_eq!(status, DeliveryStatus::from_byte(0x21));
                assert_eq!(retries, 4);
            }
            other => panic!("expected DeliveryFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replies_match_by_correlation_id() {
        let broker = MemoryBroker::new();
        let consumer = consumer_for(&broker, Recorder::default()).await;

        // Answer in reverse order, after first sending a reply nobody asked for.
        let bridge = broker.connect();
        bridge.declare_queue(TRANSMIT_QUEUE, false).await.unwrap();
        let mut requests = bridge.consume(TRANSMIT_QUEUE).await.unwrap();
        let queue = consumer.queue_name().to_string();
        tokio::spawn(async move {
            let first = requests.recv().await.unwrap();
            let second = requests.recv().await.unwrap();
            let reply = |delivery: &Delivery| {
                let request: TransmitRequest = serde_json::from_slice(&delivery.body).unwrap();
                let TransmitRequest::SendData { data, .. } = request;
                (
                    MessageProperties::reply(delivery.properties.correlation_id.clone().unwrap()),
                    serde_json::to_vec(&tx_status(0, data[0], 0)).unwrap(),
                )
            };
            let stray = serde_json::to_vec(&tx_status(0, 99, 0)).unwrap();
            bridge
                .publish(DEFAULT_EXCHANGE, &queue, MessageProperties::reply("nobody"), &stray)
                .await
                .unwrap();
            for delivery in [second, first] {
                let (properties, body) = reply(&delivery);
                bridge
                    .publish(DEFAULT_EXCHANGE, &queue, properties, &body)
                    .await
                    .unwrap();
            }
        });

        let (one, two) = tokio::join!(
            consumer.send_data_and_confirm(node_a(), vec![1u8]),
            consumer.send_data_and_confirm(node_b(), vec![2u8]),
        );
        assert_eq!(one.unwrap().retries, 1);
        assert_eq!(two.unwrap().retries, 2);
        assert!(consumer.inner.data_requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reach_handler_and_failures_are_isolated() {
        let broker = MemoryBroker::new();
        let recorder = Recorder::default();
        let consumer = consumer_for(&broker, recorder.clone()).await;

        let bridge = broker.connect();
        let frames = [
            (node_a(), zb_rx(node_a(), b"fail")),
            (node_b(), zb_rx(node_b(), b"panic")),
            (node_c(), zb_rx(node_c(), b"not mine")),
            (node_a(), zb_rx(node_a(), b"ok")),
        ];
        for (address, frame) in &frames {
            bridge
                .publish(
                    RAW_EXCHANGE,
                    &raw_routing_key(frame.kind(), address),
                    MessageProperties::default(),
                    &serde_json::to_vec(frame).unwrap(),
                )
                .await
                .unwrap();
        }
        bridge
            .publish(
                RAW_EXCHANGE,
                &raw_routing_key("zb_rx", &node_a()),
                MessageProperties::default(),
                b"not json",
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = recorder.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, node_a());
        assert_eq!(seen[1].0, node_b());
        assert_eq!(seen[2], (node_a(), zb_rx(node_a(), b"ok")));
        assert!(!consumer.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_command_resolves_by_address_and_frame_id() {
        let broker = MemoryBroker::new();
        let link = MockLink::new();
        let recorder = Recorder::default();
        let consumer = PacketConsumer::builder()
            .address(node_a())
            .link(Arc::new(link.clone()))
            .handler(recorder.clone())
            .build(Arc::new(broker.connect()))
            .await
            .unwrap();

        let d0 = AtCommand::new("D0").unwrap();
        let call = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .send_remote_command_and_confirm(node_a(), d0, Some(vec![0x05]))
                    .await
            }
        });

        while link.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let sent = link.sent();
        let frame_id = sent[0].frame_id();
        assert!(matches!(&sent[0], Command::RemoteAt { parameter: Some(p), .. } if p == &vec![0x05]));

        let bridge = broker.connect();
        let response = |frame_id: u8| Frame::RemoteAtResponse {
            frame_id,
            source_addr_long: node_a(),
            source_addr: 0x1234,
            command: d0,
            status: RemoteCommandStatus::Ok,
            parameter: vec![0x05],
        };
        // A response with another frame id is an ordinary packet.
        for id in [frame_id.wrapping_add(1).max(1), frame_id] {
            bridge
                .publish(
                    RAW_EXCHANGE,
                    &raw_routing_key("remote_at_response", &node_a()),
                    MessageProperties::default(),
                    &serde_json::to_vec(&response(id)).unwrap(),
                )
                .await
                .unwrap();
        }

        assert_eq!(call.await.unwrap().unwrap(), vec![0x05]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.seen().len(), 1);
        assert!(consumer.inner.remote_requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_command_failure_status() {
        let broker = MemoryBroker::new();
        let link = MockLink::new();
        let consumer = PacketConsumer::builder()
            .address(node_a())
            .link(Arc::new(link.clone()))
            .build(Arc::new(broker.connect()))
            .await
            .unwrap();

        let call = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .send_remote_command_and_confirm(node_a(), AtCommand::new("XX").unwrap(), None)
                    .await
            }
        });
        while link.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let frame = Frame::RemoteAtResponse {
            frame_id: link.sent()[0].frame_id(),
            source_addr_long: node_a(),
            source_addr: 0,
            command: AtCommand::new("XX").unwrap(),
            status: RemoteCommandStatus::InvalidCommand,
            parameter: Vec::new(),
        };
        broker
            .connect()
            .publish(
                RAW_EXCHANGE,
                &raw_routing_key(frame.kind(), &node_a()),
                MessageProperties::default(),
                &serde_json::to_vec(&frame).unwrap(),
            )
            .await
            .unwrap();

        assert!(matches!(
            call.await.unwrap(),
            Err(Error::RemoteCommand(RemoteCommandStatus::InvalidCommand))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_command_needs_link_and_subscription() {
        let broker = MemoryBroker::new();
        let consumer = consumer_for(&broker, Recorder::default()).await;
        let d0 = AtCommand::new("D0").unwrap();
        assert!(matches!(
            consumer.send_remote_command_and_confirm(node_a(), d0, None).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            consumer.send_remote_command_and_confirm(node_c(), d0, None).await,
            Err(Error::InvalidDestination(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_command_times_out() {
        let broker = MemoryBroker::new();
        let consumer = PacketConsumer::builder()
            .address(node_a())
            .link(Arc::new(MockLink::new()))
            .rpc_timeout(Duration::from_secs(2))
            .build(Arc::new(broker.connect()))
            .await
            .unwrap();
        let result = consumer
            .send_remote_command_and_confirm(node_a(), AtCommand::new("D0").unwrap(), None)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(consumer.inner.remote_requests.is_empty());
    }

    #[tokio::test]
    async fn derived_data_goes_to_sensor_exchange() {
        let broker = MemoryBroker::new();
        let consumer = consumer_for(&broker, Recorder::default()).await;

        let listener = broker.connect();
        let q = listener.declare_queue("", true).await.unwrap();
        listener.bind_queue(&q, SENSOR_EXCHANGE, "temperature.#").await.unwrap();
        let mut rx = listener.consume(&q).await.unwrap();

        let key = crate::routing::derived_routing_key("temperature", Some(&node_a()));
        consumer
            .publish_derived_data(&key, &serde_json::json!({"celsius": 21.5}))
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.routing_key, key);
        let body: serde_json::Value = serde_json::from_slice(&got.body).unwrap();
        assert_eq!(body["celsius"], 21.5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_abandons_waiters() {
        let broker = MemoryBroker::new();
        let bridge = broker.connect();
        bridge.declare_queue(TRANSMIT_QUEUE, false).await.unwrap();
        let consumer = consumer_for(&broker, Recorder::default()).await;
        let queue = consumer.queue_name().to_string();

        let call = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.send_data_and_confirm(node_a(), b"x".to_vec()).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        consumer.shutdown().await.unwrap();
        consumer.shutdown().await.unwrap();
        consumer.closed().await;
        assert!(!broker.has_queue(&queue));

        assert!(matches!(call.await.unwrap(), Err(Error::Timeout)));
    }
}
