//! Packet bridge between a radio link and the broker.
//!
//! The bridge publishes every frame that names a source node to the raw
//! exchange, and services the transmit queue: each request is sent to the
//! radio with a fresh frame id, and the radio's transmit status for that id
//! is published back to the requester.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{Command, Frame};
use meshlink_core::link::RadioLink;

use crate::bus::{Deliveries, Delivery, MessageBus, MessageProperties, DEFAULT_EXCHANGE};
use crate::consumer::DEFAULT_RPC_TIMEOUT;
use crate::frame_id::next_frame_id;
use crate::pending::PendingTable;
use crate::routing::{raw_routing_key, RAW_EXCHANGE, TRANSMIT_QUEUE};
use crate::rpc::TransmitRequest;

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Topic exchange raw frames are published to.
    pub raw_exchange: String,
    /// Queue transmit requests are read from.
    pub transmit_queue: String,
    /// How long to wait for the radio's transmit status.
    pub status_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            raw_exchange: RAW_EXCHANGE.to_string(),
            transmit_queue: TRANSMIT_QUEUE.to_string(),
            status_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    link: Arc<dyn RadioLink>,
    config: BridgeConfig,
    tx_requests: PendingTable<u8, Frame>,
    cancel: CancellationToken,
    closing: AtomicBool,
}

/// A running packet bridge.
#[derive(Clone)]
pub struct PacketBridge {
    inner: Arc<Inner>,
}

impl PacketBridge {
    /// Declare the raw exchange and transmit queue, then start moving
    /// frames and requests.
    ///
    /// `frames` carries every frame received from the radio, typically the
    /// receiver returned by
    /// [`GatewayClient::connect`](../meshlink_gateway/struct.GatewayClient.html).
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        link: Arc<dyn RadioLink>,
        frames: mpsc::UnboundedReceiver<Frame>,
        config: BridgeConfig,
    ) -> Result<Self> {
        bus.declare_exchange(&config.raw_exchange).await?;
        bus.declare_queue(&config.transmit_queue, false).await?;
        let requests = bus.consume(&config.transmit_queue).await?;

        info!(
            exchange = %config.raw_exchange,
            queue = %config.transmit_queue,
            "packet bridge started"
        );

        let bridge = PacketBridge {
            inner: Arc::new(Inner {
                bus,
                link,
                config,
                tx_requests: PendingTable::new(),
                cancel: CancellationToken::new(),
                closing: AtomicBool::new(false),
            }),
        };

        let span = tracing::info_span!("bridge");
        tokio::spawn(bridge.clone().frame_loop(frames).instrument(span.clone()));
        tokio::spawn(bridge.clone().request_loop(requests).instrument(span));
        Ok(bridge)
    }

    /// Stop both loops, halt the radio link, and close the broker
    /// connection. Calling this twice is not an error.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        info!("packet bridge shutting down");
        let halted = self.inner.link.halt().await;
        let closed = self.inner.bus.close().await;
        halted.and(closed)
    }

    /// Whether the bridge has stopped.
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until the bridge stops, by [`shutdown`](Self::shutdown) or
    /// because the radio or broker went away.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    async fn frame_loop(self, mut frames: mpsc::UnboundedReceiver<Frame>) {
        let cancel = self.inner.cancel.clone();
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.recv() => frame,
            };
            match frame {
                Some(frame) => self.on_frame(frame).await,
                None => {
                    warn!("radio frame stream ended");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    async fn on_frame(&self, frame: Frame) {
        if let Frame::ZbTxStatus { frame_id, .. } = &frame {
            let frame_id = *frame_id;
            if !self.inner.tx_requests.resolve(&frame_id, frame) {
                debug!(frame_id, "transmit status with no pending request");
            }
            return;
        }

        let Some(source) = frame.source() else {
            debug!(kind = frame.kind(), "frame without source address not published");
            return;
        };
        let routing_key = raw_routing_key(frame.kind(), &source);
        let body = match serde_json::to_vec(&frame) {
            Ok(body) => body,
            Err(e) => {
                warn!(%routing_key, "cannot encode frame: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .inner
            .bus
            .publish(
                &self.inner.config.raw_exchange,
                &routing_key,
                MessageProperties::default(),
                &body,
            )
            .await
        {
            warn!(%routing_key, "publish failed: {}", e);
        }
    }

    async fn request_loop(self, mut requests: Deliveries) {
        let cancel = self.inner.cancel.clone();
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = requests.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                warn!("transmit queue consumer ended");
                cancel.cancel();
                break;
            };
            let bridge = self.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = bridge.service_request(delivery).await {
                        warn!("transmit request failed: {}", e);
                    }
                }
                .in_current_span(),
            );
        }
    }

    async fn service_request(&self, delivery: Delivery) -> Result<()> {
        let Some(reply_to) = delivery.properties.reply_to.clone() else {
            warn!("transmit request without reply-to dropped");
            return Ok(());
        };
        let request: TransmitRequest = serde_json::from_slice(&delivery.body)
            .map_err(|e| Error::Codec(format!("undecodable transmit request: {}", e)))?;
        let TransmitRequest::SendData { dest, data } = request;

        let frame_id = next_frame_id();
        let rx = self.inner.tx_requests.register(frame_id)?;
        if let Err(e) = self
            .inner
            .link
            .send(&Command::transmit(frame_id, dest, data))
            .await
        {
            self.inner.tx_requests.remove(&frame_id);
            return Err(e);
        }
        debug!(%dest, frame_id, "transmit sent");

        let status = self
            .inner
            .tx_requests
            .wait(&frame_id, rx, self.inner.config.status_timeout)
            .await?;
        let body = serde_json::to_vec(&status).map_err(|e| Error::Codec(e.to_string()))?;
        let properties = MessageProperties {
            reply_to: None,
            correlation_id: delivery.properties.correlation_id,
        };
        self.inner
            .bus
            .publish(DEFAULT_EXCHANGE, &reply_to, properties, &body)
            .await
    }
}
