//! meshlink-bus: radio frames over an AMQP message broker.
//!
//! Two roles meet on the broker:
//!
//! - [`PacketBridge`] sits next to the radio (usually behind a gateway
//!   client). It publishes every inbound frame to the raw-frame topic
//!   exchange as `{kind}.{address}` and services transmit requests from the
//!   `xbee_tx` queue.
//! - [`PacketConsumer`] is embedded in worker processes. It receives frames
//!   for a fixed set of node addresses, hands them to a [`PacketHandler`],
//!   and offers confirm-on-send: [`send_data_and_confirm`] publishes a
//!   transmit request and waits for the radio's delivery report.
//!
//! Both talk to the broker through the [`MessageBus`] trait, implemented by
//! [`AmqpBus`] for a real broker and [`MemoryBus`] for an in-process one.
//!
//! [`send_data_and_confirm`]: PacketConsumer::send_data_and_confirm

pub mod amqp;
pub mod bridge;
pub mod bus;
pub mod consumer;
pub mod frame_id;
pub mod memory;
pub mod pending;
pub mod routing;
pub mod rpc;

pub use amqp::AmqpBus;
pub use bridge::{BridgeConfig, PacketBridge};
pub use bus::{Deliveries, Delivery, MessageBus, MessageProperties, DEFAULT_EXCHANGE};
pub use consumer::{
    ConsumerConfig, LoggingHandler, PacketConsumer, PacketConsumerBuilder, PacketHandler,
    TxConfirmation, DEFAULT_RPC_TIMEOUT,
};
pub use frame_id::{next_frame_id, FrameIdCounter};
pub use memory::{MemoryBroker, MemoryBus};
pub use pending::PendingTable;
pub use routing::{RAW_EXCHANGE, SENSOR_EXCHANGE, TRANSMIT_QUEUE};
pub use rpc::TransmitRequest;
