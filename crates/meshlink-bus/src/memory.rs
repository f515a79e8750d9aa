//! In-process message broker.
//!
//! [`MemoryBroker`] implements AMQP topic routing in memory: the default
//! exchange routes by queue name, topic exchanges route through bindings,
//! and unroutable messages are dropped. Each [`MemoryBus`] is one
//! "connection" to the broker; its exclusive queues disappear when it
//! closes. Every publish is also recorded so tests can assert on what was
//! (or was not) sent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshlink_core::error::{Error, Result};

use crate::bus::{Deliveries, Delivery, MessageBus, MessageProperties, DEFAULT_EXCHANGE};
use crate::routing::topic_matches;

type ConnectionId = u64;

struct Queue {
    owner: Option<ConnectionId>,
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
    backlog: Vec<Delivery>,
}

impl Queue {
    fn deliver(&mut self, delivery: Delivery) {
        if let Some(consumer) = &self.consumer {
            match consumer.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => {
                    self.consumer = None;
                    self.backlog.push(delivery);
                }
            }
        } else {
            self.backlog.push(delivery);
        }
    }
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    published: Vec<Delivery>,
    next_queue: u64,
}

/// An in-process topic broker shared by any number of connections.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the broker.
    pub fn connect(&self) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<Delivery> {
        self.lock().published.clone()
    }

    /// Messages published with the given exchange and routing key.
    pub fn published_to(&self, exchange: &str, routing_key: &str) -> Vec<Delivery> {
        self.lock()
            .published
            .iter()
            .filter(|d| d.exchange == exchange && d.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Whether a queue with this name exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
    id: ConnectionId,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    /// The broker this connection belongs to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Bus("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if name.is_empty() {
            return Err(Error::Bus("cannot redeclare the default exchange".into()));
        }
        self.broker.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        self.check_open()?;
        let mut state = self.broker.lock();

        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}-{}", self.id, state.next_queue)
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(Error::Bus(format!("queue {} is exclusive to another connection", name)));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            Queue {
                owner: exclusive.then_some(self.id),
                consumer: None,
                backlog: Vec::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(Error::Bus(format!("no exchange {}", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(Error::Bus(format!("no queue {}", queue)));
        }
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Bus(format!("no queue {}", queue)))?;
        if q.consumer.as_ref().is_some_and(|c| !c.is_closed()) {
            return Err(Error::Bus(format!("queue {} already has a consumer", queue)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in q.backlog.drain(..) {
            let _ = tx.send(delivery);
        }
        q.consumer = Some(tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();

        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: body.to_vec(),
        };
        state.published.push(delivery.clone());

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(Error::Bus(format!("no exchange {}", exchange)));
            }
            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.deliver(delivery.clone());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.lock();
        let id = self.id;
        state.queues.retain(|_, q| q.owner != Some(id));
        let BrokerState { queues, bindings, .. } = &mut *state;
        bindings.retain(|b| queues.contains_key(&b.queue));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topic_exchange_routes_through_bindings() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.declare_exchange("raw").await.unwrap();
        let q = bus.declare_queue("", true).await.unwrap();
        bus.bind_queue(&q, "raw", "*.a").await.unwrap();
        let mut rx = bus.consume(&q).await.unwrap();

        bus.publish("raw", "zb_rx.a", MessageProperties::default(), b"1")
            .await
            .unwrap();
        bus.publish("raw", "zb_rx.b", MessageProperties::default(), b"2")
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.body, b"1");
        assert_eq!(got.routing_key, "zb_rx.a");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn overlapping_bindings_deliver_once() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.declare_exchange("raw").await.unwrap();
        let q = bus.declare_queue("", true).await.unwrap();
        bus.bind_queue(&q, "raw", "*.a").await.unwrap();
        bus.bind_queue(&q, "raw", "#").await.unwrap();
        let mut rx = bus.consume(&q).await.unwrap();

        bus.publish("raw", "zb_rx.a", MessageProperties::default(), b"x")
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.declare_queue("work", false).await.unwrap();

        // Published before anyone consumes: held in the backlog.
        let props = MessageProperties::request("reply-q", "c-1");
        bus.publish("", "work", props.clone(), b"job").await.unwrap();

        let mut rx = bus.consume("work").await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.properties, props);
        assert_eq!(got.body, b"job");
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.publish("", "nobody", MessageProperties::default(), b"x")
            .await
            .unwrap();
        assert!(!broker.has_queue("nobody"));
    }

    #[tokio::test]
    async fn publish_to_undeclared_exchange_fails() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        let result = bus
            .publish("missing", "k", MessageProperties::default(), b"x")
            .await;
        assert!(matches!(result, Err(Error::Bus(_))));
    }

    #[tokio::test]
    async fn close_removes_exclusive_queues_and_ends_consumers() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        let other = broker.connect();
        bus.declare_exchange("raw").await.unwrap();

        let q = bus.declare_queue("", true).await.unwrap();
        bus.bind_queue(&q, "raw", "#").await.unwrap();
        let mut rx = bus.consume(&q).await.unwrap();
        other.declare_queue("shared", false).await.unwrap();

        bus.close().await.unwrap();
        assert!(!broker.has_queue(&q));
        assert!(broker.has_queue("shared"));
        assert!(rx.recv().await.is_none());

        let result = bus.publish("raw", "a", MessageProperties::default(), b"x").await;
        assert!(matches!(result, Err(Error::Bus(_))));
    }

    #[tokio::test]
    async fn exclusive_queue_is_private() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let intruder = broker.connect();
        let q = owner.declare_queue("mine", true).await.unwrap();
        assert!(matches!(
            intruder.declare_queue(&q, false).await,
            Err(Error::Bus(_))
        ));
    }
}
