// Broker primitives for the courier messaging layer, plus an in-process
// broker implementing them.
//
// The traits here are the only surface the messaging core sees: open a
// channel, declare/bind a queue, publish framed bytes to an address, consume
// deliveries, acknowledge, close. A network-broker client would implement the
// same pair of traits; the in-process broker below is the reference
// implementation used by tests, demos, and embedded deployments.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue {0} is exclusively owned by another channel")]
    ExclusiveViolation(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("session closed")]
    SessionClosed,
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("unknown consumer tag {0}")]
    UnknownConsumerTag(String),
}

// Per-consumer queue depth; publishers fall back to the queue backlog when a
// consumer's queue is full.
const CONSUMER_QUEUE_DEPTH: usize = 1024;

/// Attributes requested when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// A single message handed to a consumer. Tags are scoped to the consuming
/// channel and must be acknowledged on that channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Bytes,
}

/// An active subscription: the broker-assigned tag plus the delivery stream.
#[derive(Debug)]
pub struct ConsumerStream {
    pub consumer_tag: String,
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// One broker channel. Callers must not interleave operations on a single
/// channel from multiple tasks; the messaging core guards each channel with
/// its own mutex.
#[async_trait]
pub trait BrokerChannel: Send + Sync + std::fmt::Debug {
    /// Declare a queue, returning its name. An empty name asks the broker to
    /// generate one. Redeclaring an existing queue is idempotent.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<String>;

    /// Bind a queue to an exchange under a routing key. The exchange is
    /// created on first bind. Routing keys match exactly.
    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish framed bytes. An empty exchange uses default routing: the
    /// routing key names the destination queue directly, so unbound
    /// exclusive reply queues stay addressable.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Begin consuming from a queue.
    async fn consume(&self, queue: &str) -> Result<ConsumerStream>;

    /// Acknowledge a delivery previously received on this channel.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Cancel an active subscription.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel. Unacknowledged deliveries are requeued as
    /// redelivered; exclusive queues owned by the channel are removed.
    async fn close(&self) -> Result<()>;
}

/// One broker session, owning any number of channels.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Close the session and every channel opened through it.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Binding {
    routing_key: String,
    queue: String,
}

#[derive(Debug, Default)]
struct ExchangeState {
    bindings: Vec<Binding>,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    // Channel id of the exclusive owner, when the queue was declared exclusive.
    owner: Option<u64>,
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    backlog: VecDeque<(Bytes, bool)>,
    consumers: Vec<ConsumerEntry>,
    rr: usize,
}

#[derive(Clone)]
struct ConsumerEntry {
    tag: String,
    sender: mpsc::Sender<Delivery>,
    channel: Arc<ChannelState>,
}

struct ChannelState {
    id: u64,
    open: AtomicBool,
    next_delivery_tag: AtomicU64,
    next_consumer: AtomicU64,
    // delivery tag -> (queue, payload), pending acknowledgment.
    unacked: Mutex<HashMap<u64, (String, Bytes)>>,
    // consumer tag -> queue it consumes from.
    consumers: Mutex<HashMap<String, String>>,
}

impl ChannelState {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

struct BrokerState {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    exchanges: Mutex<HashMap<String, ExchangeState>>,
    channel_counter: AtomicU64,
}

/// In-process broker with named queues, exact-match topic bindings, and
/// channel-scoped acknowledgment.
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                exchanges: Mutex::new(HashMap::new()),
                channel_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Open a session against this broker.
    pub fn session(&self) -> InProcessSession {
        InProcessSession {
            broker: Arc::clone(&self.state),
            channels: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    /// Number of queues currently declared. Test/diagnostic helper.
    pub fn queue_count(&self) -> usize {
        self.state.queues.lock().len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.lock().contains_key(name)
    }
}

impl BrokerState {
    fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    // Deliver one payload to a queue: prefer an active consumer, fall back to
    // the backlog. Candidate consumers are snapshotted so no queue lock is
    // held while unacked bookkeeping and channel queue sends happen.
    fn deliver(&self, queue: &Arc<QueueState>, payload: Bytes, redelivered: bool) {
        let candidates: Vec<ConsumerEntry> = {
            let mut inner = queue.inner.lock();
            if inner.consumers.is_empty() {
                inner.backlog.push_back((payload, redelivered));
                return;
            }
            let start = inner.rr;
            inner.rr = inner.rr.wrapping_add(1);
            let len = inner.consumers.len();
            (0..len)
                .map(|offset| inner.consumers[(start + offset) % len].clone())
                .collect()
        };
        let mut payload = payload;
        for entry in candidates {
            match push_to_consumer(&entry, queue, payload, redelivered) {
                Ok(()) => return,
                Err(returned) => payload = returned,
            }
        }
        // Every consumer queue was full or gone; keep the message.
        queue.inner.lock().backlog.push_back((payload, redelivered));
    }

    fn remove_queue_if_unused(&self, name: &str) {
        let mut queues = self.queues.lock();
        let empty = queues
            .get(name)
            .map(|queue| queue.inner.lock().consumers.is_empty())
            .unwrap_or(false);
        if empty {
            queues.remove(name);
            debug!(queue = name, "auto-delete queue removed");
        }
    }
}

// Record the delivery as unacked on the consuming channel, then hand it over.
// On failure the payload is returned so the caller can try another consumer.
fn push_to_consumer(
    entry: &ConsumerEntry,
    queue: &Arc<QueueState>,
    payload: Bytes,
    redelivered: bool,
) -> std::result::Result<(), Bytes> {
    if !entry.channel.open.load(Ordering::Acquire) {
        return Err(payload);
    }
    let delivery_tag = entry.channel.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
    entry
        .channel
        .unacked
        .lock()
        .insert(delivery_tag, (queue.name.clone(), payload.clone()));
    let delivery = Delivery {
        delivery_tag,
        redelivered,
        payload,
    };
    match entry.sender.try_send(delivery) {
        Ok(()) => Ok(()),
        Err(err) => {
            entry.channel.unacked.lock().remove(&delivery_tag);
            let payload = match err {
                mpsc::error::TrySendError::Full(delivery) => delivery.payload,
                mpsc::error::TrySendError::Closed(delivery) => delivery.payload,
            };
            Err(payload)
        }
    }
}

/// Session handle over the in-process broker.
pub struct InProcessSession {
    broker: Arc<BrokerState>,
    channels: Mutex<Vec<Arc<ChannelState>>>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerSession for InProcessSession {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(BrokerError::SessionClosed);
        }
        let state = Arc::new(ChannelState {
            id: self.broker.channel_counter.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
            next_delivery_tag: AtomicU64::new(1),
            next_consumer: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
        });
        self.channels.lock().push(Arc::clone(&state));
        Ok(Box::new(InProcessChannel {
            broker: Arc::clone(&self.broker),
            state,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            close_channel(&self.broker, &channel);
        }
        Ok(())
    }
}

/// Channel handle over the in-process broker.
pub struct InProcessChannel {
    broker: Arc<BrokerState>,
    state: Arc<ChannelState>,
}

impl std::fmt::Debug for InProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessChannel")
            .field("id", &self.state.id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerChannel for InProcessChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<String> {
        self.state.ensure_open()?;
        let name = if queue.is_empty() {
            format!("gen-{}", Uuid::new_v4())
        } else {
            queue.to_string()
        };
        let mut queues = self.broker.queues.lock();
        if let Some(existing) = queues.get(&name) {
            // Redeclare is idempotent, but exclusive ownership is enforced.
            if let Some(owner) = existing.owner {
                if owner != self.state.id {
                    return Err(BrokerError::ExclusiveViolation(name));
                }
            } else if options.exclusive {
                return Err(BrokerError::ExclusiveViolation(name));
            }
            return Ok(name);
        }
        queues.insert(
            name.clone(),
            Arc::new(QueueState {
                name: name.clone(),
                options,
                owner: options.exclusive.then_some(self.state.id),
                inner: Mutex::new(QueueInner::default()),
            }),
        );
        debug!(queue = %name, ?options, "queue declared");
        Ok(name)
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        self.state.ensure_open()?;
        // Binding an unknown queue is an error; binding creates the exchange.
        self.broker.queue(queue)?;
        let mut exchanges = self.broker.exchanges.lock();
        let state = exchanges.entry(exchange.to_string()).or_default();
        let exists = state
            .bindings
            .iter()
            .any(|binding| binding.routing_key == routing_key && binding.queue == queue);
        if !exists {
            state.bindings.push(Binding {
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.state.ensure_open()?;
        if exchange.is_empty() {
            // Default routing: the routing key names the queue.
            let queue = self.broker.queue(routing_key)?;
            self.broker.deliver(&queue, payload, false);
            return Ok(());
        }
        let targets: Vec<String> = {
            let exchanges = self.broker.exchanges.lock();
            let state = exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            state
                .bindings
                .iter()
                .filter(|binding| binding.routing_key == routing_key)
                .map(|binding| binding.queue.clone())
                .collect()
        };
        if targets.is_empty() {
            debug!(exchange, routing_key, "publish matched no bindings");
            return Ok(());
        }
        for target in targets {
            // Queues can disappear between binding and publish; skip them.
            if let Ok(queue) = self.broker.queue(&target) {
                self.broker.deliver(&queue, payload.clone(), false);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerStream> {
        self.state.ensure_open()?;
        let queue = self.broker.queue(queue)?;
        if let Some(owner) = queue.owner {
            if owner != self.state.id {
                return Err(BrokerError::ExclusiveViolation(queue.name.clone()));
            }
        }
        let tag = format!(
            "ctag-{}.{}",
            self.state.id,
            self.state.next_consumer.fetch_add(1, Ordering::Relaxed)
        );
        let (sender, receiver) = mpsc::channel(CONSUMER_QUEUE_DEPTH);
        let entry = ConsumerEntry {
            tag: tag.clone(),
            sender,
            channel: Arc::clone(&self.state),
        };
        let backlog: Vec<(Bytes, bool)> = {
            let mut inner = queue.inner.lock();
            inner.consumers.push(entry.clone());
            inner.backlog.drain(..).collect()
        };
        self.state
            .consumers
            .lock()
            .insert(tag.clone(), queue.name.clone());
        // Replay anything that queued up before this consumer arrived.
        for (payload, redelivered) in backlog {
            if let Err(payload) = push_to_consumer(&entry, &queue, payload, redelivered) {
                queue.inner.lock().backlog.push_back((payload, redelivered));
            }
        }
        debug!(queue = %queue.name, consumer_tag = %tag, "consumer started");
        Ok(ConsumerStream {
            consumer_tag: tag,
            deliveries: receiver,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.state.ensure_open()?;
        self.state
            .unacked
            .lock()
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.state.ensure_open()?;
        let queue_name = self
            .state
            .consumers
            .lock()
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::UnknownConsumerTag(consumer_tag.to_string()))?;
        let Ok(queue) = self.broker.queue(&queue_name) else {
            return Ok(());
        };
        let now_empty = {
            let mut inner = queue.inner.lock();
            inner.consumers.retain(|entry| entry.tag != consumer_tag);
            inner.consumers.is_empty()
        };
        if now_empty && queue.options.auto_delete {
            self.broker.remove_queue_if_unused(&queue_name);
        }
        debug!(queue = %queue_name, consumer_tag, "consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        close_channel(&self.broker, &self.state);
        Ok(())
    }
}

// Shared by channel close and session close: cancel consumers, requeue
// unacked deliveries as redelivered, drop exclusive queues owned here.
fn close_channel(broker: &Arc<BrokerState>, channel: &Arc<ChannelState>) {
    if !channel.open.swap(false, Ordering::AcqRel) {
        return;
    }
    let consumers = std::mem::take(&mut *channel.consumers.lock());
    for (tag, queue_name) in consumers {
        if let Ok(queue) = broker.queue(&queue_name) {
            let now_empty = {
                let mut inner = queue.inner.lock();
                inner.consumers.retain(|entry| entry.tag != tag);
                inner.consumers.is_empty()
            };
            if now_empty && queue.options.auto_delete {
                broker.remove_queue_if_unused(&queue_name);
            }
        }
    }
    let unacked: Vec<(String, Bytes)> = {
        let mut pending = channel.unacked.lock();
        pending.drain().map(|(_, entry)| entry).collect()
    };
    for (queue_name, payload) in unacked {
        if let Ok(queue) = broker.queue(&queue_name) {
            broker.deliver(&queue, payload, true);
        }
    }
    // Exclusive queues live and die with their owning channel.
    let owned: Vec<String> = {
        let queues = broker.queues.lock();
        queues
            .values()
            .filter(|queue| queue.owner == Some(channel.id))
            .map(|queue| queue.name.clone())
            .collect()
    };
    if !owned.is_empty() {
        let mut queues = broker.queues.lock();
        for name in owned {
            queues.remove(&name);
        }
    }
    debug!(channel = channel.id, "channel closed");
}
