// Session-scoped channel bound to one broker channel.
//
// Publish channels serialize and publish messages and drive requests;
// consumer channels declare their queue and host consumers. The raw broker
// handle is guarded by a per-channel async mutex so publish and ack calls
// never interleave from two tasks.
use crate::connection::Connection;
use crate::consumer::Consumer;
use crate::handler::{CorrelationHandler, Handler};
use anyhow::{ensure, Context, Result};
use courier_broker::{BrokerChannel, ConsumerStream, QueueOptions};
use courier_wire::{Envelope, Fault, Message, Request};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Publish,
    Consume,
}

/// The attribute tuple that identifies a reusable channel. Two open calls
/// with equal keys on one connection share a channel instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub role: ChannelRole,
    pub exchange: String,
    pub queue: String,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl ChannelKey {
    pub fn publish(exchange: &str) -> Self {
        Self {
            role: ChannelRole::Publish,
            exchange: exchange.to_string(),
            queue: String::new(),
            auto_delete: false,
            exclusive: false,
        }
    }

    pub fn consume(exchange: &str, queue: &str, auto_delete: bool, exclusive: bool) -> Self {
        Self {
            role: ChannelRole::Consume,
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            auto_delete,
            exclusive,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub struct Channel {
    weak: Weak<Channel>,
    id: Uuid,
    key: ChannelKey,
    connection: Weak<Connection>,
    raw: Mutex<Box<dyn BrokerChannel>>,
    consumers: parking_lot::Mutex<Vec<Arc<Consumer>>>,
    // Serializes ensure_default_consumer so one reply queue never gets two
    // default consumers racing into existence.
    setup: Mutex<()>,
}

impl Channel {
    pub(crate) fn new(
        key: ChannelKey,
        connection: Weak<Connection>,
        raw: Box<dyn BrokerChannel>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            id: Uuid::new_v4(),
            key,
            connection,
            raw: Mutex::new(raw),
            consumers: parking_lot::Mutex::new(Vec::new()),
            setup: Mutex::new(()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Fire-and-forget publish. Assigns the message id if absent; the
    /// delivery metadata carries the message's correlation id and type tag,
    /// and `reply_to` only when the caller expects an answer.
    pub async fn publish<M: Message>(
        &self,
        message: &mut M,
        queue: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        ensure!(
            self.key.role == ChannelRole::Publish,
            "publish requires a publish channel"
        );
        if message.id().is_none() {
            message.assign_id(Uuid::new_v4());
        }
        let envelope = Envelope::from_message(message, reply_to).context("build envelope")?;
        self.publish_envelope(&envelope, queue).await
    }

    /// The synchronous-call primitive: register a pending response, make
    /// sure a consumer is listening on `reply_to`, publish, then suspend
    /// until the correlated response arrives.
    ///
    /// There is deliberately no timeout here; an unanswered request stays
    /// pending until the connection goes away.
    pub async fn request<R: Request>(
        &self,
        message: &mut R,
        queue: &str,
        reply_to: &str,
    ) -> Result<R::Response> {
        ensure!(
            self.key.role == ChannelRole::Publish,
            "request requires a publish channel"
        );
        ensure!(!reply_to.is_empty(), "request requires a reply queue");
        let connection = self.connection.upgrade().context("connection is gone")?;
        if message.id().is_none() {
            message.assign_id(Uuid::new_v4());
        }
        let envelope =
            Envelope::from_message(message, Some(reply_to)).context("build request envelope")?;
        let correlation_id = envelope.properties.correlation_id;
        let pending = connection
            .correlator()
            .register(correlation_id, envelope.clone());
        t_counter!("courier_client_requests_total").increment(1);
        t_gauge!("courier_client_requests_pending")
            .set(connection.correlator().outstanding() as f64);
        // The reply consumer must be live before the request becomes visible
        // remotely, or the response could land on an empty queue forever.
        if let Err(err) = connection.ensure_reply_consumer(reply_to).await {
            connection.correlator().forget(correlation_id);
            return Err(err);
        }
        if let Err(err) = self.publish_envelope(&envelope, queue).await {
            connection.correlator().forget(correlation_id);
            return Err(err);
        }
        let envelope = pending
            .await
            .context("connection closed while awaiting response")?;
        t_gauge!("courier_client_requests_pending")
            .set(connection.correlator().outstanding() as f64);
        if envelope.is_fault() {
            let fault: Fault = envelope.open_as().context("decode fault response")?;
            anyhow::bail!("request failed remotely: {}", fault.message);
        }
        envelope.open_as::<R::Response>().context("decode response")
    }

    pub(crate) async fn publish_envelope(&self, envelope: &Envelope, queue: &str) -> Result<()> {
        let bytes = envelope.encode().context("encode envelope")?;
        let raw = self.raw.lock().await;
        // Default routing reaches queues that are bound to no exchange,
        // which is exactly what exclusive reply queues rely on.
        raw.publish("", queue, bytes)
            .await
            .context("publish to broker")
    }

    /// Attach a handler to this consumer channel, yielding a stopped
    /// consumer. Call [`Consumer::start`] to begin receiving.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> Result<Arc<Consumer>> {
        ensure!(
            self.key.role == ChannelRole::Consume,
            "handlers attach to consumer channels"
        );
        let this = self.weak.upgrade().context("channel is gone")?;
        let consumer = Consumer::new(this, self.connection.clone(), handler);
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    // Start the default correlation consumer unless one is already running.
    pub(crate) async fn ensure_default_consumer(&self) -> Result<()> {
        let _setup = self.setup.lock().await;
        let running = self
            .consumers
            .lock()
            .iter()
            .any(|consumer| consumer.is_running());
        if running {
            return Ok(());
        }
        let consumer = self.register_handler(Arc::new(CorrelationHandler))?;
        consumer
            .start(self.key.exclusive, self.key.auto_delete)
            .await
    }

    pub(crate) async fn declare_and_consume(
        &self,
        options: QueueOptions,
    ) -> Result<ConsumerStream> {
        let raw = self.raw.lock().await;
        let queue = raw
            .declare_queue(&self.key.queue, options)
            .await
            .context("declare queue")?;
        if !self.key.exchange.is_empty() {
            raw.bind_queue(&self.key.exchange, &queue, &queue)
                .await
                .context("bind queue")?;
        }
        raw.consume(&queue).await.context("begin consuming")
    }

    pub(crate) async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let raw = self.raw.lock().await;
        raw.ack(delivery_tag).await.context("ack delivery")
    }

    pub(crate) async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        let raw = self.raw.lock().await;
        raw.cancel(consumer_tag).await.context("cancel consumer")
    }

    /// Close this channel and remove it from the connection's channel set.
    pub async fn close(&self) -> Result<()> {
        if let Some(connection) = self.connection.upgrade() {
            connection.forget_channel(&self.key);
        }
        self.shutdown().await
    }

    // Stop consumers, then close the raw broker channel. Also used by the
    // connection's cascading close, which has already drained the set.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let consumers: Vec<Arc<Consumer>> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            if let Err(err) = consumer.stop().await {
                debug!(error = %err, "consumer stop during channel close failed");
            }
        }
        let raw = self.raw.lock().await;
        raw.close().await.context("close broker channel")
    }
}
