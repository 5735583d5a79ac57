// Connection: owns the broker session, the channel-reuse cache, and the
// correlation tables shared by every channel and consumer.
use crate::channel::{Channel, ChannelKey};
use crate::config::ClientConfig;
use crate::correlation::Correlator;
use anyhow::{ensure, Context, Result};
use courier_broker::BrokerSession;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

// Channel cache with defined insert/remove/find operations; the raw map is
// never handed out for external locking.
pub(crate) struct ChannelSet {
    inner: Mutex<HashMap<ChannelKey, Arc<Channel>>>,
}

impl ChannelSet {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn find(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.inner.lock().get(key).cloned()
    }

    fn insert(&self, key: ChannelKey, channel: Arc<Channel>) {
        self.inner.lock().insert(key, channel);
    }

    fn remove(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.inner.lock().remove(key)
    }

    fn drain(&self) -> Vec<Arc<Channel>> {
        self.inner.lock().drain().map(|(_, channel)| channel).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// One broker session plus everything scoped to it: the reusable channels
/// and the pending-response tables.
pub struct Connection {
    weak: Weak<Connection>,
    session: Box<dyn BrokerSession>,
    config: ClientConfig,
    channels: ChannelSet,
    correlator: Correlator,
    // Serializes channel-open operations so concurrent callers asking for
    // the same attribute tuple end up sharing one channel instance.
    open_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an established broker session. Provisioning broker channels is
    /// comparatively expensive, so channels opened through this connection
    /// are cached and reused by their attribute tuple.
    pub fn open(session: impl BrokerSession + 'static, config: ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            session: Box::new(session),
            config,
            channels: ChannelSet::new(),
            correlator: Correlator::new(),
            open_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// A fresh reply queue name under the configured prefix.
    pub fn reply_queue_name(&self) -> String {
        format!("{}{}", self.config.reply_queue_prefix, Uuid::new_v4())
    }

    pub async fn open_publish_channel(&self, exchange: &str) -> Result<Arc<Channel>> {
        self.open_channel(ChannelKey::publish(exchange)).await
    }

    pub async fn open_consumer_channel(
        &self,
        exchange: &str,
        queue: &str,
        auto_delete: bool,
        exclusive: bool,
    ) -> Result<Arc<Channel>> {
        self.open_channel(ChannelKey::consume(exchange, queue, auto_delete, exclusive))
            .await
    }

    async fn open_channel(&self, key: ChannelKey) -> Result<Arc<Channel>> {
        ensure!(!self.closed.load(Ordering::Acquire), "connection is closed");
        // Fast path: an equal-attribute channel already exists.
        if let Some(existing) = self.channels.find(&key) {
            return Ok(existing);
        }
        let _gate = self.open_gate.lock().await;
        if let Some(existing) = self.channels.find(&key) {
            return Ok(existing);
        }
        let raw = self.session.open_channel().await.context("open broker channel")?;
        let channel = Channel::new(key.clone(), self.weak.clone(), raw);
        self.channels.insert(key, Arc::clone(&channel));
        debug!(channel = %channel.id(), "channel opened");
        Ok(channel)
    }

    // Make sure a default correlation consumer is live on the reply queue.
    // Reply queues are exclusive, auto-deleting, and bound to no exchange.
    pub(crate) async fn ensure_reply_consumer(&self, reply_to: &str) -> Result<()> {
        let channel = self.open_consumer_channel("", reply_to, true, true).await?;
        channel.ensure_default_consumer().await
    }

    pub(crate) fn forget_channel(&self, key: &ChannelKey) {
        self.channels.remove(key);
    }

    /// Close every owned channel, then the broker session. One failing
    /// channel close does not abort the rest. Requests still outstanding
    /// stay pending forever.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for channel in self.channels.drain() {
            if let Err(err) = channel.shutdown().await {
                warn!(error = %err, "channel close failed");
            }
        }
        self.session.close().await.context("close broker session")
    }
}
