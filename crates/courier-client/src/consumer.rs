// Consumer lifecycle and the delivery loop that classifies inbound
// deliveries into requests and responses.
use crate::channel::Channel;
use crate::connection::Connection;
use crate::handler::Handler;
use anyhow::{Context, Result};
use courier_broker::{ConsumerStream, Delivery, QueueOptions};
use courier_wire::{Envelope, Fault, Message};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// A subscription on a consumer channel's queue.
///
/// Stopped until [`start`](Consumer::start) is called; running exactly while
/// it holds a broker-assigned subscription tag. Stopping only stops new
/// deliveries; handler invocations already in flight run to completion.
pub struct Consumer {
    channel: Weak<Channel>,
    connection: Weak<Connection>,
    handler: Arc<dyn Handler>,
    tag: parking_lot::Mutex<Option<String>>,
}

impl Consumer {
    pub(crate) fn new(
        channel: Arc<Channel>,
        connection: Weak<Connection>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel: Arc::downgrade(&channel),
            connection,
            handler,
            tag: parking_lot::Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.tag.lock().is_some()
    }

    /// Declare and bind the channel's queue and begin receiving.
    /// Start after start implicitly stops the previous subscription.
    pub async fn start(&self, exclusive: bool, auto_delete: bool) -> Result<()> {
        if self.is_running() {
            self.stop().await?;
        }
        let channel = self.channel.upgrade().context("channel is gone")?;
        let connection = self.connection.upgrade().context("connection is gone")?;
        let options = QueueOptions {
            exclusive,
            auto_delete,
        };
        let ConsumerStream {
            consumer_tag,
            deliveries,
        } = channel.declare_and_consume(options).await?;
        *self.tag.lock() = Some(consumer_tag.clone());
        let permits = Arc::new(Semaphore::new(connection.config().max_in_flight_handlers));
        tokio::spawn(run_consumer_loop(
            channel,
            self.connection.clone(),
            Arc::clone(&self.handler),
            deliveries,
            permits,
        ));
        debug!(%consumer_tag, "consumer running");
        Ok(())
    }

    /// Cancel the subscription. A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let Some(tag) = self.tag.lock().take() else {
            return Ok(());
        };
        let Some(channel) = self.channel.upgrade() else {
            return Ok(());
        };
        channel.cancel_consumer(&tag).await
    }
}

async fn run_consumer_loop(
    channel: Arc<Channel>,
    connection: Weak<Connection>,
    handler: Arc<dyn Handler>,
    mut deliveries: mpsc::Receiver<Delivery>,
    permits: Arc<Semaphore>,
) {
    while let Some(delivery) = deliveries.recv().await {
        // Acknowledge before processing: at-least-once semantics, trading
        // possible loss on crash against consumer-side redelivery storms.
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            debug!(error = %err, "ack failed; consumer loop stopping");
            break;
        }
        t_counter!("courier_client_deliveries_total").increment(1);
        let envelope = match Envelope::decode(delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Malformed or foreign message: discard silently.
                debug!(error = %err, "discarding undecodable delivery");
                continue;
            }
        };
        let Some(conn) = connection.upgrade() else {
            break;
        };
        if envelope.is_request() {
            // Bounded handler concurrency; deliveries keep draining while
            // handlers run.
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let channel = Arc::clone(&channel);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                answer_request(conn, channel, handler, envelope).await;
                drop(permit);
            });
        } else {
            handler.handle_response(conn.correlator(), envelope).await;
        }
    }
    debug!("consumer loop exited");
}

// Run the handler's request path and publish its answer to the reply queue.
// A handler failure is converted into a fault response; a blocked requester
// is never left silent.
async fn answer_request(
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    handler: Arc<dyn Handler>,
    envelope: Envelope,
) {
    let reply_to = envelope.properties.reply_to.clone().unwrap_or_default();
    let correlation_id = envelope.properties.correlation_id;
    let result = handler.handle_request(channel, envelope).await;
    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "request handler failed; answering with fault");
            t_counter!("courier_client_faults_total").increment(1);
            let mut fault = Fault::new(correlation_id, err.to_string());
            fault.assign_id(Uuid::new_v4());
            match Envelope::from_message(&fault, None) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(error = %err, "failed to build fault envelope");
                    return;
                }
            }
        }
    };
    // Responses answer on the request's correlation id and carry no reply
    // address; an empty reply-to is what marks them as responses downstream.
    response.properties.correlation_id = correlation_id;
    response.properties.reply_to = None;
    let publish_channel = match connection.open_publish_channel("").await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(error = %err, "failed to open publish channel for response");
            return;
        }
    };
    if let Err(err) = publish_channel.publish_envelope(&response, &reply_to).await {
        warn!(error = %err, correlation = %correlation_id, "failed to publish response");
    }
}
