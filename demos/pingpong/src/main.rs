//! Request/reply demo over the in-process broker.
//!
//! # Purpose
//! Demonstrates the end-to-end flow: boot a broker, attach a server consumer
//! with a typed route, then drive single and concurrent requests from a
//! client connection.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use anyhow::Result;
use courier_broker::Broker;
use courier_client::{ClientConfig, Connection, DispatchHandler, HandlerRegistry, Message, Request};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    id: Option<Uuid>,
    sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    sequence: u32,
}

impl Message for Ping {
    fn type_tag() -> &'static str {
        "demo.ping"
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }
}

impl Message for Pong {
    fn type_tag() -> &'static str {
        "demo.pong"
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }

    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id.or(self.id)
    }
}

impl Request for Ping {
    type Response = Pong;
}

async fn run_demo() -> Result<()> {
    // Keep the demo output readable and step-by-step.
    println!("== Courier Ping/Pong Demo ==");
    println!("Goal: synchronous-looking requests over fire-and-forget pub/sub.");

    println!("Step 1/4: booting the in-process broker.");
    let broker = Broker::new();

    println!("Step 2/4: starting the server consumer on queue 'demo_queue'.");
    let server = Connection::open(broker.session(), ClientConfig::default());
    let serve_channel = server
        .open_consumer_channel("", "demo_queue", false, false)
        .await?;
    let mut registry = HandlerRegistry::new();
    registry.register::<Ping, _, _>(|request| async move {
        Ok(Pong {
            id: None,
            correlation_id: request.id,
            sequence: request.sequence,
        })
    });
    let consumer = serve_channel.register_handler(Arc::new(DispatchHandler::new(registry)))?;
    consumer.start(false, false).await?;

    println!("Step 3/4: one request/response round trip.");
    let client = Connection::open(broker.session(), ClientConfig::default());
    let channel = client.open_publish_channel("").await?;
    let reply_queue = client.reply_queue_name();
    let mut request = Ping {
        id: None,
        sequence: 7,
    };
    let response = channel
        .request(&mut request, "demo_queue", &reply_queue)
        .await?;
    println!(
        "  sent Ping(sequence=7), got Pong(sequence={}) correlated on {}",
        response.sequence,
        response
            .correlation_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string()),
    );

    println!("Step 4/4: 32 concurrent requests on one reply queue.");
    let mut tasks = Vec::new();
    for sequence in 1..=32u32 {
        let channel = Arc::clone(&channel);
        let reply_queue = reply_queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut request = Ping {
                id: None,
                sequence,
            };
            channel
                .request(&mut request, "demo_queue", &reply_queue)
                .await
        }));
    }
    let mut answered = 0;
    for task in tasks {
        let response = task.await??;
        assert_eq!(response.sequence, answered + 1);
        answered += 1;
    }
    println!("  {answered}/32 responses, each matching its own request.");

    client.close().await?;
    server.close().await?;
    println!("Done.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run_demo().await
}
