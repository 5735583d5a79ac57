use crate::channel::Channel;
use crate::config::{ClientConfig, DEFAULT_MAX_IN_FLIGHT_HANDLERS, DEFAULT_REPLY_QUEUE_PREFIX};
use crate::connection::Connection;
use crate::handler::{CallbackHandler, DispatchHandler, HandlerError, HandlerRegistry};
use courier_broker::Broker;
use courier_wire::{Envelope, Message, Request};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
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

// A request whose registered routine always fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Boom {
    id: Option<Uuid>,
}

impl Message for Ping {
    fn type_tag() -> &'static str {
        "test.ping"
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
        "test.pong"
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }

    // Pong answers a Ping; it correlates by the id it carries.
    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id.or(self.id)
    }
}

impl Message for Boom {
    fn type_tag() -> &'static str {
        "test.boom"
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }
}

impl Request for Ping {
    type Response = Pong;
}

impl Request for Boom {
    type Response = Pong;
}

fn ping(sequence: u32) -> Ping {
    Ping { id: None, sequence }
}

// Boot a server connection answering Ping with Pong and failing Boom.
async fn start_echo_server(broker: &Broker, queue: &str) -> Arc<Connection> {
    let connection = Connection::open(broker.session(), ClientConfig::default());
    let channel = connection
        .open_consumer_channel("", queue, false, false)
        .await
        .expect("consumer channel");
    let mut registry = HandlerRegistry::new();
    registry.register::<Ping, _, _>(|request| async move {
        Ok(Pong {
            id: None,
            correlation_id: request.id,
            sequence: request.sequence,
        })
    });
    registry.register::<Boom, _, _>(|_request| async move {
        Err(HandlerError::failed("boom handler exploded"))
    });
    let consumer = channel
        .register_handler(Arc::new(DispatchHandler::new(registry)))
        .expect("register handler");
    consumer.start(false, false).await.expect("start consumer");
    connection
}

async fn client(broker: &Broker) -> (Arc<Connection>, Arc<Channel>, String) {
    let connection = Connection::open(broker.session(), ClientConfig::default());
    let channel = connection
        .open_publish_channel("")
        .await
        .expect("publish channel");
    let reply_queue = connection.reply_queue_name();
    (connection, channel, reply_queue)
}

#[tokio::test]
async fn request_round_trip() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let (_connection, channel, reply_queue) = client(&broker).await;
    let mut request = ping(7);
    let response = channel
        .request(&mut request, "test_queue", &reply_queue)
        .await
        .expect("response");
    assert_eq!(response.sequence, 7);
    // The response correlates on the request's id.
    assert_eq!(response.correlation_id, request.id);
    assert!(request.id.is_some());
}

#[tokio::test]
async fn id_assignment_is_idempotent() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let connection = Connection::open(broker.session(), ClientConfig::default());
    let channel = connection
        .open_publish_channel("")
        .await
        .expect("publish channel");

    let preassigned = Uuid::new_v4();
    let mut request = ping(1);
    request.assign_id(preassigned);
    channel
        .publish(&mut request, "test_queue", None)
        .await
        .expect("publish");
    assert_eq!(request.id, Some(preassigned));

    let mut fresh = ping(2);
    channel
        .publish(&mut fresh, "test_queue", None)
        .await
        .expect("publish");
    let assigned = fresh.id.expect("id assigned on first publish");
    channel
        .publish(&mut fresh, "test_queue", None)
        .await
        .expect("publish");
    assert_eq!(fresh.id, Some(assigned));
}

#[tokio::test]
async fn equal_attributes_share_a_channel() {
    let broker = Broker::new();
    let connection = Connection::open(broker.session(), ClientConfig::default());

    let first = connection.open_publish_channel("").await.expect("open");
    let second = connection.open_publish_channel("").await.expect("open");
    assert!(Arc::ptr_eq(&first, &second));

    let other_exchange = connection
        .open_publish_channel("events")
        .await
        .expect("open");
    assert!(!Arc::ptr_eq(&first, &other_exchange));

    let consumer = connection
        .open_consumer_channel("", "jobs", false, false)
        .await
        .expect("open");
    let consumer_again = connection
        .open_consumer_channel("", "jobs", false, false)
        .await
        .expect("open");
    assert!(Arc::ptr_eq(&consumer, &consumer_again));

    // Any attribute difference yields a distinct channel.
    let auto_delete = connection
        .open_consumer_channel("", "jobs", true, false)
        .await
        .expect("open");
    assert!(!Arc::ptr_eq(&consumer, &auto_delete));
    assert_eq!(connection.channel_count(), 4);
}

#[tokio::test]
async fn concurrent_requests_keep_their_own_responses() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let (_connection, channel, reply_queue) = client(&broker).await;

    let mut tasks = Vec::new();
    for sequence in 1..=128u32 {
        let channel = Arc::clone(&channel);
        let reply_queue = reply_queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut request = ping(sequence);
            let response = channel
                .request(&mut request, "test_queue", &reply_queue)
                .await
                .expect("response");
            (sequence, response)
        }));
    }
    let mut seen = HashSet::new();
    for task in tasks {
        let (sequence, response) = task.await.expect("task");
        // Every caller observes exactly its own marker.
        assert_eq!(response.sequence, sequence);
        assert!(seen.insert(response.sequence), "duplicate response");
    }
    assert_eq!(seen.len(), 128);
}

#[tokio::test]
async fn handler_failure_becomes_a_fault_and_serving_continues() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let (_connection, channel, reply_queue) = client(&broker).await;

    let mut bad = Boom { id: None };
    let err = channel
        .request(&mut bad, "test_queue", &reply_queue)
        .await
        .expect_err("fault response");
    assert!(
        err.to_string().contains("boom handler exploded"),
        "unexpected error: {err}"
    );

    // The serving consumer survived the failure.
    let mut request = ping(9);
    let response = channel
        .request(&mut request, "test_queue", &reply_queue)
        .await
        .expect("response");
    assert_eq!(response.sequence, 9);
}

#[tokio::test]
async fn unregistered_request_type_is_answered_with_a_fault() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let (connection, channel, reply_queue) = client(&broker).await;

    // A response-kind message sent with a reply address is still classified
    // as a request; the registry has no route for it.
    let mut stray = Pong {
        id: None,
        correlation_id: None,
        sequence: 0,
    };
    stray.assign_id(Uuid::new_v4());
    let envelope = Envelope::from_message(&stray, Some(&reply_queue)).expect("envelope");
    let pending = connection
        .correlator()
        .register(envelope.properties.correlation_id, envelope.clone());
    connection
        .ensure_reply_consumer(&reply_queue)
        .await
        .expect("reply consumer");
    channel
        .publish_envelope(&envelope, "test_queue")
        .await
        .expect("publish");
    let answer = pending.await.expect("fault envelope");
    assert!(answer.is_fault());
    assert!(!answer.is_request());
}

#[tokio::test]
async fn unknown_correlation_is_ignored_silently() {
    let broker = Broker::new();
    let _server = start_echo_server(&broker, "test_queue").await;
    let (connection, channel, reply_queue) = client(&broker).await;

    // Establish the reply consumer, then feed it a response nobody asked for.
    connection
        .ensure_reply_consumer(&reply_queue)
        .await
        .expect("reply consumer");
    let mut orphan = Pong {
        id: None,
        correlation_id: Some(Uuid::new_v4()),
        sequence: 0,
    };
    orphan.assign_id(Uuid::new_v4());
    let envelope = Envelope::from_message(&orphan, None).expect("envelope");
    channel
        .publish_envelope(&envelope, &reply_queue)
        .await
        .expect("publish");

    // The consumer shrugged it off and still resolves real requests.
    let mut request = ping(3);
    let response = channel
        .request(&mut request, "test_queue", &reply_queue)
        .await
        .expect("response");
    assert_eq!(response.sequence, 3);
    assert_eq!(connection.correlator().outstanding(), 0);
}

#[tokio::test]
async fn fixed_callback_handler_answers_requests() {
    let broker = Broker::new();
    let server = Connection::open(broker.session(), ClientConfig::default());
    let serve_channel = server
        .open_consumer_channel("", "echo_queue", false, false)
        .await
        .expect("consumer channel");
    let handler = CallbackHandler::new(|_channel, envelope: Envelope| async move {
        let request: Ping = envelope.open_as().map_err(HandlerError::Decode)?;
        let mut response = Pong {
            id: None,
            correlation_id: request.id,
            sequence: request.sequence,
        };
        response.assign_id(Uuid::new_v4());
        Envelope::from_message(&response, None).map_err(HandlerError::Encode)
    });
    let consumer = serve_channel
        .register_handler(Arc::new(handler))
        .expect("register handler");
    consumer.start(false, false).await.expect("start");

    let (_connection, channel, reply_queue) = client(&broker).await;
    let mut request = ping(11);
    let response = channel
        .request(&mut request, "echo_queue", &reply_queue)
        .await
        .expect("response");
    assert_eq!(response.sequence, 11);
}

#[tokio::test]
async fn consumer_stops_and_restarts() {
    let broker = Broker::new();
    let server = Connection::open(broker.session(), ClientConfig::default());
    let serve_channel = server
        .open_consumer_channel("", "test_queue", false, false)
        .await
        .expect("consumer channel");
    let mut registry = HandlerRegistry::new();
    registry.register::<Ping, _, _>(|request| async move {
        Ok(Pong {
            id: None,
            correlation_id: request.id,
            sequence: request.sequence,
        })
    });
    let consumer = serve_channel
        .register_handler(Arc::new(DispatchHandler::new(registry)))
        .expect("register handler");

    consumer.start(false, false).await.expect("start");
    assert!(consumer.is_running());
    consumer.stop().await.expect("stop");
    assert!(!consumer.is_running());
    consumer.stop().await.expect("stop is idempotent");

    // Start after start implicitly stops the previous subscription.
    consumer.start(false, false).await.expect("restart");
    consumer.start(false, false).await.expect("start over start");
    assert!(consumer.is_running());

    let (_connection, channel, reply_queue) = client(&broker).await;
    let mut request = ping(21);
    let response = channel
        .request(&mut request, "test_queue", &reply_queue)
        .await
        .expect("response");
    assert_eq!(response.sequence, 21);
}

#[tokio::test]
async fn close_cascades_and_is_idempotent() {
    let broker = Broker::new();
    let connection = Connection::open(broker.session(), ClientConfig::default());
    connection
        .open_publish_channel("")
        .await
        .expect("publish channel");
    connection
        .open_consumer_channel("", "jobs", false, false)
        .await
        .expect("consumer channel");
    assert_eq!(connection.channel_count(), 2);

    connection.close().await.expect("close");
    connection.close().await.expect("close twice");
    assert_eq!(connection.channel_count(), 0);
    let err = connection
        .open_publish_channel("")
        .await
        .expect_err("closed connection");
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn closing_a_channel_removes_it_from_the_cache() {
    let broker = Broker::new();
    let connection = Connection::open(broker.session(), ClientConfig::default());
    let channel = connection.open_publish_channel("").await.expect("open");
    channel.close().await.expect("close");
    assert_eq!(connection.channel_count(), 0);
    let reopened = connection.open_publish_channel("").await.expect("reopen");
    assert!(!Arc::ptr_eq(&channel, &reopened));
}

// ===== Config tests =====

#[test]
fn config_defaults() {
    let config = ClientConfig::default();
    assert_eq!(config.reply_queue_prefix, DEFAULT_REPLY_QUEUE_PREFIX);
    assert_eq!(config.max_in_flight_handlers, DEFAULT_MAX_IN_FLIGHT_HANDLERS);
}

#[test]
#[serial_test::serial]
fn config_from_env_variables() {
    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var("COURIER_REPLY_QUEUE_PREFIX");
            std::env::remove_var("COURIER_MAX_IN_FLIGHT_HANDLERS");
        }
    }

    let _guard = EnvGuard;
    std::env::set_var("COURIER_REPLY_QUEUE_PREFIX", "answers.");
    std::env::set_var("COURIER_MAX_IN_FLIGHT_HANDLERS", "32");

    let config = ClientConfig::from_env();
    assert_eq!(config.reply_queue_prefix, "answers.");
    assert_eq!(config.max_in_flight_handlers, 32);
}

#[test]
#[serial_test::serial]
fn config_env_ignores_invalid_values() {
    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var("COURIER_MAX_IN_FLIGHT_HANDLERS");
        }
    }

    let _guard = EnvGuard;
    std::env::set_var("COURIER_MAX_IN_FLIGHT_HANDLERS", "0");
    let config = ClientConfig::from_env();
    assert_eq!(config.max_in_flight_handlers, DEFAULT_MAX_IN_FLIGHT_HANDLERS);

    std::env::set_var("COURIER_MAX_IN_FLIGHT_HANDLERS", "not-a-number");
    let config = ClientConfig::from_env();
    assert_eq!(config.max_in_flight_handlers, DEFAULT_MAX_IN_FLIGHT_HANDLERS);
}

#[test]
#[serial_test::serial]
fn config_from_yaml_file() {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let yaml = r#"
reply_queue_prefix: "rsvp."
max_in_flight_handlers: 8
"#;
    let mut temp_file = NamedTempFile::new().expect("temp file");
    temp_file.write_all(yaml.as_bytes()).expect("write");
    let path = temp_file.path().to_str().expect("path");

    let config = ClientConfig::from_env_or_yaml(Some(path)).expect("config");
    assert_eq!(config.reply_queue_prefix, "rsvp.");
    assert_eq!(config.max_in_flight_handlers, 8);
}

#[test]
fn config_invalid_yaml_returns_error() {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let mut temp_file = NamedTempFile::new().expect("temp file");
    temp_file
        .write_all(b"max_in_flight_handlers: [oops")
        .expect("write");
    let path = temp_file.path().to_str().expect("path");
    assert!(ClientConfig::from_env_or_yaml(Some(path)).is_err());
}

#[test]
fn config_missing_yaml_file_returns_error() {
    assert!(ClientConfig::from_env_or_yaml(Some("/nonexistent/courier.yaml")).is_err());
}
