// Handler resolution: how an inbound delivery turns into processing logic.
//
// Two shapes are supported. A fixed callback is handed every request as-is.
// The registry resolves a processing routine from the envelope's type tag;
// the decode step, the routine, and the declared response type are all fixed
// when the route is registered, so nothing is inspected per message beyond
// the tag itself.
use crate::channel::Channel;
use crate::correlation::Correlator;
use async_trait::async_trait;
use courier_wire::{Envelope, Message, Request};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub type HandlerResult = std::result::Result<Envelope, HandlerError>;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("no route registered for message type {0}")]
    NoRoute(String),
    #[error("failed to decode request: {0}")]
    Decode(courier_wire::Error),
    #[error("failed to encode response: {0}")]
    Encode(courier_wire::Error),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Processing logic attached to a consumer.
///
/// The request path produces the response envelope for a request delivery;
/// its failure is answered with a fault, never dropped. The response path
/// defaults to correlation resolution and is what reply-queue consumers run.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_request(&self, channel: Arc<Channel>, envelope: Envelope) -> HandlerResult;

    async fn handle_response(&self, correlator: &Correlator, envelope: Envelope) {
        let correlation_id = envelope.properties.correlation_id;
        if !correlator.resolve(correlation_id, envelope) {
            // Nobody is waiting; late and duplicate responses die here.
            debug!(%correlation_id, "response without pending correlation dropped");
        }
    }
}

/// Default handler for reply-queue consumers: responses resolve pending
/// correlations, requests are unexpected there and answered with a fault.
pub struct CorrelationHandler;

#[async_trait]
impl Handler for CorrelationHandler {
    async fn handle_request(&self, _channel: Arc<Channel>, envelope: Envelope) -> HandlerResult {
        Err(HandlerError::NoRoute(envelope.properties.type_tag))
    }
}

type Callback = dyn Fn(Arc<Channel>, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Fixed-callback handler: one caller-supplied routine for every request.
pub struct CallbackHandler {
    callback: Box<Callback>,
}

impl CallbackHandler {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Arc<Channel>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            callback: Box::new(move |channel, envelope| Box::pin(callback(channel, envelope))),
        }
    }
}

#[async_trait]
impl Handler for CallbackHandler {
    async fn handle_request(&self, channel: Arc<Channel>, envelope: Envelope) -> HandlerResult {
        (self.callback)(channel, envelope).await
    }
}

type Route = Box<dyn Fn(Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Type-driven route table: request type tag to processing routine.
///
/// Registration pins the concrete request type, its declared response type,
/// and the routine together, replacing any per-message type inspection.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: HashMap<&'static str, Route>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the routine answering requests of type `R` with
    /// `R::Response`.
    pub fn register<R, F, Fut>(&mut self, routine: F) -> &mut Self
    where
        R: Request,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R::Response, HandlerError>> + Send + 'static,
    {
        let route: Route = Box::new(move |envelope: Envelope| -> BoxFuture<'static, HandlerResult> {
            match envelope.open_as::<R>() {
                Ok(request) => {
                    let pending = routine(request);
                    Box::pin(async move {
                        let mut response = pending.await?;
                        if response.id().is_none() {
                            response.assign_id(Uuid::new_v4());
                        }
                        Envelope::from_message(&response, None).map_err(HandlerError::Encode)
                    })
                }
                Err(err) => Box::pin(async move { Err(HandlerError::Decode(err)) }),
            }
        });
        self.routes.insert(R::type_tag(), route);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Handler that answers requests through a [`HandlerRegistry`].
pub struct DispatchHandler {
    registry: HandlerRegistry,
}

impl DispatchHandler {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    async fn dispatch(&self, envelope: Envelope) -> HandlerResult {
        let tag = envelope.properties.type_tag.clone();
        match self.registry.routes.get(tag.as_str()) {
            Some(route) => route(envelope).await,
            None => Err(HandlerError::NoRoute(tag)),
        }
    }
}

#[async_trait]
impl Handler for DispatchHandler {
    async fn handle_request(&self, _channel: Arc<Channel>, envelope: Envelope) -> HandlerResult {
        self.dispatch(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Double {
        id: Option<Uuid>,
        value: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Doubled {
        id: Option<Uuid>,
        correlation_id: Option<Uuid>,
        value: u32,
    }

    impl Message for Double {
        fn type_tag() -> &'static str {
            "test.double"
        }

        fn id(&self) -> Option<Uuid> {
            self.id
        }

        fn assign_id(&mut self, id: Uuid) {
            self.id = Some(id);
        }
    }

    impl Message for Doubled {
        fn type_tag() -> &'static str {
            "test.doubled"
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

    impl Request for Double {
        type Response = Doubled;
    }

    fn request_envelope(value: u32) -> Envelope {
        let mut request = Double { id: None, value };
        request.assign_id(Uuid::new_v4());
        Envelope::from_message(&request, Some("response.test")).expect("envelope")
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register::<Double, _, _>(|request| async move {
            Ok(Doubled {
                id: None,
                correlation_id: request.id,
                value: request.value * 2,
            })
        });
        registry
    }

    #[tokio::test]
    async fn registry_routes_by_type_tag() {
        let registry = registry();
        assert_eq!(registry.len(), 1);
        let route = registry.routes.get("test.double").expect("route");
        let envelope = request_envelope(21);
        let response = route(envelope.clone()).await.expect("response");
        let doubled: Doubled = response.open_as().expect("open");
        assert_eq!(doubled.value, 42);
        assert_eq!(doubled.correlation_id, Some(envelope.properties.message_id));
    }

    #[tokio::test]
    async fn missing_route_is_a_resolution_failure() {
        let handler = DispatchHandler::new(HandlerRegistry::new());
        let result = handler.dispatch(request_envelope(1)).await;
        assert!(matches!(result, Err(HandlerError::NoRoute(_))));
    }

    #[tokio::test]
    async fn undecodable_request_is_a_decode_failure() {
        let registry = registry();
        let route = registry.routes.get("test.double").expect("route");
        let mut envelope = request_envelope(1);
        envelope.payload = bytes::Bytes::from_static(b"not json");
        let err = route(envelope).await.expect_err("decode failure");
        assert!(matches!(err, HandlerError::Decode(_)));
    }
}
