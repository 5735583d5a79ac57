// Correlation engine: outstanding requests and their pending response
// futures, keyed by correlation id.
use courier_wire::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

// Both maps live under one mutex so a resolve removes the request entry and
// the pending sender atomically with respect to other callers.
#[derive(Default)]
struct Tables {
    // Original request envelopes, kept for diagnostics until resolved.
    requests: HashMap<Uuid, Envelope>,
    responses: HashMap<Uuid, oneshot::Sender<Envelope>>,
}

/// Pending-response table shared by every channel and consumer of a
/// connection. Ids are uuid-v4, so one id never identifies more than one
/// outstanding request.
#[derive(Default)]
pub struct Correlator {
    tables: Mutex<Tables>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an outstanding request and hand back the future its response
    /// will resolve.
    pub fn register(&self, id: Uuid, original: Envelope) -> oneshot::Receiver<Envelope> {
        let (sender, receiver) = oneshot::channel();
        let mut tables = self.tables.lock();
        tables.requests.insert(id, original);
        if tables.responses.insert(id, sender).is_some() {
            // Cannot happen with generated ids; the displaced caller's
            // receiver reports a closed channel rather than hanging.
            warn!(%id, "correlation id registered twice; displacing prior waiter");
        }
        receiver
    }

    /// Fulfill the pending future for `id`. Late, duplicate, or mis-tagged
    /// responses resolve nothing and return false.
    pub fn resolve(&self, id: Uuid, envelope: Envelope) -> bool {
        let sender = {
            let mut tables = self.tables.lock();
            let sender = tables.responses.remove(&id);
            if sender.is_some() {
                tables.requests.remove(&id);
            }
            sender
        };
        match sender {
            // The caller may have gone away; a dropped receiver is fine.
            Some(sender) => {
                let _ = sender.send(envelope);
                true
            }
            None => false,
        }
    }

    /// Drop the entries for `id` without resolving, e.g. when the publish
    /// that would have produced a response failed.
    pub fn forget(&self, id: Uuid) {
        let mut tables = self.tables.lock();
        tables.responses.remove(&id);
        tables.requests.remove(&id);
    }

    /// The original envelope of an unresolved request, for diagnostics.
    pub fn original(&self, id: Uuid) -> Option<Envelope> {
        self.tables.lock().requests.get(&id).cloned()
    }

    pub fn outstanding(&self) -> usize {
        self.tables.lock().responses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_wire::Properties;

    fn envelope(id: Uuid) -> Envelope {
        Envelope {
            properties: Properties {
                message_id: id,
                type_tag: "test.message".to_string(),
                correlation_id: id,
                reply_to: None,
            },
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn resolve_fulfills_the_registered_future() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let pending = correlator.register(id, envelope(id));
        assert_eq!(correlator.outstanding(), 1);
        assert!(correlator.original(id).is_some());
        assert!(correlator.resolve(id, envelope(id)));
        let resolved = pending.await.expect("resolved");
        assert_eq!(resolved.properties.correlation_id, id);
        assert_eq!(correlator.outstanding(), 0);
        assert!(correlator.original(id).is_none());
    }

    #[tokio::test]
    async fn unknown_id_resolves_nothing() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(Uuid::new_v4(), envelope(Uuid::new_v4())));
    }

    #[tokio::test]
    async fn double_resolve_is_a_no_op() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let _pending = correlator.register(id, envelope(id));
        assert!(correlator.resolve(id, envelope(id)));
        assert!(!correlator.resolve(id, envelope(id)));
    }

    #[tokio::test]
    async fn forget_leaves_the_future_unresolvable() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let pending = correlator.register(id, envelope(id));
        correlator.forget(id);
        assert!(!correlator.resolve(id, envelope(id)));
        assert!(pending.await.is_err());
    }
}
