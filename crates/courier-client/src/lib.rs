// Request/reply correlation layer over a pub/sub broker.
//
// The broker gives us one-way, fire-and-forget delivery; this crate turns
// that into synchronous-looking request/response calls that stay correct
// under concurrency.
//
// DESIGN NOTES (courier-client)
// -----------------------------
// A) Correlation, not ordering
//    - Every request carries a uuid correlation id; responses echo it. N
//      concurrent requests can share one reply queue because each pending
//      future is keyed by its own id; delivery order never matters.
//    - The pending tables live on the Connection and are resolved by the
//      reply-queue consumer's response path.
//
// B) Channels are cached, not pooled
//    - Provisioning a broker channel is comparatively expensive, so open
//      calls are satisfied from a cache keyed by the full attribute tuple
//      (role, exchange, queue, auto_delete, exclusive). Equal attributes
//      share one instance; anything else gets its own.
//    - Each channel's raw broker handle sits behind its own async mutex;
//      publish and ack calls never interleave from two tasks.
//
// C) Classification by reply address alone
//    - A delivery with a non-empty reply-to is a request; everything else
//      is a response. Handlers never need to know which kind they are
//      about to receive.
//    - Deliveries are acknowledged before processing. That is a deliberate
//      at-least-once trade: a crash mid-handler loses the message instead
//      of looping it back at the consumer.
//
// D) Requests are never left silent
//    - A handler failure, a missing route, an undecodable request body:
//      each is answered with a fault response carrying the failure text,
//      because the requester is suspended waiting. Failures on the
//      response path are logged and dropped; nobody is waiting on those.

#[macro_use]
mod macros;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod correlation;
pub mod handler;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ChannelKey, ChannelRole};
pub use config::ClientConfig;
pub use connection::Connection;
pub use consumer::Consumer;
pub use correlation::Correlator;
pub use handler::{
    CallbackHandler, CorrelationHandler, DispatchHandler, Handler, HandlerError, HandlerRegistry,
};

// Re-export the wire-level vocabulary so most callers depend on one crate.
pub use courier_wire::{Envelope, Fault, Message, Properties, Request};
