//! Node-local event bus
//!
//! Components subscribe with an [`EventFilter`](api::EventFilter) and receive
//! matching events on an unbounded channel. The partition service publishes
//! ownership changes here; consumer managers listen for them.

pub(crate) mod error;
pub(crate) mod event;
pub(crate) mod manager;

// Public API module - the only public interface for the notification system
pub mod api;
