//! UniAssist timeline delivery service.
//!
//! Runs the durable event delivery pipeline: providers hand interaction
//! events to [`services::AdmissionService`], which stores them on the
//! session timeline and enqueues a delivery envelope in the same
//! transaction. The delivery worker drives envelopes to the Redis streams
//! and the stream consumer bridges them to the fan-out layer, closing the
//! loop on the outbox.

pub mod config;
pub mod db;
pub mod services;
pub mod workers;

pub use config::Config;
