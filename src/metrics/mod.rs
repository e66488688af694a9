//! Metrics Module
//!
//! Prometheus counters fed from the server event stream.

pub mod collector;

pub use collector::Metrics;
