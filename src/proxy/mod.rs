//! Outbound request execution against backend services.

pub mod forwarder;

pub use forwarder::{AttemptOutcome, ForwardAttempt, ForwardOutcome, ForwardResult, Forwarder};
