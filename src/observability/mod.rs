// Backend health probing
pub mod health;

// Structured logging
pub mod logging;

// Prometheus metrics
pub mod metrics;

// Re-export commonly used types for convenience
pub use health::{HealthMonitor, HealthProbe, HealthStatus, HttpHealthProbe, ServiceHealth};
pub use logging::init_logging;
