//! Gateway dispatch service and its HTTP surface.

pub mod server;
pub mod service;

pub use server::{build_app, serve, AppState};
pub use service::{GatewayService, ServiceStatus};
