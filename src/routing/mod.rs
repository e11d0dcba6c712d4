//! Inbound path to backend service resolution.

pub mod router;

pub use router::{RouteMatch, Router, RouterBuilder};
