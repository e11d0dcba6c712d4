//! Caller identity from bearer tokens.
//!
//! The gateway does not issue tokens. It only validates the ones it is handed and uses
//! the `sub` claim as the user id for per-identity rate limiting.

pub mod jwt;

pub use jwt::{JwtClaims, JwtValidator};
