//! Thin HTTP binding of the submit/poll protocol.

pub mod error;
pub mod middleware;
pub mod query;
pub mod routes;
pub mod status;

pub use routes::*;
