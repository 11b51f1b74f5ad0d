//! Deduplicating cache-aside query dispatcher.
//!
//! Clients submit keyword queries; the first submitter of a keyword claims it
//! and enqueues a search job, everyone else gets a request handle to poll.
//! Workers persist results to the primary store and reads are spread across
//! its replicas.

pub mod app;
pub mod cli;
pub mod config;
pub mod latest;
pub mod logging;
pub mod query;
pub mod queue;
pub mod replica;
pub mod router;
pub mod search;
pub mod state;
pub mod store;
pub mod utils;
pub mod web;
pub mod worker;
