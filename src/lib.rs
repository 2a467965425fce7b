//! Fleet log monitoring
//!
//! A hub provisions tailing agents over SSH, receives their batched log
//! lines over one websocket per (target, file), runs every line through
//! scriptable filter pipelines and keeps a bounded history of matches per
//! sub filter for a dashboard to query.

pub mod actors;
pub mod agent;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod ssh;
pub mod transport;

pub use error::{Error, Result};
