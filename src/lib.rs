//! # Threadwatch
//!
//! Watches chat threads, asks an LLM whether they describe an actionable
//! issue, and files or updates a tracker issue for each one.

pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub use migration;
