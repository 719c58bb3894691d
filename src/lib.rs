//! Live facial blendshape streaming.
//!
//! A producer (thread or child process) turns frames into [`types::Sample`]s
//! and publishes them into a depth-1 overwrite channel. The
//! [`server::StreamingServer`] accepts one WebSocket client at a time and
//! forwards the latest sample on a fixed cadence.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod types;
