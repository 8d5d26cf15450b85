//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed push-channel message parsing, a per-request execution
//! monitor, HTTP API wrappers, workflow templating, error classification,
//! and the [`generator::ImageGenerator`] that ties them into a single
//! `generate_image` call.

pub mod api;
pub mod classify;
pub mod client;
pub mod config;
pub mod events;
pub mod generator;
pub mod history;
pub mod messages;
pub mod monitor;
pub mod template;
