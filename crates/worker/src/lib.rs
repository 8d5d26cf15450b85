//! Operator-facing boundary for the generation relay.
//!
//! Reads commands line by line, forwards generation requests to
//! [`relay_comfyui::generator::ImageGenerator`], and writes the resulting
//! images to disk.

pub mod command;
pub mod session;
