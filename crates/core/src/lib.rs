//! Shared types for the image-generation relay.
//!
//! Kept free of any transport dependency: actor identifiers, the
//! classified error taxonomy, the per-actor admission gate, and the
//! request context that carries cancellation and deadlines through
//! every blocking stage.

pub mod context;
pub mod error;
pub mod gate;
pub mod types;
