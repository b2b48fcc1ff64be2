//! Lossless stream-copy operations and adaptive-streaming packaging.
//!
//! All of these are one-shot [`crate::ToolCommand`] invocations with a time
//! limit supplied by the caller.

pub mod concat;
pub mod cut;
pub mod package;
pub mod segment;

pub use concat::concat;
pub use cut::cut;
pub use package::{merge_into, package, MANIFEST_NAME};
pub use segment::segment;
