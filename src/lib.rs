//! Reelforge - video transcoding orchestration engine
//!
//! Turns one source video into a ladder of renditions: single-shot or
//! chunked encodes dispatched to a worker pool, reassembly of chunk groups,
//! HLS packaging of the primary renditions, and lossless trimming.
//!
//! This library crate exposes the engine for the binary and for
//! integration testing.

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod media_tools;
pub mod orchestrator;
pub mod packaging;
pub mod processes;
pub mod trim;
pub mod worker;

pub use orchestrator::{EncodeReport, EncodeRequest, ImportRequest, Orchestrator};
