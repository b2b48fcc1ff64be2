//! Database query modules.

pub mod chunk_groups;
pub mod encodings;
pub mod media;
pub mod profiles;
pub mod trim_requests;
