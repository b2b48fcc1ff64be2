//! Reelforge-Common: shared types, IDs, and errors.
//!
//! - **Typed IDs**: UUID wrappers for media, profiles, encodings and trim requests
//! - **Core Types**: codecs, containers, job statuses, trim actions, time ranges and probed media info
//! - **Error Handling**: common error type and result alias
//!
//! # Examples
//!
//! ```
//! use reelforge_common::{Codec, Container, EncodingStatus, MediaId};
//!
//! let media_id = MediaId::new();
//! assert_eq!(Codec::Vp9.container(), Container::Webm);
//! assert!(EncodingStatus::Pending.is_live());
//! # let _ = media_id;
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
