//! Error types for reelforge-av.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from external tool invocations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required external tool is not available.
    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    /// An external tool ran and failed.
    #[error("tool execution failed: {tool}: {message}")]
    ToolFailed { tool: String, message: String },

    /// An external tool exceeded its time limit and was killed.
    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    /// Failed to parse tool output.
    #[error("failed to parse {tool} output: {message}")]
    ParseError { tool: String, message: String },

    /// A required input file does not exist.
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn parse_error(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// True when the failure came from a full disk, either as an OS error
    /// or as the tool's own diagnostic text.
    pub fn is_no_space(&self) -> bool {
        match self {
            Self::Io(e) => is_no_space_io(e),
            Self::ToolFailed { message, .. } => mentions_no_space(message),
            _ => false,
        }
    }
}

/// True for `ENOSPC`.
pub fn is_no_space_io(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}

/// True when diagnostic text reports a full disk.
pub fn mentions_no_space(text: &str) -> bool {
    text.to_ascii_lowercase().contains("no space left on device")
}

impl From<Error> for reelforge_common::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => reelforge_common::Error::Io(io),
            Error::ToolNotFound { tool } => {
                reelforge_common::Error::tool(tool.clone(), format!("{tool} not found"))
            }
            Error::ToolFailed { tool, message } => reelforge_common::Error::tool(tool, message),
            Error::Timeout { tool, after } => {
                reelforge_common::Error::tool(tool, format!("timed out after {after:?}"))
            }
            other => reelforge_common::Error::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_space_detection() {
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(Error::Io(io).is_no_space());
        assert!(Error::tool_failed("ffmpeg", "av_interleaved_write_frame(): No space left on device")
            .is_no_space());
        assert!(!Error::tool_failed("ffmpeg", "Invalid data found").is_no_space());
    }

    #[test]
    fn converts_to_common_error() {
        let err: reelforge_common::Error = Error::tool_failed("mp4hls", "exit 2").into();
        assert!(matches!(err, reelforge_common::Error::Tool { .. }));
    }
}
