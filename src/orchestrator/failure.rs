//! Failure classification for encoder runs.

use reelforge_av::error::{is_no_space_io, mentions_no_space};
use reelforge_av::RunError;

/// Diagnostic fragments meaning the source itself cannot be encoded.
/// Matched case-insensitively; retrying would fail the same way.
const BENIGN_FAILURES: [&str; 3] = [
    "output file is empty",
    "invalid data found when processing input",
    "unable to find a suitable output format",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Source or configuration problem; never retried.
    Permanent,
    /// Anything else that went wrong; retried up to the ceiling.
    Transient,
    /// Disk full or similar; surfaced, not retried.
    ResourceExhausted,
    /// Watchdog expired and the process was killed.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "encoder",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

pub fn is_benign(text: &str) -> bool {
    let lower = text.to_lowercase();
    BENIGN_FAILURES.iter().any(|needle| lower.contains(needle))
}

/// Classify free-form diagnostic text.
pub fn classify_text(text: &str) -> FailureKind {
    if mentions_no_space(text) {
        FailureKind::ResourceExhausted
    } else if is_benign(text) {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

pub fn classify_run(err: &RunError) -> FailureKind {
    match err {
        RunError::Spawn(e) | RunError::Io(e) if is_no_space_io(e) => FailureKind::ResourceExhausted,
        RunError::Spawn(_) | RunError::Io(_) | RunError::NoOutput => FailureKind::Transient,
        RunError::Failed { detail, .. } => classify_text(detail),
    }
}

pub fn classify_av(err: &reelforge_av::Error) -> FailureKind {
    match err {
        reelforge_av::Error::Timeout { .. } => FailureKind::Timeout,
        e if e.is_no_space() => FailureKind::ResourceExhausted,
        reelforge_av::Error::ToolNotFound { .. } | reelforge_av::Error::InvalidInput(_) => {
            FailureKind::Permanent
        }
        reelforge_av::Error::ToolFailed { message, .. } => classify_text(message),
        _ => FailureKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_matches_ignore_case() {
        assert!(is_benign("x.mp4: Invalid data found when processing input"));
        assert!(is_benign("OUTPUT FILE IS EMPTY, nothing was encoded"));
        assert!(!is_benign("Conversion failed!"));
    }

    #[test]
    fn failed_run_classification() {
        let benign = RunError::Failed {
            code: Some(1),
            detail: "Unable to find a suitable output format for 'x'".into(),
        };
        assert_eq!(classify_run(&benign), FailureKind::Permanent);

        let disk = RunError::Failed {
            code: Some(1),
            detail: "av_interleaved_write_frame(): No space left on device".into(),
        };
        assert_eq!(classify_run(&disk), FailureKind::ResourceExhausted);

        let other = RunError::Failed {
            code: Some(137),
            detail: "Killed".into(),
        };
        assert_eq!(classify_run(&other), FailureKind::Transient);
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
    }

    #[test]
    fn no_space_io_is_resource_exhausted() {
        let err = RunError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(classify_run(&err), FailureKind::ResourceExhausted);
        assert_eq!(classify_run(&RunError::NoOutput), FailureKind::Transient);
    }

    #[test]
    fn tool_timeout_is_timeout() {
        let err = reelforge_av::Error::Timeout {
            tool: "ffmpeg".into(),
            after: std::time::Duration::from_secs(5),
        };
        assert_eq!(classify_av(&err), FailureKind::Timeout);
    }
}
