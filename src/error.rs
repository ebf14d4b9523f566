//! Error types for sdm-extract

use thiserror::Error;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sdm-extract
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing run configuration (nothing has been launched yet)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to launch Chrome
    #[error("Failed to launch Chrome: {0}")]
    Launch(String),

    /// Chrome not found
    #[error("Chrome not found")]
    ChromeNotFound,

    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// CDP protocol error
    #[error("CDP error in {method}: {message} (code {code})")]
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// JavaScript evaluation failed inside a page or frame
    #[error("Script error in {context}: {message}")]
    Script { context: String, message: String },

    /// Navigation error
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// Main document answered with something other than 200
    #[error("Failed to load {url}: HTTP {status}")]
    HttpStatus { url: String, status: i64 },

    /// No frame matched any form signature
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// Search form controls never became visible
    #[error("Form not ready: {0}")]
    FormNotReady(String),

    /// A control did not read back the value that was written to it
    #[error("Input mismatch on '{selector}': expected '{expected}', got '{actual}'")]
    InputMismatch {
        selector: String,
        expected: String,
        actual: String,
    },

    /// No submit affordance could be located
    #[error("Submission target not found: {0}")]
    SubmissionTarget(String),

    /// Submission produced neither a popup nor a frame holding the detail table
    #[error("Result not found: {0}")]
    ResultNotFound(String),

    /// The result popup went away while we were still reading from it
    #[error("Popup window closed unexpectedly")]
    PopupClosed,

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; raised before any browser exists
    Configuration,
    /// Target application unreachable or answering with an error
    Navigation,
    /// Frame, popup or result context could not be resolved
    Resolution,
    /// A form control read back an unexpected value
    Verification,
    /// Browser process, protocol, or local IO failure
    Browser,
}

impl ErrorCategory {
    /// Process exit code for an unrecovered failure of this category
    pub fn exit_code(self) -> i32 {
        1
    }
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a CDP error with full context
    pub fn cdp(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a script error
    pub fn script(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an input mismatch error
    pub fn mismatch(
        selector: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InputMismatch {
            selector: selector.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Configuration,
            Error::Navigation(_) | Error::HttpStatus { .. } => ErrorCategory::Navigation,
            Error::FrameNotFound(_)
            | Error::FormNotReady(_)
            | Error::SubmissionTarget(_)
            | Error::ResultNotFound(_)
            | Error::PopupClosed => ErrorCategory::Resolution,
            Error::InputMismatch { .. } => ErrorCategory::Verification,
            _ => ErrorCategory::Browser,
        }
    }

    /// True when the error means the execution context went away
    /// (frame detached, world destroyed, target closed)
    pub fn is_context_lost(&self) -> bool {
        match self {
            Error::Cdp { message, .. } => {
                message.contains("Cannot find context")
                    || message.contains("No frame")
                    || message.contains("Frame with the given id")
                    || message.contains("No target")
                    || message.contains("Session with given id not found")
            }
            Error::Transport { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            Error::Config("missing".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::HttpStatus {
                url: "http://x".into(),
                status: 404
            }
            .category(),
            ErrorCategory::Navigation
        );
        assert_eq!(Error::PopupClosed.category(), ErrorCategory::Resolution);
        assert_eq!(
            Error::mismatch("#ticket_type", "go_chg", "go_in").category(),
            ErrorCategory::Verification
        );
        assert_eq!(Error::ChromeNotFound.category(), ErrorCategory::Browser);
    }

    #[test]
    fn test_every_category_exits_nonzero() {
        for category in [
            ErrorCategory::Configuration,
            ErrorCategory::Navigation,
            ErrorCategory::Resolution,
            ErrorCategory::Verification,
            ErrorCategory::Browser,
        ] {
            assert_ne!(category.exit_code(), 0);
        }
    }

    #[test]
    fn test_context_lost_detection() {
        let err = Error::cdp(
            "Runtime.evaluate",
            -32000,
            "Cannot find context with specified id",
        );
        assert!(err.is_context_lost());
        assert!(!Error::Timeout("x".into()).is_context_lost());
    }

    #[test]
    fn test_mismatch_message() {
        let err = Error::mismatch("input[name=\"searchKey\"]", "21236341", "2123");
        assert_eq!(
            err.to_string(),
            "Input mismatch on 'input[name=\"searchKey\"]': expected '21236341', got '2123'"
        );
    }
}
