use std::collections::HashMap;
use std::fmt;

/// Parameter name to value, as produced by [`crate::args::parse_action_input`].
pub type ArgumentMap = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorKind {
    AccessDenied,
    NotFound,
    InvalidArgument,
    Timeout,
    IoFailure,
}

impl ActionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Timeout => "timeout",
            Self::IoFailure => "io_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::AccessDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::InvalidArgument, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::IoFailure, message)
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ActionErrorKind::AccessDenied => write!(f, "Access denied: {}", self.message),
            _ => write!(f, "Error: {}", self.message),
        }
    }
}

impl std::error::Error for ActionError {}

pub type ActionResult<T> = Result<T, ActionError>;

/// Outcome of one external process run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Error class of a run that did not succeed, if any.
    pub fn error_kind(&self) -> Option<ActionErrorKind> {
        if self.timed_out {
            Some(ActionErrorKind::Timeout)
        } else if self.succeeded {
            None
        } else {
            Some(ActionErrorKind::IoFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionError, ActionErrorKind, ExecutionResult};

    #[test]
    fn access_denied_renders_with_its_own_prefix() {
        let err = ActionError::access_denied("path `../x` escapes the root");
        assert_eq!(err.to_string(), "Access denied: path `../x` escapes the root");
        assert_eq!(err.kind.as_str(), "access_denied");
    }

    #[test]
    fn other_kinds_render_as_errors() {
        let err = ActionError::new(ActionErrorKind::Timeout, "took too long");
        assert_eq!(err.to_string(), "Error: took too long");
        assert_eq!(ActionError::not_found("x").kind.as_str(), "not_found");
    }

    #[test]
    fn timed_out_runs_classify_as_timeout() {
        let mut result = ExecutionResult {
            succeeded: false,
            stdout: "partial".to_owned(),
            stderr: String::new(),
            exit_code: None,
            timed_out: true,
        };
        assert_eq!(result.error_kind(), Some(ActionErrorKind::Timeout));
        result.timed_out = false;
        assert_eq!(result.error_kind(), Some(ActionErrorKind::IoFailure));
        result.succeeded = true;
        assert_eq!(result.error_kind(), None);
    }
}
