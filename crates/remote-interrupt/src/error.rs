//! Error types for identity resolution and interrupt dispatch.
//!
//! Resolution errors never reach the user; the resolver logs them and the
//! session ends up with an empty identity. Dispatch errors are surfaced only
//! when the user asks for an interrupt.

/// Broad classification used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    IntrospectionFailure,
    NotRemoteKernel,
    Unresolved,
    TransportFailure,
    ApplicationFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::IntrospectionFailure => write!(f, "introspection_failure"),
            FailureKind::NotRemoteKernel => write!(f, "not_remote_kernel"),
            FailureKind::Unresolved => write!(f, "unresolved"),
            FailureKind::TransportFailure => write!(f, "transport_failure"),
            FailureKind::ApplicationFailure => write!(f, "application_failure"),
        }
    }
}

/// Failure to read pid/host back from a kernel.
#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    #[error("Kernel has no connection file")]
    NoConnection,

    #[error("Failed to read connection file: {0}")]
    ConnectionFile(#[from] std::io::Error),

    #[error("Kernel communication failed: {0}")]
    Kernel(String),

    #[error("Execution status was '{0}'")]
    ExecutionStatus(String),

    #[error("Expression '{name}' failed: {reason}")]
    Expression { name: String, reason: String },

    #[error("Malformed introspection reply: {0}")]
    MalformedReply(String),

    #[error("Introspection timed out")]
    Timeout,
}

impl IntrospectionError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::IntrospectionFailure
    }
}

/// Failure to interrupt the remote kernel.
#[derive(Debug, thiserror::Error)]
pub enum InterruptError {
    #[error("'{display_name}' is not a remote kernel")]
    NotRemoteKernel { display_name: String },

    #[error("Remote kernel address is not resolved")]
    Unresolved,

    #[error("Interrupt request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Interrupt endpoint returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Malformed interrupt response: {0}")]
    MalformedResponse(String),

    #[error("Backend failed to interrupt the kernel (code {code})")]
    Application { code: i64 },

    #[error("Invalid interrupt endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Generic message shown for any failure past the local guards.
pub const GENERIC_FAILURE_MESSAGE: &str = "Could not interrupt the remote kernel";

impl InterruptError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InterruptError::NotRemoteKernel { .. } => FailureKind::NotRemoteKernel,
            InterruptError::Unresolved => FailureKind::Unresolved,
            InterruptError::Application { .. } => FailureKind::ApplicationFailure,
            InterruptError::Transport(_)
            | InterruptError::HttpStatus { .. }
            | InterruptError::MalformedResponse(_)
            | InterruptError::InvalidEndpoint(_) => FailureKind::TransportFailure,
        }
    }

    /// Whether the request was refused before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            InterruptError::NotRemoteKernel { .. } | InterruptError::Unresolved
        )
    }

    /// Human-readable reason for the error toast.
    pub fn user_message(&self) -> &'static str {
        match self {
            InterruptError::NotRemoteKernel { .. } => "This is not a remote kernel",
            InterruptError::Unresolved => {
                "The remote kernel address is not known yet, try again in a moment"
            }
            _ => GENERIC_FAILURE_MESSAGE,
        }
    }
}
