use snafu::Snafu;

use crate::{balancer, circuit_breaker, persistence, protocol, provider, queue, resolver};

/// Stable error kinds, independent of display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    SubstitutionError,
    MethodNotSupported,
    ProviderNotFound,
    ProviderUnavailable,
    ProviderTimeout,
    ProviderError,
    CircuitOpen,
    DependencyFailed,
    Cancelled,
    CrashRecovered,
    PersistenceError,
}

impl ErrorKind {
    /// Whether the engine's retry manager should attempt this kind again.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderUnavailable
                | ErrorKind::ProviderTimeout
                | ErrorKind::ProviderError
                | ErrorKind::CircuitOpen
        )
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::SubstitutionError => "SUBSTITUTION_ERROR",
            ErrorKind::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorKind::ProviderNotFound => "PROVIDER_NOT_FOUND",
            ErrorKind::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorKind::ProviderTimeout => "PROVIDER_TIMEOUT",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::CrashRecovered => "CRASH_RECOVERED",
            ErrorKind::PersistenceError => "PERSISTENCE_ERROR",
        }
    }
}

/// A structured task/workflow-facing error: stable code, human message, optional data.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskError {
    pub kind_code: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl TaskError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind_code: kind.code().to_string(),
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind_code.as_str(),
            "PROVIDER_UNAVAILABLE" | "PROVIDER_TIMEOUT" | "PROVIDER_ERROR" | "CIRCUIT_OPEN"
        )
    }
}

/// Crate-wide error, aggregating every subsystem's error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("protocol registry error: {source}"))]
    Protocol { source: protocol::Error },

    #[snafu(display("provider registry error: {source}"))]
    Provider { source: provider::Error },

    #[snafu(display("load balancer error: {source}"))]
    Balancer { source: balancer::Error },

    #[snafu(display("circuit breaker error: {source}"))]
    CircuitBreaker { source: circuit_breaker::Error },

    #[snafu(display("persistence error: {source}"))]
    Persistence { source: persistence::Error },

    #[snafu(display("queue error: {source}"))]
    Queue { source: queue::Error },

    #[snafu(display("resolver error: {source}"))]
    Resolver { source: resolver::Error },

    #[snafu(display("task error: {error:?}"))]
    Task { error: TaskError },

    #[snafu(display("workflow {id} not found"))]
    WorkflowNotFound { id: String },

    #[snafu(display("workflow {id} contains a dependency cycle"))]
    CyclicWorkflow { id: String },
}

impl From<protocol::Error> for Error {
    fn from(source: protocol::Error) -> Self {
        Error::Protocol { source }
    }
}

impl From<provider::Error> for Error {
    fn from(source: provider::Error) -> Self {
        Error::Provider { source }
    }
}

impl From<balancer::Error> for Error {
    fn from(source: balancer::Error) -> Self {
        Error::Balancer { source }
    }
}

impl From<circuit_breaker::Error> for Error {
    fn from(source: circuit_breaker::Error) -> Self {
        Error::CircuitBreaker { source }
    }
}

impl From<persistence::Error> for Error {
    fn from(source: persistence::Error) -> Self {
        Error::Persistence { source }
    }
}

impl From<queue::Error> for Error {
    fn from(source: queue::Error) -> Self {
        Error::Queue { source }
    }
}

impl From<resolver::Error> for Error {
    fn from(source: resolver::Error) -> Self {
        Error::Resolver { source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
