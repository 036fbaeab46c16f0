// rendezvous-core/src/error.rs

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Error, Debug)]
pub enum CoordinationError {

    #[error("Deadline exceeded: {message}")]
    DeadlineExceeded {
        message: String,
    },

    #[error("Not found: {message}")]
    NotFound {
        message: String,
    },

    #[error("Aborted: {message}")]
    Aborted {
        message: String,
    },

    #[error("Already exists: {message}")]
    AlreadyExists {
        message: String,
    },

    #[error("Failed precondition: {message}")]
    FailedPrecondition {
        message: String,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
    },

    #[error("Coordinator unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

// Convenience constructors
impl CoordinationError {

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a node agent may retry the failed call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<CoordinationError> for Status {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::DeadlineExceeded { message } => Status::deadline_exceeded(message),
            CoordinationError::NotFound { message } => Status::not_found(message),
            CoordinationError::Aborted { message } => Status::aborted(message),
            CoordinationError::AlreadyExists { message } => Status::already_exists(message),
            CoordinationError::FailedPrecondition { message } => {
                Status::failed_precondition(message)
            }
            CoordinationError::InvalidArgument { message } => Status::invalid_argument(message),
            CoordinationError::Unavailable { message, .. } => Status::unavailable(message),
            CoordinationError::Config { message, .. } => Status::internal(message),
        }
    }
}

impl From<Status> for CoordinationError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::DeadlineExceeded => Self::deadline_exceeded(message),
            Code::NotFound => Self::not_found(message),
            Code::Aborted | Code::Cancelled => Self::aborted(message),
            Code::AlreadyExists => Self::already_exists(message),
            Code::FailedPrecondition => Self::failed_precondition(message),
            Code::InvalidArgument | Code::OutOfRange => Self::invalid_argument(message),
            _ => Self::unavailable_with_source(message, status),
        }
    }
}
