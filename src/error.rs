//! Errors returned by the control plane to its callers.

use crate::agents::auth::AuthError;
use crate::agents::channel::ChannelError;
use crate::agents::proto::Code;
use crate::storage::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Authentication(#[from] AuthError),

    /// The agent connection failed or was closed while waiting.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("pmm-agent with ID {0:?} is not currently connected")]
    NotConnected(String),

    /// The agent answered, but with an embedded error.
    #[error("{0}")]
    Application(String),

    #[error("unexpected response from agent: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("retries exhausted for job {0:?}")]
    RetriesExhausted(String),
}

impl Error {
    /// Status code an API layer should report for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::Authentication(e) => e.code(),
            Error::Channel(ChannelError::DeadlineExceeded(_)) => Code::DeadlineExceeded,
            Error::Channel(ChannelError::Remote(status)) => status.code,
            Error::Channel(_) => Code::Unavailable,
            Error::NotConnected(_) | Error::FailedPrecondition(_) | Error::RetriesExhausted(_) => {
                Code::FailedPrecondition
            }
            Error::Application(_) => Code::Internal,
            Error::UnexpectedResponse { .. } => Code::Internal,
            Error::Store(e) if e.is_not_found() => Code::NotFound,
            Error::Store(_) => Code::Internal,
            Error::InvalidArgument(_) => Code::InvalidArgument,
        }
    }
}
