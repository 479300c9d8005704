use shared::error::ApiError;
use thiserror::Error;

use crate::local_id::LocalId;

/// Misuse of the echo/reconcile API by a caller. Policy refusals (no id
/// available, echo not eligible) are `None` results, never errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EchoError {
    #[error("no pending message with local id '{0}'")]
    UnknownLocalId(LocalId),
    #[error("send for local id '{0}' was aborted")]
    Aborted(LocalId),
    #[error("message with local id '{0}' has not failed; nothing to resend")]
    NotFailed(LocalId),
    #[error("send for local id '{0}' was already acknowledged by the server")]
    AlreadyAcked(LocalId),
    #[error("message with local id '{0}' was already reconciled; edit it by server id")]
    AlreadyReconciled(LocalId),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected send with status {status}: {}", .error.msg)]
    Api { status: u16, error: ApiError },
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout(),
            Self::Api { .. } => false,
        }
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}
