use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    /// The event queue the client registered is gone; client state is stale.
    BadEventQueueId,
    StreamWildcardMentionNotAllowed,
    TopicWildcardMentionNotAllowed,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Codes that the compose UI renders as a dedicated banner instead of a
    /// generic send failure.
    pub fn is_mention_restriction(&self) -> bool {
        matches!(
            self,
            Self::StreamWildcardMentionNotAllowed | Self::TopicWildcardMentionNotAllowed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    #[serde(alias = "message")]
    pub msg: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}
