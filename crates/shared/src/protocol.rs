use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageTarget, QueueId, Submessage, TopicLink, UserId},
    error::ApiError,
};

/// A composed message as handed from the compose box to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub queue_id: QueueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resend: bool,
}

impl MessageRequest {
    pub fn new(
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        queue_id: QueueId,
    ) -> Self {
        Self {
            sender_id,
            target,
            content: content.into(),
            queue_id,
            draft_id: None,
            local_id: None,
            resend: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_visibility_policy: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFlag {
    Read,
    Starred,
    Collapsed,
    Mentioned,
    WildcardMentioned,
    HasAlertWord,
    #[serde(other)]
    Other,
}

/// Event-stream notification for a newly persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Present only on the client instance that originated the send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_full_name: Option<String>,
    pub target: MessageTarget,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub topic_links: Vec<TopicLink>,
    #[serde(default)]
    pub is_me_message: bool,
    #[serde(default)]
    pub submessages: Vec<Submessage>,
    #[serde(default)]
    pub flags: Vec<MessageFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        message: MessageEvent,
    },
    UpdateMessage {
        message_id: MessageId,
        rendered_content: String,
    },
    DeleteMessage {
        message_ids: Vec<MessageId>,
    },
    Heartbeat,
    Error(ApiError),
}
