use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(StreamId);
id_newtype!(MessageId);

/// Opaque identifier of the client's event queue registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub String);

impl QueueId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Where a message is addressed: a stream topic or a direct-message conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageTarget {
    Stream { stream_id: StreamId, topic: String },
    Direct { recipient_ids: BTreeSet<UserId> },
}

impl MessageTarget {
    pub fn stream(stream_id: StreamId, topic: impl Into<String>) -> Self {
        Self::Stream {
            stream_id,
            topic: topic.into(),
        }
    }

    pub fn direct(recipient_ids: impl IntoIterator<Item = UserId>) -> Self {
        Self::Direct {
            recipient_ids: recipient_ids.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLink {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submessage {
    pub id: i64,
    pub sender_id: UserId,
    pub msg_type: String,
    pub content: String,
}
