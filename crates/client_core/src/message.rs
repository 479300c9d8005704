use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageTarget, Submessage, TopicLink, UserId},
    protocol::{MessageEvent, MessageFlag},
};

use crate::local_id::{DisplayId, LocalId};

/// The user this session sends as; stamped onto locally echoed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderProfile {
    pub user_id: UserId,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub read: bool,
    pub starred: bool,
    pub collapsed: bool,
    pub mentioned: bool,
    pub wildcard_mentioned: bool,
    pub alerted: bool,
}

impl MessageFlags {
    pub fn from_wire(flags: &[MessageFlag]) -> Self {
        let mut out = Self::default();
        for flag in flags {
            match flag {
                MessageFlag::Read => out.read = true,
                MessageFlag::Starred => out.starred = true,
                MessageFlag::Collapsed => out.collapsed = true,
                MessageFlag::Mentioned => out.mentioned = true,
                MessageFlag::WildcardMentioned => out.wildcard_mentioned = true,
                MessageFlag::HasAlertWord => out.alerted = true,
                MessageFlag::Other => {}
            }
        }
        out
    }
}

/// A message as held by the store, the pending registry and the views.
///
/// While `locally_echoed` is set the message is pending: its `id` is
/// provisional and it is tracked by the registry under `local_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: DisplayId,
    pub local_id: Option<LocalId>,
    pub sender_id: UserId,
    pub sender_full_name: String,
    pub sender_email: Option<String>,
    pub target: MessageTarget,
    pub content: String,
    pub raw_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub topic_links: Vec<TopicLink>,
    pub submessages: Vec<Submessage>,
    pub is_me_message: bool,
    pub flags: MessageFlags,
    pub locally_echoed: bool,
    pub failed: bool,
}

impl Message {
    pub fn server_id(&self) -> Option<MessageId> {
        self.id.server_id()
    }

    /// Copies the fields only the server can compute onto this message.
    pub fn merge_server_fields(&mut self, event: &MessageEvent) {
        self.timestamp = event.timestamp;
        self.topic_links = event.topic_links.clone();
        self.submessages = event.submessages.clone();
        self.is_me_message = event.is_me_message;
        self.flags = MessageFlags::from_wire(&event.flags);
    }
}

impl From<MessageEvent> for Message {
    fn from(event: MessageEvent) -> Self {
        let flags = MessageFlags::from_wire(&event.flags);
        Self {
            id: DisplayId::Server(event.id),
            local_id: event.local_id.map(LocalId::from),
            sender_id: event.sender_id,
            sender_full_name: event.sender_full_name.unwrap_or_default(),
            sender_email: None,
            target: event.target,
            content: event.content,
            raw_content: None,
            timestamp: event.timestamp,
            topic_links: event.topic_links,
            submessages: event.submessages,
            is_me_message: event.is_me_message,
            flags,
            locally_echoed: false,
            failed: false,
        }
    }
}
