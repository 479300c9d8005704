use std::collections::BTreeMap;

use shared::domain::MessageId;

use crate::{
    local_id::{DisplayId, LocalId},
    message::Message,
};

/// Primary in-memory message store, ordered by display id.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: BTreeMap<DisplayId, Message>,
    max_server_id: Option<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the highest id known from the initial server snapshot, before
    /// any messages have been loaded.
    pub fn with_max_message_id(max_message_id: MessageId) -> Self {
        Self {
            messages: BTreeMap::new(),
            max_server_id: Some(max_message_id),
        }
    }

    pub fn max_server_id(&self) -> Option<MessageId> {
        self.max_server_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: DisplayId) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn get_mut(&mut self, id: DisplayId) -> Option<&mut Message> {
        self.messages.get_mut(&id)
    }

    /// Most recent stored message sent under `local_id`.
    pub fn find_by_local_id(&self, local_id: &LocalId) -> Option<&Message> {
        self.messages
            .values()
            .rev()
            .find(|message| message.local_id.as_ref() == Some(local_id))
    }

    pub fn insert(&mut self, message: Message) {
        if let Some(server_id) = message.server_id() {
            self.observe_server_id(server_id);
        }
        self.messages.insert(message.id, message);
    }

    pub fn remove(&mut self, id: DisplayId) -> Option<Message> {
        self.messages.remove(&id)
    }

    /// Records a server id learned outside the store (for example from a
    /// send acknowledgement) so allocation stays above it.
    pub fn note_server_id(&mut self, id: MessageId) {
        self.observe_server_id(id);
    }

    fn observe_server_id(&mut self, id: MessageId) {
        if self.max_server_id.map_or(true, |max| id > max) {
            self.max_server_id = Some(id);
        }
    }
}
