//! Pending-message bookkeeping for locally echoed sends.

use std::collections::{HashMap, HashSet};

use shared::protocol::MessageRequest;

use crate::{local_id::LocalId, message::Message};

struct PendingEntry {
    message: Message,
    request: MessageRequest,
}

/// Tracks locally echoed messages until the server id is known
/// (`waiting_for_id`) and until the server copy has been merged
/// (`waiting_for_ack`). Both sets share one entry per local id, released
/// once neither set references it.
#[derive(Default)]
pub struct PendingMessageRegistry {
    entries: HashMap<LocalId, PendingEntry>,
    waiting_for_id: HashSet<LocalId>,
    waiting_for_ack: HashSet<LocalId>,
}

impl PendingMessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and leaves the registry untouched) when the local id is
    /// already registered.
    pub fn register(&mut self, local_id: LocalId, message: Message, request: MessageRequest) -> bool {
        if self.entries.contains_key(&local_id) {
            return false;
        }
        self.waiting_for_id.insert(local_id.clone());
        self.waiting_for_ack.insert(local_id.clone());
        self.entries
            .insert(local_id, PendingEntry { message, request });
        true
    }

    pub fn is_waiting_for_id(&self, local_id: &LocalId) -> bool {
        self.waiting_for_id.contains(local_id)
    }

    pub fn is_waiting_for_ack(&self, local_id: &LocalId) -> bool {
        self.waiting_for_ack.contains(local_id)
    }

    pub fn waiting_for_id_len(&self) -> usize {
        self.waiting_for_id.len()
    }

    pub fn waiting_for_ack_len(&self) -> usize {
        self.waiting_for_ack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: &LocalId) -> Option<&Message> {
        self.entries.get(local_id).map(|entry| &entry.message)
    }

    pub fn get_mut(&mut self, local_id: &LocalId) -> Option<&mut Message> {
        self.entries.get_mut(local_id).map(|entry| &mut entry.message)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.values().map(|entry| &entry.message)
    }

    pub fn request(&self, local_id: &LocalId) -> Option<&MessageRequest> {
        self.entries.get(local_id).map(|entry| &entry.request)
    }

    pub fn request_mut(&mut self, local_id: &LocalId) -> Option<&mut MessageRequest> {
        self.entries.get_mut(local_id).map(|entry| &mut entry.request)
    }

    /// Releases the `waiting_for_id` reference; returns whether it was held.
    pub fn release_id(&mut self, local_id: &LocalId) -> bool {
        let released = self.waiting_for_id.remove(local_id);
        self.collect(local_id);
        released
    }

    /// Releases the `waiting_for_ack` reference. Hands the message back once
    /// no reference to it remains; reification always happens first, so in
    /// practice this is the final release.
    pub fn release_ack(&mut self, local_id: &LocalId) -> Option<Message> {
        if !self.waiting_for_ack.remove(local_id) || self.waiting_for_id.contains(local_id) {
            return None;
        }
        self.entries.remove(local_id).map(|entry| entry.message)
    }

    /// Drops every trace of the local id, returning the message if present.
    pub fn remove(&mut self, local_id: &LocalId) -> Option<Message> {
        self.waiting_for_id.remove(local_id);
        self.waiting_for_ack.remove(local_id);
        self.entries.remove(local_id).map(|entry| entry.message)
    }

    fn collect(&mut self, local_id: &LocalId) {
        if !self.waiting_for_id.contains(local_id) && !self.waiting_for_ack.contains(local_id) {
            self.entries.remove(local_id);
        }
    }
}
