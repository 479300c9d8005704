//! Subscriber views and the fan-out that keeps them in sync.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::{MessageTarget, StreamId, UserId};

use crate::{local_id::DisplayId, message::Message};

/// Contract every subscriber view implements. Calls are synchronous and each
/// view decides on its own whether a message is in its scope.
pub trait MessageView: Send + Sync {
    fn add(&self, messages: &[Message]);
    fn change_id(&self, old_id: DisplayId, new_id: DisplayId);
    fn remove(&self, ids: &[DisplayId]);
    fn rerender(&self, messages: &[Message]);
}

/// Broadcasts message changes to every subscribed view.
#[derive(Clone, Default)]
pub struct ViewFanout {
    views: Vec<Arc<dyn MessageView>>,
}

impl ViewFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, view: Arc<dyn MessageView>) {
        self.views.push(view);
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn add(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        for view in &self.views {
            view.add(messages);
        }
    }

    pub fn change_id(&self, old_id: DisplayId, new_id: DisplayId) {
        for view in &self.views {
            view.change_id(old_id, new_id);
        }
    }

    pub fn remove(&self, ids: &[DisplayId]) {
        if ids.is_empty() {
            return;
        }
        for view in &self.views {
            view.remove(ids);
        }
    }

    pub fn rerender(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        for view in &self.views {
            view.rerender(messages);
        }
    }
}

/// Filter deciding which messages a list shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Narrow {
    All,
    Stream(StreamId),
    Topic { stream_id: StreamId, topic: String },
    Direct(BTreeSet<UserId>),
}

impl Narrow {
    pub fn matches(&self, message: &Message) -> bool {
        match (self, &message.target) {
            (Self::All, _) => true,
            (Self::Stream(wanted), MessageTarget::Stream { stream_id, .. }) => wanted == stream_id,
            (
                Self::Topic {
                    stream_id: wanted,
                    topic: wanted_topic,
                },
                MessageTarget::Stream { stream_id, topic },
            ) => wanted == stream_id && wanted_topic.eq_ignore_ascii_case(topic),
            (Self::Direct(wanted), MessageTarget::Direct { recipient_ids }) => {
                wanted == recipient_ids
            }
            _ => false,
        }
    }
}

#[derive(Default)]
struct ListState {
    messages: BTreeMap<DisplayId, Message>,
    selected: Option<DisplayId>,
}

/// In-memory, id-ordered message list with a selection cursor.
pub struct MessageListView {
    name: String,
    narrow: Narrow,
    state: Mutex<ListState>,
}

impl MessageListView {
    pub fn new(name: impl Into<String>, narrow: Narrow) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            narrow,
            state: Mutex::new(ListState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn narrow(&self) -> &Narrow {
        &self.narrow
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<DisplayId> {
        self.lock().messages.keys().copied().collect()
    }

    pub fn get(&self, id: DisplayId) -> Option<Message> {
        self.lock().messages.get(&id).cloned()
    }

    pub fn contains(&self, id: DisplayId) -> bool {
        self.lock().messages.contains_key(&id)
    }

    pub fn select(&self, id: DisplayId) -> bool {
        let mut state = self.lock();
        if !state.messages.contains_key(&id) {
            return false;
        }
        state.selected = Some(id);
        true
    }

    pub fn selected(&self) -> Option<DisplayId> {
        self.lock().selected
    }

    fn lock(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageView for MessageListView {
    fn add(&self, messages: &[Message]) {
        let mut state = self.lock();
        for message in messages.iter().filter(|m| self.narrow.matches(m)) {
            state.messages.insert(message.id, message.clone());
        }
    }

    fn change_id(&self, old_id: DisplayId, new_id: DisplayId) {
        let mut state = self.lock();
        let Some(mut message) = state.messages.remove(&old_id) else {
            return;
        };
        message.id = new_id;
        state.messages.insert(new_id, message);
        if state.selected == Some(old_id) {
            state.selected = Some(new_id);
        }
    }

    fn remove(&self, ids: &[DisplayId]) {
        let mut state = self.lock();
        for id in ids {
            state.messages.remove(id);
            if state.selected == Some(*id) {
                state.selected = None;
            }
        }
    }

    fn rerender(&self, messages: &[Message]) {
        let mut state = self.lock();
        for message in messages {
            if state.messages.contains_key(&message.id) || self.narrow.matches(message) {
                state.messages.insert(message.id, message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::domain::MessageId;

    use super::*;
    use crate::message::MessageFlags;

    fn message(id: DisplayId, target: MessageTarget) -> Message {
        Message {
            id,
            local_id: None,
            sender_id: UserId(1),
            sender_full_name: "Iago".into(),
            sender_email: None,
            target,
            content: "<p>hi</p>".into(),
            raw_content: Some("hi".into()),
            timestamp: Utc::now(),
            topic_links: Vec::new(),
            submessages: Vec::new(),
            is_me_message: false,
            flags: MessageFlags::default(),
            locally_echoed: false,
            failed: false,
        }
    }

    #[test]
    fn topic_narrow_filters_additions() {
        let view = MessageListView::new("topic", Narrow::Topic {
            stream_id: StreamId(3),
            topic: "Lunch".into(),
        });
        view.add(&[
            message(MessageId(1).into(), MessageTarget::stream(StreamId(3), "lunch")),
            message(MessageId(2).into(), MessageTarget::stream(StreamId(3), "dinner")),
            message(MessageId(3).into(), MessageTarget::direct([UserId(2)])),
        ]);
        assert_eq!(view.ids(), vec![DisplayId::Server(MessageId(1))]);
    }

    #[test]
    fn change_id_moves_row_and_selection() {
        let view = MessageListView::new("all", Narrow::All);
        let old_id = DisplayId::Provisional("10.01".parse().expect("id"));
        let new_id = DisplayId::Server(MessageId(11));
        view.add(&[message(old_id, MessageTarget::stream(StreamId(1), "t"))]);
        assert!(view.select(old_id));

        view.change_id(old_id, new_id);

        assert!(!view.contains(old_id));
        assert_eq!(view.get(new_id).map(|m| m.id), Some(new_id));
        assert_eq!(view.selected(), Some(new_id));
    }

    #[test]
    fn rerender_replaces_known_rows_and_skips_out_of_scope() {
        let view = MessageListView::new("stream", Narrow::Stream(StreamId(1)));
        let id = DisplayId::Server(MessageId(5));
        view.add(&[message(id, MessageTarget::stream(StreamId(1), "t"))]);

        let mut updated = message(id, MessageTarget::stream(StreamId(1), "t"));
        updated.content = "<p>edited</p>".into();
        let other = message(MessageId(6).into(), MessageTarget::stream(StreamId(2), "t"));
        view.rerender(&[updated, other]);

        assert_eq!(view.ids(), vec![id]);
        assert_eq!(view.get(id).map(|m| m.content), Some("<p>edited</p>".into()));
    }

    #[test]
    fn remove_clears_selection() {
        let view = MessageListView::new("all", Narrow::All);
        let id = DisplayId::Server(MessageId(5));
        view.add(&[message(id, MessageTarget::stream(StreamId(1), "t"))]);
        view.select(id);
        view.remove(&[id]);
        assert!(view.messages().is_empty());
        assert_eq!(view.selected(), None);
    }
}
