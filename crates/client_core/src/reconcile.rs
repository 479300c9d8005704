//! Reconciliation of locally echoed messages with their server copies.
//!
//! Each echoed send moves through `EchoedUnconfirmed → IdReified →
//! FullyReconciled`, or ends in `Aborted`. The HTTP acknowledgement and the
//! event-stream notification both drive the same transitions, and each
//! transition is guarded so whichever arrives second is a no-op.

use std::collections::HashMap;

use shared::{
    domain::MessageId,
    protocol::{MessageEvent, MessageRequest},
};
use tracing::{debug, info, warn};

use crate::{
    error::EchoError,
    local_id::{DisplayId, LocalId, LocalIdAllocator, ProvisionalId},
    message::Message,
    registry::PendingMessageRegistry,
    render::{MessageRenderer, RenderedContent},
    store::MessageStore,
    views::ViewFanout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    EchoedUnconfirmed,
    IdReified(MessageId),
    FullyReconciled(MessageId),
    Aborted,
}

/// An edit made while the send was pending, released once the server copy
/// has been merged so it can be sent against the real message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEdit {
    pub local_id: LocalId,
    pub message_id: MessageId,
    pub raw_content: String,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Messages not echoed by this client; the caller inserts them normally.
    pub non_echo: Vec<MessageEvent>,
    pub reconciled: Vec<(LocalId, MessageId)>,
    pub disparities: Vec<LocalId>,
    /// Sends marked failed whose message the server stored anyway.
    pub recovered: Vec<LocalId>,
    pub deferred_edits: Vec<DeferredEdit>,
    /// Notifications dropped because the send was aborted or already merged.
    pub swallowed: Vec<LocalId>,
}

struct QueuedEdit {
    raw_content: String,
    rendered: RenderedContent,
    /// Local render of the content that went out with the send.
    sent_content: String,
}

/// Owns all per-session echo state: id allocation, the pending registry,
/// the primary store and the per-local-id state machine.
///
/// `states` only holds sends that are pending or aborted; a fully reconciled
/// send is recognised by its copy in the store.
pub struct ReconciliationEngine {
    allocator: LocalIdAllocator,
    registry: PendingMessageRegistry,
    store: MessageStore,
    states: HashMap<LocalId, EchoState>,
    queued_edits: HashMap<LocalId, QueuedEdit>,
}

impl ReconciliationEngine {
    pub fn new(allocator: LocalIdAllocator, store: MessageStore) -> Self {
        Self {
            allocator,
            registry: PendingMessageRegistry::new(),
            store,
            states: HashMap::new(),
            queued_edits: HashMap::new(),
        }
    }

    /// A fresh engine for a new session in the same process; provisional ids
    /// issued by this engine are never handed out again. Rows for sends still
    /// pending here are dropped from `views`; their server copies arrive in
    /// the new session as ordinary messages.
    pub fn restart(&self, store: MessageStore, views: &ViewFanout) -> Self {
        let stale: Vec<DisplayId> = self.registry.messages().map(|message| message.id).collect();
        if !stale.is_empty() {
            info!(count = stale.len(), "restart: dropping rows of pending sends");
        }
        views.remove(&stale);
        Self::new(self.allocator.successor(), store)
    }

    pub fn registry(&self) -> &PendingMessageRegistry {
        &self.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn state(&self, local_id: &LocalId) -> Option<EchoState> {
        self.states.get(local_id).copied().or_else(|| {
            self.store
                .find_by_local_id(local_id)
                .and_then(Message::server_id)
                .map(EchoState::FullyReconciled)
        })
    }

    pub fn pending(&self, local_id: &LocalId) -> Option<&Message> {
        self.registry.get(local_id)
    }

    /// Looks a message up wherever it currently lives.
    pub fn message(&self, id: DisplayId) -> Option<&Message> {
        self.store.get(id).or_else(|| match id {
            DisplayId::Provisional(provisional) => self.registry.get(&LocalId::from(provisional)),
            DisplayId::Server(_) => None,
        })
    }

    pub(crate) fn allocate_local_id(&mut self) -> Option<ProvisionalId> {
        self.allocator.next_id(self.store.max_server_id())
    }

    /// Acks for sends that were not echoed still move allocation forward.
    pub(crate) fn note_acked_id(&mut self, server_id: MessageId) {
        self.store.note_server_id(server_id);
    }

    pub(crate) fn is_waiting_for_id(&self, local_id: &LocalId) -> bool {
        self.registry.is_waiting_for_id(local_id)
    }

    pub(crate) fn register_echo(
        &mut self,
        message: Message,
        request: MessageRequest,
        views: &ViewFanout,
    ) -> bool {
        let Some(local_id) = message.local_id.clone() else {
            return false;
        };
        if !self
            .registry
            .register(local_id.clone(), message.clone(), request)
        {
            warn!(local_id = %local_id, "echo: local id already registered");
            return false;
        }
        self.states
            .insert(local_id.clone(), EchoState::EchoedUnconfirmed);
        views.add(std::slice::from_ref(&message));
        debug!(local_id = %local_id, "echo: message inserted locally");
        true
    }

    /// Replaces the provisional id with the server id. Only the first call for
    /// a local id has any effect.
    pub fn reify(&mut self, local_id: &LocalId, server_id: MessageId, views: &ViewFanout) -> bool {
        if !self.registry.is_waiting_for_id(local_id) {
            debug!(local_id = %local_id, message_id = server_id.0, "reify: nothing waiting");
            return false;
        }
        let Some(message) = self.registry.get_mut(local_id) else {
            return false;
        };
        let old_id = message.id;
        let new_id = DisplayId::Server(server_id);
        message.id = new_id;
        message.locally_echoed = false;

        self.registry.release_id(local_id);
        self.store.note_server_id(server_id);
        self.states
            .insert(local_id.clone(), EchoState::IdReified(server_id));
        views.change_id(old_id, new_id);
        info!(
            local_id = %local_id,
            message_id = server_id.0,
            "reify: provisional id replaced"
        );
        true
    }

    /// Merges event-stream messages into their locally echoed counterparts
    /// and returns everything that was not echoed here.
    pub fn process_from_server(
        &mut self,
        messages: Vec<MessageEvent>,
        views: &ViewFanout,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut touched = Vec::new();

        for event in messages {
            let local_id = event.local_id.as_deref().map(LocalId::from);
            let Some(local_id) = local_id.filter(|id| self.registry.is_waiting_for_ack(id)) else {
                if let Some(local_id) = self.already_handled(&event) {
                    report.swallowed.push(local_id);
                } else {
                    report.non_echo.push(event);
                }
                continue;
            };

            self.reify(&local_id, event.id, views);

            let queued_edit = self.queued_edits.remove(&local_id);
            let Some(message) = self.registry.get_mut(&local_id) else {
                continue;
            };
            if message.failed {
                info!(local_id = %local_id, "reconcile: failed send was persisted after all");
                message.failed = false;
                report.recovered.push(local_id.clone());
            }
            let sent_content = queued_edit
                .as_ref()
                .map_or(message.content.as_str(), |edit| edit.sent_content.as_str());
            if sent_content != event.content {
                report.disparities.push(local_id.clone());
            }
            message.content = event.content.clone();
            message.merge_server_fields(&event);
            if let Some(edit) = queued_edit {
                message.raw_content = Some(edit.raw_content.clone());
                message.content = edit.rendered.content;
                message.is_me_message = edit.rendered.is_me_message;
                report.deferred_edits.push(DeferredEdit {
                    local_id: local_id.clone(),
                    message_id: event.id,
                    raw_content: edit.raw_content,
                });
            }

            let Some(message) = self.registry.release_ack(&local_id) else {
                continue;
            };
            self.states.remove(&local_id);
            self.store.insert(message.clone());
            touched.push(message);
            report.reconciled.push((local_id, event.id));
        }

        views.rerender(&touched);
        if !touched.is_empty() {
            debug!(count = touched.len(), "reconcile: merged server copies");
        }
        report
    }

    fn already_handled(&self, event: &MessageEvent) -> Option<LocalId> {
        let local_id = LocalId::from(event.local_id.as_deref()?);
        if self.states.get(&local_id) == Some(&EchoState::Aborted) {
            info!(
                local_id = %local_id,
                message_id = event.id.0,
                "reconcile: ignoring message for aborted send"
            );
            return Some(local_id);
        }
        let stored = self.store.get(DisplayId::Server(event.id))?;
        if stored.local_id.as_ref() != Some(&local_id) {
            return None;
        }
        debug!(local_id = %local_id, "reconcile: duplicate delivery");
        Some(local_id)
    }

    /// Marks a pending send as failed; the message stays registered so it
    /// can be resent under the same local id.
    pub fn message_send_error(
        &mut self,
        local_id: &LocalId,
        views: &ViewFanout,
    ) -> Result<(), EchoError> {
        match self.state(local_id) {
            None => return Err(EchoError::UnknownLocalId(local_id.clone())),
            Some(EchoState::Aborted) => return Err(EchoError::Aborted(local_id.clone())),
            Some(EchoState::IdReified(_) | EchoState::FullyReconciled(_)) => {
                return Err(EchoError::AlreadyAcked(local_id.clone()))
            }
            Some(EchoState::EchoedUnconfirmed) => {}
        }
        let message = self
            .registry
            .get_mut(local_id)
            .ok_or_else(|| EchoError::UnknownLocalId(local_id.clone()))?;
        message.failed = true;
        views.rerender(std::slice::from_ref(message));
        Ok(())
    }

    /// Clears the failure and returns the request to send again, flagged as a
    /// resend and carrying the current raw content.
    pub fn prepare_resend(
        &mut self,
        local_id: &LocalId,
        renderer: &dyn MessageRenderer,
        views: &ViewFanout,
    ) -> Result<MessageRequest, EchoError> {
        match self.state(local_id) {
            None => return Err(EchoError::UnknownLocalId(local_id.clone())),
            Some(EchoState::Aborted) => return Err(EchoError::Aborted(local_id.clone())),
            Some(EchoState::IdReified(_) | EchoState::FullyReconciled(_)) => {
                return Err(EchoError::AlreadyAcked(local_id.clone()))
            }
            Some(EchoState::EchoedUnconfirmed) => {}
        }
        let message = self
            .registry
            .get_mut(local_id)
            .ok_or_else(|| EchoError::UnknownLocalId(local_id.clone()))?;
        if !message.failed {
            return Err(EchoError::NotFailed(local_id.clone()));
        }
        let raw = message.raw_content.clone().unwrap_or_default();
        let rendered = renderer.render(&raw);
        message.failed = false;
        message.locally_echoed = true;
        message.content = rendered.content;
        message.is_me_message = rendered.is_me_message;
        views.rerender(std::slice::from_ref(message));

        // The resent request already carries any pending edit.
        self.queued_edits.remove(local_id);
        let request = self
            .registry
            .request_mut(local_id)
            .ok_or_else(|| EchoError::UnknownLocalId(local_id.clone()))?;
        request.content = raw;
        request.local_id = Some(local_id.to_string());
        request.resend = true;
        Ok(request.clone())
    }

    /// Applies an edit to a message whose send is still in flight. The edit
    /// is shown immediately and re-applied after the server copy is merged.
    pub fn edit_pending(
        &mut self,
        local_id: &LocalId,
        raw_content: &str,
        renderer: &dyn MessageRenderer,
        views: &ViewFanout,
    ) -> Result<(), EchoError> {
        match self.state(local_id) {
            None => return Err(EchoError::UnknownLocalId(local_id.clone())),
            Some(EchoState::Aborted) => return Err(EchoError::Aborted(local_id.clone())),
            Some(EchoState::FullyReconciled(_)) => {
                return Err(EchoError::AlreadyReconciled(local_id.clone()))
            }
            Some(EchoState::EchoedUnconfirmed | EchoState::IdReified(_)) => {}
        }
        let message = self
            .registry
            .get_mut(local_id)
            .ok_or_else(|| EchoError::UnknownLocalId(local_id.clone()))?;
        let sent_content = match self.queued_edits.get(local_id) {
            Some(previous) => previous.sent_content.clone(),
            None => message.content.clone(),
        };
        let rendered = renderer.render(raw_content);
        message.raw_content = Some(raw_content.to_string());
        message.content = rendered.content.clone();
        message.is_me_message = rendered.is_me_message;
        views.rerender(std::slice::from_ref(message));

        if let Some(request) = self.registry.request_mut(local_id) {
            request.content = raw_content.to_string();
        }
        self.queued_edits.insert(
            local_id.clone(),
            QueuedEdit {
                raw_content: raw_content.to_string(),
                rendered,
                sent_content,
            },
        );
        Ok(())
    }

    /// Cancels a send that has not been acknowledged yet.
    pub fn abort(&mut self, local_id: &LocalId, views: &ViewFanout) -> Result<Message, EchoError> {
        match self.state(local_id) {
            None => return Err(EchoError::UnknownLocalId(local_id.clone())),
            Some(EchoState::Aborted) => return Err(EchoError::Aborted(local_id.clone())),
            Some(EchoState::IdReified(_) | EchoState::FullyReconciled(_)) => {
                return Err(EchoError::AlreadyAcked(local_id.clone()))
            }
            Some(EchoState::EchoedUnconfirmed) => {}
        }
        let message = self
            .registry
            .remove(local_id)
            .ok_or_else(|| EchoError::UnknownLocalId(local_id.clone()))?;
        self.queued_edits.remove(local_id);
        self.states.insert(local_id.clone(), EchoState::Aborted);
        views.remove(&[message.id]);
        info!(local_id = %local_id, "abort: pending send cancelled");
        Ok(message)
    }

    /// Ordinary insertion for messages this client did not echo. Messages
    /// already in the store are skipped.
    pub fn insert_new_messages(
        &mut self,
        messages: Vec<MessageEvent>,
        views: &ViewFanout,
    ) -> Vec<Message> {
        let inserted: Vec<Message> = messages
            .into_iter()
            .map(Message::from)
            .filter(|message| self.store.get(message.id).is_none())
            .collect();
        for message in &inserted {
            self.store.insert(message.clone());
        }
        views.add(&inserted);
        inserted
    }

    pub fn apply_update(
        &mut self,
        message_id: MessageId,
        rendered_content: String,
        views: &ViewFanout,
    ) -> bool {
        let Some(message) = self.store.get_mut(DisplayId::Server(message_id)) else {
            return false;
        };
        message.content = rendered_content;
        views.rerender(std::slice::from_ref(message));
        true
    }

    pub fn remove_messages(&mut self, message_ids: &[MessageId], views: &ViewFanout) -> usize {
        let removed: Vec<DisplayId> = message_ids
            .iter()
            .map(|id| DisplayId::Server(*id))
            .filter(|id| self.store.remove(*id).is_some())
            .collect();
        views.remove(&removed);
        removed.len()
    }
}
