use std::sync::Arc;

use chrono::Utc;
use shared::protocol::MessageRequest;
use tracing::{debug, error};

use crate::{
    local_id::{DisplayId, LocalId},
    message::{Message, MessageFlags, SenderProfile},
    reconcile::ReconciliationEngine,
    render::{is_slash_command, MessageRenderer, RecipientPolicy},
    views::ViewFanout,
};

/// Decides whether a send can be shown before the server confirms it, and
/// if so builds and registers the provisional copy.
#[derive(Clone)]
pub struct LocalEchoEngine {
    sender: SenderProfile,
    renderer: Arc<dyn MessageRenderer>,
    policy: Arc<dyn RecipientPolicy>,
}

impl LocalEchoEngine {
    pub fn new(
        sender: SenderProfile,
        renderer: Arc<dyn MessageRenderer>,
        policy: Arc<dyn RecipientPolicy>,
    ) -> Self {
        Self {
            sender,
            renderer,
            policy,
        }
    }

    pub fn sender(&self) -> &SenderProfile {
        &self.sender
    }

    pub fn renderer(&self) -> &dyn MessageRenderer {
        self.renderer.as_ref()
    }

    /// Returns `None` when the message must go through the ordinary send
    /// path. On success the request carries the new local id.
    pub fn try_deliver_locally(
        &self,
        request: &mut MessageRequest,
        engine: &mut ReconciliationEngine,
        views: &ViewFanout,
    ) -> Option<Message> {
        if self.renderer.contains_backend_only_syntax(&request.content) {
            debug!("echo: content needs server rendering");
            return None;
        }
        if is_slash_command(&request.content) {
            debug!("echo: slash command");
            return None;
        }
        if !self.policy.can_send_to(self.sender.user_id, &request.target) {
            debug!("echo: sender may not post to this recipient");
            return None;
        }

        let provisional = engine.allocate_local_id()?;
        let local_id = LocalId::from(provisional);
        if engine.is_waiting_for_id(&local_id) {
            error!(local_id = %local_id, "echo: local id is already waiting for a server id");
            return None;
        }

        let rendered = self.renderer.render(&request.content);
        let message = Message {
            id: DisplayId::Provisional(provisional),
            local_id: Some(local_id.clone()),
            sender_id: self.sender.user_id,
            sender_full_name: self.sender.full_name.clone(),
            sender_email: Some(self.sender.email.clone()),
            target: request.target.clone(),
            content: rendered.content,
            raw_content: Some(request.content.clone()),
            timestamp: Utc::now(),
            topic_links: Vec::new(),
            submessages: Vec::new(),
            is_me_message: rendered.is_me_message,
            flags: MessageFlags {
                read: true,
                ..MessageFlags::default()
            },
            locally_echoed: true,
            failed: false,
        };

        request.local_id = Some(local_id.to_string());
        if !engine.register_echo(message.clone(), request.clone(), views) {
            request.local_id = None;
            return None;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::{MessageId, MessageTarget, QueueId, StreamId, UserId};

    use super::*;
    use crate::{
        local_id::LocalIdAllocator,
        reconcile::EchoState,
        render::{AllowAllRecipients, BasicRenderer, PostingPolicy},
        store::MessageStore,
        views::{MessageListView, Narrow},
    };

    fn echo_engine(policy: Arc<dyn RecipientPolicy>) -> LocalEchoEngine {
        LocalEchoEngine::new(
            SenderProfile {
                user_id: UserId(7),
                full_name: "Iago".into(),
                email: "iago@example.com".into(),
            },
            Arc::new(BasicRenderer::default()),
            policy,
        )
    }

    fn reconcile_engine() -> ReconciliationEngine {
        ReconciliationEngine::new(
            LocalIdAllocator::default(),
            MessageStore::with_max_message_id(MessageId(100)),
        )
    }

    fn request(content: &str) -> MessageRequest {
        MessageRequest::new(
            UserId(7),
            MessageTarget::stream(StreamId(3), "lunch"),
            content,
            QueueId("queue".into()),
        )
    }

    #[test]
    fn echoes_plain_messages_into_views() {
        let echo = echo_engine(Arc::new(AllowAllRecipients));
        let mut engine = reconcile_engine();
        let list = MessageListView::new("lunch", Narrow::Stream(StreamId(3)));
        let mut views = ViewFanout::new();
        views.subscribe(list.clone());

        let mut req = request("hello");
        let message = echo
            .try_deliver_locally(&mut req, &mut engine, &views)
            .expect("echoed");

        assert_eq!(message.id.to_string(), "100.01");
        assert!(message.locally_echoed);
        assert_eq!(message.content, "<p>hello</p>");
        assert_eq!(message.sender_full_name, "Iago");
        assert_eq!(req.local_id.as_deref(), Some("100.01"));
        assert_eq!(list.messages(), vec![message]);

        let local_id = LocalId::from("100.01");
        assert!(engine.registry().is_waiting_for_id(&local_id));
        assert!(engine.registry().is_waiting_for_ack(&local_id));
        assert_eq!(engine.state(&local_id), Some(EchoState::EchoedUnconfirmed));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn slash_commands_and_server_only_syntax_are_not_echoed() {
        let echo = echo_engine(Arc::new(AllowAllRecipients));
        let mut engine = reconcile_engine();
        let views = ViewFanout::new();

        for content in ["/poll lunch?", "$$x^2$$"] {
            let mut req = request(content);
            assert!(echo.try_deliver_locally(&mut req, &mut engine, &views).is_none());
            assert!(req.local_id.is_none());
        }
        assert!(engine.registry().is_empty());

        let mut me = request("/me waves");
        let message = echo
            .try_deliver_locally(&mut me, &mut engine, &views)
            .expect("/me is echoed");
        assert!(message.is_me_message);
    }

    #[test]
    fn recipient_policy_gates_echo() {
        let policy = PostingPolicy {
            read_only_streams: [StreamId(3)].into_iter().collect(),
            direct_messages_restricted: false,
        };
        let echo = echo_engine(Arc::new(policy));
        let mut engine = reconcile_engine();

        let mut req = request("announcement");
        assert!(echo
            .try_deliver_locally(&mut req, &mut engine, &ViewFanout::new())
            .is_none());
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn stops_echoing_when_too_far_ahead() {
        let echo = echo_engine(Arc::new(AllowAllRecipients));
        let mut engine = reconcile_engine();
        let views = ViewFanout::new();

        for _ in 0..5 {
            assert!(echo
                .try_deliver_locally(&mut request("burst"), &mut engine, &views)
                .is_some());
        }
        let mut sixth = request("burst");
        assert!(echo.try_deliver_locally(&mut sixth, &mut engine, &views).is_none());
        assert!(sixth.local_id.is_none());
        assert_eq!(engine.registry().waiting_for_id_len(), 5);
    }
}
