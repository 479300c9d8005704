use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use shared::{
    domain::MessageId,
    error::ErrorCode,
    protocol::{MessageEvent, MessageRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

pub mod config;
pub mod echo;
pub mod error;
pub mod event_stream;
pub mod local_id;
pub mod message;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod sent_messages;
pub mod store;
pub mod transport;
pub mod views;

pub use config::EchoSettings;
pub use echo::LocalEchoEngine;
pub use error::{EchoError, SendError};
pub use local_id::{DisplayId, LocalId, LocalIdAllocator, ProvisionalId};
pub use message::{Message, SenderProfile};
pub use reconcile::{EchoState, ReconciliationEngine};
pub use sent_messages::SendTimes;
pub use store::MessageStore;
pub use transport::{
    HttpMessagePoster, MessagePoster, ReloadHandler, ReloadOptions, SendOutcome, SendTransport,
};
pub use views::{MessageListView, MessageView, Narrow, ViewFanout};

use render::{AllowAllRecipients, BasicRenderer, MessageRenderer, RecipientPolicy};
use sent_messages::SentMessages;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageEchoed {
        local_id: LocalId,
        message: Message,
    },
    /// The server acknowledged the send over HTTP.
    MessageSent {
        local_id: LocalId,
        message_id: MessageId,
    },
    MessageReconciled {
        local_id: LocalId,
        message_id: MessageId,
    },
    MessagesReceived(Vec<Message>),
    SendFailed {
        local_id: LocalId,
        message: String,
        code: Option<ErrorCode>,
    },
    SendSlow {
        local_id: LocalId,
    },
    /// Acked but the event has not shown up; the caller should refetch.
    EventCatchupNeeded {
        local_id: LocalId,
        message_id: MessageId,
    },
    DeferredEditSent {
        local_id: LocalId,
        message_id: MessageId,
    },
    DeliveryConfirmed(SendTimes),
    ReloadRequired(ReloadOptions),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub local_id: LocalId,
    pub locally_echoed: bool,
    pub outcome: SendOutcome,
}

/// Reload subsystem that asks the embedding application to reload through
/// the client event channel.
struct EventReloadHandler {
    pending: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

impl ReloadHandler for EventReloadHandler {
    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn initiate(&self, options: ReloadOptions) {
        self.pending.store(true, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::ReloadRequired(options));
    }
}

struct ClientSession {
    engine: ReconciliationEngine,
    sent: SentMessages,
    views: ViewFanout,
}

#[derive(Debug, Clone, Copy)]
struct Timings {
    slow_send_threshold: Duration,
    event_catchup_after: Duration,
}

pub struct EchoClient {
    echo: LocalEchoEngine,
    transport: SendTransport,
    reload: Arc<EventReloadHandler>,
    timings: Timings,
    inner: Mutex<ClientSession>,
    events: broadcast::Sender<ClientEvent>,
}

impl EchoClient {
    /// Client posting over HTTP to `settings.server_url`, with the basic
    /// renderer and no posting restrictions.
    pub fn new(settings: &EchoSettings, sender: SenderProfile, store: MessageStore) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            sender,
            store,
            Arc::new(HttpMessagePoster::new(settings.server_url.clone())),
            Arc::new(BasicRenderer::new(settings.backend_only_markers.clone())),
            Arc::new(AllowAllRecipients),
        )
    }

    pub fn new_with_dependencies(
        settings: &EchoSettings,
        sender: SenderProfile,
        store: MessageStore,
        poster: Arc<dyn MessagePoster>,
        renderer: Arc<dyn MessageRenderer>,
        policy: Arc<dyn RecipientPolicy>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let reload = Arc::new(EventReloadHandler {
            pending: AtomicBool::new(false),
            events: events.clone(),
        });
        let allocator = LocalIdAllocator::new(
            settings.local_id_increment_thousandths,
            settings.max_local_steps,
        );
        Arc::new(Self {
            echo: LocalEchoEngine::new(sender, renderer, policy),
            transport: SendTransport::new(poster, reload.clone()),
            reload,
            timings: Timings {
                slow_send_threshold: settings.slow_send_threshold(),
                event_catchup_after: settings.event_catchup_after(),
            },
            inner: Mutex::new(ClientSession {
                engine: ReconciliationEngine::new(allocator, store),
                sent: SentMessages::new(),
                views: ViewFanout::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Client events as a stream; events missed by a lagging reader are
    /// skipped.
    pub fn events_stream(&self) -> impl Stream<Item = ClientEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(error = %err, "client events: receiver lagged");
                    None
                }
            }
        })
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn reload_pending(&self) -> bool {
        self.reload.is_pending()
    }

    pub async fn subscribe_view(&self, view: Arc<dyn MessageView>) {
        self.inner.lock().await.views.subscribe(view);
    }

    /// Runs `f` against the session's reconciliation state.
    pub async fn inspect<R>(&self, f: impl FnOnce(&ReconciliationEngine) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard.engine)
    }

    pub async fn send_message(self: &Arc<Self>, mut request: MessageRequest) -> SendReceipt {
        let (local_id, echoed) = {
            let mut guard = self.inner.lock().await;
            let session = &mut *guard;
            match self
                .echo
                .try_deliver_locally(&mut request, &mut session.engine, &session.views)
            {
                Some(message) => {
                    let local_id = message.local_id.clone().unwrap_or_else(|| {
                        LocalId::from(message.id.to_string())
                    });
                    session.sent.start_tracking(local_id.clone(), true);
                    let _ = self.events.send(ClientEvent::MessageEchoed {
                        local_id: local_id.clone(),
                        message,
                    });
                    (local_id, true)
                }
                None => {
                    let local_id = session.sent.next_fallback_local_id();
                    request.local_id = Some(local_id.to_string());
                    session.sent.start_tracking(local_id.clone(), false);
                    debug!(local_id = %local_id, "send: not echoed locally");
                    (local_id, false)
                }
            }
        };
        self.dispatch(request, local_id, echoed).await
    }

    /// Retries a failed echoed send under its original local id.
    pub async fn resend(self: &Arc<Self>, local_id: &LocalId) -> Result<SendReceipt, EchoError> {
        let request = {
            let mut guard = self.inner.lock().await;
            let session = &mut *guard;
            let request =
                session
                    .engine
                    .prepare_resend(local_id, self.echo.renderer(), &session.views)?;
            session.sent.start_resend(local_id.clone(), true);
            request
        };
        info!(local_id = %local_id, "send: resending failed message");
        Ok(self.dispatch(request, local_id.clone(), true).await)
    }

    /// Cancels an unacknowledged send. The request already in flight is not
    /// cancelled; its response no longer affects any view.
    pub async fn abort(&self, local_id: &LocalId) -> Result<Message, EchoError> {
        let mut guard = self.inner.lock().await;
        let session = &mut *guard;
        let message = session.engine.abort(local_id, &session.views)?;
        session.sent.forget(local_id);
        Ok(message)
    }

    pub async fn edit_pending(&self, local_id: &LocalId, raw_content: &str) -> Result<(), EchoError> {
        let mut guard = self.inner.lock().await;
        let session = &mut *guard;
        session
            .engine
            .edit_pending(local_id, raw_content, self.echo.renderer(), &session.views)
    }

    /// Starts a new session against a fresh snapshot. Views stay subscribed
    /// but lose the rows of sends that were still pending; provisional ids
    /// issued before the reset are never reused.
    pub async fn reset_session(&self, store: MessageStore) {
        let mut guard = self.inner.lock().await;
        let session = &mut *guard;
        session.engine = session.engine.restart(store, &session.views);
        session.sent.clear();
        self.reload.pending.store(false, Ordering::SeqCst);
        info!("session: reset");
    }

    pub async fn handle_server_events(&self, events: Vec<ServerEvent>) {
        let mut messages: Vec<MessageEvent> = Vec::new();
        let mut updates = Vec::new();
        let mut deletions = Vec::new();
        for event in events {
            match event {
                ServerEvent::Message { message } => messages.push(message),
                ServerEvent::UpdateMessage {
                    message_id,
                    rendered_content,
                } => updates.push((message_id, rendered_content)),
                ServerEvent::DeleteMessage { message_ids } => deletions.extend(message_ids),
                ServerEvent::Heartbeat => {}
                ServerEvent::Error(error) if error.code == ErrorCode::BadEventQueueId => {
                    warn!(msg = %error.msg, "events: queue expired");
                    self.reload.initiate(ReloadOptions {
                        immediate: true,
                        save_compose: true,
                        send_after_reload: false,
                    });
                }
                ServerEvent::Error(error) => {
                    let _ = self.events.send(ClientEvent::Error(error.msg));
                }
            }
        }

        let mut notifications = Vec::new();
        let deferred_edits = {
            let mut guard = self.inner.lock().await;
            let session = &mut *guard;

            let event_local_ids: Vec<LocalId> = messages
                .iter()
                .filter_map(|m| m.local_id.as_deref().map(LocalId::from))
                .collect();
            let report = session
                .engine
                .process_from_server(messages, &session.views);
            for local_id in &report.disparities {
                session.sent.mark_disparity(local_id);
            }
            // A failed send never gets its ack, so its timing is abandoned.
            for local_id in &report.recovered {
                session.sent.forget(local_id);
            }
            for local_id in &event_local_ids {
                if let Some(times) = session.sent.report_event_received(local_id) {
                    notifications.push(ClientEvent::DeliveryConfirmed(times));
                }
            }
            for (local_id, message_id) in report.reconciled {
                notifications.push(ClientEvent::MessageReconciled {
                    local_id,
                    message_id,
                });
            }

            let inserted = session
                .engine
                .insert_new_messages(report.non_echo, &session.views);
            if !inserted.is_empty() {
                notifications.push(ClientEvent::MessagesReceived(inserted));
            }
            for (message_id, rendered_content) in updates {
                session
                    .engine
                    .apply_update(message_id, rendered_content, &session.views);
            }
            session.engine.remove_messages(&deletions, &session.views);
            report.deferred_edits
        };

        for event in notifications {
            let _ = self.events.send(event);
        }
        for edit in deferred_edits {
            let transport = self.transport.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                match transport.edit(edit.message_id, &edit.raw_content).await {
                    Ok(()) => {
                        let _ = events.send(ClientEvent::DeferredEditSent {
                            local_id: edit.local_id,
                            message_id: edit.message_id,
                        });
                    }
                    Err(err) => {
                        warn!(local_id = %edit.local_id, error = %err, "edit: deferred edit failed");
                        let _ = events.send(ClientEvent::Error(format!(
                            "failed to save edit for message {}: {err}",
                            edit.message_id.0
                        )));
                    }
                }
            });
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        request: MessageRequest,
        local_id: LocalId,
        echoed: bool,
    ) -> SendReceipt {
        let slow_watch = self.spawn_slow_send_watch(local_id.clone());
        let outcome = self.transport.send(&request).await;
        slow_watch.abort();

        match &outcome {
            SendOutcome::Acked(response) => self.on_acked(&local_id, echoed, response.id).await,
            SendOutcome::Failed { message, code } => {
                self.on_failed(&local_id, echoed, message, code.clone()).await
            }
            SendOutcome::ReloadInitiated => {
                info!(local_id = %local_id, "send: deferred to reload");
            }
        }

        SendReceipt {
            local_id,
            locally_echoed: echoed,
            outcome,
        }
    }

    async fn on_acked(self: &Arc<Self>, local_id: &LocalId, echoed: bool, message_id: MessageId) {
        let times = {
            let mut guard = self.inner.lock().await;
            let session = &mut *guard;
            if echoed {
                session.engine.reify(local_id, message_id, &session.views);
            } else {
                session.engine.note_acked_id(message_id);
            }
            if session.engine.state(local_id) == Some(EchoState::Aborted) {
                info!(local_id = %local_id, message_id = message_id.0, "send: ack for aborted send");
                return;
            }
            session.sent.report_server_ack(local_id)
        };

        let _ = self.events.send(ClientEvent::MessageSent {
            local_id: local_id.clone(),
            message_id,
        });
        match times {
            Some(times) => {
                let _ = self.events.send(ClientEvent::DeliveryConfirmed(times));
            }
            None => self.spawn_event_catchup_watch(local_id.clone(), message_id),
        }
    }

    async fn on_failed(&self, local_id: &LocalId, echoed: bool, message: &str, code: Option<ErrorCode>) {
        {
            let mut guard = self.inner.lock().await;
            let session = &mut *guard;
            if echoed {
                if let Err(err) = session.engine.message_send_error(local_id, &session.views) {
                    debug!(local_id = %local_id, error = %err, "send: failure not recorded");
                }
            } else {
                session.sent.forget(local_id);
            }
        }
        let _ = self.events.send(ClientEvent::SendFailed {
            local_id: local_id.clone(),
            message: message.to_string(),
            code,
        });
    }

    fn spawn_slow_send_watch(self: &Arc<Self>, local_id: LocalId) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(client.timings.slow_send_threshold).await;
            let still_waiting = {
                let guard = client.inner.lock().await;
                guard
                    .sent
                    .get(&local_id)
                    .is_some_and(|transaction| !transaction.server_acked())
            };
            if still_waiting {
                info!(local_id = %local_id, "send: still waiting for the server");
                let _ = client.events.send(ClientEvent::SendSlow { local_id });
            }
        })
    }

    fn spawn_event_catchup_watch(self: &Arc<Self>, local_id: LocalId, message_id: MessageId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(client.timings.event_catchup_after).await;
            let missing = {
                let guard = client.inner.lock().await;
                guard
                    .sent
                    .get(&local_id)
                    .is_some_and(|transaction| !transaction.event_received())
            };
            if missing {
                warn!(
                    local_id = %local_id,
                    message_id = message_id.0,
                    "send: acked message never arrived on the event stream"
                );
                let _ = client.events.send(ClientEvent::EventCatchupNeeded {
                    local_id,
                    message_id,
                });
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
