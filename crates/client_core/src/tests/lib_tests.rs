use super::*;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use shared::{
    domain::{MessageTarget, QueueId, StreamId, UserId},
    error::ApiError,
    protocol::EditMessageRequest,
};
use std::sync::atomic::AtomicUsize;
use tokio::{net::TcpListener, time::timeout};

#[derive(Clone, Default)]
struct ServerState {
    sends: Arc<std::sync::Mutex<Vec<MessageRequest>>>,
    edits: Arc<std::sync::Mutex<Vec<(i64, String)>>>,
    failures_left: Arc<AtomicUsize>,
    delay_ms: u64,
    next_id: i64,
}

async fn handle_send(
    State(state): State<ServerState>,
    Json(request): Json<MessageRequest>,
) -> Response {
    state.sends.lock().expect("lock").push(request);
    if state.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
    }
    let failing = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"code": "rate_limited", "msg": "API usage exceeded rate limit"})),
        )
            .into_response();
    }
    Json(json!({"id": state.next_id})).into_response()
}

async fn handle_edit(
    State(state): State<ServerState>,
    Path(message_id): Path<i64>,
    Json(edit): Json<EditMessageRequest>,
) -> StatusCode {
    state
        .edits
        .lock()
        .expect("lock")
        .push((message_id, edit.content));
    StatusCode::OK
}

async fn handle_events(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(push_one_message)
}

async fn push_one_message(mut socket: WebSocket) {
    let frame = json!([
        {"type": "heartbeat"},
        {"type": "message", "payload": {
            "id": 777,
            "sender_id": 9,
            "sender_full_name": "Othello",
            "target": {"type": "stream", "stream_id": 3, "topic": "lunch"},
            "content": "<p>pizza?</p>",
            "timestamp": "2024-01-01T12:00:00Z"
        }}
    ]);
    let _ = socket.send(AxumWsMessage::Text(frame.to_string())).await;
    let _ = socket.send(AxumWsMessage::Close(None)).await;
}

async fn spawn_server(state: ServerState) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/messages", post(handle_send))
        .route("/messages/:id", patch(handle_edit))
        .route("/events", get(handle_events))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn sender() -> SenderProfile {
    SenderProfile {
        user_id: UserId(7),
        full_name: "Iago".into(),
        email: "iago@example.com".into(),
    }
}

fn settings(server_url: String) -> EchoSettings {
    EchoSettings {
        server_url,
        ..EchoSettings::default()
    }
}

fn request(content: &str) -> MessageRequest {
    MessageRequest::new(
        UserId(7),
        MessageTarget::stream(StreamId(3), "lunch"),
        content,
        QueueId("queue-1".into()),
    )
}

fn server_copy(local_id: &LocalId, id: i64, content: &str) -> ServerEvent {
    ServerEvent::Message {
        message: MessageEvent {
            local_id: Some(local_id.to_string()),
            id: MessageId(id),
            sender_id: UserId(7),
            sender_full_name: Some("Iago".into()),
            target: MessageTarget::stream(StreamId(3), "lunch"),
            content: content.into(),
            timestamp: Utc::now(),
            topic_links: Vec::new(),
            is_me_message: false,
            submessages: Vec::new(),
            flags: Vec::new(),
        },
    }
}

async fn next_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

async fn client_with_list(
    settings: &EchoSettings,
) -> (Arc<EchoClient>, Arc<MessageListView>) {
    let client = EchoClient::new(
        settings,
        sender(),
        MessageStore::with_max_message_id(MessageId(100)),
    );
    let list = MessageListView::new("all", Narrow::All);
    client.subscribe_view(list.clone()).await;
    (client, list)
}

#[tokio::test]
async fn echoed_send_is_reified_by_the_http_ack() {
    let state = ServerState {
        next_id: 4521,
        ..ServerState::default()
    };
    let server_url = spawn_server(state.clone()).await;
    let (client, list) = client_with_list(&settings(server_url)).await;
    let mut events = client.subscribe_events();

    let receipt = client.send_message(request("hello")).await;

    assert!(receipt.locally_echoed);
    assert_eq!(receipt.local_id.as_str(), "100.01");
    let sent = state.sends.lock().expect("lock").clone();
    assert_eq!(sent[0].local_id.as_deref(), Some("100.01"));
    assert!(!sent[0].resend);
    assert_eq!(list.ids(), vec![DisplayId::Server(MessageId(4521))]);
    next_event(&mut events, |e| {
        matches!(e, ClientEvent::MessageSent { message_id, .. } if *message_id == MessageId(4521))
    })
    .await;

    client
        .handle_server_events(vec![server_copy(&receipt.local_id, 4521, "<p>hello</p>")])
        .await;
    let confirmed = next_event(&mut events, |e| matches!(e, ClientEvent::DeliveryConfirmed(_))).await;
    let ClientEvent::DeliveryConfirmed(times) = confirmed else {
        unreachable!()
    };
    assert!(times.locally_echoed);
    assert!(!times.rendered_content_disparity);
    assert!(client.inspect(|engine| engine.registry().is_empty()).await);
}

#[tokio::test]
async fn failed_send_is_marked_and_resent_with_the_same_local_id() {
    let state = ServerState {
        next_id: 200,
        failures_left: Arc::new(AtomicUsize::new(1)),
        ..ServerState::default()
    };
    let server_url = spawn_server(state.clone()).await;
    let (client, list) = client_with_list(&settings(server_url)).await;
    let mut events = client.subscribe_events();

    let receipt = client.send_message(request("retry me")).await;
    assert!(matches!(
        receipt.outcome,
        SendOutcome::Failed { code: Some(ErrorCode::RateLimited), .. }
    ));
    assert!(list.messages()[0].failed);
    let failure = next_event(&mut events, |e| matches!(e, ClientEvent::SendFailed { .. })).await;
    let ClientEvent::SendFailed { message, .. } = failure else {
        unreachable!()
    };
    assert_eq!(message, "Error sending message: API usage exceeded rate limit");

    let retry = client.resend(&receipt.local_id).await.expect("resend");
    assert!(matches!(retry.outcome, SendOutcome::Acked(_)));

    let sent = state.sends.lock().expect("lock").clone();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].resend);
    assert_eq!(sent[1].local_id, sent[0].local_id);
    assert_eq!(list.ids(), vec![DisplayId::Server(MessageId(200))]);
    assert!(!list.messages()[0].failed);
}

#[tokio::test]
async fn non_echoed_sends_use_fallback_ids() {
    let state = ServerState {
        next_id: 300,
        ..ServerState::default()
    };
    let server_url = spawn_server(state.clone()).await;
    let (client, list) = client_with_list(&settings(server_url)).await;

    let receipt = client.send_message(request("/poll lunch?")).await;

    assert!(!receipt.locally_echoed);
    assert_eq!(receipt.local_id.as_str(), "loc-1");
    assert_eq!(
        state.sends.lock().expect("lock")[0].local_id.as_deref(),
        Some("loc-1")
    );
    assert!(list.messages().is_empty());

    client
        .handle_server_events(vec![server_copy(&receipt.local_id, 300, "<p>poll</p>")])
        .await;
    assert_eq!(list.ids(), vec![DisplayId::Server(MessageId(300))]);
}

#[tokio::test]
async fn edits_made_while_pending_are_sent_after_reconciliation() {
    let state = ServerState {
        next_id: 4521,
        ..ServerState::default()
    };
    let server_url = spawn_server(state.clone()).await;
    let (client, list) = client_with_list(&settings(server_url)).await;
    let mut events = client.subscribe_events();

    let receipt = client.send_message(request("tpyo")).await;
    client
        .edit_pending(&receipt.local_id, "typo")
        .await
        .expect("edit while waiting for the event");
    assert_eq!(list.messages()[0].content, "<p>typo</p>");

    client
        .handle_server_events(vec![server_copy(&receipt.local_id, 4521, "<p>tpyo</p>")])
        .await;
    next_event(&mut events, |e| matches!(e, ClientEvent::DeferredEditSent { .. })).await;

    assert_eq!(
        state.edits.lock().expect("lock").as_slice(),
        &[(4521, "typo".to_string())]
    );
    assert_eq!(list.messages()[0].content, "<p>typo</p>");
}

#[tokio::test]
async fn slow_sends_are_reported() {
    let state = ServerState {
        next_id: 101,
        delay_ms: 300,
        ..ServerState::default()
    };
    let server_url = spawn_server(state).await;
    let settings = EchoSettings {
        slow_send_threshold_ms: 20,
        ..settings(server_url)
    };
    let (client, _list) = client_with_list(&settings).await;
    let mut events = client.subscribe_events();

    let receipt = client.send_message(request("slow")).await;

    let slow = next_event(&mut events, |e| matches!(e, ClientEvent::SendSlow { .. })).await;
    let ClientEvent::SendSlow { local_id } = slow else {
        unreachable!()
    };
    assert_eq!(local_id, receipt.local_id);
}

#[tokio::test]
async fn missing_event_after_ack_requests_catchup() {
    let state = ServerState {
        next_id: 101,
        ..ServerState::default()
    };
    let server_url = spawn_server(state).await;
    let settings = EchoSettings {
        event_catchup_ms: 20,
        ..settings(server_url)
    };
    let (client, _list) = client_with_list(&settings).await;
    let mut events = client.subscribe_events();

    client.send_message(request("lost")).await;

    let catchup =
        next_event(&mut events, |e| matches!(e, ClientEvent::EventCatchupNeeded { .. })).await;
    assert!(matches!(
        catchup,
        ClientEvent::EventCatchupNeeded { message_id: MessageId(101), .. }
    ));
}

#[tokio::test]
async fn expired_event_queue_requests_reload() {
    let client = EchoClient::new(&EchoSettings::default(), sender(), MessageStore::new());
    let mut events = client.subscribe_events();

    client
        .handle_server_events(vec![ServerEvent::Error(ApiError::new(
            ErrorCode::BadEventQueueId,
            "Bad event queue id",
        ))])
        .await;

    next_event(&mut events, |e| matches!(e, ClientEvent::ReloadRequired(_))).await;
    assert!(client.reload_pending());

    client.reset_session(MessageStore::new()).await;
    assert!(!client.reload_pending());
}

#[tokio::test]
async fn event_stream_feeds_the_client() {
    let server_url = spawn_server(ServerState::default()).await;
    let (client, list) = client_with_list(&settings(server_url.clone())).await;
    let mut events = Box::pin(client.events_stream());

    let task = event_stream::spawn_event_stream(
        client.clone(),
        &server_url,
        &QueueId::generate(),
    )
    .await
    .expect("connect");

    let received = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ClientEvent::MessagesReceived(messages)) = events.next().await {
                return messages;
            }
        }
    })
    .await
    .expect("message event");
    assert_eq!(received[0].sender_full_name, "Othello");
    assert_eq!(list.ids(), vec![DisplayId::Server(MessageId(777))]);
    let _ = timeout(Duration::from_secs(5), task).await;
}

#[tokio::test]
async fn failed_send_persisted_by_the_server_stops_being_tracked() {
    let state = ServerState {
        next_id: 200,
        failures_left: Arc::new(AtomicUsize::new(1)),
        ..ServerState::default()
    };
    let server_url = spawn_server(state).await;
    let (client, list) = client_with_list(&settings(server_url)).await;
    let mut events = client.subscribe_events();

    let receipt = client.send_message(request("lost ack")).await;
    assert!(matches!(receipt.outcome, SendOutcome::Failed { .. }));
    assert!(client.inner.lock().await.sent.get(&receipt.local_id).is_some());

    client
        .handle_server_events(vec![server_copy(&receipt.local_id, 200, "<p>lost ack</p>")])
        .await;
    next_event(&mut events, |e| matches!(e, ClientEvent::MessageReconciled { .. })).await;

    assert!(client.inner.lock().await.sent.get(&receipt.local_id).is_none());
    assert_eq!(list.ids(), vec![DisplayId::Server(MessageId(200))]);
    assert!(!list.messages()[0].failed);
}
