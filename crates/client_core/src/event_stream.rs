//! Websocket subscription to the server's event queue.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use shared::{domain::QueueId, protocol::ServerEvent};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{info, warn};
use url::Url;

use crate::{ClientEvent, EchoClient};

/// A frame carries one event or a batch; batches are reconciled together.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventFrame {
    Batch(Vec<ServerEvent>),
    Single(ServerEvent),
}

impl EventFrame {
    fn into_events(self) -> Vec<ServerEvent> {
        match self {
            Self::Batch(events) => events,
            Self::Single(event) => vec![event],
        }
    }
}

pub fn events_url(server_url: &str, queue_id: &QueueId) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(anyhow!("server_url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket url from {server_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server url cannot be a base: {server_url}"))?
        .pop_if_empty()
        .push("events");
    url.query_pairs_mut().clear().append_pair("queue_id", &queue_id.0);
    Ok(url)
}

/// Connects to the event queue and feeds every decoded frame into the
/// client. The returned task ends when the socket closes.
pub async fn spawn_event_stream(
    client: Arc<EchoClient>,
    server_url: &str,
    queue_id: &QueueId,
) -> Result<JoinHandle<()>> {
    let url = events_url(server_url, queue_id)?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    let (_, mut ws_reader) = ws_stream.split();
    info!(queue_id = %queue_id.0, "events: connected");

    Ok(tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<EventFrame>(&text) {
                    Ok(frame) => client.handle_server_events(frame.into_events()).await,
                    Err(err) => {
                        warn!(error = %err, "events: undecodable frame");
                        client.emit(ClientEvent::Error(format!("invalid server event: {err}")));
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    client.emit(ClientEvent::Error(format!("websocket receive failed: {err}")));
                    break;
                }
            }
        }
        info!("events: stream closed");
    }))
}
