use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, load_settings_from},
    event_stream::spawn_event_stream,
    ClientEvent, EchoClient, EchoSettings, MessageListView, MessageStore, Narrow, SendOutcome,
    SenderProfile,
};
use futures::StreamExt;
use shared::{
    domain::{MessageId, MessageTarget, QueueId, StreamId, UserId},
    protocol::MessageRequest,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to ./echo_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Post a stream message with local echo and wait for it to be confirmed.
    Send {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value = "")]
        full_name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long)]
        stream_id: i64,
        #[arg(long)]
        topic: String,
        /// Highest message id the client already knows about.
        #[arg(long, default_value_t = 0)]
        max_message_id: i64,
        /// Event queue to subscribe to; without it only the HTTP ack is awaited.
        #[arg(long)]
        queue_id: Option<String>,
        #[arg(long, default_value_t = 10_000)]
        wait_ms: u64,
        content: String,
    },
    /// Print the effective settings.
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }

    match cli.command {
        Command::Settings => println!("{settings:#?}"),
        Command::Send {
            user_id,
            full_name,
            email,
            stream_id,
            topic,
            max_message_id,
            queue_id,
            wait_ms,
            content,
        } => {
            let sender = SenderProfile {
                user_id: UserId(user_id),
                full_name,
                email,
            };
            let target = MessageTarget::stream(StreamId(stream_id), topic);
            send(
                &settings,
                sender,
                target,
                MessageId(max_message_id),
                queue_id.map(QueueId),
                Duration::from_millis(wait_ms),
                content,
            )
            .await?;
        }
    }

    Ok(())
}

async fn send(
    settings: &EchoSettings,
    sender: SenderProfile,
    target: MessageTarget,
    max_message_id: MessageId,
    queue_id: Option<QueueId>,
    wait: Duration,
    content: String,
) -> Result<()> {
    let user_id = sender.user_id;
    let client = EchoClient::new(settings, sender, MessageStore::with_max_message_id(max_message_id));
    let list = MessageListView::new("all", Narrow::All);
    client.subscribe_view(list.clone()).await;
    let mut events = Box::pin(client.events_stream());

    let listening = queue_id.is_some();
    let queue_id = match queue_id {
        Some(queue_id) => {
            spawn_event_stream(client.clone(), &settings.server_url, &queue_id)
                .await
                .context("failed to subscribe to the event queue")?;
            queue_id
        }
        None => QueueId::generate(),
    };

    let receipt = client
        .send_message(MessageRequest::new(user_id, target, content, queue_id))
        .await;
    info!(
        local_id = %receipt.local_id,
        locally_echoed = receipt.locally_echoed,
        "send finished"
    );
    match &receipt.outcome {
        SendOutcome::Acked(response) => println!("sent message_id={}", response.id.0),
        SendOutcome::Failed { message, .. } => anyhow::bail!("{message}"),
        SendOutcome::ReloadInitiated => anyhow::bail!("session is stale; reload required"),
    }
    if !listening {
        return Ok(());
    }

    let confirmed = tokio::time::timeout(wait, async {
        while let Some(event) = events.next().await {
            match event {
                ClientEvent::DeliveryConfirmed(times) if times.local_id == receipt.local_id => {
                    return Some(times);
                }
                ClientEvent::Error(err) => tracing::warn!(error = %err, "client error"),
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    match confirmed {
        Some(times) => println!(
            "confirmed in {}ms (ack {}ms, event {}ms)",
            times.total.as_millis(),
            times.until_server_ack.as_millis(),
            times.until_event.as_millis()
        ),
        None => println!("message event not received within {}ms", wait.as_millis()),
    }
    for message in list.messages() {
        println!("{}  {}", message.id, message.content);
    }
    Ok(())
}
