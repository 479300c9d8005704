//! Send transport: posts composed messages and normalizes the result.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::{EditMessageRequest, MessageRequest, SendMessageResponse},
};
use tracing::{info, warn};

use crate::error::SendError;

#[async_trait]
pub trait MessagePoster: Send + Sync {
    async fn post_message(&self, request: &MessageRequest)
        -> Result<SendMessageResponse, SendError>;
    async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<(), SendError>;
}

pub struct HttpMessagePoster {
    http: Client,
    server_url: String,
}

impl HttpMessagePoster {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MessagePoster for HttpMessagePoster {
    async fn post_message(
        &self,
        request: &MessageRequest,
    ) -> Result<SendMessageResponse, SendError> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<(), SendError> {
        let response = self
            .http
            .patch(format!("{}/messages/{}", self.server_url, message_id.0))
            .json(&EditMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(code_for_status(status), body));
    Err(SendError::Api {
        status: status.as_u16(),
        error,
    })
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        s if s.is_client_error() => ErrorCode::Validation,
        _ => ErrorCode::Internal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOptions {
    pub immediate: bool,
    pub save_compose: bool,
    pub send_after_reload: bool,
}

/// The reload subsystem, consulted when a send fails while the client's
/// session may be out of date.
pub trait ReloadHandler: Send + Sync {
    fn is_pending(&self) -> bool;
    fn initiate(&self, options: ReloadOptions);
}

/// Exactly one outcome is produced per send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Acked(SendMessageResponse),
    Failed {
        message: String,
        code: Option<ErrorCode>,
    },
    /// The failure was handed to the reload subsystem; the ordinary error
    /// path must not run for this attempt.
    ReloadInitiated,
}

#[derive(Clone)]
pub struct SendTransport {
    poster: Arc<dyn MessagePoster>,
    reload: Arc<dyn ReloadHandler>,
}

impl SendTransport {
    pub fn new(poster: Arc<dyn MessagePoster>, reload: Arc<dyn ReloadHandler>) -> Self {
        Self { poster, reload }
    }

    pub async fn send(&self, request: &MessageRequest) -> SendOutcome {
        match self.poster.post_message(request).await {
            Ok(response) => SendOutcome::Acked(response),
            Err(err) => self.classify_failure(err),
        }
    }

    pub async fn edit(&self, message_id: MessageId, content: &str) -> Result<(), SendError> {
        self.poster.edit_message(message_id, content).await
    }

    fn classify_failure(&self, err: SendError) -> SendOutcome {
        let stale_queue = err
            .api_error()
            .is_some_and(|api| api.code == ErrorCode::BadEventQueueId);
        if !err.is_timeout() && (stale_queue || self.reload.is_pending()) {
            info!(error = %err, "send: failure while session is stale; reloading");
            self.reload.initiate(ReloadOptions {
                immediate: true,
                save_compose: true,
                send_after_reload: true,
            });
            return SendOutcome::ReloadInitiated;
        }

        let (message, code) = match err.api_error() {
            Some(api) => (api.msg.clone(), Some(api.code.clone())),
            None => (err.to_string(), None),
        };
        warn!(error = %err, "send: message send failed");
        SendOutcome::Failed {
            message: format!("Error sending message: {message}"),
            code,
        }
    }
}
