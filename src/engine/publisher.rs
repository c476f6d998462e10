use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: String,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(MessageHandle),
    RetryAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("chat api error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("chat transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<SendOutcome, PublishError>;
    async fn pin_chat_message(&self, chat_id: &str, message_id: i64) -> Result<(), PublishError>;
    async fn close(&self);
}

#[derive(Debug, Deserialize)]
struct BotReply<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

enum Reply<T> {
    Ok(T),
    RetryAfter(Duration),
}

/// Telegram Bot API over plain HTTPS.
#[derive(Clone)]
pub struct TelegramBot {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramBot {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build telegram http client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<Reply<T>, PublishError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.bot_token);
        let resp = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PublishError::Transport(format!("{method}: {}", e.without_url())))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PublishError::Transport(format!("{method} body: {}", e.without_url())))?;
        let reply: BotReply<T> = serde_json::from_str(&body).map_err(|e| {
            PublishError::Transport(format!("{method}: unexpected reply ({status}): {e}"))
        })?;

        if reply.ok {
            return reply.result.map(Reply::Ok).ok_or_else(|| {
                PublishError::Transport(format!("{method}: reply without result"))
            });
        }
        if let Some(secs) = reply.parameters.and_then(|p| p.retry_after) {
            return Ok(Reply::RetryAfter(Duration::from_secs(secs)));
        }
        Err(PublishError::Api {
            code: reply.error_code.unwrap_or(i64::from(status.as_u16())),
            description: reply.description.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ChatTransport for TelegramBot {
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<SendOutcome, PublishError> {
        let payload = json!({
            "chat_id": chat_id,
            "text": body,
            "parse_mode": "HTML",
        });
        match self.call::<SentMessage>("sendMessage", payload).await? {
            Reply::Ok(msg) => Ok(SendOutcome::Sent(MessageHandle {
                chat_id: chat_id.to_string(),
                message_id: msg.message_id,
            })),
            Reply::RetryAfter(d) => Ok(SendOutcome::RetryAfter(d)),
        }
    }

    async fn pin_chat_message(&self, chat_id: &str, message_id: i64) -> Result<(), PublishError> {
        let payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "disable_notification": false,
        });
        match self.call::<bool>("pinChatMessage", payload).await? {
            Reply::Ok(_) => Ok(()),
            Reply::RetryAfter(d) => Err(PublishError::Api {
                code: 429,
                description: format!("pin throttled, retry after {}s", d.as_secs()),
            }),
        }
    }

    async fn close(&self) {
        info!("chat session closed");
    }
}

/// Sends rendered sales to one channel and pins the large ones.
pub struct Publisher {
    transport: Arc<dyn ChatTransport>,
    chat_id: String,
    pin_threshold: Decimal,
}

impl Publisher {
    pub fn new(transport: Arc<dyn ChatTransport>, chat_id: &str, pin_threshold: Decimal) -> Self {
        Self {
            transport,
            chat_id: chat_id.to_string(),
            pin_threshold,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// A retry-after reply is slept out and the same body resent once.
    pub async fn send(&self, body: &str) -> Result<MessageHandle, PublishError> {
        match self.transport.send_message(&self.chat_id, body).await? {
            SendOutcome::Sent(handle) => Ok(handle),
            SendOutcome::RetryAfter(wait) => {
                warn!(wait_secs = wait.as_secs_f64(), "chat rate limited, waiting");
                tokio::time::sleep(wait).await;
                match self.transport.send_message(&self.chat_id, body).await? {
                    SendOutcome::Sent(handle) => Ok(handle),
                    SendOutcome::RetryAfter(again) => Err(PublishError::Api {
                        code: 429,
                        description: format!(
                            "still rate limited, retry after {}s",
                            again.as_secs()
                        ),
                    }),
                }
            }
        }
    }

    /// Returns whether a pin was issued and accepted. Failures are only logged.
    pub async fn pin_if(&self, handle: &MessageHandle, amount: Decimal) -> bool {
        if amount < self.pin_threshold {
            return false;
        }
        match self
            .transport
            .pin_chat_message(&handle.chat_id, handle.message_id)
            .await
        {
            Ok(()) => {
                info!(message_id = handle.message_id, %amount, "pinned high-value sale");
                true
            }
            Err(e) => {
                error!(message_id = handle.message_id, err = %e, "failed to pin message");
                false
            }
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
