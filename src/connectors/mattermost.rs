//! Mattermost chat adapter: outgoing-webhook payloads in, threaded replies out.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use utoipa::ToSchema;

use super::http::{build_client, ensure_success};
use super::{ChatReplier, ConnectorError};
use crate::config::ChatConfig;
use crate::models::{Attachment, ChatEvent, Message};

const REPLY_TIMEOUT_SECS: u64 = 10;

/// Body of a Mattermost outgoing webhook call.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatWebhookPayload {
    /// Shared token configured on the webhook
    #[serde(default)]
    pub token: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub post_id: String,
    /// Root post of the thread; empty or absent for a top-level post
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub files: Vec<WebhookFile>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct WebhookFile {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ChatWebhookPayload {
    /// Convert to a transport-neutral event. Fails on missing identifiers.
    pub fn into_event(self) -> Result<ChatEvent, String> {
        for (name, value) in [
            ("channel_id", &self.channel_id),
            ("user_id", &self.user_id),
            ("post_id", &self.post_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("`{}` must not be empty", name));
            }
        }

        let timestamp = self
            .timestamp
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);

        let message = Message {
            id: self.post_id,
            author_id: self.user_id,
            author_name: self.user_name.filter(|name| !name.is_empty()),
            text: self.text,
            timestamp,
            attachments: self
                .files
                .into_iter()
                .map(|file| Attachment {
                    url: file.url,
                    filename: file.name,
                    mime_type: file.mime_type,
                    size: file.size,
                })
                .collect(),
        };

        Ok(ChatEvent {
            channel_name: self
                .channel_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| self.channel_id.clone()),
            channel_id: self.channel_id,
            root_message_id: self.root_id.filter(|root| !root.is_empty()),
            message,
        })
    }
}

/// Posts replies under the thread's root post.
#[derive(Clone)]
pub struct MattermostReplier {
    client: Client,
    api_base: String,
    token: String,
}

impl MattermostReplier {
    /// `None` unless both the server URL and a bot token are configured.
    pub fn from_config(config: &ChatConfig) -> Result<Option<Self>, ConnectorError> {
        let (Some(api_base), Some(token)) = (config.api_base.clone(), config.api_token.clone())
        else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: build_client(std::time::Duration::from_secs(REPLY_TIMEOUT_SECS))?,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }))
    }
}

#[async_trait]
impl ChatReplier for MattermostReplier {
    async fn reply(
        &self,
        channel_id: &str,
        root_message_id: &str,
        text: &str,
    ) -> Result<(), ConnectorError> {
        let response = self
            .client
            .post(format!("{}/api/v4/posts", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({
                "channel_id": channel_id,
                "root_id": root_message_id,
                "message": text,
            }))
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(channel_id, root_message_id, "Posted chat reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> ChatWebhookPayload {
        serde_json::from_value(json!({
            "token": "hook-token",
            "channel_id": "ch1",
            "channel_name": "support",
            "timestamp": 1_772_359_200_000_i64,
            "user_id": "u1",
            "user_name": "alice",
            "post_id": "p2",
            "root_id": "p1",
            "text": "still broken",
            "files": [{"url": "https://files.test/log.txt", "name": "log.txt"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_payload_converts_to_event() {
        let event = payload().into_event().unwrap();
        assert_eq!(event.thread_id().key(), "ch1/p1");
        assert_eq!(event.channel_name, "support");
        assert_eq!(event.message.author_label(), "alice");
        assert_eq!(event.message.attachments[0].filename, "log.txt");
        assert_eq!(event.message.timestamp.timestamp_millis(), 1_772_359_200_000);
    }

    #[test]
    fn test_top_level_post_roots_its_own_thread() {
        let mut top = payload();
        top.root_id = Some(String::new());
        top.channel_name = None;
        let event = top.into_event().unwrap();
        assert_eq!(event.thread_id().key(), "ch1/p2");
        assert_eq!(event.channel_name, "ch1");
    }

    #[test]
    fn test_missing_ids_rejected() {
        let mut broken = payload();
        broken.post_id = " ".into();
        assert!(broken.into_event().unwrap_err().contains("post_id"));
    }

    #[tokio::test]
    async fn test_reply_posts_threaded_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/posts"))
            .and(header("authorization", "Bearer bot-token"))
            .and(body_json(json!({
                "channel_id": "ch1",
                "root_id": "p1",
                "message": "Created issue #1"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let replier = MattermostReplier::from_config(&ChatConfig {
            api_base: Some(server.uri()),
            api_token: Some("bot-token".into()),
            ..ChatConfig::default()
        })
        .unwrap()
        .unwrap();
        replier.reply("ch1", "p1", "Created issue #1").await.unwrap();
    }
}
