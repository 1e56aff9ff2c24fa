//! # Webhook Handlers
//!
//! Chat ingress. The chat server posts every message in a channel here; the
//! pipeline decides whether the message belongs to a monitored thread.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::connectors::ChatWebhookPayload;
use crate::error::{ApiError, unauthorized};
use crate::pipeline::TriggerDecision;
use crate::server::AppState;

/// Webhook accept response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// `accepted` or `ignored`
    pub status: String,
    /// `immediate`, `scheduled` or `duplicate` for accepted messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Seconds until a scheduled trigger fires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fires_in_secs: Option<u64>,
}

impl WebhookAcceptResponse {
    fn ignored() -> Self {
        Self {
            status: "ignored".to_string(),
            trigger: None,
            fires_in_secs: None,
        }
    }

    fn accepted(decision: TriggerDecision) -> Self {
        let (trigger, fires_in_secs) = match decision {
            TriggerDecision::Immediate => ("immediate", None),
            TriggerDecision::Scheduled { fires_in } => ("scheduled", Some(fires_in.as_secs())),
            TriggerDecision::Duplicate => ("duplicate", None),
        };
        Self {
            status: "accepted".to_string(),
            trigger: Some(trigger.to_string()),
            fires_in_secs,
        }
    }
}

/// Token carried either in the payload or as a bearer header.
fn presented_token<'a>(headers: &'a HeaderMap, payload: &'a ChatWebhookPayload) -> Option<&'a str> {
    payload.token.as_deref().filter(|t| !t.is_empty()).or_else(|| {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    })
}

fn verify_token(expected: Option<&str>, presented: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        Some(_) => {
            warn!("Chat webhook token mismatch");
            Err(unauthorized(Some("Invalid webhook token")))
        }
        None => {
            warn!("Chat webhook token missing");
            Err(unauthorized(Some("Missing webhook token")))
        }
    }
}

/// Accept one chat message
///
/// Returns `202` when the message joined a monitored thread and `200` with
/// status `ignored` for the bot's own posts and unmonitored channels.
#[utoipa::path(
    post,
    path = "/webhooks/chat",
    params(
        ("Authorization" = Option<String>, Header, description = "Bearer webhook token when not carried in the payload")
    ),
    request_body(content = ChatWebhookPayload, content_type = "application/json"),
    responses(
        (status = 202, description = "Message accepted", body = WebhookAcceptResponse),
        (status = 200, description = "Message ignored", body = WebhookAcceptResponse),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Missing or invalid webhook token", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_chat_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatWebhookPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<WebhookAcceptResponse>), ApiError> {
    let Json(payload) = payload?;
    verify_token(
        state.webhook_token.as_deref(),
        presented_token(&headers, &payload),
    )?;

    let event = payload.into_event().map_err(|message| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED".to_string(),
            message,
        )
    })?;
    debug!(
        channel = %event.channel_name,
        message_id = %event.message.id,
        "Chat webhook received"
    );

    match state.pipeline.handle_event(event).await {
        Some(decision) => Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAcceptResponse::accepted(decision)),
        )),
        None => Ok((StatusCode::OK, Json(WebhookAcceptResponse::ignored()))),
    }
}
