//! Chat thread domain types
//!
//! A thread is a logical conversation rooted at one chat message. The
//! aggregator owns the live thread; everything else works on immutable
//! [`ThreadSnapshot`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identity of a thread: the channel it lives in plus its root message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct ThreadId {
    pub channel_id: String,
    pub root_message_id: String,
}

impl ThreadId {
    pub fn new(channel_id: impl Into<String>, root_message_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            root_message_id: root_message_id.into(),
        }
    }

    /// Stable string key used for persistence.
    pub fn key(&self) -> String {
        format!("{}/{}", self.channel_id, self.root_message_id)
    }

    /// Deterministic marker embedded in tracker issues so a lost local record
    /// can be reconciled against the tracker.
    pub fn marker(&self) -> String {
        format!("threadwatch:thread={}", self.key())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.root_message_id)
    }
}

/// File attached to a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .map(|mime| mime.starts_with("image/"))
            .unwrap_or(false)
    }
}

/// A single chat message. Immutable once appended to a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Chat-side message id, used to drop re-delivered events
    pub id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn author_label(&self) -> &str {
        self.author_name.as_deref().unwrap_or(&self.author_id)
    }
}

/// Thread lifecycle.
///
/// `Open -> PendingExtraction -> Linked | Suppressed -> Stale`. `Linked` and
/// `Suppressed` threads go back to `PendingExtraction` when new activity
/// triggers another cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Open,
    PendingExtraction,
    Linked,
    Suppressed,
    Stale,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadState::Open => "open",
            ThreadState::PendingExtraction => "pending_extraction",
            ThreadState::Linked => "linked",
            ThreadState::Suppressed => "suppressed",
            ThreadState::Stale => "stale",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable copy of a thread handed to the extraction and decision stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub channel_name: String,
    pub messages: Vec<Message>,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: ThreadState,
    /// Bumped on every append; lets a cycle tell whether the thread moved on
    pub generation: u64,
    pub linked_issue: Option<String>,
}

impl ThreadSnapshot {
    /// Conversation rendered as plain text, one block per message, in arrival order.
    pub fn transcript(&self) -> String {
        let mut formatted = Vec::with_capacity(self.messages.len() * 3);
        for message in &self.messages {
            formatted.push(format!(
                "**{}** ({}):",
                message.author_label(),
                message.timestamp.to_rfc3339()
            ));
            formatted.push(message.text.clone());
            if !message.attachments.is_empty() {
                let names: Vec<&str> = message
                    .attachments
                    .iter()
                    .map(|attachment| attachment.filename.as_str())
                    .collect();
                formatted.push(format!("Attachments: {}", names.join(", ")));
            }
            formatted.push(String::new());
        }
        formatted.join("\n")
    }

    /// Earliest and latest message timestamps.
    pub fn message_span(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self
            .messages
            .iter()
            .map(|message| message.timestamp)
            .min()
            .unwrap_or(self.first_seen);
        let end = self
            .messages
            .iter()
            .map(|message| message.timestamp)
            .max()
            .unwrap_or(self.last_activity);
        (start, end)
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.messages
            .iter()
            .flat_map(|message| message.attachments.iter())
    }
}

/// One message delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub channel_id: String,
    pub channel_name: String,
    /// Root of the thread the message replies to; `None` when the message
    /// starts a thread itself
    pub root_message_id: Option<String>,
    pub message: Message,
}

impl ChatEvent {
    pub fn thread_id(&self) -> ThreadId {
        let root = self
            .root_message_id
            .as_deref()
            .filter(|root| !root.is_empty())
            .unwrap_or(&self.message.id);
        ThreadId::new(self.channel_id.clone(), root)
    }
}
