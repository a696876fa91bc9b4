//! Domain model: settings, investigations, chat messages and agent status.

use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unix epoch milliseconds.
pub type Timestamp = i64;

/// Investigation identifier.
pub type InvestigationId = Uuid;

/// Message identifier.
pub type MessageId = Uuid;

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Model-level invariant violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid investigation transition: {from} -> {to}")]
    InvalidTransition {
        from: InvestigationStatus,
        to: InvestigationStatus,
    },
    #[error("Message {0} is no longer streaming; content is frozen")]
    MessageFrozen(MessageId),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Panel colour theme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

/// Request-shaping toggles used when the agent reaches out to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StealthSettings {
    pub user_agent_rotation: bool,
    pub request_throttling: bool,
    pub passive_mode: bool,
}

impl Default for StealthSettings {
    fn default() -> Self {
        Self {
            user_agent_rotation: true,
            request_throttling: true,
            passive_mode: false,
        }
    }
}

/// Provider API key. Never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw key value, for handing to the provider client only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("ApiKey(<empty>)")
        } else {
            f.write_str("ApiKey(<redacted>)")
        }
    }
}

/// User settings. Seeded on install, overwritten field-wise afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: Theme,
    pub api_keys: BTreeMap<String, ApiKey>,
    pub stealth: StealthSettings,
}

impl Settings {
    /// Key for a provider, if one is configured and non-empty.
    #[must_use]
    pub fn api_key(&self, provider: &str) -> Option<&ApiKey> {
        self.api_keys.get(provider).filter(|k| !k.is_empty())
    }
}

/// Partial stealth update; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealthPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent_rotation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_throttling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive_mode: Option<bool>,
}

/// Partial settings update, merged field by field into the stored settings.
///
/// `api_keys` merges per provider: providers not named are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<BTreeMap<String, ApiKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stealth: Option<StealthPatch>,
}

impl SettingsPatch {
    #[must_use]
    pub const fn theme(theme: Theme) -> Self {
        Self {
            theme: Some(theme),
            api_keys: None,
            stealth: None,
        }
    }

    #[must_use]
    pub fn api_key(provider: impl Into<String>, key: ApiKey) -> Self {
        Self {
            api_keys: Some(BTreeMap::from([(provider.into(), key)])),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

/// A chat message. Content is frozen once `is_streaming` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    content: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    is_streaming: bool,
}

impl Message {
    /// Materialize a caller-supplied message with a fresh id.
    #[must_use]
    pub fn from_new(new: NewMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: new.role,
            content: new.content,
            timestamp: new.timestamp.unwrap_or_else(now_millis),
            is_streaming: new.is_streaming,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Append a streamed chunk.
    ///
    /// # Errors
    /// Returns [`ModelError::MessageFrozen`] once streaming has finished.
    pub fn append(&mut self, chunk: &str) -> Result<(), ModelError> {
        if !self.is_streaming {
            return Err(ModelError::MessageFrozen(self.id));
        }
        self.content.push_str(chunk);
        Ok(())
    }

    /// Mark the content final. Idempotent.
    pub const fn finish(&mut self) {
        self.is_streaming = false;
    }
}

/// Message as supplied by a caller: no id, optional timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub is_streaming: bool,
}

impl NewMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            is_streaming: false,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Start the message open for streamed chunks.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Investigations
// ---------------------------------------------------------------------------

/// Investigation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigationStatus {
    Active,
    Paused,
    Completed,
}

impl InvestigationStatus {
    /// `active <-> paused`, anything non-terminal `-> completed`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Paused | Self::Completed)
                | (Self::Paused, Self::Active | Self::Completed)
        )
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        })
    }
}

/// A named unit of work: a target and its chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investigation {
    pub id: InvestigationId,
    pub target: String,
    pub messages: Vec<Message>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub status: InvestigationStatus,
}

impl Investigation {
    /// New active investigation with an empty history.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        let timestamp = now_millis();
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            messages: Vec::new(),
            created_at: timestamp,
            updated_at: timestamp,
            status: InvestigationStatus::Active,
        }
    }

    /// Bump `updated_at` without ever moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at).max(self.created_at);
    }

    /// Move to `next`. Re-entering the current status is a no-op.
    ///
    /// # Errors
    /// Returns [`ModelError::InvalidTransition`] for moves out of `completed`.
    pub fn transition_to(&mut self, next: InvestigationStatus) -> Result<(), ModelError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }
}

// ---------------------------------------------------------------------------
// Agent status / transient session
// ---------------------------------------------------------------------------

/// What the agent is doing for the active request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Searching,
    Verifying,
}

impl AgentStatus {
    /// Every status except `idle` means a request is streaming.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Searching => "searching",
            Self::Verifying => "verifying",
        })
    }
}

/// Read-only view of the transient session handed to UI contexts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub agent_status: AgentStatus,
    pub current_investigation: Option<InvestigationId>,
}
