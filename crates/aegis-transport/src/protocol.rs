//! Wire protocol between execution contexts.
//!
//! Requests are `{ "type": TYPE, ...payload }`; replies are either a result
//! object or `{ "error": ..., "code": ... }`. Unknown payload fields are
//! ignored so senders can add optional fields without breaking older
//! receivers.

use std::fmt;

use aegis_core::{
    Investigation, MessageId, SessionSnapshot, SettingsPatch, StorageKeys, StorageMap, TabId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request from one context to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Read stored values.
    GetStorage {
        #[serde(default)]
        keys: StorageKeys,
    },
    /// Write stored values.
    SetStorage { data: StorageMap },
    /// Visible text of a page, via its content script.
    ExtractPageText {
        #[serde(default, rename = "tabId", skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
    /// Links on a page, via its content script.
    ExtractLinks {
        #[serde(default, rename = "tabId", skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
    /// Send a chat prompt to the agent.
    SubmitQuery { content: String },
    /// Stop the agent run in progress.
    CancelQuery,
    /// Start a new investigation and make it current.
    CreateInvestigation { target: String },
    /// Transient chat session.
    GetSession,
    /// Empty the chat log.
    ClearMessages,
    /// Merge a partial settings update.
    UpdateSettings { settings: SettingsPatch },
}

impl Request {
    /// Every recognised `type` tag.
    pub const KINDS: [&'static str; 11] = [
        "PING",
        "GET_STORAGE",
        "SET_STORAGE",
        "EXTRACT_PAGE_TEXT",
        "EXTRACT_LINKS",
        "SUBMIT_QUERY",
        "CANCEL_QUERY",
        "CREATE_INVESTIGATION",
        "GET_SESSION",
        "CLEAR_MESSAGES",
        "UPDATE_SETTINGS",
    ];

    /// The `type` tag of this request.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::GetStorage { .. } => "GET_STORAGE",
            Self::SetStorage { .. } => "SET_STORAGE",
            Self::ExtractPageText { .. } => "EXTRACT_PAGE_TEXT",
            Self::ExtractLinks { .. } => "EXTRACT_LINKS",
            Self::SubmitQuery { .. } => "SUBMIT_QUERY",
            Self::CancelQuery => "CANCEL_QUERY",
            Self::CreateInvestigation { .. } => "CREATE_INVESTIGATION",
            Self::GetSession => "GET_SESSION",
            Self::ClearMessages => "CLEAR_MESSAGES",
            Self::UpdateSettings { .. } => "UPDATE_SETTINGS",
        }
    }

    /// Decode a raw message, telling unknown types apart from bad payloads.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] when the message has no string `type`, an
    /// unrecognised `type`, or a payload that does not fit its type.
    pub fn decode(message: Value) -> Result<Self, ProtocolError> {
        let kind = match message.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) | None => return Err(ProtocolError::MissingType),
        };
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::Unrecognized(kind));
        }
        serde_json::from_value(message).map_err(|source| ProtocolError::Malformed { kind, source })
    }
}

/// Decoding failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message has no string `type` field")]
    MissingType,
    #[error("Unrecognized request type: {0}")]
    Unrecognized(String),
    #[error("Malformed {kind} request: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingType | Self::Unrecognized(_) => ErrorCode::UnrecognizedRequest,
            Self::Malformed { .. } => ErrorCode::MalformedRequest,
        }
    }
}

/// Machine-readable error category carried next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnrecognizedRequest,
    MalformedRequest,
    UnreachableContext,
    ExtractionFailed,
    StorageQuotaExceeded,
    StorageFailure,
    InvalidValue,
    Busy,
    NotFound,
    InvalidRequest,
    ChannelClosed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Reply to a [`Request`]. Exactly one is delivered per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Error { error: String, code: ErrorCode },
    Pong { status: String },
    Data { data: StorageMap },
    Success { success: bool },
    PageText { text: String },
    Links { links: Vec<String> },
    Accepted {
        accepted: bool,
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    Cancelled { cancelled: bool },
    Investigation { investigation: Investigation },
    Session { session: SessionSnapshot },
}

impl Reply {
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            status: "pong".to_owned(),
        }
    }

    #[must_use]
    pub const fn success() -> Self {
        Self::Success { success: true }
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            code,
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Error code, if this is an error reply.
    #[must_use]
    pub const fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}
