//! Core abstractions for the Aegis coordination layer.
//!
//! This crate provides the fundamental building blocks:
//! - Domain model (`Settings`, `Investigation`, `Message`, `AgentStatus`)
//! - `StreamingMachine` - one request/response cycle with generation tagging
//! - `StatusFeed` - broadcast + history of session changes
//! - `Origin` - context addressing
//! - Storage and page-context traits

pub mod context;
pub mod model;
pub mod status_feed;
pub mod streaming;
pub mod traits;

pub use context::{ContextKind, Origin, PageSnapshot, TabId};
pub use model::{
    AgentStatus, ApiKey, Investigation, InvestigationId, InvestigationStatus, Message, MessageId,
    ModelError, NewMessage, Role, SessionSnapshot, Settings, SettingsPatch, StealthPatch,
    StealthSettings, Theme, Timestamp,
};
pub use status_feed::{StatusEvent, StatusFeed};
pub use streaming::{Generation, RunTicket, Settlement, StreamingError, StreamingMachine};
pub use traits::{ContextError, PageContext, StorageArea, StorageError, StorageKeys, StorageMap};
