//! Session store and streaming orchestration for the Aegis coordination layer.
//!
//! Provides:
//! - `SessionStore` - owner of settings, investigations and the chat session
//! - `ConversationManager` - one agent request at a time, cancellable
//! - Install/update lifecycle with schema versioning
//! - Storage implementations (memory, JSON file)

pub mod lifecycle;
pub mod manager;
pub mod responder;
pub mod storage;
pub mod store;

pub use lifecycle::{InstallOutcome, InstallReason, detect_install_reason, on_installed};
pub use manager::{ConversationManager, ManagerError};
pub use responder::{AcknowledgingResponder, PhaseReporter, Responder, ResponderError};
pub use store::{SessionStore, StoreError};
