//! Cross-context transport for the Aegis coordination layer.
//!
//! Provides:
//! - Wire protocol (`Request` / `Reply`)
//! - `Router` with single-resolution reply slots
//! - `PageRegistry` for content-script contexts
//! - `ContextClient` stubs
//! - Line-delimited JSON stdio bridge (feature: stdio)

pub mod client;
pub mod pages;
pub mod protocol;
pub mod router;

#[cfg(feature = "stdio")]
pub mod stdio;

pub use client::ContextClient;
pub use pages::PageRegistry;
pub use protocol::{ErrorCode, ProtocolError, Reply, Request};
pub use router::{ReplySlot, Router, RouterHandle, TransportError};
