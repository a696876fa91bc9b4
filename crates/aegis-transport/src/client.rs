//! Client stub held by panel and content contexts.

use aegis_core::{Origin, SessionSnapshot, StorageKeys, StorageMap};
use serde_json::Value;

use crate::{
    protocol::{Reply, Request},
    router::{RouterHandle, TransportError},
};

/// Sends requests to the router on behalf of one context.
#[derive(Clone)]
pub struct ContextClient {
    handle: RouterHandle,
    origin: Origin,
}

impl ContextClient {
    #[must_use]
    pub const fn new(handle: RouterHandle, origin: Origin) -> Self {
        Self { handle, origin }
    }

    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Send a typed request.
    ///
    /// # Errors
    /// Returns error if the request cannot be encoded or the router is gone.
    pub async fn request(&self, request: &Request) -> Result<Reply, TransportError> {
        let message = serde_json::to_value(request)?;
        self.send(message).await
    }

    /// Send a raw JSON message.
    ///
    /// # Errors
    /// Returns error if the router is gone.
    pub async fn send(&self, message: Value) -> Result<Reply, TransportError> {
        self.handle.send(message, self.origin).await
    }

    /// # Errors
    /// Returns error if the router is gone.
    pub async fn ping(&self) -> Result<Reply, TransportError> {
        self.request(&Request::Ping).await
    }

    /// # Errors
    /// Returns error if the router is gone.
    pub async fn get_storage(&self, keys: StorageKeys) -> Result<Reply, TransportError> {
        self.request(&Request::GetStorage { keys }).await
    }

    /// # Errors
    /// Returns error if the router is gone.
    pub async fn set_storage(&self, data: StorageMap) -> Result<Reply, TransportError> {
        self.request(&Request::SetStorage { data }).await
    }

    /// Current transient session, or `None` if the router answered with an
    /// error.
    ///
    /// # Errors
    /// Returns error if the router is gone.
    pub async fn session(&self) -> Result<Option<SessionSnapshot>, TransportError> {
        match self.request(&Request::GetSession).await? {
            Reply::Session { session } => Ok(Some(session)),
            other => {
                tracing::warn!(reply = ?other, "unexpected reply to GET_SESSION");
                Ok(None)
            }
        }
    }
}
