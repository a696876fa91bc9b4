//! Message router: one handler per request, exactly one reply per request.
//!
//! Every request travels with a [`ReplySlot`]. Settling consumes the slot, so
//! a handler cannot reply twice; dropping an unsettled slot (early return,
//! panic, cancelled task) replies with `channel_closed`, so a caller is never
//! left waiting.

use std::{collections::HashMap, sync::Arc};

use aegis_core::{ContextError, Origin, StorageArea, StorageError, StreamingError};
use aegis_session::{ConversationManager, ManagerError, StoreError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    client::ContextClient,
    pages::PageRegistry,
    protocol::{ErrorCode, Reply, Request},
};

/// Transport error seen by a sending context.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Router is no longer running")]
    RouterUnavailable,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-use reply channel for one request.
#[must_use = "an unsettled slot replies with `channel_closed` when dropped"]
pub struct ReplySlot {
    tx: Option<oneshot::Sender<Reply>>,
}

impl ReplySlot {
    /// A slot and the receiver its reply will arrive on.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the reply.
    pub fn settle(mut self, reply: Reply) {
        if let Some(tx) = self.tx.take() {
            if tx.send(reply).is_err() {
                tracing::debug!("caller went away before the reply arrived");
            }
        }
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!("request finished without a reply; closing channel with an error");
            let _ = tx.send(Reply::error(
                ErrorCode::ChannelClosed,
                "Handler finished without replying",
            ));
        }
    }
}

/// A decoded request waiting in its origin's lane.
type Queued = (Request, ReplySlot);

/// A request in flight through the router queue.
pub struct Envelope {
    pub message: Value,
    pub origin: Origin,
    pub reply: ReplySlot,
}

/// Sending side of a running router. Cheap to clone.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl RouterHandle {
    /// Send a raw message and wait for its reply.
    ///
    /// # Errors
    /// Returns [`TransportError::RouterUnavailable`] if the router has stopped.
    pub async fn send(&self, message: Value, origin: Origin) -> Result<Reply, TransportError> {
        let rx = self.enqueue(message, origin)?;
        rx.await.map_err(|_| TransportError::RouterUnavailable)
    }

    /// Queue a raw message without waiting. The queue position is fixed on
    /// return, so back-to-back calls are handled in call order.
    ///
    /// # Errors
    /// Returns [`TransportError::RouterUnavailable`] if the router has stopped.
    pub fn enqueue(
        &self,
        message: Value,
        origin: Origin,
    ) -> Result<oneshot::Receiver<Reply>, TransportError> {
        let (reply, rx) = ReplySlot::channel();
        self.tx
            .send(Envelope {
                message,
                origin,
                reply,
            })
            .map_err(|_| TransportError::RouterUnavailable)?;
        Ok(rx)
    }

    /// Client stub for a context.
    #[must_use]
    pub fn client(&self, origin: Origin) -> ContextClient {
        ContextClient::new(self.clone(), origin)
    }
}

/// Dispatches requests from any context to their handler.
pub struct Router<S>
where
    S: StorageArea,
{
    conversation: Arc<ConversationManager<S>>,
    pages: PageRegistry,
}

impl<S> Router<S>
where
    S: StorageArea + 'static,
{
    #[must_use]
    pub const fn new(conversation: Arc<ConversationManager<S>>, pages: PageRegistry) -> Self {
        Self {
            conversation,
            pages,
        }
    }

    pub const fn pages(&self) -> &PageRegistry {
        &self.pages
    }

    /// Run the router on the current tokio runtime.
    ///
    /// Each origin gets its own lane: requests from one sender are handled
    /// one at a time in send order, while different senders proceed
    /// independently. Decode failures are answered inline.
    pub fn spawn(self) -> (RouterHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let router = Arc::new(self);

        let task = tokio::spawn(async move {
            let mut lanes: HashMap<Origin, mpsc::UnboundedSender<Queued>> = HashMap::new();

            while let Some(Envelope {
                message,
                origin,
                reply,
            }) = rx.recv().await
            {
                let request = match Request::decode(message) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(%origin, "rejected message: {e}");
                        reply.settle(Reply::error(e.code(), e.to_string()));
                        continue;
                    }
                };
                tracing::debug!(%origin, kind = request.kind(), "routing request");

                let lane = lanes
                    .entry(origin)
                    .or_insert_with(|| Self::spawn_lane(Arc::clone(&router), origin));
                if let Err(mpsc::error::SendError(queued)) = lane.send((request, reply)) {
                    // Lane task died; start a fresh one for this origin
                    tracing::warn!(%origin, "request lane closed; restarting it");
                    let lane = Self::spawn_lane(Arc::clone(&router), origin);
                    let _ = lane.send(queued);
                    lanes.insert(origin, lane);
                }
            }
            tracing::debug!("router queue closed");
        });

        (RouterHandle { tx }, task)
    }

    fn spawn_lane(router: Arc<Self>, origin: Origin) -> mpsc::UnboundedSender<Queued> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let response = router.handle(request, &origin).await;
                reply.settle(response);
            }
            tracing::debug!(%origin, "request lane closed");
        });
        tx
    }

    /// Decode and handle one raw message.
    pub async fn dispatch(&self, message: Value, origin: &Origin) -> Reply {
        match Request::decode(message) {
            Ok(request) => self.handle(request, origin).await,
            Err(e) => {
                tracing::warn!(%origin, "rejected message: {e}");
                Reply::error(e.code(), e.to_string())
            }
        }
    }

    /// Handle one decoded request. Failures come back as error replies.
    pub async fn handle(&self, request: Request, origin: &Origin) -> Reply {
        let store = self.conversation.store();

        match request {
            Request::Ping => Reply::pong(),
            Request::GetStorage { keys } => match store.get(&keys).await {
                Ok(data) => Reply::Data { data },
                Err(e) => store_error_reply(&e),
            },
            Request::SetStorage { data } => match store.set(data).await {
                Ok(()) => Reply::success(),
                Err(e) => store_error_reply(&e),
            },
            Request::ExtractPageText { tab_id } => {
                let result = match self.pages.resolve(tab_id, origin) {
                    Ok(page) => page.extract_text().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(text) => Reply::PageText { text },
                    Err(e) => context_error_reply(&e),
                }
            }
            Request::ExtractLinks { tab_id } => {
                let result = match self.pages.resolve(tab_id, origin) {
                    Ok(page) => page.extract_links().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(links) => Reply::Links { links },
                    Err(e) => context_error_reply(&e),
                }
            }
            Request::SubmitQuery { content } => match self.conversation.submit(&content).await {
                Ok(message) => Reply::Accepted {
                    accepted: true,
                    message_id: message.id,
                },
                Err(e) => manager_error_reply(&e),
            },
            Request::CancelQuery => Reply::Cancelled {
                cancelled: self.conversation.cancel().await,
            },
            Request::CreateInvestigation { target } => {
                if target.trim().is_empty() {
                    return Reply::error(ErrorCode::InvalidRequest, "Investigation target is empty");
                }
                match store.create_investigation(target.trim()).await {
                    Ok(investigation) => Reply::Investigation { investigation },
                    Err(e) => store_error_reply(&e),
                }
            }
            Request::GetSession => Reply::Session {
                session: store.snapshot().await,
            },
            Request::ClearMessages => {
                store.clear_messages().await;
                Reply::success()
            }
            Request::UpdateSettings { settings } => match store.update_settings(settings).await {
                Ok(_) => Reply::success(),
                Err(e) => store_error_reply(&e),
            },
        }
    }
}

fn store_error_reply(e: &StoreError) -> Reply {
    let code = match e {
        StoreError::Storage(StorageError::QuotaExceeded { .. }) => ErrorCode::StorageQuotaExceeded,
        StoreError::Storage(_) => ErrorCode::StorageFailure,
        StoreError::InvalidValue { .. } | StoreError::TransientKey(_) | StoreError::Model(_) => {
            ErrorCode::InvalidValue
        }
        StoreError::InvestigationNotFound(_) | StoreError::MessageNotFound(_) => {
            ErrorCode::NotFound
        }
        StoreError::Streaming(StreamingError::Busy(_)) => ErrorCode::Busy,
        StoreError::Streaming(StreamingError::InvalidPhase(_)) => ErrorCode::InvalidRequest,
    };
    if code == ErrorCode::StorageFailure || code == ErrorCode::StorageQuotaExceeded {
        tracing::error!("storage request failed: {e}");
    }
    Reply::error(code, e.to_string())
}

fn manager_error_reply(e: &ManagerError) -> Reply {
    match e {
        ManagerError::Store(e) => store_error_reply(e),
        ManagerError::EmptyPrompt | ManagerError::PromptTooLong { .. } => {
            Reply::error(ErrorCode::InvalidRequest, e.to_string())
        }
    }
}

fn context_error_reply(e: &ContextError) -> Reply {
    let code = match e {
        ContextError::Unreachable(_) => ErrorCode::UnreachableContext,
        ContextError::Extraction(_) => ErrorCode::ExtractionFailed,
    };
    Reply::error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aegis_core::{AgentStatus, PageSnapshot, StorageKeys};
    use aegis_session::{AcknowledgingResponder, SessionStore, storage::MemoryStorage};
    use serde_json::json;

    use super::*;

    async fn router() -> Router<MemoryStorage> {
        let store = SessionStore::load(MemoryStorage::new()).await.unwrap();
        let conversation = ConversationManager::new(
            Arc::new(store),
            Arc::new(AcknowledgingResponder::new(Duration::from_secs(30))),
        );
        Router::new(Arc::new(conversation), PageRegistry::new())
    }

    #[test]
    fn test_dropped_slot_replies_channel_closed() {
        let (slot, mut rx) = ReplySlot::channel();
        drop(slot);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::ChannelClosed));
    }

    #[test]
    fn test_settled_slot_replies_once() {
        let (slot, mut rx) = ReplySlot::channel();
        slot.settle(Reply::success());
        assert_eq!(rx.try_recv().unwrap(), Reply::success());
    }

    #[tokio::test]
    async fn test_ping() {
        let router = router().await;
        let reply = router.dispatch(json!({ "type": "PING" }), &Origin::panel()).await;
        assert_eq!(reply, Reply::pong());
    }

    #[tokio::test]
    async fn test_unknown_type_gets_explicit_error() {
        let router = router().await;
        let reply = router
            .dispatch(json!({ "type": "FORMAT_DISK" }), &Origin::panel())
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::UnrecognizedRequest));
    }

    #[tokio::test]
    async fn test_get_storage_missing_key_is_not_an_error() {
        let router = router().await;
        let reply = router
            .handle(
                Request::GetStorage {
                    keys: StorageKeys::many(["nonexistent"]),
                },
                &Origin::panel(),
            )
            .await;
        match reply {
            Reply::Data { data } => assert!(!data.contains_key("nonexistent")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_storage_transient_key_is_invalid() {
        let router = router().await;
        let reply = router
            .dispatch(
                json!({ "type": "SET_STORAGE", "data": { "agentStatus": "thinking" } }),
                &Origin::panel(),
            )
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidValue));
    }

    #[tokio::test]
    async fn test_extract_without_page_is_unreachable() {
        let router = router().await;
        let reply = router
            .handle(Request::ExtractPageText { tab_id: Some(42) }, &Origin::panel())
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::UnreachableContext));
    }

    #[tokio::test]
    async fn test_extract_relays_collaborator_output() {
        let router = router().await;
        router.pages().register(
            7,
            Arc::new(PageSnapshot::new(
                "page body",
                vec!["https://example.com/a".into(), "https://example.com/b".into()],
            )),
        );

        let text = router
            .handle(Request::ExtractPageText { tab_id: None }, &Origin::content(7))
            .await;
        assert_eq!(text, Reply::PageText { text: "page body".into() });

        let links = router
            .handle(Request::ExtractLinks { tab_id: Some(7) }, &Origin::panel())
            .await;
        assert!(matches!(links, Reply::Links { ref links } if links.len() == 2));
    }

    #[tokio::test]
    async fn test_submit_busy_then_cancel() {
        let router = router().await;
        let origin = Origin::panel();

        let first = router
            .handle(Request::SubmitQuery { content: "first".into() }, &origin)
            .await;
        assert!(matches!(first, Reply::Accepted { accepted: true, .. }));

        let second = router
            .handle(Request::SubmitQuery { content: "second".into() }, &origin)
            .await;
        assert_eq!(second.error_code(), Some(ErrorCode::Busy));

        let cancelled = router.handle(Request::CancelQuery, &origin).await;
        assert_eq!(cancelled, Reply::Cancelled { cancelled: true });

        let again = router.handle(Request::CancelQuery, &origin).await;
        assert_eq!(again, Reply::Cancelled { cancelled: false });

        match router.handle(Request::GetSession, &origin).await {
            Reply::Session { session } => {
                assert_eq!(session.agent_status, AgentStatus::Idle);
                assert!(!session.is_streaming);
                assert_eq!(session.messages.len(), 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_investigation_requires_target() {
        let router = router().await;
        let reply = router
            .handle(Request::CreateInvestigation { target: "  ".into() }, &Origin::panel())
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_spawned_router_round_trip() {
        let (handle, _task) = router().await.spawn();
        let reply = handle
            .send(json!({ "type": "PING" }), Origin::content(1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::pong());

        let reply = handle
            .send(json!({ "type": "NOPE" }), Origin::panel())
            .await
            .unwrap();
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_stopped_router_is_unavailable() {
        let (handle, task) = router().await.spawn();
        task.abort();
        let _ = task.await;

        let err = handle
            .send(json!({ "type": "PING" }), Origin::panel())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RouterUnavailable));
    }
}
