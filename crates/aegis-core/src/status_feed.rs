//! Broadcast + history feed of session changes.
//!
//! Panels that (re)connect receive the recent history first, then switch to
//! live events without a gap.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    model::{AgentStatus, InvestigationId, InvestigationStatus, Message, MessageId},
    streaming::Generation,
};

/// Default number of events kept for late subscribers.
pub const DEFAULT_HISTORY_LEN: usize = 256;

const CHANNEL_CAPACITY: usize = 1024;

/// Something observable changed in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Agent status moved.
    StatusChanged {
        status: AgentStatus,
        generation: Generation,
    },
    MessageAdded { message: Message },
    /// Streamed content grew or the message was finalized.
    MessageUpdated {
        id: MessageId,
        content: String,
        is_streaming: bool,
    },
    MessagesCleared,
    InvestigationCreated { id: InvestigationId, target: String },
    InvestigationUpdated {
        id: InvestigationId,
        status: InvestigationStatus,
    },
    SettingsUpdated,
}

struct Inner {
    history: VecDeque<StatusEvent>,
    capacity: usize,
}

/// Status feed with broadcast and bounded history.
pub struct StatusFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<StatusEvent>,
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_LEN)
    }

    /// Feed that keeps at most `capacity` events for replay.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(capacity.min(64)),
                capacity,
            }),
            sender,
        }
    }

    /// Publish to live subscribers and history.
    pub fn push(&self, event: StatusEvent) {
        // Send under the history lock so a new subscriber sees each event in
        // exactly one of history or live
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(event.clone()); // no subscribers is fine

        if inner.capacity == 0 {
            return;
        }
        while inner.history.len() >= inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn history(&self) -> Vec<StatusEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// History first, then live events. Lagged events are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, StatusEvent> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            (inner.history.iter().cloned().collect::<Vec<_>>(), self.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!("status subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }

    /// Live agent-status transitions only.
    #[must_use]
    pub fn status_stream(&self) -> futures::stream::BoxStream<'static, AgentStatus> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move {
                match res {
                    Ok(StatusEvent::StatusChanged { status, .. }) => Some(status),
                    _ => None,
                }
            })
            .boxed()
    }
}
