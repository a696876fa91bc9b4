//! Conversation manager: runs one agent request at a time against the store.

use std::{panic::AssertUnwindSafe, sync::Arc};

use aegis_core::{AgentStatus, Message, NewMessage, RunTicket, StorageArea};
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::{
    responder::{PhaseReporter, Responder, ResponderError},
    store::{SessionStore, StoreError},
};

/// Longest prompt the panel accepts.
pub const MAX_PROMPT_CHARS: usize = 500;

/// Conversation manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("Prompt is {len} characters; the limit is {max}")]
    PromptTooLong { len: usize, max: usize },
}

/// The run in flight.
struct ActiveRun {
    ticket: RunTicket,
    interrupt_tx: Option<oneshot::Sender<()>>,
}

/// Drives submissions through the [`Responder`] and back into the store.
///
/// The store's state machine is the authority on whether a run is current;
/// the interrupt here only stops work early.
pub struct ConversationManager<S>
where
    S: StorageArea,
{
    store: Arc<SessionStore<S>>,
    responder: Arc<dyn Responder>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl<S> ConversationManager<S>
where
    S: StorageArea + 'static,
{
    #[must_use]
    pub fn new(store: Arc<SessionStore<S>>, responder: Arc<dyn Responder>) -> Self {
        Self {
            store,
            responder,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub const fn store(&self) -> &Arc<SessionStore<S>> {
        &self.store
    }

    /// Log the prompt and start the agent on it.
    ///
    /// # Errors
    /// Returns error for empty or oversized prompts, while another run is in
    /// progress, or if the store cannot persist.
    pub async fn submit(&self, content: &str) -> Result<Message, ManagerError> {
        let prompt = content.trim();
        if prompt.is_empty() {
            return Err(ManagerError::EmptyPrompt);
        }
        let len = prompt.chars().count();
        if len > MAX_PROMPT_CHARS {
            return Err(ManagerError::PromptTooLong {
                len,
                max: MAX_PROMPT_CHARS,
            });
        }

        let (ticket, message) = self.store.submit_request(NewMessage::user(prompt)).await?;
        let (interrupt_tx, interrupt_rx) = oneshot::channel();

        *self.active.lock().await = Some(ActiveRun {
            ticket,
            interrupt_tx: Some(interrupt_tx),
        });

        tokio::spawn(run(
            Arc::clone(&self.store),
            Arc::clone(&self.responder),
            Arc::clone(&self.active),
            ticket,
            prompt.to_owned(),
            interrupt_rx,
        ));

        Ok(message)
    }

    /// Cancel the run in progress. Returns `false` if nothing was running.
    pub async fn cancel(&self) -> bool {
        if let Some(mut active) = self.active.lock().await.take() {
            if let Some(tx) = active.interrupt_tx.take() {
                let _ = tx.send(());
            }
        }
        self.store.cancel_request().await
    }
}

async fn run<S: StorageArea>(
    store: Arc<SessionStore<S>>,
    responder: Arc<dyn Responder>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    ticket: RunTicket,
    prompt: String,
    mut interrupt_rx: oneshot::Receiver<()>,
) {
    let (phase_tx, mut phase_rx) = mpsc::unbounded_channel::<AgentStatus>();
    let reporter = PhaseReporter::new(phase_tx);
    // A panicking agent still ends the run, as a failure
    let respond = AssertUnwindSafe(responder.respond(&prompt, &reporter))
        .catch_unwind()
        .map(|result| {
            result.unwrap_or_else(|_| Err(ResponderError::Failed("agent panicked".to_owned())))
        });
    tokio::pin!(respond);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut interrupt_rx => break None,
            Some(phase) = phase_rx.recv() => {
                if let Err(e) = store.report_phase(ticket, phase).await {
                    tracing::warn!("agent reported an invalid phase: {e}");
                }
            }
            result = &mut respond => break Some(result),
        }
    };

    let settled = match outcome {
        None => {
            tracing::debug!(generation = %ticket.generation(), "run interrupted");
            Ok(None)
        }
        Some(Ok(reply)) => store.complete_request(ticket, reply).await,
        Some(Err(e)) => {
            tracing::warn!("agent run failed: {e}");
            store.fail_request(ticket, e.to_string()).await
        }
    };
    if let Err(e) = settled {
        tracing::error!("failed to record agent reply: {e}");
    }

    let mut active = active.lock().await;
    if active.as_ref().is_some_and(|a| a.ticket == ticket) {
        *active = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aegis_core::{Role, StreamingError};
    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::{responder::AcknowledgingResponder, storage::MemoryStorage};

    struct Failing;

    #[async_trait]
    impl Responder for Failing {
        async fn respond(
            &self,
            _prompt: &str,
            _phases: &PhaseReporter,
        ) -> Result<String, ResponderError> {
            Err(ResponderError::Unavailable("no model configured".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Responder for Panicking {
        async fn respond(
            &self,
            _prompt: &str,
            _phases: &PhaseReporter,
        ) -> Result<String, ResponderError> {
            panic!("model crashed");
        }
    }

    /// Ignores interrupts and answers after a fixed delay.
    struct Stubborn(Duration);

    #[async_trait]
    impl Responder for Stubborn {
        async fn respond(
            &self,
            _prompt: &str,
            phases: &PhaseReporter,
        ) -> Result<String, ResponderError> {
            phases.report(AgentStatus::Searching);
            tokio::time::sleep(self.0).await;
            Ok("late answer".into())
        }
    }

    async fn manager(responder: Arc<dyn Responder>) -> ConversationManager<MemoryStorage> {
        let store = SessionStore::load(MemoryStorage::new()).await.unwrap();
        ConversationManager::new(Arc::new(store), responder)
    }

    async fn wait_for_idle(store: &SessionStore<MemoryStorage>) {
        let mut statuses = store.feed().status_stream();
        while store.is_streaming().await {
            let _ = tokio::time::timeout(Duration::from_millis(50), statuses.next()).await;
        }
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let manager = manager(Arc::new(AcknowledgingResponder::new(Duration::ZERO))).await;
        let user = manager.submit("  hello  ").await.unwrap();
        assert_eq!(user.content(), "hello");

        wait_for_idle(manager.store()).await;

        let messages = manager.store().messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Agent);
        assert!(messages[1].content().contains("hello"));
    }

    #[tokio::test]
    async fn test_rejects_bad_prompts() {
        let manager = manager(Arc::new(AcknowledgingResponder::default())).await;
        assert!(matches!(manager.submit("   ").await, Err(ManagerError::EmptyPrompt)));

        let long = "x".repeat(MAX_PROMPT_CHARS + 1);
        assert!(matches!(
            manager.submit(&long).await,
            Err(ManagerError::PromptTooLong { .. })
        ));
        assert!(manager.store().messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_submit_while_busy_is_rejected() {
        let manager = manager(Arc::new(Stubborn(Duration::from_secs(30)))).await;
        manager.submit("first").await.unwrap();

        let err = manager.submit("second").await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Store(StoreError::Streaming(StreamingError::Busy(_)))
        ));
        assert_eq!(manager.store().messages().await.len(), 1);
        assert!(manager.cancel().await);
    }

    #[tokio::test]
    async fn test_failure_is_logged_as_system_message() {
        let manager = manager(Arc::new(Failing)).await;
        manager.submit("hi").await.unwrap();
        wait_for_idle(manager.store()).await;

        let messages = manager.store().messages().await;
        assert_eq!(messages.last().unwrap().role, Role::System);
        assert!(messages.last().unwrap().content().contains("no model configured"));
    }

    #[tokio::test]
    async fn test_panicking_agent_ends_the_run() {
        let manager = manager(Arc::new(Panicking)).await;
        manager.submit("hi").await.unwrap();
        wait_for_idle(manager.store()).await;

        let last = manager.store().messages().await.pop().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content().contains("agent panicked"));

        // and the next prompt is accepted
        manager.submit("again").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_returns_to_idle_immediately() {
        let manager = manager(Arc::new(Stubborn(Duration::from_secs(30)))).await;
        manager.submit("q").await.unwrap();

        assert!(manager.cancel().await);
        assert_eq!(manager.store().agent_status().await, AgentStatus::Idle);
        assert!(!manager.cancel().await);

        // idle is re-enterable right away
        manager.submit("again").await.unwrap();
        assert!(manager.store().is_streaming().await);
        manager.cancel().await;
    }
}
