//! Agent collaborator seam.
//!
//! The natural-language agent is external; this crate only drives it through
//! [`Responder`] and turns its phase reports into state-machine moves.

use std::time::Duration;

use aegis_core::AgentStatus;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Responder error.
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),
    #[error("Agent failed: {0}")]
    Failed(String),
}

/// Lets a responder announce which busy phase it is in.
#[derive(Debug, Clone)]
pub struct PhaseReporter {
    tx: mpsc::UnboundedSender<AgentStatus>,
}

impl PhaseReporter {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<AgentStatus>) -> Self {
        Self { tx }
    }

    /// Report a phase. Ignored once the run is over.
    pub fn report(&self, phase: AgentStatus) {
        let _ = self.tx.send(phase);
    }
}

/// Produces the agent's reply to a prompt.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Answer `prompt`, reporting progress through `phases`.
    async fn respond(&self, prompt: &str, phases: &PhaseReporter) -> Result<String, ResponderError>;
}

/// Placeholder agent: waits, walks the busy phases, and acknowledges the
/// query.
#[derive(Debug, Clone)]
pub struct AcknowledgingResponder {
    delay: Duration,
}

impl AcknowledgingResponder {
    /// Default thinking time.
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(1500);

    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for AcknowledgingResponder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

#[async_trait]
impl Responder for AcknowledgingResponder {
    async fn respond(
        &self,
        prompt: &str,
        phases: &PhaseReporter,
    ) -> Result<String, ResponderError> {
        let step = self.delay / 2;

        phases.report(AgentStatus::Searching);
        tokio::time::sleep(step).await;
        phases.report(AgentStatus::Verifying);
        tokio::time::sleep(self.delay.saturating_sub(step)).await;

        Ok(format!(
            "I received your query: \"{prompt}\"\n\n\
             Live investigation is not connected yet. For now I can confirm that:\n\n\
             - your message was received\n\
             - session state is being tracked\n\
             - the panel is responsive"
        ))
    }
}
