//! Streaming session state machine.
//!
//! One request/response cycle at a time: `idle -> thinking`, any order among
//! the busy phases, back to `idle` on completion or cancel. Each run carries a
//! [`Generation`]; results tagged with an older generation are stale and must
//! be dropped by the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::AgentStatus;

/// Monotonic run counter. Bumped on every submit and every effective cancel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Proof of an accepted submission. Only the holder of the current ticket can
/// move the machine between busy phases or complete the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct RunTicket {
    generation: Generation,
}

impl RunTicket {
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }
}

/// Whether a ticket-bearing operation took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    /// The ticket's run was cancelled or already finished.
    Stale,
}

impl Settlement {
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Streaming state machine error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamingError {
    #[error("A request is already in progress (agent is {0})")]
    Busy(AgentStatus),
    #[error("`{0}` is not a busy phase")]
    InvalidPhase(AgentStatus),
}

/// The state machine itself. Not synchronized; owners wrap it in their lock.
#[derive(Debug, Default)]
pub struct StreamingMachine {
    status: AgentStatus,
    generation: Generation,
}

impl StreamingMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn status(&self) -> AgentStatus {
        self.status
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.status.is_busy()
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Ticket belongs to the run in progress.
    #[must_use]
    pub fn is_current(&self, ticket: RunTicket) -> bool {
        self.status.is_busy() && ticket.generation == self.generation
    }

    /// Start a run: `idle -> thinking`.
    ///
    /// # Errors
    /// Returns [`StreamingError::Busy`] while another run is in progress.
    pub fn submit(&mut self) -> Result<RunTicket, StreamingError> {
        if self.status.is_busy() {
            return Err(StreamingError::Busy(self.status));
        }
        self.generation = self.generation.next();
        self.status = AgentStatus::Thinking;
        Ok(RunTicket {
            generation: self.generation,
        })
    }

    /// Move the current run to another busy phase.
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidPhase`] for `idle`; use
    /// [`complete`](Self::complete) or [`cancel`](Self::cancel) instead.
    pub fn advance(
        &mut self,
        ticket: RunTicket,
        phase: AgentStatus,
    ) -> Result<Settlement, StreamingError> {
        if !phase.is_busy() {
            return Err(StreamingError::InvalidPhase(phase));
        }
        if !self.is_current(ticket) {
            return Ok(Settlement::Stale);
        }
        self.status = phase;
        Ok(Settlement::Applied)
    }

    /// Finish the current run: `busy -> idle`.
    pub fn complete(&mut self, ticket: RunTicket) -> Settlement {
        if !self.is_current(ticket) {
            return Settlement::Stale;
        }
        self.status = AgentStatus::Idle;
        Settlement::Applied
    }

    /// Abort whatever is running. Returns `false` if already idle.
    pub fn cancel(&mut self) -> bool {
        if !self.status.is_busy() {
            return false;
        }
        self.status = AgentStatus::Idle;
        self.generation = self.generation.next();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_idle() {
        let machine = StreamingMachine::new();
        assert_eq!(machine.status(), AgentStatus::Idle);
        assert!(!machine.is_streaming());
    }

    #[test]
    fn test_submit_enters_thinking() {
        let mut machine = StreamingMachine::new();
        let ticket = machine.submit().unwrap();
        assert_eq!(machine.status(), AgentStatus::Thinking);
        assert!(machine.is_streaming());
        assert!(machine.is_current(ticket));
    }

    #[test]
    fn test_submit_while_busy_is_rejected() {
        let mut machine = StreamingMachine::new();
        let ticket = machine.submit().unwrap();
        machine.advance(ticket, AgentStatus::Searching).unwrap();

        assert_eq!(machine.submit(), Err(StreamingError::Busy(AgentStatus::Searching)));
        assert_eq!(machine.status(), AgentStatus::Searching);
        assert_eq!(machine.generation(), ticket.generation());
    }

    #[test]
    fn test_busy_phases_in_any_order() {
        let mut machine = StreamingMachine::new();
        let ticket = machine.submit().unwrap();
        for phase in [
            AgentStatus::Verifying,
            AgentStatus::Thinking,
            AgentStatus::Searching,
            AgentStatus::Verifying,
        ] {
            assert_eq!(machine.advance(ticket, phase), Ok(Settlement::Applied));
            assert_eq!(machine.status(), phase);
        }
        assert_eq!(machine.complete(ticket), Settlement::Applied);
        assert_eq!(machine.status(), AgentStatus::Idle);
    }

    #[test]
    fn test_advance_to_idle_is_invalid() {
        let mut machine = StreamingMachine::new();
        let ticket = tokio_test::assert_ok!(machine.submit());
        let err = tokio_test::assert_err!(machine.advance(ticket, AgentStatus::Idle));
        assert_eq!(err, StreamingError::InvalidPhase(AgentStatus::Idle));
        assert!(machine.is_current(ticket));
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let mut machine = StreamingMachine::new();
        let before = machine.generation();
        assert!(!machine.cancel());
        assert_eq!(machine.status(), AgentStatus::Idle);
        assert_eq!(machine.generation(), before);
    }

    #[test]
    fn test_cancel_makes_ticket_stale() {
        let mut machine = StreamingMachine::new();
        let ticket = machine.submit().unwrap();
        machine.advance(ticket, AgentStatus::Searching).unwrap();

        assert!(machine.cancel());
        assert_eq!(machine.status(), AgentStatus::Idle);
        assert_eq!(machine.complete(ticket), Settlement::Stale);
        assert_eq!(machine.advance(ticket, AgentStatus::Verifying), Ok(Settlement::Stale));
        assert_eq!(machine.status(), AgentStatus::Idle);
    }

    #[test]
    fn test_stale_ticket_cannot_touch_next_run() {
        let mut machine = StreamingMachine::new();
        let old = machine.submit().unwrap();
        machine.cancel();
        let fresh = machine.submit().unwrap();
        assert!(fresh.generation() > old.generation());

        assert_eq!(machine.complete(old), Settlement::Stale);
        assert!(machine.is_current(fresh));
        assert_eq!(machine.status(), AgentStatus::Thinking);
    }

    #[test]
    fn test_double_complete_is_stale() {
        let mut machine = StreamingMachine::new();
        let ticket = machine.submit().unwrap();
        assert_eq!(machine.complete(ticket), Settlement::Applied);
        assert_eq!(machine.complete(ticket), Settlement::Stale);
    }
}
