//! Closure negotiation.
//!
//! When the technician proposes closing the ticket, the session counts down
//! a fixed number of ticks. The operator may confirm (closing immediately)
//! or decline (returning to `Idle`). Reaching zero counts as a confirmation.
//!
//! [`ClosureNegotiation`] is the pure state value; [`Countdown`] is the
//! cancellable repeating task that feeds it ticks. Every countdown carries
//! a generation number so that a tick which was already in flight when its
//! countdown got cancelled is recognized and ignored.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Default number of ticks before the closure is confirmed on its own.
pub const DEFAULT_COUNTDOWN_TICKS: u32 = 6;

/// Where the negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosurePhase {
    /// No closure proposed.
    Idle,
    /// A proposal arrived; the countdown is about to start.
    Proposed,
    /// Waiting for the operator, counting down.
    CountingDown,
    /// The session is closing.
    Resolved,
}

/// How the last negotiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureOutcome {
    /// Confirmed by the operator or by the countdown running out.
    ConfirmedClosed,
    /// The operator kept the ticket open.
    Declined,
}

/// Result of feeding a tick to the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stale or unexpected tick; nothing changed.
    Ignored,
    /// Still counting; this many ticks remain.
    Remaining(u32),
    /// The countdown ran out and the negotiation is resolved.
    Expired,
}

/// State of one session's closure negotiation.
#[derive(Debug, Clone)]
pub struct ClosureNegotiation {
    phase: ClosurePhase,
    remaining: u32,
    outcome: Option<ClosureOutcome>,
    initial: u32,
    generation: u64,
}

impl ClosureNegotiation {
    /// Creates an idle negotiation that counts down from `ticks`.
    #[must_use]
    pub const fn new(ticks: u32) -> Self {
        Self {
            phase: ClosurePhase::Idle,
            remaining: ticks,
            outcome: None,
            initial: ticks,
            generation: 0,
        }
    }

    /// Handle a closure proposal.
    ///
    /// Returns the generation of the countdown to start, or `None` when a
    /// negotiation is already running or finished (first proposal wins).
    pub fn propose(&mut self) -> Option<u64> {
        if self.phase != ClosurePhase::Idle {
            return None;
        }
        self.phase = ClosurePhase::Proposed;
        self.outcome = None;
        self.remaining = self.initial;
        self.generation += 1;
        self.phase = ClosurePhase::CountingDown;
        Some(self.generation)
    }

    /// Apply one countdown tick from the countdown of `generation`.
    pub fn tick(&mut self, generation: u64) -> TickOutcome {
        if self.phase != ClosurePhase::CountingDown || generation != self.generation {
            return TickOutcome::Ignored;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.resolve();
            TickOutcome::Expired
        } else {
            TickOutcome::Remaining(self.remaining)
        }
    }

    /// The operator confirmed. Returns `false` if nothing was pending.
    pub fn confirm(&mut self) -> bool {
        if self.phase != ClosurePhase::CountingDown {
            return false;
        }
        self.resolve();
        true
    }

    /// The operator declined. Returns `false` if nothing was pending.
    pub fn decline(&mut self) -> bool {
        if self.phase != ClosurePhase::CountingDown {
            return false;
        }
        self.phase = ClosurePhase::Idle;
        self.outcome = Some(ClosureOutcome::Declined);
        self.remaining = self.initial;
        true
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> ClosurePhase {
        self.phase
    }

    /// Ticks left in the running countdown.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Outcome of the most recent negotiation, if any.
    #[must_use]
    pub const fn outcome(&self) -> Option<ClosureOutcome> {
        self.outcome
    }

    /// Generation of the current (or last) countdown.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn resolve(&mut self) {
        self.phase = ClosurePhase::Resolved;
        self.outcome = Some(ClosureOutcome::ConfirmedClosed);
        self.remaining = 0;
    }
}

impl Default for ClosureNegotiation {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTDOWN_TICKS)
    }
}

/// Repeating tick task driving a [`ClosureNegotiation`].
///
/// At most one task runs at a time; starting a new one aborts the old.
#[derive(Debug, Default)]
pub struct Countdown {
    task: Option<JoinHandle<()>>,
}

impl Countdown {
    /// Start calling `on_tick` every `period`.
    ///
    /// The first tick fires one `period` after the start. The task stops on
    /// its own once `on_tick` returns `false`.
    pub fn start<F>(&mut self, period: Duration, mut on_tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !on_tick() {
                    break;
                }
            }
        }));
    }

    /// Stop the running countdown. Cancelling twice, or after the task has
    /// ended, is a no-op.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether a countdown task is currently scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}
