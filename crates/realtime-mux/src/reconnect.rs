use std::time::Duration;

use tokio::task::JoinHandle;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Bounded exponential backoff applied after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempts, max)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSnapshot {
    pub attempts: u32,
    pub pending_delay: Option<Duration>,
    pub exhausted: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    AlreadyPending,
    /// `newly` is false when the budget had already run out earlier.
    Exhausted { newly: bool },
    Schedule { delay: Duration, attempt: u32 },
}

struct PendingRetry {
    delay: Duration,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Per-entry retry bookkeeping. At most one timer is armed at a time.
#[derive(Default)]
pub(crate) struct ReconnectState {
    attempts: u32,
    exhausted: bool,
    pending: Option<PendingRetry>,
}

impl ReconnectState {
    pub(crate) fn next_retry(&mut self, policy: &ReconnectPolicy) -> RetryDecision {
        if self.pending.is_some() {
            return RetryDecision::AlreadyPending;
        }
        if self.attempts >= policy.max_attempts {
            let newly = !self.exhausted;
            self.exhausted = true;
            return RetryDecision::Exhausted { newly };
        }
        let delay = policy.delay_for(self.attempts);
        self.attempts += 1;
        RetryDecision::Schedule {
            delay,
            attempt: self.attempts,
        }
    }

    pub(crate) fn arm(&mut self, delay: Duration, generation: u64, timer: JoinHandle<()>) {
        self.cancel();
        self.pending = Some(PendingRetry {
            delay,
            generation,
            timer,
        });
    }

    /// Claims the armed timer for `generation`. False means it was cancelled or
    /// superseded and the caller must not act.
    pub(crate) fn take_fired(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_connected(&mut self) {
        self.reset();
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
        self.cancel();
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn snapshot(&self) -> ReconnectSnapshot {
        ReconnectSnapshot {
            attempts: self.attempts,
            pending_delay: self.pending.as_ref().map(|pending| pending.delay),
            exhausted: self.exhausted,
        }
    }
}
