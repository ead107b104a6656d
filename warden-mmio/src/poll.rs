//! Bounded Polling
//!
//! Every wait on hardware in the driver is bounded: a short run of tight
//! spins, then exponential backoff (or a wait-for-event when the device
//! signals completion with SEV), then a timeout. Callers never loop forever
//! on hardware-controlled state.

use core::fmt;
use core::hint::spin_loop;

use crate::barrier;

/// Polling budget for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Polls performed with a single spin hint between them
    pub spin_iterations: u32,
    /// Upper bound on the exponential backoff delay, in spin hints
    pub max_backoff: u32,
    /// Total polls before giving up
    pub budget: u32,
    /// Wait for an event (WFE) instead of backing off
    pub use_wfe: bool,
}

impl PollConfig {
    /// Budget used when the device is modelled in software and answers
    /// synchronously.
    pub const IMMEDIATE: Self = Self {
        spin_iterations: 1,
        max_backoff: 1,
        budget: 4,
        use_wfe: false,
    };
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 10,
            max_backoff: 1024,
            budget: 100_000,
            use_wfe: false,
        }
    }
}

/// The poll budget ran out before the condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout {
    /// Number of polls performed
    pub polls: u32,
}

impl fmt::Display for PollTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll timed out after {} attempts", self.polls)
    }
}

/// Spin, then back off, then time out.
pub struct Backoff {
    config: PollConfig,
    polls: u32,
    delay: u32,
}

impl Backoff {
    /// Start a new wait with the given budget.
    #[inline]
    #[must_use]
    pub const fn new(config: PollConfig) -> Self {
        Self {
            config,
            polls: 0,
            delay: 1,
        }
    }

    /// Number of waits performed so far.
    #[inline]
    #[must_use]
    pub const fn polls(&self) -> u32 {
        self.polls
    }

    /// Wait once before the next poll.
    ///
    /// Returns [`PollTimeout`] once the budget is exhausted.
    pub fn wait(&mut self) -> Result<(), PollTimeout> {
        self.polls += 1;
        if self.polls >= self.config.budget {
            return Err(PollTimeout { polls: self.polls });
        }

        if self.polls <= self.config.spin_iterations {
            spin_loop();
        } else if self.config.use_wfe {
            barrier::wfe();
        } else {
            for _ in 0..self.delay {
                spin_loop();
            }
            self.delay = (self.delay * 2).min(self.config.max_backoff.max(1));
        }
        Ok(())
    }
}

/// Poll `condition` until it returns `true` or the budget runs out.
pub fn poll_until<F>(config: &PollConfig, mut condition: F) -> Result<(), PollTimeout>
where
    F: FnMut() -> bool,
{
    let mut backoff = Backoff::new(*config);
    loop {
        if condition() {
            return Ok(());
        }
        backoff.wait()?;
    }
}
