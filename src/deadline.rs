//! Admission deadlines.
//!
//! Every admission request arrives with a time budget. The core is blocking
//! and sequential, so cancellation is cooperative: a [`Deadline`] is threaded
//! through review and evaluation and checked between steps. Expiry fails
//! closed -- the request errors out rather than silently admitting.

use anyhow::{bail, Result};
use std::time::{Duration, Instant};

/// A caller-supplied point in time after which evaluation must abort.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; checks always pass.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `budget` from now.
    pub fn within(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    /// Deadline at an absolute instant.
    pub fn at(when: Instant) -> Self {
        Self(Some(when))
    }

    /// Returns whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|t| Instant::now() >= t)
    }

    /// Errors out if the deadline has passed, naming the step that was about
    /// to run.
    pub fn check(&self, step: &str) -> Result<()> {
        if self.expired() {
            bail!("admission deadline exceeded before {step}");
        }
        Ok(())
    }
}
