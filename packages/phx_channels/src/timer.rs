//! Retry scheduling with attempt counting.
//!
//! A [`Timer`] only decides *when*: it sleeps for `backoff(tries + 1)` and
//! then reports the wake-up through its `on_fire` sink, tagged with the
//! generation it was scheduled under. The owner confirms the wake-up with
//! [`Timer::fire`], which bumps the attempt counter, and then runs whatever
//! retry it stands for. Rescheduling is always the owner's call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

const FALLBACK_STEP_MS: u64 = 10_000;

/// Attempt number (1-based) to delay.
#[derive(Clone)]
pub struct Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl Backoff {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// `steps_ms[tries - 1]`, holding the last step for every later attempt.
    /// With no steps every attempt waits 10 s.
    pub fn stepped(steps_ms: &[u64]) -> Self {
        let steps: Vec<u64> = steps_ms.to_vec();
        Self::new(move |tries| {
            let idx = (tries.max(1) - 1) as usize;
            let ms = steps
                .get(idx)
                .or_else(|| steps.last())
                .copied()
                .unwrap_or(FALLBACK_STEP_MS);
            Duration::from_millis(ms)
        })
    }

    /// A fixed delay regardless of the attempt.
    pub fn constant(delay: Duration) -> Self {
        Self::new(move |_| delay)
    }

    pub fn delay(&self, tries: u32) -> Duration {
        (self.0)(tries)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::stepped(&[1000, 5000, 10000])
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backoff")
            .field(&self.delay(1))
            .field(&self.delay(2))
            .field(&self.delay(3))
            .finish()
    }
}

pub(crate) type FireSink = Arc<dyn Fn(u64) + Send + Sync>;

pub struct Timer {
    backoff: Backoff,
    tries: u32,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    on_fire: FireSink,
}

impl Timer {
    pub(crate) fn new(backoff: Backoff, on_fire: FireSink) -> Self {
        Self {
            backoff,
            tries: 0,
            generation: 0,
            pending: None,
            on_fire,
        }
    }

    /// Cancel any pending wake-up and schedule a new one after
    /// `backoff(tries + 1)`.
    pub fn schedule(&mut self) {
        self.cancel();
        let delay = self.backoff.delay(self.tries + 1);
        let generation = self.generation;
        let on_fire = Arc::clone(&self.on_fire);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        }));
    }

    /// Accept a wake-up. Returns `false` for a stale generation, i.e. one
    /// that was cancelled or rescheduled after the sleep was started.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        self.tries += 1;
        true
    }

    /// Zero the attempt counter and cancel any pending wake-up.
    pub fn reset(&mut self) {
        self.tries = 0;
        self.cancel();
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("backoff", &self.backoff)
            .field("tries", &self.tries)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}
