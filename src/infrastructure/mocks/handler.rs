//! Scripted event handler.

use crate::application::ports::EventHandler;
use crate::domain::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome a [`ScriptedHandler`] produces for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    FailTransient,
    FailPermanent,
}

/// Handler that replays a fixed list of outcomes.
///
/// Once the script is exhausted every further call uses the fallback step.
/// An optional delay simulates slow processing; the delay is cut short when
/// the processing token is cancelled, in which case the call fails with
/// [`Error::Cancelled`].
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedHandler {
    /// Handler that always succeeds.
    pub fn succeeding() -> Self {
        Self::new([], Step::Succeed)
    }

    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `handle` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that ran to completion without being cancelled.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Payloads received, in call order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().expect("ScriptedHandler mutex poisoned").clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .expect("ScriptedHandler mutex poisoned")
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .expect("ScriptedHandler mutex poisoned")
            .push(payload.to_vec());
        let step = self.next_step();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let interrupted = if self.delay.is_zero() {
            false
        } else {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.delay) => false,
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if interrupted {
            return Err(Error::Cancelled);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        match step {
            Step::Succeed => Ok(()),
            Step::FailTransient => Err(Error::transient("scripted transient failure")),
            Step::FailPermanent => Err(Error::permanent("scripted permanent failure")),
        }
    }
}
