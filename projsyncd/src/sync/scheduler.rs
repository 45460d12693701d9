use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Why the scheduler is asked to consider a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A write or delete was just recorded.
    Write,
    /// The periodic safety-net timer fired.
    Tick,
    /// An attempt finished; `pending` counts changes that arrived during it.
    Chain,
}

/// Single-flight decision: a new attempt may only start when none is
/// outstanding, and only when there is something to send.
pub fn should_start(trigger: Trigger, pending: usize, in_flight: bool) -> bool {
    match trigger {
        Trigger::Write | Trigger::Tick => !in_flight && pending > 0,
        // The finishing attempt still owns the flight.
        Trigger::Chain => pending > 0,
    }
}

/// Cancellable repeating timer. Starting a running tick and stopping a
/// stopped one are no-ops; dropping it stops the timer.
#[derive(Debug, Default)]
pub struct PeriodicTick {
    token: Option<CancellationToken>,
}

impl PeriodicTick {
    pub fn stopped() -> Self {
        Self::default()
    }

    /// Runs `on_tick` every `period` (first call after one period) until
    /// stopped or until `on_tick` returns `false`.
    pub fn start<F>(&mut self, runtime: &Handle, period: Duration, mut on_tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_running() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if !on_tick() {
                            break;
                        }
                    }
                }
            }
            debug!("periodic tick stopped");
        });
        self.token = Some(token);
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Drop for PeriodicTick {
    fn drop(&mut self) {
        self.stop();
    }
}
