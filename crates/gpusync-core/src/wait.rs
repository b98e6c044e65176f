//! Blocking waits: poll a predicate with an injectable backoff strategy, consulting the
//! device-hang signal periodically.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::HangDetector;
use crate::config::{BackoffKind, WaitConfig};

/// What a waiter does between two unsuccessful polls.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// `iteration` counts unsuccessful polls since the wait started.
    fn pause(&self, iteration: u32);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpinBackoff;

impl BackoffStrategy for SpinBackoff {
    fn pause(&self, _iteration: u32) {
        std::hint::spin_loop();
    }
}

/// Spin for `spin_iterations` polls, then yield the thread.
#[derive(Debug, Clone, Copy)]
pub struct YieldBackoff {
    pub spin_iterations: u32,
}

impl BackoffStrategy for YieldBackoff {
    fn pause(&self, iteration: u32) {
        if iteration < self.spin_iterations {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Spin for `spin_iterations` polls, then sleep between polls.
#[derive(Debug, Clone, Copy)]
pub struct LowPowerBackoff {
    pub spin_iterations: u32,
    pub sleep: Duration,
}

impl BackoffStrategy for LowPowerBackoff {
    fn pause(&self, iteration: u32) {
        if iteration < self.spin_iterations {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(self.sleep);
        }
    }
}

pub fn backoff_for(config: &WaitConfig) -> Arc<dyn BackoffStrategy> {
    match config.backoff {
        BackoffKind::Spin => Arc::new(SpinBackoff),
        BackoffKind::Yield => Arc::new(YieldBackoff {
            spin_iterations: config.spin_iterations,
        }),
        BackoffKind::LowPower => Arc::new(LowPowerBackoff {
            spin_iterations: config.spin_iterations,
            sleep: config.low_power_sleep(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Hang,
    TimedOut,
}

#[derive(Clone)]
pub struct WaitPolicy {
    backoff: Arc<dyn BackoffStrategy>,
    hang_check_period: Duration,
    timeout: Option<Duration>,
}

impl WaitPolicy {
    pub fn new(backoff: Arc<dyn BackoffStrategy>, hang_check_period: Duration) -> Self {
        Self {
            backoff,
            hang_check_period,
            timeout: None,
        }
    }

    pub fn from_config(config: &WaitConfig) -> Self {
        Self::new(backoff_for(config), config.hang_check_period())
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// Poll `ready` until it returns true, the hang signal is raised, or the timeout expires.
    ///
    /// The predicate is always evaluated before the hang signal, so work that completed before
    /// a hang is still reported as ready.
    pub fn wait_until(
        &self,
        hang: &dyn HangDetector,
        mut ready: impl FnMut() -> bool,
    ) -> WaitOutcome {
        let start = Instant::now();
        let mut last_hang_check = start;
        let mut iteration: u32 = 0;
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }

            let now = Instant::now();
            if now.duration_since(last_hang_check) >= self.hang_check_period {
                last_hang_check = now;
                if hang.is_hung() {
                    return WaitOutcome::Hang;
                }
            }
            if self
                .timeout
                .is_some_and(|timeout| now.duration_since(start) >= timeout)
            {
                return WaitOutcome::TimedOut;
            }

            self.backoff.pause(iteration);
            iteration = iteration.saturating_add(1);
        }
    }
}

impl fmt::Debug for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitPolicy")
            .field("backoff", &self.backoff)
            .field("hang_check_period", &self.hang_check_period)
            .field("timeout", &self.timeout)
            .finish()
    }
}
