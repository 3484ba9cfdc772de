//! Clock abstraction for deterministic timing in the background pipelines

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Time source used by the flush workers and transfer timers
///
/// The pipelines only ever measure elapsed time and sleep, so the trait
/// stays minimal. Production uses `SystemClock`; tests drive flush ticks
/// with `FakeClock::advance`.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real time via tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for tests
///
/// Sleepers are parked until `advance` moves the clock past their
/// deadline; time never moves on its own.
#[derive(Debug)]
pub struct FakeClock {
    state: Mutex<FakeClockState>,
    base: Instant,
}

#[derive(Debug)]
struct FakeClockState {
    elapsed: Duration,
    sleepers: Vec<Sleeper>,
}

#[derive(Debug)]
struct Sleeper {
    deadline: Duration,
    wake: oneshot::Sender<()>,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeClockState {
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            }),
            base: Instant::now(),
        })
    }

    /// Move the clock forward, waking every sleeper whose deadline passed
    pub fn advance(&self, duration: Duration) {
        let woken = {
            let mut state = self.state.lock();
            state.elapsed += duration;
            let now = state.elapsed;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .sleepers
                .drain(..)
                .partition(|s| s.deadline <= now);
            state.sleepers = pending;
            due
        };
        for sleeper in woken {
            let _ = sleeper.wake.send(());
        }
    }

    /// Number of tasks currently parked in `sleep`
    #[must_use]
    pub fn sleeper_count(&self) -> usize {
        self.state.lock().sleepers.len()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.state.lock().elapsed
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let rx = {
            let mut state = self.state.lock();
            let (tx, rx) = oneshot::channel();
            let deadline = state.elapsed + duration;
            state.sleepers.push(Sleeper {
                deadline,
                wake: tx,
            });
            rx
        };
        // A dropped sender (clock torn down mid-sleep) wakes the sleeper
        // rather than stranding it.
        let _ = rx.await;
    }
}
