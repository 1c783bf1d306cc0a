//! Virtual clock backed by tokio's paused time
//!
//! A simulation runs on a single-threaded runtime whose clock starts paused.
//! Whenever every task is blocked on a timer, tokio advances the clock straight
//! to the earliest pending deadline, so virtual time only moves when the
//! simulation asks it to and wall-clock speed never changes ordering.

use async_trait::async_trait;
use retrace_core::{Clock, ClockError};
use std::time::Duration;
use tokio::time::Instant;

/// Build the single-threaded, paused-time runtime a simulation runs on
pub fn simulation_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
}

/// Simulated time measured from the moment the clock was attached
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    origin: Instant,
}

impl VirtualClock {
    /// Attach to the runtime driving the current task.
    ///
    /// Fails when called outside a tokio runtime.
    pub fn attach() -> Result<Self, ClockError> {
        tokio::runtime::Handle::try_current().map_err(|_| ClockError::Unavailable)?;
        Ok(Self {
            origin: Instant::now(),
        })
    }

    /// Current simulated time in whole milliseconds
    pub fn now_ms(&self) -> u64 {
        duration_to_ms(self.now())
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn suspend_until(&self, deadline: Duration) {
        if deadline <= self.now() {
            return;
        }
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}

/// Next multiple of `quantum` at or after `now`
pub fn next_boundary(now: Duration, quantum: Duration) -> Duration {
    if quantum.is_zero() {
        return now;
    }
    let quantum_ns = quantum.as_nanos();
    let ticks = now.as_nanos().div_ceil(quantum_ns);
    Duration::from_nanos((ticks * quantum_ns) as u64)
}

/// Millisecond view of a duration, saturating at `u64::MAX`
pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_outside_runtime_fails() {
        assert_eq!(VirtualClock::attach().unwrap_err(), ClockError::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_starts_at_zero() {
        let clock = VirtualClock::attach().unwrap();
        assert_eq!(clock.now_ms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_until_advances_virtual_time() {
        let clock = VirtualClock::attach().unwrap();
        let wall = std::time::Instant::now();

        clock.suspend_until(Duration::from_secs(3600)).await;

        assert_eq!(clock.now(), Duration::from_secs(3600));
        // An hour of virtual time must not take anywhere near an hour
        assert!(wall.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_until_past_deadline_returns_immediately() {
        let clock = VirtualClock::attach().unwrap();
        clock.suspend_until(Duration::from_millis(500)).await;

        clock.suspend_until(Duration::from_millis(100)).await;
        clock.suspend_until(Duration::from_millis(500)).await;

        assert_eq!(clock.now_ms(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_wake_in_deadline_order() {
        let clock = VirtualClock::attach().unwrap();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for deadline_ms in [300u64, 100, 200] {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                clock.suspend_until(Duration::from_millis(deadline_ms)).await;
                order.lock().unwrap().push((deadline_ms, clock.now_ms()));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(*order, vec![(100, 100), (200, 200), (300, 300)]);
    }

    #[test]
    fn test_next_boundary() {
        let q = Duration::from_millis(1000);
        assert_eq!(next_boundary(Duration::ZERO, q), Duration::ZERO);
        assert_eq!(next_boundary(Duration::from_millis(1), q), Duration::from_millis(1000));
        assert_eq!(next_boundary(Duration::from_millis(1000), q), Duration::from_millis(1000));
        assert_eq!(next_boundary(Duration::from_millis(2500), q), Duration::from_millis(3000));
        assert_eq!(next_boundary(Duration::from_millis(42), Duration::ZERO), Duration::from_millis(42));
    }
}
