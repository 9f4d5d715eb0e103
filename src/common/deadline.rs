//! Bounded-wait polling
//!
//! Readiness probing, pid discovery and staged shutdown all follow the same
//! pattern: check something at a fixed period until it holds or a deadline
//! passes. `PollTimer` owns the period, the deadline and an optional
//! cancellation channel so callers never write raw sleep loops.
//!
//! Uses `tokio::time`, so tests can run with paused time.

use std::future::pending;

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

use super::shutdown::ShutdownReceiver;

/// Result of waiting for the next poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Time to poll again
    Poll,
    /// The deadline has passed
    Expired,
    /// The cancellation channel fired
    Cancelled,
}

/// Ticker with a hard deadline
#[derive(Debug)]
pub struct PollTimer {
    interval: Interval,
    started: Instant,
    deadline: Instant,
    cancel: Option<ShutdownReceiver>,
}

impl PollTimer {
    /// Poll every `period` for at most `limit`. The first tick is immediate.
    pub fn new(period: Duration, limit: Duration) -> Self {
        let started = Instant::now();
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            started,
            deadline: started + limit,
            cancel: None,
        }
    }

    /// Abort waiting as soon as `cancel` receives a signal
    pub fn with_cancel(mut self, cancel: ShutdownReceiver) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Wait for the next poll point
    pub async fn tick(&mut self) -> Tick {
        if Instant::now() >= self.deadline {
            return Tick::Expired;
        }

        let Self {
            interval,
            deadline,
            cancel,
            ..
        } = self;

        tokio::select! {
            biased;

            _ = wait_cancelled(cancel) => Tick::Cancelled,

            _ = interval.tick() => Tick::Poll,

            _ = time::sleep_until(*deadline) => Tick::Expired,
        }
    }

    /// Time since the timer was created
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }
}

async fn wait_cancelled(cancel: &mut Option<ShutdownReceiver>) {
    match cancel {
        // Closed or lagged channels count as cancellation too
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_deadline() {
        let mut timer = PollTimer::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut polls = 0;
        loop {
            match timer.tick().await {
                Tick::Poll => polls += 1,
                Tick::Expired => break,
                Tick::Cancelled => panic!("no cancel channel attached"),
            }
        }
        // Immediate first tick plus one per second up to and including t=30
        assert_eq!(polls, 31);
        assert_eq!(timer.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_limit_expires_between_ticks() {
        let mut timer = PollTimer::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(timer.tick().await, Tick::Poll);
        assert_eq!(timer.tick().await, Tick::Expired);
        assert_eq!(timer.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_takes_priority() {
        let (tx, rx) = broadcast::channel(1);
        let mut timer =
            PollTimer::new(Duration::from_secs(1), Duration::from_secs(60)).with_cancel(rx);
        assert_eq!(timer.tick().await, Tick::Poll);
        tx.send(()).unwrap();
        assert_eq!(timer.tick().await, Tick::Cancelled);
    }
}
