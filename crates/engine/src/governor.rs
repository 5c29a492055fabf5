//! The rate governor.
//!
//! Dispatching is paced so the aggregate request rate across all transports
//! stays under the third-party quota. The floor is one dispatch per
//! `60/N + 1` seconds for N active transports, and it holds even with a
//! single transport.

use std::time::Duration;

use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(100);

/// Monotonic-clock pacer for the dispatch loop.
#[derive(Debug)]
pub struct Governor {
    interval: Duration,
    last: Option<Instant>,
}

impl Governor {
    /// Governor for `n` active transports: one dispatch per `60/n + 1`
    /// seconds.
    pub fn for_transports(n: usize) -> Self {
        let n = n.max(1);
        Self::with_interval(Duration::from_secs_f64(60.0 / n as f64 + 1.0))
    }

    /// Governor with an explicit interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// The configured dispatch interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next dispatch may begin.
    pub async fn pace(&mut self) {
        self.last = Some(wait(self.last, self.interval).await);
    }
}

/// Return the monotonic time at which the next dispatch should begin: `now`
/// on the first call, otherwise after sleeping in 100 ms increments until
/// `now >= last + interval`.
pub async fn wait(last: Option<Instant>, interval: Duration) -> Instant {
    let Some(last) = last else {
        return Instant::now();
    };
    loop {
        let now = Instant::now();
        if now.duration_since(last) >= interval {
            return now;
        }
        tokio::time::sleep(POLL).await;
    }
}
