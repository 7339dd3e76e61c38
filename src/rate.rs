//! Shared request budget and retry backoff.

use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window request budget: at most `capacity` requests in any `window`.
///
/// One instance is shared by every stream because the API limit is global.
#[derive(Debug)]
pub struct RateBudget {
    capacity: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Take one unit, waiting for the oldest request to leave the window if
    /// the budget is spent. The wait never exceeds one window.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = issued.front() {
                    if now.duration_since(oldest) >= self.window {
                        issued.pop_front();
                    } else {
                        break;
                    }
                }
                if issued.len() < self.capacity {
                    issued.push_back(now);
                    return;
                }
                match issued.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };
            log::debug!("Rate budget exhausted, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Units still available right now.
    #[cfg(test)]
    pub async fn available(&self) -> usize {
        let issued = self.issued.lock().await;
        let now = Instant::now();
        let live = issued.iter().filter(|&&t| now.duration_since(t) < self.window).count();
        self.capacity.saturating_sub(live)
    }
}

/// Exponential backoff with upward jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the nominal delay added at random, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based). Doubling with jitter
    /// below 1.0 keeps successive delays strictly increasing until the cap.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.base.saturating_mul(2u32.saturating_pow(retry)).min(self.max);
        let jitter = if self.jitter > 0.0 {
            rand::rng().random::<f64>() * self.jitter.min(0.99)
        } else {
            0.0
        };
        nominal.mul_f64(1.0 + jitter).min(self.max)
    }

    /// Like `delay_for`, but never shorter than a server-supplied hint
    /// (which is itself capped).
    pub fn delay_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry);
        match hint {
            Some(hint) => delay.max(hint.min(self.max)),
            None => delay,
        }
    }
}
