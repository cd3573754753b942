//! Reconnection policies and the backoff driver used by the client handle

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides how long to wait before each reconnection attempt
///
/// `attempt` starts at 1 for the first retry after a disconnect. Returning
/// `None` gives up and leaves the client disconnected.
pub trait ReconnectPolicy: Send + Sync + Debug {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }

        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return Some(self.max_backoff);
        }
        Some(Duration::from_secs_f64(secs))
    }
}

/// Fixed list of delays, one per attempt
///
/// Once the list is exhausted the policy gives up, unless `repeat_last` is
/// set in which case the final delay is used forever.
#[derive(Debug, Clone)]
pub struct DelaySequence {
    delays: Vec<Duration>,
    repeat_last: bool,
}

impl DelaySequence {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            repeat_last: false,
        }
    }

    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }
}

impl Default for DelaySequence {
    /// 0s, 2s, 10s, 30s then give up
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl ReconnectPolicy for DelaySequence {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let index = attempt.saturating_sub(1) as usize;
        match self.delays.get(index) {
            Some(delay) => Some(*delay),
            None if self.repeat_last => self.delays.last().copied(),
            None => None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Attempt counter that sleeps according to a [`ReconnectPolicy`]
pub struct ReconnectManager {
    policy: Arc<dyn ReconnectPolicy>,
    attempt: u32,
}

impl ReconnectManager {
    pub fn new(policy: Arc<dyn ReconnectPolicy>) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Wait before next reconnection attempt
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        let delay = self
            .policy
            .next_delay(self.attempt)
            .ok_or(ReconnectError::MaxAttemptsReached)?;

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Reset the attempt counter (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection attempts");
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next call to `wait` would use
    pub fn next_backoff(&self) -> Option<Duration> {
        self.policy.next_delay(self.attempt + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_backoff(max_attempts: Option<u32>) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_exponential_delays_cap() {
        let policy = fast_backoff(None);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(40)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(80)));
        // Should cap at max_backoff
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(500), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_delay_sequence() {
        let policy = DelaySequence::new(vec![Duration::ZERO, Duration::from_secs(2)]);
        assert_eq!(policy.next_delay(1), Some(Duration::ZERO));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), None);

        let repeating = policy.repeat_last();
        assert_eq!(repeating.next_delay(7), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_empty_sequence_gives_up() {
        let policy = DelaySequence::new(Vec::new()).repeat_last();
        assert_eq!(policy.next_delay(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reset() {
        let mut manager = ReconnectManager::new(Arc::new(fast_backoff(None)));
        let cancel = CancellationToken::new();

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();

        assert_eq!(manager.attempt(), 2);
        assert_eq!(manager.next_backoff(), Some(Duration::from_millis(40)));

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.next_backoff(), Some(Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let mut manager = ReconnectManager::new(Arc::new(fast_backoff(Some(3))));
        let cancel = CancellationToken::new();

        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());

        let result = manager.wait(&cancel).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let mut manager = ReconnectManager::new(Arc::new(
            ExponentialBackoff::default().with_initial_backoff(Duration::from_secs(30)),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(manager.wait(&cancel).await, Err(ReconnectError::Cancelled));
    }
}
