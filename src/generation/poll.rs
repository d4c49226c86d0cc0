use rand::Rng;
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tokio::time::sleep;

/// Bounded retry schedule for waiting on an asynchronous job.
///
/// `multiplier = 1` gives a fixed interval, `2` doubles the delay after every
/// pending attempt up to `max_delay`.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_wait: Duration,
    pub jitter: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1,
            max_delay: Duration::from_secs(8),
            max_attempts: 60,
            max_wait: Duration::from_secs(120),
            jitter: false,
        }
    }
}

impl PollPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_delay: env_u64("POLL_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            multiplier: env_u64("POLL_MULTIPLIER")
                .map(|v| v.clamp(1, 4) as u32)
                .unwrap_or(defaults.multiplier),
            max_delay: env_u64("POLL_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            max_attempts: env_u64("POLL_MAX_ATTEMPTS")
                .filter(|v| *v >= 1)
                .map(|v| v as u32)
                .unwrap_or(defaults.max_attempts),
            max_wait: env_u64("POLL_MAX_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wait),
            jitter: std::env::var("POLL_JITTER")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    #[cfg(test)]
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
            max_attempts,
            max_wait: delay.saturating_mul(max_attempts).saturating_add(Duration::from_secs(5)),
            jitter: false,
        }
    }

    #[cfg(test)]
    pub fn doubling(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: initial,
            multiplier: 2,
            max_delay,
            max_attempts,
            max_wait: max_delay.saturating_mul(max_attempts).saturating_add(Duration::from_secs(5)),
            jitter: false,
        }
    }

    /// Delay to wait after the given (1-based) pending attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let spread = (base.as_millis() as u64) / 10;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

/// Result of a single status check.
#[derive(Debug)]
pub enum PollStatus<T> {
    Pending,
    Succeeded(T),
    Failed(String),
}

/// Terminal state of the whole wait loop.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { reason: String, attempts: u32 },
    Exhausted { attempts: u32, elapsed: Duration },
}

/// Calls `check` until it reports a terminal status or the policy runs out.
///
/// Errors from `check` abort the loop immediately; only `Pending` is retried.
pub async fn poll_until_settled<T, E, F, Fut>(
    policy: &PollPolicy,
    mut check: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
{
    let started = Instant::now();
    let mut attempts = 0;
    while attempts < policy.max_attempts {
        attempts += 1;
        match check(attempts).await? {
            PollStatus::Succeeded(value) => return Ok(PollOutcome::Succeeded { value, attempts }),
            PollStatus::Failed(reason) => return Ok(PollOutcome::Failed { reason, attempts }),
            PollStatus::Pending => {}
        }
        if attempts >= policy.max_attempts {
            break;
        }
        let delay = policy.delay_for(attempts);
        if started.elapsed() + delay > policy.max_wait {
            break;
        }
        sleep(delay).await;
    }
    Ok(PollOutcome::Exhausted {
        attempts,
        elapsed: started.elapsed(),
    })
}
