use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Exponential backoff settings for reference-data calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self.initial_interval.mul_f64(factor);
        if delay > self.max_interval {
            delay = self.max_interval;
        }
        if self.jitter {
            // Spread callers out by up to ten percent either way.
            let skew = rand::thread_rng().gen_range(-0.1..=0.1);
            delay = delay.mul_f64(1.0 + skew);
        }
        delay
    }
}

/// Runs `op` until it succeeds, fails terminally, or the attempt budget is
/// spent. Only transient io errors are retried; an open circuit comes back
/// immediately since waiting out the breaker inside one request is pointless,
/// and it does not consume the attempt budget.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ Error::TransientIo(_)) => {
                if attempt >= config.max_attempts {
                    log::warn!("{op_name}: giving up after {attempt} attempts: {err}");
                    return Err(err);
                }
                let delay = config.delay_for(attempt);
                log::info!(
                    "{op_name}: attempt {attempt} failed ({err}), retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
