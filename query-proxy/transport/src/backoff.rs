use std::future::Future;
use tokio::time::{self, Duration, Instant};

/// Exponential backoff with a hard cap on the total time spent retrying.
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2,
            max_elapsed: Duration::from_secs(30),
        }
    }
}

// === impl Backoff ===

impl Backoff {
    /// Runs `operation` until it succeeds or until the next delay would exceed the total time
    /// budget, in which case the last error is returned.
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if start.elapsed() + delay > self.max_elapsed {
                        tracing::error!(
                            operation = %operation_name,
                            attempt,
                            %error,
                            "Giving up"
                        );
                        return Err(error);
                    }
                    tracing::debug!(
                        operation = %operation_name,
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying"
                    );
                    time::sleep(delay).await;
                    delay *= self.multiplier;
                }
            }
        }
    }
}
