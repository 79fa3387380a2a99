//! Bounded retry with exponential backoff and jitter.
//!
//! The loop is an explicit state machine (attempt counter + capped delay) so
//! cancellation and attempt accounting stay auditable.

use crate::client::ClientError;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, counting the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, exhausts the
/// attempt budget, or the run is cancelled mid-backoff. Returns the final
/// result and the number of attempts made.
pub async fn with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &mut watch::Receiver<bool>,
    mut operation: F,
) -> (Result<T, ClientError>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if !e.is_transient() => {
                error!(operation = %operation_name, attempt, error = %e, "permanent failure");
                return (Err(e), attempt);
            }
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "transient failure, retries exhausted"
                    );
                    return (Err(e), attempt);
                }
                metrics::counter!("exec_retries_total", 1u64);

                // Jitter 0.5x..1.5x to avoid retry stampedes.
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "transient failure, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            warn!(operation = %operation_name, attempt, "retry abandoned: cancelled");
                            return (Err(e), attempt);
                        }
                    }
                }

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
