//! Cooldown and transient-error retry for control-plane mutations.

use crate::control_plane::CpResult;
use crate::error::{ControlPlaneError, DeployError, Result};

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};

/// How a failed control-plane call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The platform refused because the resource changed too recently or the
    /// caller is rate limited. Waiting fixes it.
    Cooldown,
    /// Known-flaky request-shape errors that pass on a second try.
    Transient,
    Fatal,
}

/// Classify a control-plane failure. Typed HTTP status first, message
/// patterns second; every pattern lives here and nowhere else.
pub fn classify(error: &ControlPlaneError) -> ErrorClass {
    if error.status_code() == Some(429) {
        return ErrorClass::Cooldown;
    }

    let lower = error.to_string().to_lowercase();
    if lower.contains("too recently")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("cooldown")
    {
        return ErrorClass::Cooldown;
    }
    if lower.contains("problem processing request") || lower.contains("malformed") {
        return ErrorClass::Transient;
    }
    ErrorClass::Fatal
}

/// Sleep abstraction so retry timing can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Cooldown backoff grows by this much per attempt.
    pub cooldown_step: Duration,
    pub cooldown_cap: Duration,
    /// Total time a single call may spend waiting out cooldowns.
    pub cooldown_budget: Duration,
    pub transient_attempts: usize,
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cooldown_step: Duration::from_secs(5),
            cooldown_cap: Duration::from_secs(20),
            cooldown_budget: Duration::from_secs(180),
            transient_attempts: 3,
            transient_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn cooldown_delay(&self, attempt: u32) -> Duration {
        self.cooldown_step.saturating_mul(attempt).min(self.cooldown_cap)
    }
}

/// Run a mutating control-plane call, waiting out cooldown and transient
/// failures according to `policy`. Fatal errors are returned on first sight.
pub async fn with_cooldown_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CpResult<T>>,
{
    let started = Instant::now();
    let mut slept = Duration::ZERO;
    let mut cooldown_attempts = 0u32;
    let mut transient_failures = 0usize;

    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let delay = match classify(&error) {
            ErrorClass::Fatal => return Err(error.into()),
            ErrorClass::Transient => {
                transient_failures += 1;
                if transient_failures >= policy.transient_attempts {
                    return Err(error.into());
                }
                policy.transient_delay
            }
            ErrorClass::Cooldown => {
                cooldown_attempts += 1;
                let delay = policy.cooldown_delay(cooldown_attempts);
                let waited = started.elapsed().max(slept);
                if waited + delay > policy.cooldown_budget {
                    return Err(DeployError::CooldownBlocked {
                        operation: operation.to_string(),
                        waited_secs: waited.as_secs(),
                        last_error: error.to_string(),
                    }
                    .into());
                }
                delay
            }
        };

        tracing::warn!(
            operation,
            delay_ms = delay.as_millis() as u64,
            %error,
            "control plane call failed, retrying"
        );
        sleeper.sleep(delay).await;
        slept += delay;
    }
}
