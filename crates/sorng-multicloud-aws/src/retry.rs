//! Bounded retry policies.
//!
//! The dispatcher retries throttled and transient failures with an
//! exponential backoff. A few mutating APIs race the provider's eventual
//! consistency and get their own fixed-delay policies.

use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::transport::CallContext;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// `base * 2^attempt`, capped at `max_delay`. With `jitter` the actual
    /// delay is drawn uniformly from `0..=capped`.
    Exponential { jitter: bool },
    /// Always `base`.
    Fixed,
}

/// A bounded retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Throttling policy: exponential backoff from a 3 s base.
    pub fn throttling(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Exponential { jitter: false },
        }
    }

    /// Certificate propagation lag on TLS listener creation: 4 × 10 s.
    pub fn certificate_propagation() -> Self {
        Self::fixed(4, Duration::from_secs(10))
    }

    /// Address association right after allocation: 3 × 30 s.
    pub fn eip_association() -> Self {
        Self::fixed(3, Duration::from_secs(30))
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { jitter } => {
                let base = self.base_delay.as_millis() as u64;
                let max = self.max_delay.as_millis() as u64;
                let exponential = base.saturating_mul(2u64.saturating_pow(attempt));
                let capped = exponential.min(max);
                if jitter {
                    // Full jitter: random between 0 and capped
                    use rand::Rng;
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(rng.gen_range(0..=capped))
                } else {
                    Duration::from_millis(capped)
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::throttling(3)
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the policy's attempts are exhausted. The last error is returned.
/// Backoff sleeps end early with `Timeout` when `ctx` is cancelled or
/// expires.
pub async fn retry_when<T, F, Fut, P>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> AwsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AwsResult<T>>,
    P: Fn(&AwsError) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && should_retry(&err) => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "{} failed with {} (attempt {}/{}) - retrying in {}ms",
                    err.action.as_deref().unwrap_or(&err.service),
                    err.code,
                    attempt + 1,
                    attempts,
                    delay.as_millis()
                );
                ctx.sleep(&err.service, delay).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `CertificateNotFound` returned while a freshly uploaded certificate
/// propagates to the load balancer control plane.
pub fn is_certificate_not_found(err: &AwsError) -> bool {
    err.code == "CertificateNotFound"
}

/// Address association racing a just-allocated address.
pub fn is_address_not_found(err: &AwsError) -> bool {
    err.kind == ErrorKind::NotFound
        && (err.code.starts_with("InvalidAllocationID") || err.code.starts_with("InvalidAddress"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn throttling_grows_from_three_seconds() {
        let p = RetryPolicy::throttling(3);
        assert_eq!(p.delay_for(0), Duration::from_secs(3));
        assert_eq!(p.delay_for(1), Duration::from_secs(6));
        assert_eq!(p.delay_for(2), Duration::from_secs(12));
        assert_eq!(p.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn named_fixed_policies() {
        let cert = RetryPolicy::certificate_propagation();
        assert_eq!(cert.max_attempts, 4);
        assert_eq!(cert.delay_for(3), Duration::from_secs(10));
        let eip = RetryPolicy::eip_association();
        assert_eq!(eip.max_attempts, 3);
        assert_eq!(eip.delay_for(0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let p = RetryPolicy {
            backoff: Backoff::Exponential { jitter: true },
            ..RetryPolicy::throttling(3)
        };
        for attempt in 0..5 {
            assert!(p.delay_for(attempt) <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn retry_when_stops_after_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(4, Duration::from_millis(1));
        let result = retry_when(&CallContext::background(), &policy, is_certificate_not_found, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AwsError::new("elasticloadbalancing", "CertificateNotFound", "not yet", 400))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_when_gives_up_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: AwsResult<()> = retry_when(&CallContext::background(), &policy, is_address_not_found, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AwsError::new("ec2", "InvalidAllocationID.NotFound", "missing", 400)) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_when_skips_unmatched_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: AwsResult<()> = retry_when(&CallContext::background(), &policy, is_certificate_not_found, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AwsError::new("elasticloadbalancing", "AccessDenied", "no", 403)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_during_backoff_ends_the_wait() {
        let (cancel, ctx) = CallContext::cancellable();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::eip_association();
        let started = tokio::time::Instant::now();

        let retrying = retry_when(&ctx, &policy, is_address_not_found, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AwsError::new("ec2", "InvalidAllocationID.NotFound", "missing", 400)) }
        });
        let cancelling = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(retrying, cancelling);

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_shorter_than_backoff_yields_timeout() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let policy = RetryPolicy::throttling(3);
        let result: AwsResult<()> = retry_when(&ctx, &policy, |e| e.retryable, || async {
            Err(AwsError::new("ec2", "RequestLimitExceeded", "slow down", 503))
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
    }
}
