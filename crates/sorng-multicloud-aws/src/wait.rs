//! Bounded polling.

use crate::error::{AwsError, AwsResult};
use crate::transport::CallContext;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Poll `probe` every `interval` until it yields `Some`, the `deadline`
/// elapses (Timeout) or the probe fails.
pub async fn wait_until<T, F, Fut>(
    ctx: &CallContext,
    what: &str,
    interval: Duration,
    deadline: Duration,
    mut probe: F,
) -> AwsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AwsResult<Option<T>>>,
{
    let ctx = ctx.clone().deadline(Instant::now() + deadline);
    let started = Instant::now();
    loop {
        if let Some(done) = ctx.run(what, probe()).await? {
            log::debug!("{} finished after {:?}", what, started.elapsed());
            return Ok(done);
        }
        if let Err(err) = ctx.sleep(what, interval).await {
            return Err(if ctx.is_cancelled() {
                err
            } else {
                AwsError::timeout(
                    what,
                    &format!("not finished within {}s", deadline.as_secs()),
                )
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_when_probe_succeeds() {
        let polls = AtomicU32::new(0);
        let value = wait_until(
            &CallContext::background(),
            "instance",
            Duration::from_millis(1),
            Duration::from_secs(5),
            || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n >= 2 { Some("running") } else { None }) }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, "running");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let err = wait_until(
            &CallContext::background(),
            "import",
            Duration::from_millis(5),
            Duration::from_millis(20),
            || async { Ok(None::<()>) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn probe_errors_surface() {
        let err = wait_until(
            &CallContext::background(),
            "import",
            Duration::from_millis(1),
            Duration::from_secs(1),
            || async { Err::<Option<()>, _>(AwsError::not_found("ec2", "gone")) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
