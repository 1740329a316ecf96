//! Guarded call: run a future under an optional wall-clock deadline.
//!
//! Deadlines are tokio timers, so guarded calls nest freely: a sub-test
//! carrying its own timeout can run inside a parent check that is itself
//! guarded. A callback that blocks the executor thread without ever
//! yielding cannot be interrupted; that is an accepted risk of running
//! checks in-process.

use std::future::Future;
use std::time::Duration;

/// The guarded future did not finish before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guarded call timed out after {}ms", .limit.as_millis())]
pub struct Timeout {
    /// The deadline that elapsed.
    pub limit: Duration,
}

/// Run `fut` to completion, or until `deadline` elapses.
///
/// On timeout the future is dropped (no partial result is available) and
/// [`Timeout`] is returned. With `deadline == None` there is no time bound.
pub async fn guard<F>(fut: F, deadline: Option<Duration>) -> Result<F::Output, Timeout>
where
    F: Future,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_elapsed| Timeout { limit }),
        None => Ok(fut.await),
    }
}

/// Result of a body run under a deadline.
pub(crate) enum Guarded<T> {
    Done(T),
    TimedOut(Timeout),
}

pub(crate) async fn guarded<F, T>(fut: F, deadline: Option<Duration>) -> anyhow::Result<Guarded<T>>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match guard(fut, deadline).await {
        Ok(result) => result.map(Guarded::Done),
        Err(timeout) => Ok(Guarded::TimedOut(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_without_deadline_returns_value() {
        let value = guard(async { 7 }, None).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let limit = Duration::from_secs(1);
        let result = guard(
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                1
            },
            Some(limit),
        )
        .await;

        assert_eq!(result, Err(Timeout { limit }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_nested_deadlines() {
        let outer = guard(
            async {
                guard(
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    },
                    Some(Duration::from_secs(2)),
                )
                .await
            },
            Some(Duration::from_secs(5)),
        )
        .await;

        // The inner deadline fires first; the outer call still completes.
        let inner = outer.expect("outer guard should not time out");
        assert_eq!(
            inner,
            Err(Timeout {
                limit: Duration::from_secs(2)
            })
        );
    }

    #[test]
    fn test_timeout_display() {
        let t = Timeout {
            limit: Duration::from_millis(1500),
        };
        assert_eq!(t.to_string(), "guarded call timed out after 1500ms");
    }
}
