// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition that becomes true asynchronously, such as an
//! agent's answer being processed

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of one check of the condition passed to [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed
///
/// `cond` returns `Ok(O)` once the condition holds,
/// `Err(CondCheckError::NotYet)` to keep waiting, or
/// `Err(CondCheckError::Failed(e))` to give up immediately.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_eventually() {
        let count = AtomicUsize::new(0);
        let result = wait_for_condition(
            || {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(CondCheckError::<()>::NotYet)
                    } else {
                        Ok(n)
                    }
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let result = wait_for_condition(
            || async { Err::<(), _>(CondCheckError::<()>::NotYet) },
            &Duration::from_millis(10),
            &Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_poll_permanent_error() {
        let result = wait_for_condition(
            || async { Err::<(), _>(CondCheckError::Failed("gone")) },
            &Duration::from_millis(10),
            &Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(Error::PermanentError("gone"))));
    }
}
