use core::future::Future;

/// Runs `op` up to `attempts` times (at least once), sleeping `delay` between attempts.
/// Errors for which `should_retry` is false are returned immediately.
pub async fn retry_with_delay<F, Fut, T, E, R>(
    attempts: usize,
    delay: std::time::Duration,
    should_retry: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut left = attempts.max(1);
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if left > 1 && should_retry(&e) => {
                left -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::advance;

    fn always(_: &&'static str) -> bool {
        true
    }

    fn not_fatal(e: &&'static str) -> bool {
        *e != "fatal"
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_does_not_retry() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let out: Result<i32, &'static str> = retry_with_delay(5, Duration::from_secs(1), always, || async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let delay = Duration::from_millis(500);
        let task = tokio::spawn(async move {
            retry_with_delay(3, delay, always, || async {
                let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err("not yet") } else { Ok(7) }
            })
            .await
        });
        advance(delay).await;
        advance(delay).await;
        assert_eq!(task.await.unwrap().unwrap(), 7);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_returned() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let res: Result<(), &'static str> = retry_with_delay(3, Duration::ZERO, always, || async {
            let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
            Err(if n < 3 { "early" } else { "last" })
        })
        .await;
        assert_eq!(res.unwrap_err(), "last");
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let res: Result<(), &'static str> = retry_with_delay(5, Duration::from_secs(1), not_fatal, || async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;
        assert_eq!(res.unwrap_err(), "fatal");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let res: Result<(), &'static str> = retry_with_delay(0, Duration::ZERO, always, || async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err("x")
        })
        .await;
        assert!(res.is_err());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
