// crates/jobs/src/retention.rs
//! Deferred purge of finished job records.
//!
//! Every terminal transition arms a timer that purges the record once the
//! retention window elapses. Read paths also run a lazy sweep over
//! `finished` ages, so records are reclaimed even when a timer never fires.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Whether a record finished at `finished` has outlived `retention` at `now`.
pub(crate) fn is_expired(finished: Instant, retention: Duration, now: Instant) -> bool {
    now.saturating_duration_since(finished) >= retention
}

/// Run `purge` on `runtime` after `delay`. The returned handle aborts the timer.
pub(crate) fn spawn_purge<F>(runtime: &Handle, delay: Duration, purge: F) -> AbortHandle
where
    F: FnOnce() + Send + 'static,
{
    runtime
        .spawn(async move {
            tokio::time::sleep(delay).await;
            purge();
        })
        .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_is_expired() {
        let finished = Instant::now();
        let retention = Duration::from_secs(60);
        assert!(!is_expired(finished, retention, finished));
        assert!(!is_expired(finished, retention, finished + Duration::from_secs(59)));
        assert!(is_expired(finished, retention, finished + retention));
    }

    #[test]
    fn test_zero_retention_expires_immediately() {
        let finished = Instant::now();
        assert!(is_expired(finished, Duration::ZERO, finished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_purge_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        spawn_purge(&Handle::current(), Duration::from_secs(10), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_purge_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = spawn_purge(&Handle::current(), Duration::from_secs(10), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.abort();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
