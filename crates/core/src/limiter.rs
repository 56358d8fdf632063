//! Bounded fan-out for filesystem calls
//!
//! Every traversal site funnels its concurrent `stat`/`readdir`/`readlink`
//! calls through one [`Limiter`], so the number of in-flight operations never
//! exceeds its width.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::control::ScanControl;
use crate::error::{Error, Result};

/// Default number of concurrent filesystem operations.
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Largest accepted width.
pub const MAX_CONCURRENCY: usize = 32;

/// Semaphore-gated task spawner.
#[derive(Debug, Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    width: usize,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl Limiter {
    /// Width is clamped to `1..=MAX_CONCURRENCY`.
    #[must_use]
    pub fn new(width: usize) -> Self {
        let width = width.clamp(1, MAX_CONCURRENCY);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Run `f` over every item with bounded concurrency, keeping input order.
    ///
    /// `control` is checked before each dispatch. On cancellation no new
    /// tasks start, tasks already running are awaited, and the call fails
    /// with [`Error::Cancelled`].
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] or [`Error::Shutdown`] if the semaphore
    /// was closed.
    pub async fn map<I, T, F, Fut>(&self, items: Vec<I>, control: &ScanControl, f: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = items.len();
        let mut tasks = JoinSet::new();
        let mut stopped = None;

        for (index, item) in items.into_iter().enumerate() {
            if let Err(err) = control.checkpoint().await {
                stopped = Some(err);
                break;
            }
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    stopped = Some(Error::Shutdown);
                    break;
                }
            };
            let fut = f(item);
            tasks.spawn(async move {
                let out = fut.await;
                drop(permit);
                (index, out)
            });
        }

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, out)) => slots[index] = Some(out),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => stopped = stopped.or(Some(Error::Cancelled)),
            }
        }

        if let Some(err) = stopped {
            return Err(err);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_map_keeps_order() {
        let limiter = Limiter::new(3);
        let out = limiter
            .map((0..20u64).collect(), &ScanControl::new(), |n| async move {
                tokio::time::sleep(Duration::from_millis(20 - n)).await;
                n * 2
            })
            .await
            .unwrap();
        assert_eq!(out, (0..20u64).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_map_respects_width() {
        let limiter = Limiter::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        limiter
            .map((0..10).collect::<Vec<u32>>(), &ScanControl::new(), |_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_map_fails() {
        let control = ScanControl::new();
        control.cancel();
        let err = Limiter::new(4)
            .map(vec![1, 2, 3], &control, |n| async move { n })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_width_is_clamped() {
        assert_eq!(Limiter::new(0).width(), 1);
        assert_eq!(Limiter::new(100).width(), MAX_CONCURRENCY);
    }
}
