//! Cooperative spin lock on a key-value store
//!
//! `acquire` retries `set_nx` with a TTL until it wins or runs out of attempts.
//! The TTL bounds how long a crashed holder can block others. There is no
//! fencing token and no fairness between waiters.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::metrics::{MetricsSink, OperationSample, Outcome, TracingMetrics};
use crate::store::KeyValueStore;
use crate::Result;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    /// Doubles the delay after each miss, capped at `max`
    Exponential { max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of `set_nx` calls; zero never touches the store and reports busy
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(10),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(mut self, max: Duration) -> Self {
        self.backoff = Backoff::Exponential { max };
        self
    }

    /// Sleep before attempt `attempt + 1`
    fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max } => self
                .delay
                .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
                .unwrap_or(max)
                .min(max),
        }
    }
}

pub struct DistributedMutex {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    prefix: String,
    metrics: Arc<dyn MetricsSink>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            prefix: String::new(),
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Prepended to every lock key
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn report<T>(&self, operation: &str, started: Instant, result: &Result<T>) {
        self.metrics.record(&OperationSample::new(
            operation,
            self.store.backend(),
            started,
            Outcome::of(result),
        ));
    }

    /// Try to take `key` for `ttl` under the configured retry policy.
    /// `Ok(false)` means another holder kept it for every attempt.
    pub async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.acquire_with(key, token, ttl, self.policy).await
    }

    pub async fn acquire_with(&self, key: &str, token: &str, ttl: Duration, policy: RetryPolicy) -> Result<bool> {
        let key = self.full_key(key);
        let attempts = policy.max_attempts;

        for attempt in 0..attempts {
            let started = Instant::now();
            let result = self.store.set_nx(&key, token, ttl).await;
            self.report("set_nx", started, &result);

            match result {
                Ok(true) => {
                    tracing::debug!(key = %key, attempt = attempt + 1, "lock acquired");
                    return Ok(true);
                }
                Ok(false) => {}
                // Transient store errors count as a missed attempt
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::warn!(key = %key, attempt = attempt + 1, "lock attempt failed: {}", e);
                }
                Err(e) => return Err(e),
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(policy.delay_after(attempt)).await;
            }
        }

        tracing::debug!(key = %key, attempts, "lock busy");
        Ok(false)
    }

    /// Drop the lock regardless of who holds it
    pub async fn release(&self, key: &str) -> Result<()> {
        let key = self.full_key(key);
        let started = Instant::now();
        let unlinked = self.store.unlink(&key).await;
        self.report("unlink", started, &unlinked);
        if let Err(e) = unlinked {
            tracing::warn!(key = %key, "unlink failed, falling back to delete: {}", e);
            let started = Instant::now();
            let deleted = self.store.delete(&key).await;
            self.report("delete", started, &deleted);
            deleted?;
        }
        Ok(())
    }

    /// Drop the lock only while `token` still holds it; false otherwise
    pub async fn release_owned(&self, key: &str, token: &str) -> Result<bool> {
        let key = self.full_key(key);
        let started = Instant::now();
        let result = self.store.compare_and_delete(&key, token).await;
        self.report("compare_and_delete", started, &result);
        result
    }

    /// Run `work` while holding `key`; `Ok(None)` when the lock stayed busy.
    /// The lock is released with `release_owned` afterwards, so an expired and
    /// re-taken lock is left to its new holder.
    pub async fn run_exclusive<F, T>(&self, key: &str, token: &str, ttl: Duration, work: F) -> Result<Option<T>>
    where
        F: Future<Output = T>,
    {
        if !self.acquire(key, token, ttl).await? {
            return Ok(None);
        }
        let output = work.await;
        if !self.release_owned(key, token).await? {
            tracing::warn!(key = %self.full_key(key), "lock expired before the work finished");
        }
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use crate::metrics::RecordingMetrics;
    use crate::store::SqliteKv;
    use crate::Error;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(SqliteKv::in_memory().unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_acquire_has_one_winner() {
        let mutex = Arc::new(DistributedMutex::new(store()));
        let policy = RetryPolicy::new(10, Duration::from_millis(10));

        let racers: Vec<_> = ["worker-a", "worker-b"]
            .into_iter()
            .map(|token| {
                let mutex = mutex.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let won = mutex
                        .acquire_with("job:42", token, Duration::from_secs(1), policy)
                        .await
                        .unwrap();
                    (won, started.elapsed())
                })
            })
            .collect();

        let mut results = Vec::new();
        for racer in racers {
            results.push(racer.await.unwrap());
        }
        assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
        let (_, loser_waited) = results.iter().find(|(won, _)| !*won).unwrap();
        assert!(*loser_waited >= Duration::from_millis(80), "loser gave up after {:?}", loser_waited);
    }

    #[tokio::test]
    async fn test_release_then_acquire_first_try() {
        let metrics = Arc::new(RecordingMetrics::new());
        let mutex = DistributedMutex::new(store()).with_metrics(metrics.clone());

        assert!(mutex.acquire("job:1", "a", Duration::from_secs(5)).await.unwrap());
        mutex.release("job:1").await.unwrap();

        let before = metrics.count("set_nx");
        assert!(mutex.acquire("job:1", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(metrics.count("set_nx"), before + 1);
        assert_eq!(metrics.count("unlink"), 1);
    }

    #[tokio::test]
    async fn test_expired_lock_admits_next_holder() {
        let mutex = DistributedMutex::new(store()).with_policy(RetryPolicy::new(1, Duration::from_millis(1)));
        assert!(mutex.acquire("job:7", "a", Duration::from_millis(30)).await.unwrap());
        assert!(!mutex.acquire("job:7", "b", Duration::from_secs(1)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(mutex.acquire("job:7", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_owned_refuses_foreign_token() {
        let kv = store();
        let mutex = DistributedMutex::new(kv.clone()).with_prefix("locks:");
        assert!(mutex.acquire("job:9", "owner", Duration::from_secs(5)).await.unwrap());

        assert!(!mutex.release_owned("job:9", "intruder").await.unwrap());
        assert_eq!(kv.get("locks:job:9").await.unwrap().as_deref(), Some("owner"));
        assert!(mutex.release_owned("job:9", "owner").await.unwrap());
        assert_eq!(kv.get("locks:job:9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_exclusive() {
        let kv = store();
        let mutex = DistributedMutex::new(kv.clone()).with_policy(RetryPolicy::new(2, Duration::from_millis(1)));

        let ran = mutex
            .run_exclusive("report", "t1", Duration::from_secs(5), async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));
        assert_eq!(kv.get("report").await.unwrap(), None);

        kv.set("report", "someone-else", Some(Duration::from_secs(5))).await.unwrap();
        let skipped = mutex
            .run_exclusive("report", "t2", Duration::from_secs(5), async { 7 })
            .await
            .unwrap();
        assert_eq!(skipped, None);
    }

    /// Delegates to SQLite but fails every `unlink`
    struct NoUnlink {
        inner: SqliteKv,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for NoUnlink {
        fn endpoint(&self) -> &str {
            "no-unlink"
        }

        fn backend(&self) -> &'static str {
            "no-unlink"
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await
        }

        async fn unlink(&self, _key: &str) -> Result<bool> {
            Err(Error::Unsupported("UNLINK".to_string()))
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }

        async fn incr(&self, key: &str, by: i64) -> Result<i64> {
            self.inner.incr(key, by).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_release_falls_back_to_delete() {
        let kv = Arc::new(NoUnlink {
            inner: SqliteKv::in_memory().unwrap(),
            deletes: AtomicUsize::new(0),
        });
        let metrics = Arc::new(RecordingMetrics::new());
        let mutex = DistributedMutex::new(kv.clone()).with_metrics(metrics.clone());

        assert!(mutex.acquire("job:3", "a", Duration::from_secs(5)).await.unwrap());
        mutex.release("job:3").await.unwrap();

        assert_eq!(kv.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(kv.get("job:3").await.unwrap(), None);
        assert_eq!(metrics.count("unlink"), 1);
        assert_eq!(metrics.count("delete"), 1);
        assert!(metrics.samples().iter().any(|s| s.operation == "unlink" && s.outcome == Outcome::Error));
        assert!(mutex.acquire("job:3", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_attempts_never_writes() {
        let kv = store();
        let metrics = Arc::new(RecordingMetrics::new());
        let mutex = DistributedMutex::new(kv.clone()).with_metrics(metrics.clone());

        let busy = mutex
            .acquire_with("job:5", "a", Duration::from_secs(5), RetryPolicy::new(0, Duration::from_millis(1)))
            .await
            .unwrap();
        assert!(!busy);
        assert_eq!(metrics.count("set_nx"), 0);
        assert_eq!(kv.get("job:5").await.unwrap(), None);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10)).exponential(Duration::from_millis(50));
        assert_eq!(policy.delay_after(0), Duration::from_millis(10));
        assert_eq!(policy.delay_after(1), Duration::from_millis(20));
        assert_eq!(policy.delay_after(2), Duration::from_millis(40));
        assert_eq!(policy.delay_after(3), Duration::from_millis(50));
        assert_eq!(policy.delay_after(40), Duration::from_millis(50));
        assert_eq!(RetryPolicy::default().delay_after(5), Duration::from_millis(10));
    }
}
