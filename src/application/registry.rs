//! Multi-key limiter: one token bucket per event type.
//!
//! Buckets are created either up front from explicit per-key policies or
//! lazily on first use from a default policy. A key with neither is
//! unthrottled: every call is admitted immediately.

use crate::application::limiter::TokenBucket;
use crate::application::ports::{Clock, MetricsRecorder, NoopMetrics};
use crate::domain::error::Result;
use crate::domain::policy::RatePolicy;
use crate::infrastructure::clock::SystemClock;
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

type BucketMap = HashMap<String, Arc<TokenBucket>, RandomState>;

/// Returned by [`MultiKeyLimiter::tokens`] for a key that is not throttled.
pub const UNLIMITED: f64 = -1.0;

/// Registry of token buckets keyed by event type.
///
/// A bucket, once created, is never replaced; [`reset`](Self::reset) refills
/// it in place.
///
/// # Example
/// ```
/// use queue_guard::{MultiKeyLimiter, RatePolicy};
///
/// let limiter = MultiKeyLimiter::builder()
///     .policy("material_uploaded", RatePolicy::new(1.0, 2.0))
///     .build();
///
/// assert!(limiter.allow("material_uploaded"));
/// assert!(limiter.allow("material_uploaded"));
/// assert!(!limiter.allow("material_uploaded"));
///
/// // No policy and no default: unthrottled.
/// assert!(limiter.allow("student_enrolled"));
/// assert_eq!(limiter.tokens("student_enrolled"), -1.0);
/// ```
#[derive(Debug)]
pub struct MultiKeyLimiter {
    buckets: RwLock<BucketMap>,
    default_policy: Option<RatePolicy>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
}

/// Builder for [`MultiKeyLimiter`].
#[derive(Debug, Default)]
pub struct MultiKeyLimiterBuilder {
    policies: Vec<(String, RatePolicy)>,
    default_policy: Option<RatePolicy>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl MultiKeyLimiterBuilder {
    /// Add an explicit policy for `key`. A later call for the same key wins.
    pub fn policy(mut self, key: impl Into<String>, policy: RatePolicy) -> Self {
        self.policies.push((key.into(), policy));
        self
    }

    /// Add several explicit policies.
    pub fn policies<I, K>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = (K, RatePolicy)>,
        K: Into<String>,
    {
        self.policies
            .extend(policies.into_iter().map(|(key, policy)| (key.into(), policy)));
        self
    }

    /// Policy used to materialise buckets for keys seen for the first time.
    pub fn default_policy(mut self, policy: RatePolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> MultiKeyLimiter {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetrics) as Arc<dyn MetricsRecorder>);

        let mut buckets = BucketMap::default();
        for (key, policy) in self.policies {
            buckets.insert(key, Arc::new(TokenBucket::with_clock(policy, Arc::clone(&clock))));
        }

        MultiKeyLimiter {
            buckets: RwLock::new(buckets),
            default_policy: self.default_policy,
            clock,
            metrics,
        }
    }
}

impl MultiKeyLimiter {
    pub fn builder() -> MultiKeyLimiterBuilder {
        MultiKeyLimiterBuilder::default()
    }

    /// Limiter with explicit per-key policies and an optional default.
    pub fn new<I, K>(policies: I, default_policy: Option<RatePolicy>) -> Self
    where
        I: IntoIterator<Item = (K, RatePolicy)>,
        K: Into<String>,
    {
        let builder = Self::builder().policies(policies);
        match default_policy {
            Some(policy) => builder.default_policy(policy),
            None => builder,
        }
        .build()
    }

    /// Limiter that admits everything.
    pub fn unthrottled() -> Self {
        Self::builder().build()
    }

    /// Consume a token for `key` without blocking.
    pub fn allow(&self, key: &str) -> bool {
        let Some(bucket) = self.bucket_for(key) else {
            return true;
        };

        let allowed = bucket.allow();
        if allowed {
            self.metrics.limiter_allowed(key);
            self.metrics.limiter_tokens(key, bucket.tokens());
        }
        allowed
    }

    /// Wait for a token for `key`, or until `cancel` fires.
    pub async fn wait(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(bucket) = self.bucket_for(key) else {
            return Ok(());
        };

        if bucket.allow() {
            self.metrics.limiter_allowed(key);
        } else {
            let started = Instant::now();
            bucket.wait(cancel).await?;
            self.metrics.limiter_waited(key, started.elapsed());
        }
        self.metrics.limiter_tokens(key, bucket.tokens());
        Ok(())
    }

    /// Tokens currently available for `key`.
    ///
    /// Returns [`UNLIMITED`] when the key is not throttled. A key that would
    /// be materialised from the default policy reports a full bucket without
    /// being created.
    pub fn tokens(&self, key: &str) -> f64 {
        if let Some(bucket) = self.existing(key) {
            return bucket.tokens();
        }
        match self.default_policy {
            Some(policy) => policy.burst_size(),
            None => UNLIMITED,
        }
    }

    /// Refill the bucket for `key`, if it exists.
    pub fn reset(&self, key: &str) {
        if let Some(bucket) = self.existing(key) {
            bucket.reset();
        }
    }

    /// Refill every bucket.
    pub fn reset_all(&self) {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        for bucket in buckets.values() {
            bucket.reset();
        }
    }

    /// Keys that currently have a bucket, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = buckets.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a bucket exists for `key`. Does not create one.
    pub fn has_limiter(&self, key: &str) -> bool {
        self.existing(key).is_some()
    }

    /// The policy applied to keys seen for the first time.
    pub fn default_policy(&self) -> Option<RatePolicy> {
        self.default_policy
    }

    fn existing(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Look up or lazily create the bucket for `key`.
    ///
    /// Double-checked locking: probe under the read lock (the common path),
    /// and only on a miss take the write lock and confirm-or-create. The
    /// second check matters: another caller may have inserted the bucket
    /// between the two locks, and replacing it would hand out a fresh burst.
    fn bucket_for(&self, key: &str) -> Option<Arc<TokenBucket>> {
        if let Some(bucket) = self.existing(key) {
            return Some(bucket);
        }

        let policy = self.default_policy?;
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::with_clock(policy, Arc::clone(&self.clock))));
        Some(Arc::clone(bucket))
    }
}
