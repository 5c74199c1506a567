//! Circuit-breaker decorators for downstream clients.
//!
//! Each decorator implements the same capability trait as the client it
//! wraps, so callers cannot tell them apart. Every call goes through the
//! breaker: successes and failures are recorded, and while the circuit is
//! open calls fail fast with [`Denial::CircuitOpen`] without reaching the
//! client.
//!
//! [`Denial::CircuitOpen`]: crate::domain::error::Denial::CircuitOpen

use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::ports::{ObjectStore, TextGenerator};
use crate::domain::content::{Quiz, Summary};
use crate::domain::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// [`ObjectStore`] guarded by a circuit breaker.
#[derive(Debug)]
pub struct BreakerObjectStore<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S: ObjectStore> BreakerObjectStore<S> {
    pub fn new(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for BreakerObjectStore<S> {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.breaker.execute(|| self.inner.download(key)).await
    }

    async fn upload(&self, key: &str, content: Vec<u8>) -> Result<()> {
        self.breaker.execute(move || self.inner.upload(key, content)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.breaker.execute(|| self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.breaker.execute(|| self.inner.exists(key)).await
    }
}

/// [`TextGenerator`] guarded by a circuit breaker.
#[derive(Debug)]
pub struct BreakerTextGenerator<G> {
    inner: G,
    breaker: Arc<CircuitBreaker>,
}

impl<G: TextGenerator> BreakerTextGenerator<G> {
    pub fn new(inner: G, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn into_inner(self) -> G {
        self.inner
    }
}

#[async_trait]
impl<G: TextGenerator> TextGenerator for BreakerTextGenerator<G> {
    async fn generate_summary(&self, text: &str) -> Result<Summary> {
        self.breaker.execute(|| self.inner.generate_summary(text)).await
    }

    async fn generate_quiz(&self, text: &str, question_count: usize) -> Result<Quiz> {
        self.breaker
            .execute(|| self.inner.generate_quiz(text, question_count))
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.breaker.execute(|| self.inner.health_check()).await
    }
}
