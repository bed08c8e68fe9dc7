use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use porter_core::types::AgentSessionId;

use crate::error::{AgentError, Result};

/// A client the pool can hand out.
///
/// Construction and teardown happen in the borrowing task: the runtime's
/// nested task-group protocol makes cross-task construct/teardown
/// undefined. Dropping an implementation must reclaim its resources (the
/// CLI client does this via `kill_on_drop`).
#[async_trait]
pub trait PoolableClient: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self);
}

/// Builds one fresh client per borrow, parameterised with the resume token.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: PoolableClient;

    fn build(&self, resume: Option<AgentSessionId>) -> Self::Client;
}

/// Pool statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_concurrency: usize,
    pub active: usize,
    pub available: usize,
    pub total_requests: u64,
}

/// Fixed-capacity concurrency budget against the remote runtime.
///
/// This is not a connection pool: nothing is reused across borrows except
/// the semaphore. Each [`acquire`](ClientPool::acquire) constructs and
/// connects a fresh client in the calling task, and the returned lease
/// tears it down on the same task (or, on cancellation, through drop).
pub struct ClientPool<F: ClientFactory> {
    factory: F,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    max_wait: Duration,
    active: Arc<AtomicUsize>,
    total_requests: AtomicU64,
}

impl<F: ClientFactory> ClientPool<F> {
    pub fn new(factory: F, max_concurrency: usize, max_wait: Duration) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            max_wait,
            active: Arc::new(AtomicUsize::new(0)),
            total_requests: AtomicU64::new(0),
        }
    }

    /// Borrow a connected client, waiting up to the configured maximum for
    /// a free slot.
    pub async fn acquire(&self, resume: Option<AgentSessionId>) -> Result<Lease<F::Client>> {
        let permit = tokio::time::timeout(
            self.max_wait,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            error!(
                max_wait_ms = self.max_wait.as_millis() as u64,
                "timed out waiting for a client slot"
            );
            AgentError::PoolTimeout {
                ms: self.max_wait.as_millis() as u64,
            }
        })?
        .expect("pool semaphore closed");

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::SeqCst);

        let mut client = self.factory.build(resume.clone());
        if let Err(e) = client.connect().await {
            // Connect failed in this task; tear down in this task too.
            client.disconnect().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            return Err(e);
        }

        debug!(
            resume = resume.as_ref().map(|r| r.as_str()).unwrap_or("new"),
            active = self.active.load(Ordering::SeqCst),
            "client connected"
        );

        Ok(Lease {
            client: Some(client),
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::SeqCst);
        PoolStats {
            max_concurrency: self.max_concurrency,
            active,
            available: self.max_concurrency.saturating_sub(active),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }
}

/// A borrowed client plus its semaphore permit.
///
/// Prefer [`finish`](Lease::finish) for the graceful path; dropping the
/// lease (cancellation included) still releases the permit and lets the
/// client's own drop reclaim the process.
#[derive(Debug)]
pub struct Lease<C: PoolableClient> {
    client: Option<C>,
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl<C: PoolableClient> Lease<C> {
    pub fn client(&mut self) -> &mut C {
        self.client.as_mut().expect("lease already finished")
    }

    /// Disconnect in the borrowing task, then release the slot.
    pub async fn finish(mut self) {
        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
        // Drop releases the permit and decrements `active`.
    }
}

impl<C: PoolableClient> Drop for Lease<C> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Named pools, surfaced together on the stats endpoint.
#[derive(Default)]
pub struct PoolRegistry {
    stats_fns: HashMap<String, Box<dyn Fn() -> PoolStats + Send + Sync>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: ClientFactory>(&mut self, name: &str, pool: &Arc<ClientPool<F>>) {
        let pool = Arc::clone(pool);
        self.stats_fns
            .insert(name.to_string(), Box::new(move || pool.stats()));
    }

    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.stats_fns
            .iter()
            .map(|(name, f)| (name.clone(), f()))
            .collect()
    }
}
