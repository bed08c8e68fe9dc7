use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::backend::{CasOutcome, KvBackend};
use crate::error::Result;
use crate::memory::MemoryBackend;

/// Durable backend with an in-process fallback.
///
/// Every operation goes to the primary until the first failure; from then
/// on the backend is degraded and all traffic stays on the memory fallback.
/// Records written in degraded mode are not migrated back: the flag exists
/// so higher layers can alert, not to hide the outage.
pub struct DegradableBackend {
    primary: Arc<dyn KvBackend>,
    fallback: MemoryBackend,
    degraded: AtomicBool,
}

impl DegradableBackend {
    pub fn new(primary: Arc<dyn KvBackend>) -> Self {
        Self {
            primary,
            fallback: MemoryBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    fn degrade(&self, op: &str, err: &crate::error::StorageError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            error!(op, error = %err, "durable backend failed, degrading to in-process storage");
        } else {
            warn!(op, error = %err, "durable backend still failing");
        }
    }
}

macro_rules! degradable_op {
    ($self:ident, $op:literal, $call:expr, $fallback:expr) => {{
        if !$self.degraded.load(Ordering::SeqCst) {
            match $call.await {
                Ok(v) => return Ok(v),
                Err(e) => $self.degrade($op, &e),
            }
        }
        $fallback.await
    }};
}

#[async_trait]
impl KvBackend for DegradableBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        degradable_op!(self, "get", self.primary.get(key), self.fallback.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        degradable_op!(
            self,
            "set",
            self.primary.set(key, value, ttl),
            self.fallback.set(key, value, ttl)
        )
    }

    async fn delete(&self, key: &str) -> Result<()> {
        degradable_op!(
            self,
            "delete",
            self.primary.delete(key),
            self.fallback.delete(key)
        )
    }

    async fn cas(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        degradable_op!(
            self,
            "cas",
            self.primary.cas(key, expected_version, value, ttl),
            self.fallback.cas(key, expected_version, value, ttl)
        )
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        degradable_op!(
            self,
            "set_add",
            self.primary.set_add(key, member, ttl),
            self.fallback.set_add(key, member, ttl)
        )
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        degradable_op!(
            self,
            "set_members",
            self.primary.set_members(key),
            self.fallback.set_members(key)
        )
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        degradable_op!(
            self,
            "scan_prefix",
            self.primary.scan_prefix(prefix),
            self.fallback.scan_prefix(prefix)
        )
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        degradable_op!(
            self,
            "list_push",
            self.primary.list_push(key, value, ttl),
            self.fallback.list_push(key, value, ttl)
        )
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        degradable_op!(
            self,
            "list_range",
            self.primary.list_range(key, limit),
            self.fallback.list_range(key, limit)
        )
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<()> {
        degradable_op!(
            self,
            "touch",
            self.primary.touch(key, ttl),
            self.fallback.touch(key, ttl)
        )
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    /// Primary that fails every call, standing in for a dead database.
    struct DeadBackend;

    #[async_trait]
    impl KvBackend for DeadBackend {
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn cas(&self, _: &str, _: u64, _: &str, _: Duration) -> Result<CasOutcome> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn set_add(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<String>> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn list_push(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn list_range(&self, _: &str, _: usize) -> Result<Vec<String>> {
            Err(StorageError::Unavailable("dead".into()))
        }
        async fn touch(&self, _: &str, _: Duration) -> Result<()> {
            Err(StorageError::Unavailable("dead".into()))
        }
    }

    #[tokio::test]
    async fn degrades_on_first_failure_and_stays_degraded() {
        let b = DegradableBackend::new(Arc::new(DeadBackend));
        assert!(!b.is_degraded());

        b.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(b.is_degraded());
        // Subsequent reads come from the fallback, which saw the write.
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn healthy_primary_is_used() {
        let b = DegradableBackend::new(Arc::new(MemoryBackend::new()));
        b.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(!b.is_degraded());
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
