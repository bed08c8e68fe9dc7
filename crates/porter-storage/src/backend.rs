use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The stored version matched and the value was replaced.
    Ok,
    /// The stored version differed; caller should re-read and retry.
    Conflict,
    /// No live value under the key (never written, or TTL-expired).
    Absent,
}

/// Backend operations required by the session, conversation-state and
/// resume-mapping stores.
///
/// TTL expiry is lazy: an expired entry behaves as absent on every read,
/// whether or not the implementation has physically removed it yet.
/// Implementations must linearise [`cas`](KvBackend::cas) calls per key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Replace the value under `key` iff the stored JSON's
    /// `summary.version` equals `expected_version`.
    async fn cas(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome>;

    /// Add `member` to the set under `key`, refreshing the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// All live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append to the list under `key`, refreshing the list's TTL.
    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// The most recent `limit` list entries, oldest first.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// Refresh a value's TTL without rewriting it (sliding-TTL reads).
    /// No-op when the key is absent.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<()>;

    /// True when this backend is the in-process fallback standing in for an
    /// unavailable durable one. Surfaced on the stats endpoint.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Read the optimistic-lock version out of a stored JSON value.
pub(crate) fn embedded_version(value: &str) -> Option<u64> {
    let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
    parsed.pointer("/summary/version")?.as_u64()
}
