use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::backend::{embedded_version, CasOutcome, KvBackend};
use crate::error::Result;

/// In-process backend with the same observable semantics as the durable
/// one, minus cross-restart durability. Used standalone in tests and as
/// the degraded-mode fallback in production.
#[derive(Default)]
pub struct MemoryBackend {
    values: DashMap<String, Entry<String>>,
    sets: DashMap<String, Entry<HashSet<String>>>,
    lists: DashMap<String, Entry<Vec<String>>>,
}

struct Entry<T> {
    data: T,
    expires_at: DateTime<Utc>,
}

impl<T> Entry<T> {
    fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: deadline(ttl),
        }
    }

    fn live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

fn deadline(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.data.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.values
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn cas(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        // The entry API holds the shard lock for the whole check-and-write,
        // which linearises concurrent CAS calls on the same key.
        match self.values.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(CasOutcome::Absent),
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().live() {
                    occupied.remove();
                    return Ok(CasOutcome::Absent);
                }
                match embedded_version(&occupied.get().data) {
                    Some(v) if v == expected_version => {
                        occupied.insert(Entry::new(value.to_string(), ttl));
                        Ok(CasOutcome::Ok)
                    }
                    _ => Ok(CasOutcome::Conflict),
                }
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut entry = self
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashSet::new(), ttl));
        if !entry.live() {
            entry.data.clear();
        }
        entry.data.insert(member.to_string());
        entry.expires_at = deadline(ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match self.sets.get(key) {
            Some(entry) if entry.live() => {
                let mut members: Vec<String> = entry.data.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entry = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Vec::new(), ttl));
        if !entry.live() {
            entry.data.clear();
        }
        entry.data.push(value.to_string());
        entry.expires_at = deadline(ttl);
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        match self.lists.get(key) {
            Some(entry) if entry.live() => {
                let len = entry.data.len();
                let start = len.saturating_sub(limit);
                Ok(entry.data[start..].to_vec())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.values.get_mut(key) {
            if entry.live() {
                entry.expires_at = deadline(ttl);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn get_set_roundtrip() {
        let b = MemoryBackend::new();
        b.set("k", "v", TTL).await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
        b.delete("k").await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_value_reads_as_absent() {
        let b = MemoryBackend::new();
        b.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_outcomes() {
        let b = MemoryBackend::new();
        assert_eq!(
            b.cas("k", 0, r#"{"summary":{"version":1}}"#, TTL)
                .await
                .unwrap(),
            CasOutcome::Absent
        );

        b.set("k", r#"{"summary":{"version":0}}"#, TTL).await.unwrap();
        assert_eq!(
            b.cas("k", 0, r#"{"summary":{"version":1}}"#, TTL)
                .await
                .unwrap(),
            CasOutcome::Ok
        );
        // Stale expectation now conflicts.
        assert_eq!(
            b.cas("k", 0, r#"{"summary":{"version":1}}"#, TTL)
                .await
                .unwrap(),
            CasOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn sets_dedupe_and_sort() {
        let b = MemoryBackend::new();
        b.set_add("s", "b", TTL).await.unwrap();
        b.set_add("s", "a", TTL).await.unwrap();
        b.set_add("s", "b", TTL).await.unwrap();
        assert_eq!(b.set_members("s").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn list_range_returns_most_recent_oldest_first() {
        let b = MemoryBackend::new();
        for i in 0..5 {
            b.list_push("l", &format!("m{i}"), TTL).await.unwrap();
        }
        assert_eq!(b.list_range("l", 2).await.unwrap(), vec!["m3", "m4"]);
        assert_eq!(b.list_range("l", 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn scan_prefix_skips_other_keys() {
        let b = MemoryBackend::new();
        b.set("conv:u1", "{}", TTL).await.unwrap();
        b.set("conv:u2", "{}", TTL).await.unwrap();
        b.set("sess:x", "{}", TTL).await.unwrap();
        assert_eq!(
            b.scan_prefix("conv:").await.unwrap(),
            vec!["conv:u1", "conv:u2"]
        );
    }
}
