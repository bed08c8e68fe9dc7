use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use porter_core::types::UserId;

use crate::error::{IdentityError, Result};

/// Refresh the table from disk at most this often.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// After a failed refresh, keep serving the previous snapshot for at
/// least this long before re-attempting.
const FAILURE_GRACE: Duration = Duration::from_secs(60);

/// What the orchestrator knows about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub user_id: UserId,
    pub name: String,
    pub is_expert: bool,
    pub expert_domains: Vec<String>,
}

impl IdentityRecord {
    /// Fallback used when the identity source is unreachable: an unknown,
    /// non-expert user. The turn proceeds on this record.
    pub fn unknown(user_id: UserId) -> Self {
        Self {
            user_id,
            name: String::new(),
            is_expert: false,
            expert_domains: Vec::new(),
        }
    }
}

/// One row of `experts.csv`: `user_id,name,domain`. A user appears once
/// per domain they cover.
#[derive(Debug, Deserialize)]
struct ExpertRow {
    user_id: String,
    name: String,
    domain: String,
}

#[derive(Default)]
struct Snapshot {
    /// user_id -> domains covered.
    domains: HashMap<String, Vec<String>>,
    /// user_id -> display name.
    names: HashMap<String, String>,
}

/// Caches the user-id → expert-domain mapping with a bounded refresh
/// interval. Reads go against the current snapshot without taking a lock;
/// refreshes publish a whole new snapshot atomically.
pub struct IdentityService {
    table_path: PathBuf,
    snapshot: ArcSwap<Snapshot>,
    /// Next wall-clock instant a refresh is allowed. Guards the refresh
    /// path only, never the read path.
    next_refresh: Mutex<DateTime<Utc>>,
}

impl IdentityService {
    /// `kb_root/experts.csv` is the conventional table location.
    pub fn new(kb_root: &Path) -> Self {
        Self::with_table(kb_root.join("experts.csv"))
    }

    pub fn with_table(table_path: PathBuf) -> Self {
        Self {
            table_path,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            next_refresh: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Resolve a user's identity against the (possibly just-refreshed)
    /// snapshot. Never fails: a missing or unreadable table yields
    /// non-expert records until the next successful refresh.
    pub fn identify(&self, user_id: &UserId) -> IdentityRecord {
        self.maybe_refresh();

        let snapshot = self.snapshot.load();
        let domains = snapshot
            .domains
            .get(user_id.as_str())
            .cloned()
            .unwrap_or_default();
        IdentityRecord {
            user_id: user_id.clone(),
            name: snapshot
                .names
                .get(user_id.as_str())
                .cloned()
                .unwrap_or_default(),
            is_expert: !domains.is_empty(),
            expert_domains: domains,
        }
    }

    /// Display name lookup, empty when unknown.
    pub fn display_name(&self, user_id: &UserId) -> String {
        self.identify(user_id).name
    }

    /// All known experts for a domain, for expert routing.
    pub fn experts_for_domain(&self, domain: &str) -> Vec<IdentityRecord> {
        self.maybe_refresh();
        let snapshot = self.snapshot.load();
        let mut out: Vec<IdentityRecord> = snapshot
            .domains
            .iter()
            .filter(|(_, domains)| domains.iter().any(|d| d == domain))
            .map(|(user_id, domains)| IdentityRecord {
                user_id: UserId::from(user_id.as_str()),
                name: snapshot.names.get(user_id).cloned().unwrap_or_default(),
                is_expert: true,
                expert_domains: domains.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
        out
    }

    fn maybe_refresh(&self) {
        let now = Utc::now();
        // try_lock: when another caller is mid-refresh, serve the current
        // snapshot instead of queueing behind file I/O.
        let Ok(mut deadline) = self.next_refresh.try_lock() else {
            return;
        };
        if now < *deadline {
            return;
        }

        match load_table(&self.table_path) {
            Ok(snapshot) => {
                info!(
                    path = %self.table_path.display(),
                    experts = snapshot.domains.len(),
                    "expert table refreshed"
                );
                self.snapshot.store(Arc::new(snapshot));
                *deadline = now + chrono::Duration::from_std(REFRESH_INTERVAL).unwrap();
            }
            Err(e) => {
                warn!(
                    path = %self.table_path.display(),
                    error = %e,
                    "expert table refresh failed, keeping previous snapshot"
                );
                *deadline = now + chrono::Duration::from_std(FAILURE_GRACE).unwrap();
            }
        }
    }
}

fn load_table(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Err(IdentityError::TableMissing {
            path: path.display().to_string(),
        });
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut snapshot = Snapshot::default();
    for row in reader.deserialize::<ExpertRow>() {
        let row = row?;
        snapshot
            .domains
            .entry(row.user_id.clone())
            .or_default()
            .push(row.domain);
        snapshot.names.entry(row.user_id).or_insert(row.name);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_table(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("experts.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "user_id,name,domain").unwrap();
        write!(file, "{body}").unwrap();
        path
    }

    #[test]
    fn expert_with_multiple_domains() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(
            dir.path(),
            "exp001,Dana,HR\nexp001,Dana,Payroll\nexp002,Lee,IT\n",
        );
        let service = IdentityService::with_table(path);

        let dana = service.identify(&"exp001".into());
        assert!(dana.is_expert);
        assert_eq!(dana.name, "Dana");
        assert_eq!(dana.expert_domains, vec!["HR", "Payroll"]);

        let nobody = service.identify(&"emp999".into());
        assert!(!nobody.is_expert);
        assert!(nobody.expert_domains.is_empty());
    }

    #[test]
    fn missing_table_yields_non_experts() {
        let dir = tempfile::tempdir().unwrap();
        let service = IdentityService::with_table(dir.path().join("absent.csv"));
        let record = service.identify(&"exp001".into());
        assert!(!record.is_expert);
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), "exp001,Dana,HR\n");
        let service = IdentityService::with_table(path.clone());
        assert!(service.identify(&"exp001".into()).is_expert);

        // Table disappears; within the grace window the old snapshot and
        // the unexpired deadline both keep Dana an expert.
        std::fs::remove_file(&path).unwrap();
        assert!(service.identify(&"exp001".into()).is_expert);
    }

    #[test]
    fn domain_lookup_finds_experts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), "exp001,Dana,HR\nexp002,Lee,HR\n");
        let service = IdentityService::with_table(path);
        let experts = service.experts_for_domain("HR");
        assert_eq!(experts.len(), 2);
        assert_eq!(experts[0].user_id.as_str(), "exp001");
    }
}
