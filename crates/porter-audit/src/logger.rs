use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use porter_core::types::UserId;

use crate::error::Result;

/// Decisions at or below this confidence raise an operational alert.
const ALERT_THRESHOLD: f64 = 0.5;

/// Message previews are truncated to this many characters.
const PREVIEW_CHARS: usize = 100;

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub user_id: UserId,
    pub message_preview: String,
    pub decision: String,
    pub confidence: f64,
    pub reasoning: String,
    pub matched_role: Option<String>,
    pub audit_required: bool,
    pub reviewed: bool,
}

/// Destination for operational alerts on very low confidence decisions.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Default sink: a structured warning in the process log.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, message: &str) {
        warn!(alert = message, "routing alert");
    }
}

/// Journal for offline review of routing decisions.
///
/// A `Mutex<File>` serialises writers, so each record is appended as one
/// contiguous line; the flush after every write bounds data loss to the
/// record being written when the process dies.
pub struct AuditLogger {
    file: Mutex<File>,
    path: PathBuf,
    alerts: Box<dyn AlertSink>,
}

impl AuditLogger {
    pub fn new(log_dir: &Path, alerts: Box<dyn AlertSink>) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join("routing_audit.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "audit logger ready");
        Ok(Self {
            file: Mutex::new(file),
            path,
            alerts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal one low-confidence routing decision.
    pub fn log_low_confidence_routing(
        &self,
        user_id: &UserId,
        message: &str,
        decision: &str,
        confidence: f64,
        reasoning: &str,
        matched_role: Option<&str>,
        audit_required: bool,
    ) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event_type: "low_confidence_routing".to_string(),
            user_id: user_id.clone(),
            message_preview: truncate_chars(message, PREVIEW_CHARS),
            decision: decision.to_string(),
            confidence,
            reasoning: reasoning.to_string(),
            matched_role: matched_role.map(str::to_string),
            audit_required,
            reviewed: false,
        };
        self.append(&record)?;

        info!(
            user_id = %user_id,
            decision,
            confidence,
            "logged low confidence routing"
        );

        if confidence < ALERT_THRESHOLD {
            self.alerts.alert(&format!(
                "very low confidence routing: user={user_id}, confidence={confidence:.2}"
            ));
        }
        Ok(())
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    impl AlertSink for CountingSink {
        fn alert(&self, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_line_is_a_complete_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path(), Box::new(TracingAlertSink)).unwrap();

        for i in 0..5 {
            logger
                .log_low_confidence_routing(
                    &UserId::from(format!("emp{i:03}")),
                    "is the travel policy still current?",
                    "NEW_SESSION",
                    0.6,
                    "weak topical overlap",
                    None,
                    true,
                )
                .unwrap();
        }

        let body = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            let record: AuditRecord = serde_json::from_str(line).unwrap();
            assert_eq!(record.event_type, "low_confidence_routing");
            assert!(!record.reviewed);
        }
    }

    #[test]
    fn preview_is_truncated_to_100_chars() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path(), Box::new(TracingAlertSink)).unwrap();
        let long = "x".repeat(500);
        logger
            .log_low_confidence_routing(&"emp001".into(), &long, "sess_1", 0.65, "r", Some("user"), true)
            .unwrap();

        let body = std::fs::read_to_string(logger.path()).unwrap();
        let record: AuditRecord = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(record.message_preview.chars().count(), 100);
    }

    #[test]
    fn alert_fires_only_below_half() {
        let dir = tempfile::tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let logger =
            AuditLogger::new(dir.path(), Box::new(CountingSink(Arc::clone(&count)))).unwrap();

        logger
            .log_low_confidence_routing(&"emp001".into(), "m", "NEW_SESSION", 0.6, "r", None, true)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        logger
            .log_low_confidence_routing(&"emp001".into(), "m", "NEW_SESSION", 0.3, "r", None, true)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
