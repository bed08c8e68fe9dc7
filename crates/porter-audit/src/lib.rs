//! Append-only journal of low-confidence routing decisions.
//!
//! One JSON object per line, flushed after every record so a crash never
//! leaves a torn entry. Decisions below 0.5 additionally fire the injected
//! alert sink.

pub mod error;
pub mod logger;

pub use error::{AuditError, Result};
pub use logger::{AlertSink, AuditLogger, AuditRecord, TracingAlertSink};
