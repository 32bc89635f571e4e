//! Append-only JSON-lines audit trail for the voicerag relay.
//!
//! Every decision the relay takes on behalf of a client (policy overrides,
//! dropped events, tool dispatches and their outcomes, session open/close)
//! can be recorded here as one newline-terminated JSON object. Producers
//! hold a cheap [`AuditSink`] clone; a single background task owns the file.
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/voicerag/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::ProcessStarted,
//!     AuditSource::new("voicerag"),
//!     serde_json::json!({"version": "0.1.0"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource, ToolCallRecord};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
