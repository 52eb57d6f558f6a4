use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use chrono::{SecondsFormat, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::batch::BatchSummary;

/// One append-only JSONL line per row outcome. Identifiers are stored as
/// SHA-256 hex digests, never in clear.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_idx: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_card_hash: Option<String>,
    pub action: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BatchSummary>,
}

impl AuditEntry {
    pub fn for_row(
        run_id: &str,
        row_idx: usize,
        identity_digits: &str,
        family_card_digits: &str,
        action: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: now_rfc3339(),
            run_id: run_id.to_string(),
            row_idx: Some(row_idx),
            identity_hash: hash_if_present(identity_digits),
            family_card_hash: hash_if_present(family_card_digits),
            action: action.to_string(),
            message: message.into(),
            result: None,
        }
    }

    /// Terminal entry for a run, carrying the whole summary.
    pub fn finished(run_id: &str, summary: &BatchSummary) -> Self {
        Self {
            ts: now_rfc3339(),
            run_id: run_id.to_string(),
            row_idx: None,
            identity_hash: None,
            family_card_hash: None,
            action: "finished".to_string(),
            message: summary.zip_filename.clone(),
            result: Some(summary.clone()),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_if_present(digits: &str) -> Option<String> {
    if digits.is_empty() {
        None
    } else {
        Some(sha256_hex(digits))
    }
}

/// Best-effort audit trail. Entries are fanned in from the worker pool over
/// a bounded channel and appended by a single writer thread; a failed
/// append goes to the diagnostic log and is otherwise ignored, because the
/// trail must never interrupt the batch.
pub struct AuditSink {
    sender: Sender<AuditEntry>,
    handle: JoinHandle<usize>,
}

impl AuditSink {
    pub fn spawn(path: PathBuf, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        let handle = thread::spawn(move || write_loop(path, receiver));
        Self { sender, handle }
    }

    pub fn record(&self, entry: AuditEntry) {
        if self.sender.send(entry).is_err() {
            error!("Audit writer is gone; dropping audit entry");
        }
    }

    /// Drops the sender and waits for the writer to drain the channel.
    /// Returns how many entries actually made it to disk.
    pub fn finish(self) -> usize {
        let Self { sender, handle } = self;
        drop(sender);
        handle.join().unwrap_or_else(|_| {
            error!("Audit writer thread panicked");
            0
        })
    }
}

fn write_loop(path: PathBuf, receiver: Receiver<AuditEntry>) -> usize {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(f),
        Err(e) => {
            error!("Failed to open audit log {}: {}", path.display(), e);
            None
        }
    };

    let mut written = 0usize;
    for entry in receiver {
        let Some(file) = file.as_mut() else { continue };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    error!("Failed to write audit log: {}", e);
                } else {
                    written += 1;
                }
            }
            Err(e) => error!("Failed to serialize audit entry: {}", e),
        }
    }
    debug!("Audit writer finished after {written} entries");
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn entries_are_appended_as_one_json_line_each() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = AuditSink::spawn(path.clone(), 4);
        sink.record(AuditEntry::for_row(
            "run-1",
            0,
            "1234567890123455",
            "6543210987654321",
            "ok",
            "file.png",
        ));
        sink.record(AuditEntry::for_row("run-1", 1, "", "", "invalid", "Invalid NIK: "));
        assert_eq!(sink.finish(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "ok");
        assert_eq!(first["row_idx"], 0);
        assert_eq!(first["identity_hash"], sha256_hex("1234567890123455"));

        // raw identifiers never hit the log
        assert!(!content.contains("1234567890123455"));

        // rows with no extractable digits carry no hashes at all
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second.get("identity_hash").is_none());
    }

    #[test]
    fn sink_appends_across_runs_instead_of_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = AuditSink::spawn(path.clone(), 4);
        sink.record(AuditEntry::for_row("run-1", 0, "1", "2", "ok", "a.png"));
        sink.finish();

        let sink = AuditSink::spawn(path.clone(), 4);
        sink.record(AuditEntry::for_row("run-2", 0, "1", "2", "skip", "a.png"));
        sink.finish();

        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn unwritable_audit_path_is_swallowed() {
        // the sink reports zero writes but never panics or blocks
        let sink = AuditSink::spawn(PathBuf::from("/nonexistent-dir/audit.jsonl"), 4);
        sink.record(AuditEntry::for_row("run-1", 0, "1", "2", "ok", "a.png"));
        assert_eq!(sink.finish(), 0);
    }
}
