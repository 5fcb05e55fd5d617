//! Append-only audit trail for transaction outcomes and retry attempts.
//!
//! Each entry is rendered as one line:
//! `[YYYY-MM-DD HH:MM:SS] TAG operation[: detail]`.
//! Lines are written with a single `write_all` under a lock, so concurrent
//! writers never interleave partial lines.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTag {
    Commit,
    Rollback,
    Retry,
    Exhausted,
}

impl AuditTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTag::Commit => "COMMIT",
            AuditTag::Rollback => "ROLLBACK",
            AuditTag::Retry => "RETRY",
            AuditTag::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for AuditTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub at: DateTime<Local>,
    pub tag: AuditTag,
    pub operation: String,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(tag: AuditTag, operation: &str, detail: Option<String>) -> Self {
        Self {
            at: Local::now(),
            tag,
            operation: operation.to_string(),
            detail,
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.tag,
            single_line(&self.operation)
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", single_line(detail))?;
        }
        Ok(())
    }
}

/// One entry per line: operations are often multi-line SQL.
fn single_line(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

enum Sink {
    Writer(Box<dyn Write + Send>),
    Memory(Vec<String>),
    Discard,
}

/// Shared, append-only audit sink.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<Mutex<Sink>>,
}

impl AuditLog {
    /// Append to `path`, creating it if needed.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::writer(file))
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Writer(Box::new(writer)))),
        }
    }

    /// Keep rendered lines in memory; read them back with [`AuditLog::lines`].
    pub fn memory() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Memory(Vec::new()))),
        }
    }

    pub fn discard() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Discard)),
        }
    }

    pub fn record(&self, tag: AuditTag, operation: &str, detail: Option<String>) {
        self.append(&AuditEntry::new(tag, operation, detail));
    }

    /// Write failures are logged and otherwise ignored; auditing never fails
    /// the operation being audited.
    pub fn append(&self, entry: &AuditEntry) {
        let line = format!("{}\n", entry);
        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::Writer(writer) => {
                if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.flush()) {
                    warn!(error = %e, tag = %entry.tag, operation = %entry.operation, "Failed to write audit entry");
                }
            }
            Sink::Memory(lines) => lines.push(line.trim_end().to_string()),
            Sink::Discard => {}
        }
    }

    /// Lines recorded by a memory sink. Empty for other sinks.
    pub fn lines(&self) -> Vec<String> {
        match &*self.sink.lock() {
            Sink::Memory(lines) => lines.clone(),
            _ => Vec::new(),
        }
    }

    /// Number of memory-sink lines carrying `tag`.
    pub fn count(&self, tag: AuditTag) -> usize {
        let needle = format!("] {} ", tag);
        self.lines()
            .iter()
            .filter(|line| line.contains(&needle))
            .count()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.sink.lock() {
            Sink::Writer(_) => "writer",
            Sink::Memory(_) => "memory",
            Sink::Discard => "discard",
        };
        f.debug_struct("AuditLog").field("sink", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_format() {
        let entry = AuditEntry::new(
            AuditTag::Rollback,
            "update_user_email",
            Some("Fatal error: UNIQUE constraint failed".to_string()),
        );
        let line = entry.to_string();
        assert!(line.starts_with('['));
        assert!(line.ends_with(
            "] ROLLBACK update_user_email: Fatal error: UNIQUE constraint failed"
        ));
        // "[YYYY-MM-DD HH:MM:SS]" is 21 characters.
        assert_eq!(&line[20..21], "]");
    }

    #[test]
    fn test_newlines_are_flattened() {
        let entry = AuditEntry::new(AuditTag::Retry, "op", Some("a\nb".to_string()));
        assert!(entry.to_string().ends_with("RETRY op: a b"));

        let entry = AuditEntry::new(
            AuditTag::Commit,
            "SELECT name\r\nFROM user_data\nWHERE age > ?",
            Some("x\ry".to_string()),
        );
        let line = entry.to_string();
        assert!(!line.contains('\n') && !line.contains('\r'));
        assert!(line.ends_with("COMMIT SELECT name FROM user_data WHERE age > ?: x y"));
    }

    #[test]
    fn test_multi_line_operation_is_one_file_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audit.log");
        let log = AuditLog::file(&path).unwrap();

        log.record(AuditTag::Commit, "SELECT 1 AS v\nFROM (SELECT 1)", None);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("COMMIT SELECT 1 AS v FROM (SELECT 1)"));
    }

    #[test]
    fn test_memory_sink_counts_tags() {
        let log = AuditLog::memory();
        log.record(AuditTag::Commit, "a", None);
        log.record(AuditTag::Retry, "b", Some("locked".to_string()));
        log.record(AuditTag::Commit, "c", None);

        assert_eq!(log.lines().len(), 3);
        assert_eq!(log.count(AuditTag::Commit), 2);
        assert_eq!(log.count(AuditTag::Retry), 1);
        assert_eq!(log.count(AuditTag::Exhausted), 0);
    }

    #[test]
    fn test_file_sink_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("retry.log");

        AuditLog::file(&path).unwrap().record(AuditTag::Commit, "first", None);
        AuditLog::file(&path).unwrap().record(AuditTag::Commit, "second", None);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("COMMIT first"));
        assert!(lines[1].ends_with("COMMIT second"));
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audit.log");
        let log = AuditLog::file(&path).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.record(
                            AuditTag::Retry,
                            &format!("worker_{}", t),
                            Some(format!("attempt {} {}", i, "x".repeat(200))),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            assert!(line.starts_with('['), "malformed line: {}", line);
            assert!(line.contains("] RETRY worker_"), "malformed line: {}", line);
            assert!(line.ends_with(&"x".repeat(200)), "truncated line: {}", line);
        }
    }
}
