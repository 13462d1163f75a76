//! Append-only Usage Sink boundary (spec §4.6).
//!
//! Every completion, regardless of success or failure, emits a `UsageRow`.
//! The sink never blocks or fails the caller path — write errors are
//! swallowed and logged at debug level (spec §7: "usage persistence
//! failures ... are logged and swallowed, never surfaced to the caller").

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of usage, matching the fields named in spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub quantity: f64,
    pub unit: String,
    pub cost_usd: f64,
    pub metadata: Value,
}

impl UsageRow {
    pub fn completion(
        id: impl Into<String>,
        quantity: f64,
        cost_usd: f64,
        metadata: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "llm_call".to_string(),
            quantity,
            unit: "tokens".to_string(),
            cost_usd,
            metadata,
        }
    }
}

/// Fire-and-forget sink: accepts a row and persists it without ever
/// propagating failure to the caller.
pub trait UsageSink: Send + Sync {
    fn record(&self, row: UsageRow);
}

/// Appends newline-delimited JSON rows to a file, e.g. `~/.nimbus/usage.jsonl`.
/// A `Mutex<File>` serializes concurrent writers, mirroring the teacher's
/// use of a mutex to guard shared mutable state in `client.rs`.
pub struct JsonlUsageSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlUsageSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn open(&self) -> std::io::Result<std::fs::File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl UsageSink for JsonlUsageSink {
    fn record(&self, row: UsageRow) {
        use std::io::Write;

        let line = match serde_json::to_string(&row) {
            Ok(line) => line,
            Err(e) => {
                log::debug!("failed to serialize usage row: {e}");
                return;
            }
        };

        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            match self.open() {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    log::debug!("failed to open usage sink at {}: {e}", self.path.display());
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                log::debug!("failed to write usage row: {e}");
                *guard = None;
            }
        }
    }
}

/// A sink that discards every row, used where usage tracking is disabled
/// or in tests that don't care about the sink path.
pub struct NullUsageSink;

impl UsageSink for NullUsageSink {
    fn record(&self, _row: UsageRow) {}
}

/// An in-memory sink for tests, capturing every recorded row.
#[cfg(test)]
pub struct InMemoryUsageSink {
    rows: Mutex<Vec<UsageRow>>,
}

#[cfg(test)]
impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self { rows: Mutex::new(Vec::new()) }
    }

    pub fn rows(&self) -> Vec<UsageRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl UsageSink for InMemoryUsageSink {
    fn record(&self, row: UsageRow) {
        self.rows.lock().unwrap().push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_sink_appends_row() {
        let dir = std::env::temp_dir().join(format!("nimbus-usage-test-{}", std::process::id()));
        let path = dir.join("usage.jsonl");
        let _ = std::fs::remove_file(&path);

        let sink = JsonlUsageSink::new(&path);
        sink.record(UsageRow::completion("req-1", 150.0, 0.0012, serde_json::json!({"provider":"anthropic"})));
        sink.record(UsageRow::completion("req-2", 300.0, 0.0024, serde_json::json!({"provider":"openai"})));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let row: UsageRow = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row.id, "req-1");
        assert_eq!(row.kind, "llm_call");
        assert_eq!(row.unit, "tokens");
    }

    #[test]
    fn test_jsonl_sink_never_panics_on_unwritable_path() {
        let sink = JsonlUsageSink::new("/proc/nonexistent/deeply/nested/usage.jsonl");
        sink.record(UsageRow::completion("req-x", 10.0, 0.0, serde_json::json!({})));
    }

    #[test]
    fn test_in_memory_sink_captures_rows() {
        let sink = InMemoryUsageSink::new();
        sink.record(UsageRow::completion("req-1", 10.0, 0.0001, serde_json::json!({})));
        assert_eq!(sink.rows().len(), 1);
    }

    #[test]
    fn test_null_sink_discards() {
        let sink = NullUsageSink;
        sink.record(UsageRow::completion("req-1", 10.0, 0.0, serde_json::json!({})));
    }
}
