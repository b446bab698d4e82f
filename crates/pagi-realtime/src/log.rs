//! Conversation log sink: finalized turn records, append-only.

use crate::error::RealtimeResult;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Why a turn was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Complete,
    Interrupted,
    SessionEnd,
}

/// One persisted turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub user_text: String,
    pub assistant_text: String,
    pub tools_used: Vec<String>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Append-only store for finalized turns.
///
/// Called from the inbound event handler while session locks are held, so
/// implementations must not block on I/O.
pub trait ConversationLog: Send + Sync {
    fn append(&self, record: LogRecord);
}

/// Keeps records in memory. Used by tests and previews.
#[derive(Debug, Default)]
pub struct MemoryConversationLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ConversationLog for MemoryConversationLog {
    fn append(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

enum WriterCommand {
    Append(LogRecord),
    Flush(std_mpsc::Sender<()>),
}

/// Appends one JSON object per line to a file.
///
/// Records are handed to a dedicated writer thread that keeps the file open,
/// so `append` never touches the disk on the caller's thread.
#[derive(Debug)]
pub struct JsonlConversationLog {
    path: PathBuf,
    tx: std_mpsc::Sender<WriterCommand>,
}

impl JsonlConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = std_mpsc::channel();
        let writer_path = path.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("pagi-realtime-log".to_string())
            .spawn(move || run_writer(writer_path, rx))
        {
            warn!("Conversation log writer for {} not started: {}", path.display(), e);
        }
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until every record appended so far has been written.
    pub fn flush(&self) {
        let (done_tx, done_rx) = std_mpsc::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl ConversationLog for JsonlConversationLog {
    fn append(&self, record: LogRecord) {
        if self.tx.send(WriterCommand::Append(record)).is_err() {
            warn!("Conversation log writer for {} is gone; record dropped", self.path.display());
        }
    }
}

fn open_log(path: &Path) -> RealtimeResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_record(path: &Path, file: &mut Option<File>, record: &LogRecord) -> RealtimeResult<()> {
    if file.is_none() {
        *file = Some(open_log(path)?);
    }
    let line = serde_json::to_string(record)?;
    if let Some(f) = file.as_mut() {
        writeln!(f, "{}", line)?;
    }
    Ok(())
}

/// Runs until every `JsonlConversationLog` sender is dropped.
fn run_writer(path: PathBuf, rx: std_mpsc::Receiver<WriterCommand>) {
    let mut file: Option<File> = None;
    for command in rx {
        match command {
            WriterCommand::Append(record) => {
                if let Err(e) = write_record(&path, &mut file, &record) {
                    warn!("Conversation log write to {} failed: {}", path.display(), e);
                    file = None;
                }
            }
            WriterCommand::Flush(done) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush();
                }
                let _ = done.send(());
            }
        }
    }
    debug!("📝 Conversation log writer for {} stopped", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_camel_case() {
        let record = LogRecord {
            user_text: "hi".into(),
            assistant_text: "hello".into(),
            tools_used: vec!["search_properties".into()],
            status: TurnStatus::SessionEnd,
            elapsed_ms: Some(42),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userText": "hi",
                "assistantText": "hello",
                "toolsUsed": ["search_properties"],
                "status": "session_end",
                "elapsedMs": 42
            })
        );
    }

    #[test]
    fn elapsed_is_omitted_when_absent() {
        let record = LogRecord {
            user_text: String::new(),
            assistant_text: String::new(),
            tools_used: vec![],
            status: TurnStatus::Interrupted,
            elapsed_ms: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("elapsedMs"));
        assert!(json.contains("\"interrupted\""));
    }

    #[test]
    fn jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlConversationLog::new(dir.path().join("logs/conversation.jsonl"));
        for status in [TurnStatus::Complete, TurnStatus::Interrupted] {
            log.append(LogRecord {
                user_text: "u".into(),
                assistant_text: "a".into(),
                tools_used: vec![],
                status,
                elapsed_ms: None,
            });
        }
        log.flush();
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<LogRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].status, TurnStatus::Interrupted);
    }
}
