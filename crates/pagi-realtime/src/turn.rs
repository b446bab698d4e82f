//! Turn bookkeeping for the conversation log
//!
//! Collects input/output transcript fragments and tool names for the current
//! user-utterance/assistant-response cycle and flushes exactly one record per
//! turn: on turn-complete, on interruption, or when the session ends.

use crate::log::{ConversationLog, LogRecord, TurnStatus};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Substituted for an empty user side in a partial record.
pub const NO_USER_TEXT: &str = "(no user speech captured)";

/// Substituted for an empty assistant side in a partial record.
pub const NO_ASSISTANT_TEXT: &str = "(assistant was interrupted before replying)";

/// The open turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub input_text: String,
    pub output_text: String,
    pub tools: Vec<String>,
    pub started_at: Instant,
}

impl Turn {
    fn new() -> Self {
        Self {
            input_text: String::new(),
            output_text: String::new(),
            tools: Vec::new(),
            started_at: Instant::now(),
        }
    }
}

/// State of the aggregator
#[derive(Debug, Clone)]
enum TurnState {
    Idle,
    Open(Turn),
}

/// Accumulates transcripts and emits finalized records to a `ConversationLog`.
pub struct TurnAggregator {
    state: TurnState,
    sink: Arc<dyn ConversationLog>,
}

impl TurnAggregator {
    pub fn new(sink: Arc<dyn ConversationLog>) -> Self {
        Self {
            state: TurnState::Idle,
            sink,
        }
    }

    fn open_turn(&mut self) -> &mut Turn {
        if let TurnState::Idle = self.state {
            debug!("📝 Turn opened");
            self.state = TurnState::Open(Turn::new());
        }
        match &mut self.state {
            TurnState::Open(turn) => turn,
            TurnState::Idle => unreachable!("turn was just opened"),
        }
    }

    pub fn append_input(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.open_turn().input_text.push_str(fragment);
    }

    pub fn append_output(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.open_turn().output_text.push_str(fragment);
    }

    /// Record a tool invoked during the current turn.
    pub fn note_tool(&mut self, name: &str) {
        self.open_turn().tools.push(name.to_string());
    }

    /// Turn-complete marker from the backend.
    pub fn complete(&mut self) -> Option<LogRecord> {
        let turn = self.take()?;
        let elapsed = turn.started_at.elapsed().as_millis() as u64;
        self.flush(LogRecord {
            user_text: turn.input_text,
            assistant_text: turn.output_text,
            tools_used: turn.tools,
            status: TurnStatus::Complete,
            elapsed_ms: Some(elapsed),
        })
    }

    /// Barge-in: flush whatever partial text exists.
    pub fn interrupt(&mut self) -> Option<LogRecord> {
        let turn = self.take()?;
        self.flush(partial_record(turn, TurnStatus::Interrupted))
    }

    /// Session teardown with a turn still open.
    pub fn end_session(&mut self) -> Option<LogRecord> {
        let turn = self.take()?;
        self.flush(partial_record(turn, TurnStatus::SessionEnd))
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TurnState::Open(_))
    }

    /// Snapshot of the open turn (for testing/debugging)
    pub fn current(&self) -> Option<&Turn> {
        match &self.state {
            TurnState::Open(turn) => Some(turn),
            TurnState::Idle => None,
        }
    }

    fn take(&mut self) -> Option<Turn> {
        match std::mem::replace(&mut self.state, TurnState::Idle) {
            TurnState::Open(turn) => Some(turn),
            TurnState::Idle => None,
        }
    }

    fn flush(&self, record: LogRecord) -> Option<LogRecord> {
        info!(
            "🧾 Turn flushed ({:?}, {} tool(s))",
            record.status,
            record.tools_used.len()
        );
        self.sink.append(record.clone());
        Some(record)
    }
}

fn partial_record(turn: Turn, status: TurnStatus) -> LogRecord {
    let or_placeholder = |text: String, placeholder: &str| {
        if text.trim().is_empty() {
            placeholder.to_string()
        } else {
            text
        }
    };
    LogRecord {
        user_text: or_placeholder(turn.input_text, NO_USER_TEXT),
        assistant_text: or_placeholder(turn.output_text, NO_ASSISTANT_TEXT),
        tools_used: turn.tools,
        status,
        elapsed_ms: None,
    }
}
