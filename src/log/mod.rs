//! Structured execution log as JSON lines per run.
//!
//! Every session writes a `.jsonl` file under `.shellrun/logs/` capturing
//! step starts and completions, detected prompts, auto-answers, user input
//! (length only) and raw output chunks. Each line is a self-contained JSON
//! object with an RFC 3339 timestamp, so logs are easy to grep, stream and
//! post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::events::{SessionEvent, SessionObserver};

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// The session opened its channel.
    SessionStarted {
        session_id: String,
        transport: String,
        mode: String,
        steps: usize,
    },
    StatusChanged { status: String },
    StepStarted {
        index: usize,
        name: String,
        command: String,
    },
    /// Raw output chunk.
    StepOutput { step: Option<String>, chunk: String },
    PromptDetected {
        step: Option<String>,
        kind: String,
        prompt: String,
    },
    /// A configured input answered a prompt. The answer itself is never logged.
    AutoAnswered { step: String, prompt: String },
    /// User input was written to the channel.
    UserInput { length: usize },
    StepCompleted {
        index: usize,
        name: String,
        success: bool,
        outcome: String,
        duration_ms: u64,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    SessionEnded {
        total: usize,
        succeeded: usize,
        failed: usize,
        not_executed: usize,
        cancelled: usize,
    },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<&SessionEvent> for LogEvent {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::StatusChanged { status } => LogEvent::StatusChanged {
                status: status.to_string(),
            },
            SessionEvent::StepStarted {
                index,
                name,
                command,
            } => LogEvent::StepStarted {
                index: *index,
                name: name.clone(),
                command: command.clone(),
            },
            SessionEvent::Output { step, chunk } => LogEvent::StepOutput {
                step: step.clone(),
                chunk: chunk.clone(),
            },
            SessionEvent::PromptDetected(prompt) => LogEvent::PromptDetected {
                step: prompt.step.clone(),
                kind: format!("{:?}", prompt.kind),
                prompt: prompt.prompt.clone(),
            },
            SessionEvent::AutoAnswered { step, prompt } => LogEvent::AutoAnswered {
                step: step.clone(),
                prompt: prompt.clone(),
            },
            SessionEvent::InputSubmitted { length, .. } => LogEvent::UserInput { length: *length },
            SessionEvent::StepCompleted { index, result } => LogEvent::StepCompleted {
                index: *index,
                name: result.step_name.clone(),
                success: result.success,
                outcome: result.outcome.label().to_string(),
                duration_ms: result.duration_ms,
                exit_code: result.exit_code,
                error: result.error.clone(),
            },
            SessionEvent::SessionEnded { summary } => LogEvent::SessionEnded {
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
                not_executed: summary.not_executed,
                cancelled: summary.cancelled,
            },
        }
    }
}

/// Session observer that mirrors every event into an execution log.
pub struct LogObserver {
    log: ExecutionLog,
    log_output: bool,
}

impl LogObserver {
    pub fn new(log: ExecutionLog) -> Self {
        Self {
            log,
            log_output: true,
        }
    }

    /// Skip raw output chunks (step results still carry the output).
    pub fn without_output(mut self) -> Self {
        self.log_output = false;
        self
    }
}

impl SessionObserver for LogObserver {
    fn on_event(&mut self, event: &SessionEvent) {
        if !self.log_output && matches!(event, SessionEvent::Output { .. }) {
            return;
        }
        if let Err(e) = self.log.log(LogEvent::from(event)) {
            warn!(path = %self.log.path().display(), error = %e, "failed to write execution log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PromptEvent;
    use crate::prompt::PromptKind;
    use crate::results::{StepResult, summarize};
    use crate::session::SessionStatus;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-03-01T10:00:00+00:00".to_string(),
            event: LogEvent::StepStarted {
                index: 0,
                name: "build".to_string(),
                command: "cd /srv/app && npm run build".to_string(),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"step_started\""));
        assert!(json.contains("\"data\":{\"index\":0"));
        assert!(json.contains("\"timestamp\":\"2026-03-01T10:00:00+00:00\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.jsonl");
        let log = ExecutionLog::new(&log_path).unwrap();

        log.log(LogEvent::SessionStarted {
            session_id: "abc".to_string(),
            transport: "local".to_string(),
            mode: "interactive".to_string(),
            steps: 2,
        })
        .unwrap();
        log.log(LogEvent::UserInput { length: 6 }).unwrap();
        log.log(LogEvent::SessionEnded {
            total: 2,
            succeeded: 2,
            failed: 0,
            not_executed: 0,
            cancelled: 0,
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            let ts = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        }
        assert!(lines[0].contains("\"event\":\"session_started\""));
        assert!(lines[1].contains("\"length\":6"));
        assert!(lines[2].contains("\"event\":\"session_ended\""));
    }

    #[test]
    fn creates_parent_directories_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("run.jsonl");

        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::UserInput { length: 1 }).unwrap();
        }
        {
            let log = ExecutionLog::new(&log_path).unwrap();
            assert_eq!(log.path(), log_path);
            log.log(LogEvent::UserInput { length: 2 }).unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn session_event_conversion() {
        let prompt = SessionEvent::PromptDetected(PromptEvent {
            session_id: "s".to_string(),
            step: Some("migrate".to_string()),
            kind: PromptKind::Credential,
            prompt: "Password:".to_string(),
            timestamp: chrono::Utc::now(),
        });
        match LogEvent::from(&prompt) {
            LogEvent::PromptDetected { kind, prompt, .. } => {
                assert_eq!(kind, "Credential");
                assert_eq!(prompt, "Password:");
            }
            other => panic!("unexpected conversion: {other:?}"),
        }

        let status = SessionEvent::StatusChanged {
            status: SessionStatus::AwaitingUserInput,
        };
        match LogEvent::from(&status) {
            LogEvent::StatusChanged { status } => assert_eq!(status, "awaiting-user-input"),
            other => panic!("unexpected conversion: {other:?}"),
        }
    }

    #[test]
    fn observer_skips_output_when_asked_and_never_logs_input_values() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.jsonl");
        let mut observer = LogObserver::new(ExecutionLog::new(&log_path).unwrap()).without_output();

        observer.on_event(&SessionEvent::Output {
            step: None,
            chunk: "noise".to_string(),
        });
        observer.on_event(&SessionEvent::InputSubmitted {
            step: Some("deploy".to_string()),
            length: 8,
        });
        let results = vec![StepResult::succeeded("deploy", "ok".into(), 3, Some(0))];
        observer.on_event(&SessionEvent::StepCompleted {
            index: 0,
            result: results[0].clone(),
        });
        observer.on_event(&SessionEvent::SessionEnded {
            summary: summarize(&results),
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(!content.contains("noise"));
        assert!(content.contains("\"event\":\"user_input\""));
        assert!(content.contains("\"outcome\":\"ok\""));
    }
}
