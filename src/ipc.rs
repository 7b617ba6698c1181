//! Parent/worker wire protocol.
//!
//! One JSON object per line, wrapped in a [`Frame`] that carries the protocol
//! version. The parent writes [`ParentMessage`]s to the worker's stdin and
//! reads [`WorkerMessage`]s from its stdout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};

use crate::context::{ContextSnapshot, LogLevel};
use crate::coord::queue::{Publication, StageMessage};
use crate::core::errors::{ConveyorError, Result};
use crate::task::model::{TaskEnvelope, TaskId, TaskOutcome};

/// Bumped whenever a message changes shape
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub protocol_version: u32,
    pub message: T,
}

impl<T> Frame<T> {
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message,
        }
    }
}

/// Parent to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// First frame a worker receives
    Init {
        worker_id: String,
        context: ContextSnapshot,
    },
    Execute {
        envelope: TaskEnvelope,
        /// The task talks to the coordinator through stage queues
        staged: bool,
    },
    /// Request-queue message for a staged task
    Deliver {
        task_id: TaskId,
        message: StageMessage,
    },
    Cancel {
        task_id: TaskId,
    },
    /// Pipeline stop signal
    Stop,
    Shutdown,
}

/// Worker to parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        worker_id: String,
        pid: u32,
    },
    Completed {
        outcome: TaskOutcome,
    },
    /// Publish-queue message of a staged task
    Publish {
        task_id: TaskId,
        message: Publication,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Serialize one message as a newline-terminated frame
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(&Frame::new(message))?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame, rejecting other protocol versions
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    let frame: Frame<T> = serde_json::from_str(line.trim_end())
        .map_err(|e| ConveyorError::ipc(format!("malformed frame: {}", e)))?;
    if frame.protocol_version != PROTOCOL_VERSION {
        return Err(ConveyorError::ipc(format!(
            "protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, frame.protocol_version
        )));
    }
    Ok(frame.message)
}

/// Parent-side writer to a worker's stdin
pub struct WorkerLink {
    worker_id: String,
    stdin: Option<ChildStdin>,
}

impl WorkerLink {
    pub fn new(worker_id: impl Into<String>, stdin: ChildStdin) -> Self {
        Self {
            worker_id: worker_id.into(),
            stdin: Some(stdin),
        }
    }

    pub async fn send(&mut self, message: &ParentMessage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ConveyorError::worker(&self.worker_id, "stdin already closed"))?;
        let line = encode(message)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConveyorError::io(format!("write to {}", self.worker_id), e))?;
        stdin
            .flush()
            .await
            .map_err(|e| ConveyorError::io(format!("flush to {}", self.worker_id), e))?;
        Ok(())
    }

    /// Drop stdin so the worker sees EOF
    pub fn close(&mut self) {
        self.stdin.take();
    }
}

/// Parent-side reader of a worker's stdout
pub struct WorkerStream {
    lines: Lines<BufReader<ChildStdout>>,
}

impl WorkerStream {
    pub fn new(stdout: ChildStdout) -> Self {
        Self {
            lines: BufReader::new(stdout).lines(),
        }
    }

    /// Next message, `None` at EOF
    pub async fn next(&mut self) -> Result<Option<WorkerMessage>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ConveyorError::io("read worker stdout", e))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Kwargs;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_frame_is_one_line() {
        let line = encode(&ParentMessage::Execute {
            envelope: TaskEnvelope {
                task_id: TaskId::from("task_1"),
                function: "fixtures::add".into(),
                args: vec![json!(1), json!("two\nlines")],
                kwargs: Kwargs::new(),
            },
            staged: false,
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_round_trip() {
        let message = ParentMessage::Deliver {
            task_id: TaskId::from("task_2"),
            message: StageMessage::Payload(vec![json!({"total": 5})]),
        };
        let decoded: ParentMessage = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let line = r#"{"protocol_version": 99, "message": {"type": "shutdown"}}"#;
        let err = decode::<ParentMessage>(line).unwrap_err();
        assert!(matches!(err, ConveyorError::Ipc { .. }));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode::<WorkerMessage>("not json").is_err());
    }
}
