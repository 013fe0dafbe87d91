//! Operation records
//!
//! Every operator the leader runs leaves a record in storage listing the
//! commands it executed and how it ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptive audit entry for one commander
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Commander name, e.g. `image-pull`
    pub name: String,
    /// What the command acts on
    pub target: String,
    /// Extra context for the reader
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Command {
    /// Command without detail
    #[must_use]
    pub fn new(name: &str, target: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            target: target.into(),
            detail: String::new(),
        }
    }

    /// Attach a detail
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} {}", self.name, self.target)
        } else {
            write!(f, "{} {} ({})", self.name, self.target, self.detail)
        }
    }
}

/// How far an operation record got
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    /// Still executing, or orphaned by a lost leader
    #[default]
    Running,
    /// Every command succeeded
    Completed,
    /// Stopped before finishing
    Cancelled,
    /// A command failed; see `error`
    Failed,
}

/// Stored trace of one operator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Sequential record id
    pub id: i64,
    /// Operator name
    pub operation: String,
    /// Node addresses or objects the operator works on
    #[serde(default)]
    pub targets: Vec<String>,
    /// Commands started so far, in order
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Outcome
    pub status: RecordStatus,
    /// Error of the failed command
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// When the operator started
    pub start_at: DateTime<Utc>,
    /// When the operator ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    /// Running record started now
    #[must_use]
    pub fn new(id: i64, operation: &str, targets: Vec<String>) -> Self {
        Self {
            id,
            operation: operation.to_string(),
            targets,
            commands: Vec::new(),
            status: RecordStatus::Running,
            error: String::new(),
            start_at: Utc::now(),
            end_at: None,
        }
    }

    /// Append the command about to run
    pub fn set_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// End the record as failed with `err`
    pub fn set_error(&mut self, err: &dyn std::error::Error) {
        self.status = RecordStatus::Failed;
        self.error = err.to_string();
        self.end_at = Some(Utc::now());
    }

    /// End the record as completed
    pub fn complete(&mut self) {
        self.status = RecordStatus::Completed;
        self.end_at = Some(Utc::now());
    }

    /// End the record as cancelled
    pub fn cancel(&mut self) {
        self.status = RecordStatus::Cancelled;
        self.end_at = Some(Utc::now());
    }

    /// Whether the record has ended
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != RecordStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lifecycle() {
        let mut record = OperationRecord::new(1, "etcd-bootstrap", vec!["10.0.0.11".to_string()]);
        assert!(!record.is_terminal());

        record.set_command(Command::new("image-pull", "10.0.0.11"));
        record.set_command(Command::new("run-container", "10.0.0.11").with_detail("etcd"));
        assert_eq!(record.commands.len(), 2);
        assert_eq!(record.commands[1].to_string(), "run-container 10.0.0.11 (etcd)");

        let err = std::io::Error::other("ssh: connection refused");
        record.set_error(&err);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error, "ssh: connection refused");
        assert!(record.end_at.is_some());
    }
}
