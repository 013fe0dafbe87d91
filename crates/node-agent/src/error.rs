//! Node agent errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when running commands on a node
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to spawn or talk to the local ssh client
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote command exited with a non-zero status
    #[error("Command failed on {address} (exit {status}): {command}: {stderr}")]
    CommandFailed {
        /// Node address
        address: String,
        /// Command line that was run
        command: String,
        /// Exit status
        status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// The remote command did not finish in time
    #[error("Timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// The node is not reachable
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Container parameters label could not be parsed
    #[error("Invalid container label: {0}")]
    Label(#[from] cluster_spec::SpecError),
}
