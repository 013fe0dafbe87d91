//! Agent trait for mocking
//!
//! An agent runs shell commands on one node. The engine owns one agent per
//! reachable node for the duration of a reconcile pass.

use crate::error::AgentError;

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit status of the command
    pub status: i32,
}

impl CommandOutput {
    /// Whether the command exited with status zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Trait for running commands on a node
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Address of the node
    fn address(&self) -> &str;

    /// Run a shell command, optionally feeding `input` on stdin.
    ///
    /// A non-zero exit status is reported in the output, not as an error.
    async fn execute(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput, AgentError>;

    /// Release the connection
    async fn close(&self);

    /// Run a command and return its stdout, failing on a non-zero exit
    async fn run(&self, command: &str) -> Result<String, AgentError> {
        let output = self.execute(command, None).await?;
        check(self.address(), command, output)
    }

    /// Run a command with stdin, failing on a non-zero exit
    async fn run_with_input(&self, command: &str, input: &str) -> Result<String, AgentError> {
        let output = self.execute(command, Some(input.as_bytes())).await?;
        check(self.address(), command, output)
    }
}

fn check(address: &str, command: &str, output: CommandOutput) -> Result<String, AgentError> {
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(AgentError::CommandFailed {
            address: address.to_string(),
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim_end().to_string(),
        })
    }
}
