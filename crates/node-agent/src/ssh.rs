//! SSH agent
//!
//! Commands run through the system `ssh` client with connection
//! multiplexing, so each node keeps one TCP session per reconcile pass.

use crate::agent::{Agent, CommandOutput};
use crate::error::AgentError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status `ssh` uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// SSH connection settings shared by every node
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Private key file; the ssh client default is used when `None`
    pub key_path: Option<PathBuf>,
    /// SSH port on every node
    pub port: u16,
    /// Limit for establishing a connection
    pub connect_timeout: Duration,
    /// Upper bound for a single remote command
    pub command_timeout: Duration,
    /// Directory for multiplexing control sockets
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            control_dir: std::env::temp_dir(),
        }
    }
}

/// Agent that runs commands over SSH
#[derive(Debug)]
pub struct SshAgent {
    address: String,
    user: String,
    config: SshConfig,
    control_path: PathBuf,
}

impl SshAgent {
    /// Open a connection to `address` and verify it works
    ///
    /// # Errors
    ///
    /// Returns `AgentError::NotConnected` if the node does not answer.
    pub async fn connect(address: &str, user: &str, config: &SshConfig) -> Result<Self, AgentError> {
        let agent = Self {
            address: address.to_string(),
            user: user.to_string(),
            config: config.clone(),
            control_path: config
                .control_dir
                .join(format!("clusterops-{user}@{address}:{}", config.port)),
        };

        let output = agent.execute("true", None).await?;
        if !output.success() {
            return Err(AgentError::NotConnected(format!(
                "{address}: {}",
                output.stderr.trim_end()
            )));
        }

        debug!("Connected to {}@{}", user, address);
        Ok(agent)
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=10")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlPersist=120")
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(key) = &self.config.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

#[async_trait::async_trait]
impl Agent for SshAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput, AgentError> {
        let mut cmd = self.ssh();
        cmd.arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("ssh {}: {}", self.address, command);
        let mut child = cmd.spawn()?;
        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_elapsed| {
                AgentError::Timeout(self.config.command_timeout, command.to_string())
            })??;

        let status = output.status.code().unwrap_or(-1);
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status,
        };

        if status == SSH_ERROR_STATUS {
            return Err(AgentError::NotConnected(format!(
                "{}: {}",
                self.address,
                result.stderr.trim_end()
            )));
        }

        Ok(result)
    }

    async fn close(&self) {
        let result = self
            .ssh()
            .arg("-O")
            .arg("exit")
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!("Failed to close ssh session to {}: {}", self.address, e);
        }
    }
}
