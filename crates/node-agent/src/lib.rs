//! Node agents
//!
//! Remote command execution on cluster nodes and the container engine
//! operations built on top of it.
//!
//! # Example
//!
//! ```no_run
//! use node_agent::{Agent, ContainerEngine, DockerEngine, SshAgent, SshConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshConfig::default();
//! let agent: Arc<dyn Agent> = Arc::new(SshAgent::connect("10.0.0.11", "root", &config).await?);
//! let engine = DockerEngine::new(agent);
//!
//! engine.pull_image("ghcr.io/microscaler/etcd:3.5.17.1").await?;
//! let statuses = engine.inspect(&["etcd", "rivers"]).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod docker;
pub mod engine;
pub mod error;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod shell;
pub mod ssh;

pub use agent::{Agent, CommandOutput};
pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ServiceStatus};
pub use error::AgentError;
#[cfg(feature = "test-util")]
pub use mock::{MockAgent, MockEngine};
pub use ssh::{SshAgent, SshConfig};
