//! Mock agent and container engine for unit testing

use crate::agent::{Agent, CommandOutput};
use crate::engine::{ContainerEngine, ServiceStatus};
use crate::error::AgentError;
use cluster_spec::{Mount, ServiceParams};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Agent answering commands from a table of prefixes
///
/// Unmatched commands succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    address: String,
    responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    commands: Arc<Mutex<Vec<String>>>,
    unreachable: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockAgent {
    /// Agent for `address` that accepts every command
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Answer commands starting with `prefix` with `stdout`
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.respond_with(
            prefix,
            CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        );
    }

    /// Answer commands starting with `prefix` with a full output
    pub fn respond_with(&self, prefix: &str, output: CommandOutput) {
        lock(&self.responses).push((prefix.to_string(), output));
    }

    /// Fail every command as if the node went away
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Commands executed so far
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Agent for MockAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, command: &str, _input: Option<&[u8]>) -> Result<CommandOutput, AgentError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AgentError::NotConnected(self.address.clone()));
        }
        lock(&self.commands).push(command.to_string());

        let responses = lock(&self.responses);
        Ok(responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    image: String,
    builtin: ServiceParams,
    extra: ServiceParams,
    running: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    containers: HashMap<String, MockContainer>,
    volumes: BTreeSet<String>,
    pulled: BTreeSet<String>,
    outputs: HashMap<String, String>,
    calls: Vec<String>,
    failing: HashSet<String>,
}

/// In-memory container engine
///
/// Every call is recorded as `"<method> <argument>"`, e.g. `"run_system etcd"`.
/// Calls registered with [`MockEngine::fail_on`] return an error.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    /// Runtime with no containers or volumes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container
    pub fn add_container(
        &self,
        name: &str,
        image: &str,
        builtin: ServiceParams,
        extra: ServiceParams,
        running: bool,
    ) {
        lock(&self.state).containers.insert(
            name.to_string(),
            MockContainer {
                image: image.to_string(),
                builtin,
                extra,
                running,
            },
        );
    }

    /// Pretend a volume already exists
    pub fn add_volume(&self, name: &str) {
        lock(&self.state).volumes.insert(name.to_string());
    }

    /// Stdout returned by `run_with_output` for a command whose first word is `program`
    pub fn set_output(&self, program: &str, stdout: &str) {
        lock(&self.state)
            .outputs
            .insert(program.to_string(), stdout.to_string());
    }

    /// Make a call (formatted as in [`MockEngine::calls`]) fail
    pub fn fail_on(&self, call: &str) {
        lock(&self.state).failing.insert(call.to_string());
    }

    /// Calls recorded so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Whether container `name` is running
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.state)
            .containers
            .get(name)
            .is_some_and(|c| c.running)
    }

    /// Whether volume `name` exists
    #[must_use]
    pub fn has_volume(&self, name: &str) -> bool {
        lock(&self.state).volumes.contains(name)
    }

    fn record(&self, call: String) -> Result<MutexGuard<'_, EngineState>, AgentError> {
        let mut state = lock(&self.state);
        let failing = state.failing.contains(&call);
        state.calls.push(call.clone());
        if failing {
            return Err(AgentError::CommandFailed {
                address: "mock".to_string(),
                command: call,
                status: 1,
                stderr: "injected failure".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("pull_image {image}"))?;
        state.pulled.insert(image.to_string());
        Ok(())
    }

    async fn run(&self, image: &str, _binds: &[Mount], command: &[String]) -> Result<(), AgentError> {
        let program = command.first().map_or(image, String::as_str);
        self.record(format!("run {program}"))?;
        Ok(())
    }

    async fn run_with_input(
        &self,
        image: &str,
        _binds: &[Mount],
        command: &[String],
        _input: &str,
    ) -> Result<(), AgentError> {
        let program = command.first().map_or(image, String::as_str);
        self.record(format!("run_with_input {program}"))?;
        Ok(())
    }

    async fn run_with_output(
        &self,
        image: &str,
        _binds: &[Mount],
        command: &[String],
    ) -> Result<String, AgentError> {
        let program = command.first().map_or(image, String::as_str);
        let state = self.record(format!("run_with_output {program}"))?;
        Ok(state.outputs.get(program).cloned().unwrap_or_default())
    }

    async fn run_system(
        &self,
        name: &str,
        image: &str,
        _opts: &[String],
        params: &ServiceParams,
        extra: &ServiceParams,
    ) -> Result<(), AgentError> {
        let mut state = self.record(format!("run_system {name}"))?;
        if state.containers.contains_key(name) {
            return Err(AgentError::CommandFailed {
                address: "mock".to_string(),
                command: format!("run_system {name}"),
                status: 125,
                stderr: format!("container name {name} is already in use"),
            });
        }
        state.containers.insert(
            name.to_string(),
            MockContainer {
                image: image.to_string(),
                builtin: params.clone(),
                extra: extra.clone(),
                running: true,
            },
        );
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, AgentError> {
        let state = self.record(format!("exists {name}"))?;
        Ok(state.containers.contains_key(name))
    }

    async fn stop(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("stop {name}"))?;
        if let Some(container) = state.containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("kill {name}"))?;
        if let Some(container) = state.containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("remove {name}"))?;
        state.containers.remove(name);
        Ok(())
    }

    async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ServiceStatus>, AgentError> {
        let state = self.record(format!("inspect {}", names.join(",")))?;
        Ok(names
            .iter()
            .filter_map(|name| {
                state.containers.get(*name).map(|c| {
                    (
                        (*name).to_string(),
                        ServiceStatus {
                            running: c.running,
                            image: c.image.clone(),
                            builtin_params: c.builtin.clone(),
                            extra_params: c.extra.clone(),
                            is_healthy: false,
                        },
                    )
                })
            })
            .collect())
    }

    async fn volume_create(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("volume_create {name}"))?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.record(format!("volume_remove {name}"))?;
        state.volumes.remove(name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, AgentError> {
        let state = self.record(format!("volume_exists {name}"))?;
        Ok(state.volumes.contains(name))
    }
}
