//! Docker implementation of [`ContainerEngine`]

use crate::agent::Agent;
use crate::engine::{ContainerEngine, ServiceStatus};
use crate::error::AgentError;
use crate::shell;
use cluster_spec::names::LABEL_PARAMS;
use cluster_spec::{Mount, ParamsLabel, ServiceParams};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

const LIST_CONTAINERS: &str = "docker ps -a --format '{{.Names}}'";

/// Container engine driving `docker` on a node through an [`Agent`]
#[derive(Clone)]
pub struct DockerEngine {
    agent: Arc<dyn Agent>,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine")
            .field("address", &self.agent.address())
            .finish()
    }
}

impl DockerEngine {
    /// Runtime driving the docker CLI through `agent`
    #[must_use]
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    /// The agent this engine runs commands through
    #[must_use]
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    async fn succeeds(&self, command: &str) -> Result<bool, AgentError> {
        Ok(self.agent.execute(command, None).await?.success())
    }

    fn transient_args(binds: &[Mount], interactive: bool) -> Vec<String> {
        let mut args = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--network=host".to_string(),
            "--uts=host".to_string(),
        ];
        if interactive {
            args.push("-i".to_string());
        }
        args.extend(binds.iter().map(bind_arg));
        args
    }
}

fn bind_arg(mount: &Mount) -> String {
    let mut options = vec![if mount.read_only { "ro" } else { "rw" }];
    if !mount.propagation.is_empty() {
        options.push(&mount.propagation);
    }
    format!(
        "--volume={}:{}:{}",
        mount.source,
        mount.destination,
        options.join(",")
    )
}

/// Build the `docker run` argument list for a system container
pub(crate) fn system_args(
    name: &str,
    image: &str,
    opts: &[String],
    params: &ServiceParams,
    extra: &ServiceParams,
) -> Result<Vec<String>, AgentError> {
    let label = ParamsLabel {
        builtin: params.clone(),
        extra: extra.clone(),
    }
    .to_label()?;

    let mut args = vec![
        "docker".to_string(),
        "run".to_string(),
        "--detach".to_string(),
        format!("--name={name}"),
        "--read-only".to_string(),
        "--network=host".to_string(),
        "--uts=host".to_string(),
        "--log-driver=journald".to_string(),
        format!("--label={LABEL_PARAMS}={label}"),
    ];
    args.extend(opts.iter().cloned());

    for mount in params.extra_binds.iter().chain(&extra.extra_binds) {
        args.push(bind_arg(mount));
    }

    let env: BTreeMap<&String, &String> = params
        .extra_env
        .iter()
        .chain(&extra.extra_env)
        .collect();
    for (key, value) in env {
        args.push(format!("--env={key}={value}"));
    }

    args.push(image.to_string());
    args.extend(params.extra_args.iter().cloned());
    args.extend(extra.extra_args.iter().cloned());
    Ok(args)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    name: String,
    state: ContainerState,
    config: ContainerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Parse `docker container inspect` output
pub(crate) fn parse_inspect(json: &str) -> Result<HashMap<String, ServiceStatus>, AgentError> {
    let containers: Vec<ContainerInspect> = serde_json::from_str(json)?;
    let mut statuses = HashMap::new();

    for container in containers {
        let label = container
            .config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_PARAMS))
            .map(|value| ParamsLabel::from_label(value))
            .transpose()?
            .unwrap_or_default();

        statuses.insert(
            container.name.trim_start_matches('/').to_string(),
            ServiceStatus {
                running: container.state.running,
                image: container.config.image,
                builtin_params: label.builtin,
                extra_params: label.extra,
                is_healthy: false,
            },
        );
    }

    Ok(statuses)
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), AgentError> {
        let image = shell::quote(image);
        if self
            .succeeds(&format!("docker image inspect {image} >/dev/null 2>&1"))
            .await?
        {
            return Ok(());
        }
        debug!("Pulling {} on {}", image, self.agent.address());
        self.agent.run(&format!("docker image pull {image}")).await?;
        Ok(())
    }

    async fn run(&self, image: &str, binds: &[Mount], command: &[String]) -> Result<(), AgentError> {
        let mut args = Self::transient_args(binds, false);
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.agent.run(&shell::join(&args)).await?;
        Ok(())
    }

    async fn run_with_input(
        &self,
        image: &str,
        binds: &[Mount],
        command: &[String],
        input: &str,
    ) -> Result<(), AgentError> {
        let mut args = Self::transient_args(binds, true);
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.agent.run_with_input(&shell::join(&args), input).await?;
        Ok(())
    }

    async fn run_with_output(
        &self,
        image: &str,
        binds: &[Mount],
        command: &[String],
    ) -> Result<String, AgentError> {
        let mut args = Self::transient_args(binds, false);
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.agent.run(&shell::join(&args)).await
    }

    async fn run_system(
        &self,
        name: &str,
        image: &str,
        opts: &[String],
        params: &ServiceParams,
        extra: &ServiceParams,
    ) -> Result<(), AgentError> {
        let args = system_args(name, image, opts, params, extra)?;
        debug!("Starting {} on {}", name, self.agent.address());
        self.agent.run(&shell::join(&args)).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, AgentError> {
        self.succeeds(&format!(
            "docker container inspect {} >/dev/null 2>&1",
            shell::quote(name)
        ))
        .await
    }

    async fn stop(&self, name: &str) -> Result<(), AgentError> {
        self.agent
            .run(&format!("docker container stop {}", shell::quote(name)))
            .await?;
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), AgentError> {
        self.agent
            .run(&format!("docker container kill {}", shell::quote(name)))
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), AgentError> {
        self.agent
            .run(&format!("docker container rm --force {}", shell::quote(name)))
            .await?;
        Ok(())
    }

    async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ServiceStatus>, AgentError> {
        let listed = self.agent.run(LIST_CONTAINERS).await?;
        let present: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| listed.lines().any(|line| line.trim() == *name))
            .collect();
        if present.is_empty() {
            return Ok(HashMap::new());
        }

        let mut args = vec!["docker", "container", "inspect"];
        args.extend(present);
        let output = self.agent.run(&shell::join(&args)).await?;
        parse_inspect(&output)
    }

    async fn volume_create(&self, name: &str) -> Result<(), AgentError> {
        self.agent
            .run(&format!("docker volume create {}", shell::quote(name)))
            .await?;
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), AgentError> {
        self.agent
            .run(&format!("docker volume rm {}", shell::quote(name)))
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, AgentError> {
        self.succeeds(&format!(
            "docker volume inspect {} >/dev/null 2>&1",
            shell::quote(name)
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_args_order() {
        let params = ServiceParams {
            extra_args: vec!["etcd".to_string(), "--name=10.0.0.11".to_string()],
            extra_binds: vec![Mount::read_only("/etc/etcd")],
            extra_env: BTreeMap::from([("GOMAXPROCS".to_string(), "4".to_string())]),
        };
        let extra = ServiceParams {
            extra_args: vec!["--quota-backend-bytes=8589934592".to_string()],
            ..Default::default()
        };

        let args = system_args(
            "etcd",
            "etcd:3.5",
            &["--volume=etcd-clusterops:/var/lib/etcd:rw".to_string()],
            &params,
            &extra,
        )
        .expect("args");

        let image_pos = args.iter().position(|a| a == "etcd:3.5").expect("image");
        assert!(args[..image_pos].contains(&"--volume=/etc/etcd:/etc/etcd:ro".to_string()));
        assert!(args[..image_pos].contains(&"--env=GOMAXPROCS=4".to_string()));
        assert_eq!(
            &args[image_pos + 1..],
            &[
                "etcd".to_string(),
                "--name=10.0.0.11".to_string(),
                "--quota-backend-bytes=8589934592".to_string()
            ]
        );
        assert!(args.iter().any(|a| a.starts_with(&format!("--label={LABEL_PARAMS}="))));
    }

    #[test]
    fn test_parse_inspect_reads_label() {
        let label = ParamsLabel {
            builtin: ServiceParams {
                extra_args: vec!["rivers".to_string()],
                ..Default::default()
            },
            extra: ServiceParams::default(),
        }
        .to_label()
        .expect("label");
        let labels = HashMap::from([(LABEL_PARAMS.to_string(), label)]);
        let json = serde_json::json!([
            {
                "Name": "/rivers",
                "State": {"Running": true},
                "Config": {"Image": "tools:1", "Labels": labels}
            },
            {
                "Name": "/kubelet",
                "State": {"Running": false},
                "Config": {"Image": "kubernetes:1", "Labels": null}
            }
        ])
        .to_string();

        let statuses = parse_inspect(&json).expect("parse");
        let rivers = &statuses["rivers"];
        assert!(rivers.running);
        assert_eq!(rivers.image, "tools:1");
        assert_eq!(rivers.builtin_params.extra_args, vec!["rivers".to_string()]);

        let kubelet = &statuses["kubelet"];
        assert!(!kubelet.running);
        assert_eq!(kubelet.builtin_params, ServiceParams::default());
    }
}
