//! DockerEngine behaviour against a scripted agent

use cluster_spec::ServiceParams;
use node_agent::{Agent, AgentError, CommandOutput, ContainerEngine, DockerEngine, MockAgent};
use std::sync::Arc;

fn engine(agent: &MockAgent) -> DockerEngine {
    DockerEngine::new(Arc::new(agent.clone()))
}

#[tokio::test]
async fn test_pull_skips_present_image() {
    let agent = MockAgent::new("10.0.0.11");
    let docker = engine(&agent);

    docker.pull_image("etcd:3.5").await.expect("pull");

    let commands = agent.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("docker image inspect etcd:3.5"));
}

#[tokio::test]
async fn test_pull_fetches_missing_image() {
    let agent = MockAgent::new("10.0.0.11");
    agent.respond_with(
        "docker image inspect",
        CommandOutput {
            status: 1,
            ..Default::default()
        },
    );
    let docker = engine(&agent);

    docker.pull_image("etcd:3.5").await.expect("pull");

    assert_eq!(agent.commands()[1], "docker image pull etcd:3.5");
}

#[tokio::test]
async fn test_inspect_only_queries_listed_containers() {
    let agent = MockAgent::new("10.0.0.11");
    agent.respond("docker ps", "rivers\nsomething-else\n");
    agent.respond(
        "docker container inspect",
        r#"[{"Name":"/rivers","State":{"Running":true},"Config":{"Image":"tools:1","Labels":{}}}]"#,
    );
    let docker = engine(&agent);

    let statuses = docker.inspect(&["rivers", "etcd"]).await.expect("inspect");

    assert_eq!(statuses.len(), 1);
    assert!(statuses["rivers"].running);
    assert_eq!(statuses["rivers"].builtin_params, ServiceParams::default());
    assert_eq!(agent.commands()[1], "docker container inspect rivers");
}

#[tokio::test]
async fn test_inspect_with_no_containers_skips_inspect() {
    let agent = MockAgent::new("10.0.0.11");
    let docker = engine(&agent);

    let statuses = docker.inspect(&["etcd"]).await.expect("inspect");

    assert!(statuses.is_empty());
    assert_eq!(agent.commands().len(), 1);
}

#[tokio::test]
async fn test_failed_command_reports_stderr() {
    let agent = MockAgent::new("10.0.0.11");
    agent.respond_with(
        "docker volume rm",
        CommandOutput {
            stdout: String::new(),
            stderr: "volume is in use\n".to_string(),
            status: 1,
        },
    );
    let docker = engine(&agent);

    let err = docker.volume_remove("etcd-clusterops").await.unwrap_err();
    match err {
        AgentError::CommandFailed { status, stderr, .. } => {
            assert_eq!(status, 1);
            assert_eq!(stderr, "volume is in use");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_agent() {
    let agent = MockAgent::new("10.0.0.11");
    agent.set_unreachable(true);

    let err = agent.run("true").await.unwrap_err();
    assert!(matches!(err, AgentError::NotConnected(_)));
}
