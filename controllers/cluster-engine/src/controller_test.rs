use super::*;
use crate::broker::tests::StaticIssuer;
use crate::infrastructure::tests::{LEADER_KEY, MockConnector, mock_infrastructure};
use crate::op::{Commander, Sequence};
use crate::testing;
use async_trait::async_trait;
use cluster_spec::names::CONFIG_VERSION;
use cluster_spec::{Command, OperationPhase, RecordStatus};
use kv_store::MockKv;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Step {
    name: &'static str,
    fail: bool,
    cancel: bool,
    runs: Arc<AtomicUsize>,
}

impl Step {
    fn ok(name: &'static str, runs: &Arc<AtomicUsize>) -> Self {
        Self {
            name,
            fail: false,
            cancel: false,
            runs: Arc::clone(runs),
        }
    }

    fn failing(name: &'static str, runs: &Arc<AtomicUsize>) -> Self {
        Self {
            fail: true,
            ..Self::ok(name, runs)
        }
    }

    fn interrupted(name: &'static str, runs: &Arc<AtomicUsize>) -> Self {
        Self {
            cancel: true,
            ..Self::ok(name, runs)
        }
    }
}

#[async_trait]
impl Commander for Step {
    fn command(&self) -> Command {
        Command::new(self.name, "10.0.0.11")
    }

    async fn run(&self, _: &CancellationToken, _: &Infrastructure, _: &str) -> Result<(), EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.cancel {
            return Err(EngineError::Cancelled);
        }
        if self.fail {
            return Err(EngineError::CommandFailed("boom".to_string()));
        }
        Ok(())
    }
}

fn settings() -> Settings {
    Settings {
        interval: Duration::from_secs(60),
        session_ttl: 10,
        leader_value: "engine-test".to_string(),
        max_records: 100,
        strategy: StrategyConfig::default(),
    }
}

/// Controller over a fresh store whose leader key already exists
async fn controller() -> (Controller, Storage, Arc<MockConnector>) {
    let storage = Storage::new(Arc::new(MockKv::new()));
    storage
        .kv()
        .put(LEADER_KEY, b"test".to_vec())
        .await
        .expect("leader key");
    let connector = Arc::new(MockConnector::default());
    let controller = Controller::new(
        storage.clone(),
        Arc::clone(&connector) as Arc<dyn Connector>,
        BrokerHandle::new(Some(Arc::new(StaticIssuer::default()))),
        settings(),
        ProbeState::new(),
    );
    (controller, storage, connector)
}

#[tokio::test]
async fn test_run_operator_records_every_command() {
    let cluster = testing::cluster(1, 1);
    let (inf, storage) = mock_infrastructure(&cluster, Arc::new(MockConnector::default())).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let mut op = Sequence::new("test-op", vec!["10.0.0.11".to_string()])
        .then(Step::ok("first", &runs))
        .then(Step::ok("second", &runs))
        .boxed();

    let outcome = run_operator(op.as_mut(), &inf, LEADER_KEY, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome, OperatorOutcome::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let records = storage.get_records(10).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].operation, "test-op");
    assert_eq!(records[0].status, RecordStatus::Completed);
    let names: Vec<&str> = records[0].commands.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
    assert!(records[0].end_at.is_some());
}

#[tokio::test]
async fn test_failed_command_stops_operator() {
    let cluster = testing::cluster(1, 1);
    let (inf, storage) = mock_infrastructure(&cluster, Arc::new(MockConnector::default())).await;
    let failed = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));
    let mut op = Sequence::new("test-op", vec![])
        .then(Step::failing("first", &failed))
        .then(Step::ok("second", &after))
        .boxed();

    let outcome = run_operator(op.as_mut(), &inf, LEADER_KEY, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome, OperatorOutcome::Failed);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    let record = &storage.get_records(1).await.expect("records")[0];
    assert_eq!(record.status, RecordStatus::Failed);
    assert!(record.error.contains("boom"), "{}", record.error);
    assert_eq!(record.commands.len(), 1);
}

#[tokio::test]
async fn test_cancelled_operator_is_recorded() {
    let cluster = testing::cluster(1, 1);
    let (inf, storage) = mock_infrastructure(&cluster, Arc::new(MockConnector::default())).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let mut op = Sequence::new("test-op", vec![]).then(Step::ok("first", &runs)).boxed();
    let ctx = CancellationToken::new();
    ctx.cancel();

    let outcome = run_operator(op.as_mut(), &inf, LEADER_KEY, &ctx).await.expect("run");

    assert_eq!(outcome, OperatorOutcome::Cancelled);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let record = &storage.get_records(1).await.expect("records")[0];
    assert_eq!(record.status, RecordStatus::Cancelled);
}

#[tokio::test]
async fn test_command_cancelled_midway_is_recorded_cancelled() {
    let cluster = testing::cluster(1, 1);
    let (inf, storage) = mock_infrastructure(&cluster, Arc::new(MockConnector::default())).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));
    let mut op = Sequence::new("test-op", vec![])
        .then(Step::interrupted("first", &runs))
        .then(Step::ok("second", &after))
        .boxed();

    let outcome = run_operator(op.as_mut(), &inf, LEADER_KEY, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome, OperatorOutcome::Cancelled);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    let record = &storage.get_records(1).await.expect("records")[0];
    assert_eq!(record.status, RecordStatus::Cancelled);
    assert_eq!(record.commands.len(), 1);
}

#[tokio::test]
async fn test_operator_without_leadership_fails() {
    let cluster = testing::cluster(1, 1);
    let (inf, storage) = mock_infrastructure(&cluster, Arc::new(MockConnector::default())).await;
    storage.kv().delete(LEADER_KEY).await.expect("delete");
    let runs = Arc::new(AtomicUsize::new(0));
    let mut op = Sequence::new("test-op", vec![]).then(Step::ok("first", &runs)).boxed();

    let err = run_operator(op.as_mut(), &inf, LEADER_KEY, &CancellationToken::new())
        .await
        .expect_err("not leader");

    assert!(err.is_leadership_lost(), "{err}");
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_orphaned_records_are_cancelled() {
    let (controller, storage, _) = controller().await;
    let mut finished = storage
        .register_record(LEADER_KEY, "done-op", vec![])
        .await
        .expect("register");
    finished.complete();
    storage.update_record(LEADER_KEY, &finished).await.expect("update");
    let orphan = storage
        .register_record(LEADER_KEY, "orphan-op", vec![])
        .await
        .expect("register");

    controller.cancel_orphaned_records(LEADER_KEY).await.expect("cancel");

    assert_eq!(
        storage.get_record(orphan.id).await.expect("orphan").status,
        RecordStatus::Cancelled
    );
    assert_eq!(
        storage.get_record(finished.id).await.expect("finished").status,
        RecordStatus::Completed
    );
}

#[tokio::test]
async fn test_service_account_is_issued_once() {
    let cluster = testing::cluster(1, 0);
    let storage = Storage::new(Arc::new(MockKv::new()));
    storage
        .kv()
        .put(LEADER_KEY, b"test".to_vec())
        .await
        .expect("leader key");
    let issuer = Arc::new(StaticIssuer::default());
    let inf = Infrastructure::new(
        &cluster,
        storage.clone(),
        Arc::new(MockConnector::default()),
        BrokerHandle::new(Some(Arc::clone(&issuer) as Arc<dyn crate::broker::CertIssuer>)),
    )
    .await
    .expect("infrastructure");

    ensure_service_account(&inf, LEADER_KEY).await.expect("first");
    ensure_service_account(&inf, LEADER_KEY).await.expect("second");

    let requests = issuer.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![(CA_KUBERNETES.to_string(), "service-account".to_string())]
    );
    let (cert, key) = storage.get_service_account_data().await.expect("stored");
    assert_eq!(cert, "cert:service-account");
    assert_eq!(key, "key:service-account");
}

#[tokio::test]
async fn test_reconcile_waits_without_cluster() {
    let (controller, storage, _) = controller().await;

    let tick = controller
        .reconcile(LEADER_KEY, &CancellationToken::new())
        .await
        .expect("reconcile");

    assert_eq!(tick, Tick::Idle);
    assert!(storage.get_status().await.expect_err("no status").is_not_found());
}

#[tokio::test]
async fn test_reconcile_waits_on_constraint_violation() {
    let (controller, storage, _) = controller().await;
    storage.put_cluster(&testing::cluster(1, 1)).await.expect("cluster");
    storage
        .put_constraints(&Constraints {
            control_plane_count: 3,
            ..Constraints::default()
        })
        .await
        .expect("constraints");

    let tick = controller
        .reconcile(LEADER_KEY, &CancellationToken::new())
        .await
        .expect("reconcile");

    assert_eq!(tick, Tick::Idle);
    assert!(storage.get_records(10).await.expect("records").is_empty());
}

#[tokio::test]
async fn test_reconcile_upgrades_old_layout() {
    let (controller, storage, connector) = controller().await;
    storage.put_cluster(&testing::cluster(1, 1)).await.expect("cluster");
    storage
        .kv()
        .put("/config-version", b"0".to_vec())
        .await
        .expect("config version");

    let tick = controller
        .reconcile(LEADER_KEY, &CancellationToken::new())
        .await
        .expect("reconcile");

    assert_eq!(tick, Tick::Progressed);
    let status = storage.get_status().await.expect("status");
    assert_eq!(status.phase, OperationPhase::Upgrade);
    assert_eq!(storage.get_config_version().await.expect("version"), CONFIG_VERSION);

    let records = storage.get_records(10).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].operation, "upgrade");
    assert_eq!(records[0].status, RecordStatus::Completed);
    assert_eq!(status.revision, records[0].id - 1);

    let agent = connector.agents.lock().unwrap()["10.0.0.12"].clone();
    assert!(agent.commands().iter().any(|c| c.starts_with("mkdir -p")));
    assert!(storage.get_service_account_data().await.is_ok());
}

#[tokio::test]
async fn test_run_leads_then_resigns_on_shutdown() {
    let storage = Storage::new(Arc::new(MockKv::new()));
    let probes = ProbeState::new();
    let controller = Controller::new(
        storage.clone(),
        Arc::new(MockConnector::default()),
        BrokerHandle::new(None),
        settings(),
        probes.clone(),
    );
    let ctx = CancellationToken::new();
    let task = tokio::spawn({
        let ctx = ctx.clone();
        async move { controller.run(ctx).await }
    });

    let mut leader = None;
    for _ in 0..100 {
        if let Ok(name) = storage.get_leader_hostname().await {
            leader = Some(name);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(leader.as_deref(), Some("engine-test"));

    for _ in 0..100 {
        if probes.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(probes.is_ready());

    ctx.cancel();
    task.await.expect("join").expect("run");
    assert!(storage.get_leader_hostname().await.is_err());
    assert!(!probes.is_ready());
}

#[tokio::test]
async fn test_closed_watch_keeps_leadership() {
    let kv = Arc::new(testing::ClosingWatch::new(1));
    let storage = Storage::new(Arc::clone(&kv) as Arc<dyn kv_store::KvClient>);
    let controller = Controller::new(
        storage.clone(),
        Arc::new(MockConnector::default()),
        BrokerHandle::new(None),
        settings(),
        ProbeState::new(),
    );
    let ctx = CancellationToken::new();
    let task = tokio::spawn({
        let ctx = ctx.clone();
        async move { controller.run(ctx).await }
    });

    for _ in 0..300 {
        if kv.watches.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(kv.watches.load(Ordering::SeqCst), 2);
    assert!(!task.is_finished());
    assert_eq!(
        storage.get_leader_hostname().await.expect("leader").as_str(),
        "engine-test"
    );

    ctx.cancel();
    task.await.expect("join").expect("run");
}
