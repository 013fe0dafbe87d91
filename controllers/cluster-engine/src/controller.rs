//! Leader election and the reconcile loop.
//!
//! The controller keeps a session on the engine's store and campaigns for
//! leadership. While it leads, it runs one reconcile pass after another:
//! gather the cluster status, let the strategy pick operators, and run them
//! with every command recorded. Between passes it sleeps until storage
//! changes, the interval elapses or shutdown is requested.

use crate::broker::{BrokerHandle, CA_KUBERNETES, CertRequest};
use crate::config::Config;
use crate::error::EngineError;
use crate::infrastructure::{Connector, Infrastructure};
use crate::op::Operator;
use crate::probes::ProbeState;
use crate::reboot::{check_boot, decide_reboot_args};
use crate::static_resources::static_resources;
use crate::status;
use crate::strategy::{DecideInput, StrategyConfig, decide};
use crate::watcher::{self, Watcher};
use chrono::Utc;
use cluster_spec::{Cluster, Constraints, ServerStatus, sort_resources, validate};
use kv_store::{KvError, Session, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables of the controller loop
#[derive(Debug, Clone)]
pub struct Settings {
    /// Sleep between passes when nothing changes
    pub interval: Duration,
    /// TTL of the election session in seconds
    pub session_ttl: i64,
    /// Value published under the leader key
    pub leader_value: String,
    /// Operation records kept after each pass
    pub max_records: usize,
    /// Limits handed to the strategy
    pub strategy: StrategyConfig,
}

impl Settings {
    /// Settings derived from process configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.interval(),
            session_ttl: config.session_ttl,
            leader_value: config.leader_value(),
            max_records: config.max_records,
            strategy: StrategyConfig {
                max_concurrent_updates: config.max_concurrent_updates,
                ..StrategyConfig::default()
            },
        }
    }
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing to do, or the cluster cannot be worked on yet
    Idle,
    /// Every operator completed; the next pass starts right away
    Progressed,
    /// A command failed or the pass was cancelled
    Interrupted,
}

/// How one operator ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorOutcome {
    /// Every command succeeded
    Completed,
    /// A command failed
    Failed,
    /// The pass was cancelled before the operator finished
    Cancelled,
}

/// Leader-elected reconcile loop
pub struct Controller {
    storage: Storage,
    connector: Arc<dyn Connector>,
    broker: BrokerHandle,
    settings: Settings,
    probes: ProbeState,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Controller over `storage` using `connector` for node and cluster access
    #[must_use]
    pub fn new(
        storage: Storage,
        connector: Arc<dyn Connector>,
        broker: BrokerHandle,
        settings: Settings,
        probes: ProbeState,
    ) -> Self {
        Self {
            storage,
            connector,
            broker,
            settings,
            probes,
        }
    }

    /// Campaign and lead until `ctx` is cancelled
    ///
    /// Losing leadership starts a new session and campaign.
    ///
    /// # Errors
    ///
    /// Returns any error other than lost leadership.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), EngineError> {
        info!("Starting cluster engine as {}", self.settings.leader_value);
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let session = Session::new(self.storage.kv(), self.settings.session_ttl).await?;
            let result = self.run_session(&session, &ctx).await;
            self.probes.set_ready(false);
            if let Err(e) = session.close().await {
                warn!("Failed to close session: {}", e);
            }

            match result {
                Ok(()) => {
                    info!("Cluster engine stopped");
                    return Ok(());
                }
                Err(e) if e.is_leadership_lost() => {
                    warn!("Leadership lost: {}; campaigning again", e);
                }
                Err(e) => {
                    error!("Controller failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn run_session(&self, session: &Session, ctx: &CancellationToken) -> Result<(), EngineError> {
        let done = session.done_token();
        self.probes.set_ready(true);

        info!("Campaigning for leadership");
        let leader_key = tokio::select! {
            () = ctx.cancelled() => return Ok(()),
            () = done.cancelled() => return Err(EngineError::NotLeader),
            key = session.campaign(&self.settings.leader_value) => key?,
        };
        info!("Elected as leader with key {}", leader_key);

        let result = self.lead(&leader_key, &done, ctx).await;
        if !session.is_done() {
            if let Err(e) = session.resign(&leader_key).await {
                warn!("Failed to resign leadership: {}", e);
            }
        }
        result
    }

    async fn lead(
        &self,
        leader_key: &str,
        done: &CancellationToken,
        ctx: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.cancel_orphaned_records(leader_key).await?;

        let lead_ctx = ctx.child_token();
        let _stop = lead_ctx.clone().drop_guard();
        tokio::spawn({
            let done = done.clone();
            let lead_ctx = lead_ctx.clone();
            async move {
                tokio::select! {
                    () = done.cancelled() => lead_ctx.cancel(),
                    () = lead_ctx.cancelled() => {}
                }
            }
        });

        let (events_tx, mut events) = watcher::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let watcher = Watcher::new(self.storage.clone(), self.broker.clone(), events_tx);
        let watch_task: JoinHandle<()> = tokio::spawn(watcher.run(ready_tx, lead_ctx.clone()));
        tokio::select! {
            () = lead_ctx.cancelled() => {}
            _ = ready_rx => {}
            () = tokio::time::sleep(self.settings.interval) => {
                warn!("Storage watch is not established; reconciling on the interval");
            }
        }

        while !lead_ctx.is_cancelled() {
            let tick = self.reconcile(leader_key, &lead_ctx).await;
            if lead_ctx.is_cancelled() {
                break;
            }
            match tick? {
                Tick::Progressed => {
                    self.probes.set_ready(true);
                    continue;
                }
                Tick::Idle => self.probes.set_ready(true),
                Tick::Interrupted => {}
            }

            tokio::select! {
                () = lead_ctx.cancelled() => {}
                Some(()) = events.recv() => debug!("Storage changed"),
                () = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        lead_ctx.cancel();
        if let Err(e) = watch_task.await {
            warn!("Watcher task failed: {}", e);
        }
        if done.is_cancelled() {
            Err(EngineError::NotLeader)
        } else {
            Ok(())
        }
    }

    /// Cancel records left running by a previous leader
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn cancel_orphaned_records(&self, leader_key: &str) -> Result<(), EngineError> {
        for mut record in self.storage.get_records(self.settings.max_records).await? {
            if record.is_terminal() {
                continue;
            }
            warn!("Cancelling orphaned operation {} ({})", record.id, record.operation);
            record.cancel();
            self.storage.update_record(leader_key, &record).await?;
        }
        Ok(())
    }

    /// Load the cluster document, or `None` when there is nothing valid to work on
    async fn load_cluster(&self) -> Result<Option<(Cluster, Constraints)>, EngineError> {
        let cluster = match self.storage.get_cluster().await {
            Ok(cluster) => cluster,
            Err(KvError::NotFound(_)) => {
                debug!("No cluster configuration yet");
                return Ok(None);
            }
            Err(KvError::Serialization(e)) => {
                warn!("Cluster configuration cannot be decoded: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let constraints = match self.storage.get_constraints().await {
            Ok(constraints) => constraints,
            Err(KvError::NotFound(_)) => Constraints::default(),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = validate(&cluster).and_then(|()| constraints.check(&cluster)) {
            warn!("Invalid cluster configuration: {}", e);
            return Ok(None);
        }
        Ok(Some((cluster, constraints)))
    }

    /// One reconcile pass
    ///
    /// # Errors
    ///
    /// Storage failures and lost leadership; command failures are recorded
    /// and reported as [`Tick::Interrupted`].
    pub async fn reconcile(&self, leader_key: &str, ctx: &CancellationToken) -> Result<Tick, EngineError> {
        let Some((cluster, constraints)) = self.load_cluster().await? else {
            return Ok(Tick::Idle);
        };

        let inf = Infrastructure::new(
            &cluster,
            self.storage.clone(),
            Arc::clone(&self.connector),
            self.broker.clone(),
        )
        .await?;
        let result = self.reconcile_with(&inf, Arc::new(cluster), &constraints, leader_key, ctx).await;
        inf.close().await;

        if result.is_ok() {
            let deleted = self
                .storage
                .delete_old_records(leader_key, self.settings.max_records)
                .await?;
            if deleted > 0 {
                debug!("Deleted {} old operation records", deleted);
            }
        }
        result
    }

    async fn reconcile_with(
        &self,
        inf: &Infrastructure,
        cluster: Arc<Cluster>,
        constraints: &Constraints,
        leader_key: &str,
        ctx: &CancellationToken,
    ) -> Result<Tick, EngineError> {
        match ensure_service_account(inf, leader_key).await {
            Ok(()) => {}
            Err(EngineError::Broker(e)) => {
                warn!("Cannot issue the service account key: {}", e);
                return Ok(Tick::Idle);
            }
            Err(e) => return Err(e),
        }

        let mut resources = static_resources()?;
        let mut user = self.storage.get_all_resources().await?;
        sort_resources(&mut user);
        resources.extend(user);

        let status = status::gather(inf, &cluster, &resources).await?;
        let now = Utc::now();
        let booted = check_boot(inf, &cluster, &status.reboot_queue.entries).await;
        let reboot_args = decide_reboot_args(&cluster, &status, constraints, &booted, now);

        let input = DecideInput {
            constraints,
            resources: &resources,
            reboot_args: &reboot_args,
            config: &self.settings.strategy,
            now,
        };
        let (ops, phase) = decide(&cluster, &status, &input);

        let server_status = ServerStatus {
            phase,
            timestamp: now,
            revision: self.storage.get_last_record_id().await?,
        };
        self.storage.put_status(leader_key, &server_status).await?;

        if ops.is_empty() {
            debug!("Nothing to do in phase {}", phase);
            return Ok(Tick::Idle);
        }
        info!("Phase {}: {} operators", phase, ops.len());

        for mut op in ops {
            match run_operator(op.as_mut(), inf, leader_key, ctx).await? {
                OperatorOutcome::Completed => {}
                OperatorOutcome::Failed | OperatorOutcome::Cancelled => return Ok(Tick::Interrupted),
            }
        }
        Ok(Tick::Progressed)
    }
}

/// Issue and store the service account signing key if none exists
///
/// # Errors
///
/// Storage and broker errors.
pub async fn ensure_service_account(inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
    match inf.storage().get_service_account_data().await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let issued = inf
        .broker()?
        .issue(CA_KUBERNETES, &CertRequest::new("system", "service-account"))
        .await?;
    inf.storage()
        .put_service_account_data(leader_key, &issued.certificate, &issued.private_key)
        .await?;
    info!("Stored a new service account signing key");
    Ok(())
}

/// Run every command of `op`, recording progress
///
/// # Errors
///
/// Only storage errors; command errors end up in the record.
pub async fn run_operator(
    op: &mut dyn Operator,
    inf: &Infrastructure,
    leader_key: &str,
    ctx: &CancellationToken,
) -> Result<OperatorOutcome, EngineError> {
    let storage = inf.storage();
    let mut record = storage.register_record(leader_key, &op.name(), op.targets()).await?;
    info!("Running operator {} on {:?} (record {})", record.operation, record.targets, record.id);

    while let Some(commander) = op.next_command() {
        if ctx.is_cancelled() {
            record.cancel();
            storage.update_record(leader_key, &record).await?;
            warn!("Operator {} cancelled", record.operation);
            return Ok(OperatorOutcome::Cancelled);
        }

        let command = commander.command();
        info!("Executing command {}", command);
        record.set_command(command);
        storage.update_record(leader_key, &record).await?;

        if let Err(e) = commander.run(ctx, inf, leader_key).await {
            if e.is_leadership_lost() {
                return Err(e);
            }
            if matches!(e, EngineError::Cancelled) {
                record.cancel();
                storage.update_record(leader_key, &record).await?;
                warn!("Operator {} cancelled during {}", record.operation, commander.command().name);
                return Ok(OperatorOutcome::Cancelled);
            }
            error!("Command of operator {} failed: {}", record.operation, e);
            record.set_error(&e);
            storage.update_record(leader_key, &record).await?;
            return Ok(OperatorOutcome::Failed);
        }
    }

    record.complete();
    storage.update_record(leader_key, &record).await?;
    info!("Operator {} completed", record.operation);
    Ok(OperatorOutcome::Completed)
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
