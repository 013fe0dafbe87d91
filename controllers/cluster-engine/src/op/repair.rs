//! Repair queue operators.

use super::common::run_local_with_retries;
use super::reboot::drain;
use super::{Commander, Operator, Sequence};
use crate::backoff::DrainBackoff;
use crate::error::EngineError;
use crate::infrastructure::Infrastructure;
use crate::k8s::EvictPolicy;
use async_trait::async_trait;
use chrono::Utc;
use cluster_spec::{Command, Node, RepairQueueEntry, RepairSpec, RepairStatus, RepairStep, RepairStepStatus};
use kv_store::KvError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cordon marker of nodes drained for a repair
pub const REPAIR_MARKER: &str = "repair";

/// Default timeout of a repair step command
pub const DEFAULT_REPAIR_COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Write an entry back; `false` when it was deleted or dequeued meanwhile
async fn save(inf: &Infrastructure, leader_key: &str, entry: &RepairQueueEntry) -> Result<bool, EngineError> {
    match inf.storage().update_repairs_entry(leader_key, entry).await {
        Ok(()) => Ok(true),
        Err(e @ (KvError::Conflict(_) | KvError::NotFound(_))) => {
            warn!("Repair entry for {} changed meanwhile: {}", entry.address, e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove entries marked deleted
pub struct Dequeue {
    entries: Vec<RepairQueueEntry>,
}

#[async_trait]
impl Commander for Dequeue {
    fn command(&self) -> Command {
        let addresses: Vec<&str> = self.entries.iter().map(|e| e.address.as_str()).collect();
        Command::new("repair-dequeue", addresses.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        for entry in &self.entries {
            inf.storage()
                .delete_repairs_entry(leader_key, entry.index)
                .await?;
            info!("Removed repair entry {} for {}", entry.index, entry.address);
        }
        Ok(())
    }
}

/// Remove finished or cancelled repair entries
#[must_use]
pub fn dequeue(entries: Vec<RepairQueueEntry>) -> Box<dyn Operator> {
    let targets = entries.iter().map(|e| e.address.clone()).collect();
    Sequence::new("repair-dequeue", targets)
        .then(Dequeue { entries })
        .boxed()
}

/// Finish an entry as succeeded or failed
pub struct Finish {
    entry: RepairQueueEntry,
    succeeded: bool,
}

#[async_trait]
impl Commander for Finish {
    fn command(&self) -> Command {
        let result = if self.succeeded { "succeeded" } else { "failed" };
        Command::new("repair-finish", &self.entry.address).with_detail(result)
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        let mut entry = self.entry.clone();
        entry.status = if self.succeeded {
            RepairStatus::Succeeded
        } else {
            RepairStatus::Failed
        };
        entry.last_transition_time = Some(Utc::now());
        if save(inf, leader_key, &entry).await? {
            info!("Repair of {} finished: {}", entry.address, self.command().detail);
        }
        Ok(())
    }
}

/// Mark an entry succeeded or failed
#[must_use]
pub fn finish(entry: RepairQueueEntry, succeeded: bool) -> Box<dyn Operator> {
    Sequence::new("repair-finish", vec![entry.address.clone()])
        .then(Finish { entry, succeeded })
        .boxed()
}

/// Drain the node of an entry before running its step
pub struct DrainStart {
    api_server: Node,
    entry: RepairQueueEntry,
    nodename: String,
    spec: RepairSpec,
    backoff: DrainBackoff,
}

#[async_trait]
impl Commander for DrainStart {
    fn command(&self) -> Command {
        Command::new("drain-start", &self.entry.address).with_detail(format!("step {}", self.entry.step))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        let mut entry = self.entry.clone();
        entry.status = RepairStatus::Processing;
        entry.step_status = RepairStepStatus::Draining;
        entry.last_transition_time = Some(Utc::now());
        if !save(inf, leader_key, &entry).await? {
            return Ok(());
        }

        let policy = EvictPolicy {
            retries: self.spec.evict_retries.unwrap_or(0),
            interval: self.spec.evict_interval(),
        };
        let result = match inf.kube(&self.api_server).await {
            Ok(client) => {
                drain(
                    ctx,
                    &client,
                    &self.nodename,
                    REPAIR_MARKER,
                    self.spec.protected_namespaces.as_ref(),
                    policy,
                )
                .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!("Draining {} for repair", entry.address);
                Ok(())
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                warn!("Drain of {} for repair failed: {}", entry.address, e);
                back_off(inf, leader_key, &entry, self.backoff).await
            }
        }
    }
}

async fn back_off(
    inf: &Infrastructure,
    leader_key: &str,
    entry: &RepairQueueEntry,
    backoff: DrainBackoff,
) -> Result<(), EngineError> {
    let now = Utc::now();
    let (count, expire) = backoff.next(entry.drain_backoff_count, now);
    let mut entry = entry.clone();
    entry.step_status = RepairStepStatus::Waiting;
    entry.last_transition_time = Some(now);
    entry.drain_backoff_count = count;
    entry.drain_backoff_expire = Some(expire);
    if save(inf, leader_key, &entry).await? {
        info!("Repair of {} waits until {} before draining again", entry.address, expire);
    }
    Ok(())
}

/// Cordon the machine, evict its pods and mark the step draining
#[must_use]
pub fn drain_start(
    api_server: Node,
    entry: RepairQueueEntry,
    nodename: String,
    spec: RepairSpec,
) -> Box<dyn Operator> {
    Sequence::new("repair-drain-start", vec![entry.address.clone()])
        .then(DrainStart {
            api_server,
            entry,
            nodename,
            spec,
            backoff: DrainBackoff::default(),
        })
        .boxed()
}

/// Send a draining entry back to Waiting with back-off
pub struct DrainTimeout {
    entry: RepairQueueEntry,
    backoff: DrainBackoff,
}

#[async_trait]
impl Commander for DrainTimeout {
    fn command(&self) -> Command {
        Command::new("drain-timeout", &self.entry.address)
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        back_off(inf, leader_key, &self.entry, self.backoff).await
    }
}

/// Back off the entry whose eviction did not finish in time
#[must_use]
pub fn drain_timeout(entry: RepairQueueEntry) -> Box<dyn Operator> {
    Sequence::new("repair-drain-timeout", vec![entry.address.clone()])
        .then(DrainTimeout {
            entry,
            backoff: DrainBackoff::default(),
        })
        .boxed()
}

/// Run the current step's command and start watching
///
/// A command that still fails after its retries finishes the entry as failed.
pub struct Execute {
    entry: RepairQueueEntry,
    step: RepairStep,
}

#[async_trait]
impl Commander for Execute {
    fn command(&self) -> Command {
        Command::new("repair-execute", &self.entry.address)
            .with_detail(self.step.repair_command.join(" "))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        let mut argv = self.step.repair_command.clone();
        argv.push(self.entry.address.clone());
        let timeout = self
            .step
            .command_timeout_seconds
            .map_or(DEFAULT_REPAIR_COMMAND_TIMEOUT, Duration::from_secs);
        let result = run_local_with_retries(
            ctx,
            inf,
            &argv,
            timeout,
            self.step.command_retries.unwrap_or(0),
            Duration::from_secs(self.step.command_interval.unwrap_or(0)),
        )
        .await;

        let mut entry = self.entry.clone();
        entry.status = RepairStatus::Processing;
        entry.last_transition_time = Some(Utc::now());
        match result {
            Ok(_) => {
                entry.step_status = RepairStepStatus::Watching;
                info!("Repair step {} of {} executed, watching", entry.step, entry.address);
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                error!("Repair step {} of {} failed: {}", entry.step, entry.address, e);
                entry.status = RepairStatus::Failed;
            }
        }
        save(inf, leader_key, &entry).await.map(drop)
    }
}

/// Run the commands of one repair step
#[must_use]
pub fn execute(entry: RepairQueueEntry, step: RepairStep) -> Box<dyn Operator> {
    Sequence::new("repair-execute", vec![entry.address.clone()])
        .then(Execute { entry, step })
        .boxed()
}
