//! Storage watcher.
//!
//! One long-lived watch over the whole key space. Changes to the cluster
//! document or to resource definitions wake the controller; changes to the
//! broker configuration reconnect the certificate issuer in place.

use crate::broker::BrokerHandle;
use crate::error::EngineError;
use futures::StreamExt;
use kv_store::keys::{KEY_CLUSTER, KEY_RESOURCE_PREFIX, KEY_VAULT};
use kv_store::{KvError, Storage, WatchEvent};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, info, warn};

/// First delay before restarting a failed watch
pub const WATCH_RETRY_MIN: Duration = Duration::from_secs(1);
/// Longest delay between watch restarts
pub const WATCH_RETRY_MAX: Duration = Duration::from_secs(30);

/// What a changed key means to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Reconcile again as soon as possible
    Reconcile,
    /// Reconnect the credential broker
    Broker,
}

/// Classify a put on `key`
#[must_use]
pub fn classify(key: &str) -> Option<Change> {
    if key == KEY_CLUSTER || key.starts_with(KEY_RESOURCE_PREFIX) {
        Some(Change::Reconcile)
    } else if key == KEY_VAULT {
        Some(Change::Broker)
    } else {
        None
    }
}

/// Channel pair the watcher wakes the controller through
///
/// Capacity one: a pending wake-up absorbs later ones.
#[must_use]
pub fn channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// Watches storage on behalf of the controller
#[derive(Debug)]
pub struct Watcher {
    storage: Storage,
    broker: BrokerHandle,
    events: mpsc::Sender<()>,
}

impl Watcher {
    /// Watcher sending a wake-up on `events` for every relevant change
    #[must_use]
    pub fn new(storage: Storage, broker: BrokerHandle, events: mpsc::Sender<()>) -> Self {
        Self {
            storage,
            broker,
            events,
        }
    }

    /// Watch until `ctx` is cancelled, restarting a failed watch
    ///
    /// `ready` fires once the first watch is established. Every restart
    /// also wakes the controller, since changes may have been missed.
    pub async fn run(self, ready: oneshot::Sender<()>, ctx: CancellationToken) {
        let mut ready = Some(ready);
        let mut delay = WATCH_RETRY_MIN;
        loop {
            let result = self.watch(&mut ready, &ctx).await;
            if ctx.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => return,
                Err(e) => warn!("Storage watch failed: {}; restarting in {:?}", e, delay),
            }
            self.notify();
            tokio::select! {
                () = ctx.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(WATCH_RETRY_MAX);
        }
    }

    async fn watch(&self, ready: &mut Option<oneshot::Sender<()>>, ctx: &CancellationToken) -> Result<(), EngineError> {
        let kv = self.storage.kv();
        let revision = kv.revision().await?;
        let mut stream = kv.watch("/", revision + 1).await?;
        info!("Watching storage from revision {}", revision + 1);
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        loop {
            let event = tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Err(KvError::Watch("watch stream closed".to_string()).into());
            };
            let WatchEvent::Put(kv) = event? else {
                continue;
            };
            match classify(&kv.key) {
                Some(Change::Reconcile) => {
                    debug!("{} changed at revision {}", kv.key, kv.mod_revision);
                    self.notify();
                }
                Some(Change::Broker) => self.reconnect_broker().await,
                None => {}
            }
        }
    }

    fn notify(&self) {
        // Full means a wake-up is already pending.
        if let Err(mpsc::error::TrySendError::Closed(())) = self.events.try_send(()) {
            debug!("Controller stopped listening for changes");
        }
    }

    async fn reconnect_broker(&self) {
        let config = match self.storage.get_vault_config().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to read credential broker configuration: {}", e);
                return;
            }
        };
        match self.broker.reconnect(&config).await {
            Ok(()) => info!("Credential broker reconnected to {}", config.endpoint),
            Err(e) => warn!("Failed to reconnect credential broker: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ClosingWatch;
    use kv_store::{KvClient, MockKv};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_classify() {
        assert_eq!(classify("/cluster"), Some(Change::Reconcile));
        assert_eq!(
            classify(&format!("{KEY_RESOURCE_PREFIX}Namespace/team-a")),
            Some(Change::Reconcile)
        );
        assert_eq!(classify("/vault"), Some(Change::Broker));
        assert_eq!(classify("/status"), None);
        assert_eq!(classify("/cluster-backup"), None);
        assert_eq!(classify("/records/00000000000000000001"), None);
    }

    async fn start(storage: &Storage) -> (mpsc::Receiver<()>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (tx, rx) = channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = CancellationToken::new();
        let watcher = Watcher::new(storage.clone(), BrokerHandle::new(None), tx);
        let task = tokio::spawn(watcher.run(ready_tx, ctx.clone()));
        ready_rx.await.expect("ready");
        (rx, ctx, task)
    }

    #[tokio::test]
    async fn test_cluster_change_wakes_controller_once() {
        let storage = Storage::new(Arc::new(MockKv::new()));
        storage.kv().put("/cluster", b"{}".to_vec()).await.expect("put");
        let (mut rx, ctx, task) = start(&storage).await;

        storage.kv().put("/status", b"{}".to_vec()).await.expect("put");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "writes before the watch and unrelated keys are ignored"
        );

        storage.kv().put("/cluster", b"{}".to_vec()).await.expect("put");
        storage.kv().put("/cluster", b"{}".to_vec()).await.expect("put");
        let woke = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(woke.expect("wake-up"), Some(()));

        ctx.cancel();
        task.await.expect("join");
    }

    #[tokio::test]
    async fn test_broken_broker_config_keeps_watching() {
        let storage = Storage::new(Arc::new(MockKv::new()));
        let (mut rx, ctx, task) = start(&storage).await;

        storage.kv().put("/vault", b"not json".to_vec()).await.expect("put");
        storage
            .kv()
            .put(&format!("{KEY_RESOURCE_PREFIX}ConfigMap/default/a"), b"{}".to_vec())
            .await
            .expect("put");
        let woke = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(woke.expect("wake-up"), Some(()));
        assert!(!task.is_finished());

        ctx.cancel();
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watch_is_restarted() {
        let kv = Arc::new(ClosingWatch::new(2));
        let storage = Storage::new(Arc::clone(&kv) as Arc<dyn KvClient>);
        let (mut rx, ctx, task) = start(&storage).await;

        // each restart wakes the controller
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, Some(()));
        tokio::time::sleep(WATCH_RETRY_MIN * 4).await;
        assert_eq!(kv.watches.load(Ordering::SeqCst), 3);
        assert!(!task.is_finished());

        storage.kv().put("/cluster", b"{}".to_vec()).await.expect("put");
        let woke = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(woke.expect("wake-up"), Some(()));

        ctx.cancel();
        task.await.expect("join");
    }
}
