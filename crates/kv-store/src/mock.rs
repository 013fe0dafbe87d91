//! Mock key-value store for unit testing
//!
//! Keeps keys in memory with etcd-like revisions, leases, watches and
//! elections so storage and controller logic can be tested without etcd.

use crate::error::KvError;
use crate::kv_trait::{Compare, KeyValue, KvClient, TxnOp, WatchEvent, WatchStream};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<String, Entry>,
    revision: i64,
    leases: HashMap<i64, CancellationToken>,
    next_lease: i64,
    history: Vec<WatchEvent>,
}

impl State {
    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<i64>) -> WatchEvent {
        self.revision += 1;
        let create_revision = self
            .data
            .get(key)
            .map_or(self.revision, |e| e.create_revision);
        let entry = Entry {
            value,
            create_revision,
            mod_revision: self.revision,
            lease,
        };
        let event = WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision,
            mod_revision: self.revision,
        });
        self.data.insert(key.to_string(), entry);
        self.history.push(event.clone());
        event
    }

    fn delete(&mut self, key: &str) -> Option<WatchEvent> {
        self.data.remove(key)?;
        self.revision += 1;
        let event = WatchEvent::Delete {
            key: key.to_string(),
            mod_revision: self.revision,
        };
        self.history.push(event.clone());
        Some(event)
    }

    fn check(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Exists(key) => self.data.contains_key(key),
            Compare::Missing(key) => !self.data.contains_key(key),
            Compare::ModRevision(key, rev) => {
                self.data.get(key).map_or(0, |e| e.mod_revision) == *rev
            }
        }
    }
}

fn to_kv(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
    }
}

/// Mock key-value store
///
/// Clones share the same state, so one instance can play both the engine and
/// an external actor in a test.
#[derive(Debug, Clone)]
pub struct MockKv {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
    fail_writes: Arc<AtomicBool>,
}

impl Default for MockKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Make every subsequent write fail, simulating a lost connection
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Session("mock store unavailable".to_string()));
        }
        Ok(())
    }

    /// Expire a lease, deleting every key attached to it
    pub fn expire_lease(&self, lease: i64) {
        let events = {
            let mut state = self.state();
            if let Some(token) = state.leases.remove(&lease) {
                token.cancel();
            }
            let keys: Vec<String> = state
                .data
                .iter()
                .filter(|(_, e)| e.lease == Some(lease))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| state.delete(k)).collect()
        };
        self.publish(events);
    }

    /// Raw value of a key, for assertions
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state().data.get(key).map(|e| e.value.clone())
    }

    /// Every key currently stored
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state().data.keys().cloned().collect()
    }

    fn election_leader(&self, election: &str) -> Option<String> {
        let prefix = format!("{election}/");
        self.state()
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .min_by_key(|(_, e)| e.create_revision)
            .map(|(k, _)| k.clone())
    }
}

#[async_trait::async_trait]
impl KvClient for MockKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        Ok(self.state().data.get(key).map(|e| to_kv(key, e)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        Ok(self
            .state()
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| to_kv(k, e))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.check_writable()?;
        let event = self.state().put(key, value, None);
        self.publish(vec![event]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check_writable()?;
        let event = self.state().delete(key);
        self.publish(event.into_iter().collect());
        Ok(())
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError> {
        self.check_writable()?;
        let events = {
            let mut state = self.state();
            if !compares.iter().all(|c| state.check(c)) {
                return Ok(false);
            }
            let mut events = Vec::new();
            for op in ops {
                match op {
                    TxnOp::Put(key, value) => events.push(state.put(&key, value, None)),
                    TxnOp::Delete(key) => events.extend(state.delete(&key)),
                }
            }
            events
        };
        self.publish(events);
        Ok(true)
    }

    async fn revision(&self) -> Result<i64, KvError> {
        Ok(self.state().revision)
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, KvError> {
        // Subscribe before reading history so nothing falls in between.
        let receiver = self.events.subscribe();
        let (replay, last) = {
            let state = self.state();
            let replay: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.revision() >= start_revision && e.key().starts_with(prefix))
                .cloned()
                .collect();
            (replay, state.revision)
        };

        let prefix = prefix.to_string();
        let live = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((
                            Err(KvError::Watch(format!("watcher lagged by {n} events"))),
                            rx,
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |item| {
            let keep = match item {
                Ok(event) => event.revision() > last && event.key().starts_with(&prefix),
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

        Ok(futures::stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }

    async fn grant_lease(&self, _ttl_seconds: i64) -> Result<i64, KvError> {
        self.check_writable()?;
        let mut state = self.state();
        state.next_lease += 1;
        let id = 0x1000 + state.next_lease;
        state.leases.insert(id, CancellationToken::new());
        Ok(id)
    }

    async fn keep_alive(&self, lease: i64, cancel: CancellationToken) -> Result<(), KvError> {
        let expired = self
            .state()
            .leases
            .get(&lease)
            .cloned()
            .ok_or_else(|| KvError::Session(format!("lease {lease:x} not found")))?;
        tokio::select! {
            () = cancel.cancelled() => Ok(()),
            () = expired.cancelled() => Err(KvError::Session(format!("lease {lease:x} expired"))),
        }
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError> {
        self.expire_lease(lease);
        Ok(())
    }

    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String, KvError> {
        self.check_writable()?;
        let key = format!("{election}/{lease:x}");
        let mut events = self.events.subscribe();
        {
            let mut state = self.state();
            if !state.leases.contains_key(&lease) {
                return Err(KvError::Session(format!("lease {lease:x} not found")));
            }
            if !state.data.contains_key(&key) {
                let event = state.put(&key, value.as_bytes().to_vec(), Some(lease));
                drop(state);
                self.publish(vec![event]);
            }
        }

        loop {
            if !self.state().data.contains_key(&key) {
                return Err(KvError::Session(format!("lease {lease:x} expired during campaign")));
            }
            if self.election_leader(election).as_deref() == Some(key.as_str()) {
                return Ok(key);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KvError::Session("store closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_txn_guards() {
        let kv = MockKv::new();
        kv.put("/leader/1", b"me".to_vec()).await.unwrap();

        let ok = kv
            .txn(
                vec![Compare::Exists("/leader/1".to_string())],
                vec![TxnOp::Put("/status".to_string(), b"{}".to_vec())],
            )
            .await
            .unwrap();
        assert!(ok);

        kv.delete("/leader/1").await.unwrap();
        let ok = kv
            .txn(
                vec![Compare::Exists("/leader/1".to_string())],
                vec![TxnOp::Put("/status".to_string(), b"x".to_vec())],
            )
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(kv.raw("/status").unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let kv = MockKv::new();
        kv.put("/cluster", b"1".to_vec()).await.unwrap();
        let rev = kv.revision().await.unwrap();

        let mut stream = kv.watch("/", rev + 1).await.unwrap();
        kv.put("/cluster", b"2".to_vec()).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.key(), "/cluster");
        assert_eq!(event.revision(), rev + 1);
    }

    #[tokio::test]
    async fn test_campaign_waits_for_previous_leader() {
        let kv = MockKv::new();
        let first = kv.grant_lease(60).await.unwrap();
        let second = kv.grant_lease(60).await.unwrap();

        let leader = kv.campaign("/leader", "host1", first).await.unwrap();
        assert!(leader.starts_with("/leader/"));

        let contender = kv.clone();
        let handle =
            tokio::spawn(async move { contender.campaign("/leader", "host2", second).await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        kv.expire_lease(first);
        let key = handle.await.unwrap().unwrap();
        assert_eq!(key, format!("/leader/{second:x}"));
    }
}
