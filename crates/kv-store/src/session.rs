//! Lease-backed session and leader election

use crate::error::KvError;
use crate::keys::KEY_LEADER;
use crate::kv_trait::KvClient;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A lease kept alive in the background
///
/// `done` fires when the lease is lost; every key created through the
/// session (the leader key in particular) disappears with it.
pub struct Session {
    client: Arc<dyn KvClient>,
    lease: i64,
    done: CancellationToken,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("lease", &format_args!("{:x}", self.lease))
            .field("done", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Grant a lease with `ttl_seconds` and start keeping it alive
    pub async fn new(client: Arc<dyn KvClient>, ttl_seconds: i64) -> Result<Self, KvError> {
        let lease = client.grant_lease(ttl_seconds).await?;
        let done = CancellationToken::new();
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let client = Arc::clone(&client);
            let done = done.clone();
            let stop = stop.clone();
            async move {
                match client.keep_alive(lease, stop).await {
                    Ok(()) => debug!("Session {:x} keep-alive stopped", lease),
                    Err(e) => error!("Session {:x} lost: {}", lease, e),
                }
                done.cancel();
            }
        });

        info!("Session started with lease {:x}", lease);
        Ok(Self {
            client,
            lease,
            done,
            stop,
            task,
        })
    }

    /// Lease the session keeps alive
    #[must_use]
    pub fn lease(&self) -> i64 {
        self.lease
    }

    /// Whether the lease has been lost
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Token cancelled when the lease is lost
    #[must_use]
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Campaign for leadership; resolves with the leader key once elected
    pub async fn campaign(&self, value: &str) -> Result<String, KvError> {
        self.client.campaign(KEY_LEADER, value, self.lease).await
    }

    /// Give up leadership
    pub async fn resign(&self, leader_key: &str) -> Result<(), KvError> {
        info!("Resigning leadership {}", leader_key);
        self.client.delete(leader_key).await
    }

    /// Stop the keep-alive and revoke the lease
    pub async fn close(self) -> Result<(), KvError> {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("Session keep-alive task failed: {}", e);
        }
        self.client.revoke_lease(self.lease).await
    }
}
