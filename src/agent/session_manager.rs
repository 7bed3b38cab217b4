//! Session manager: lifecycle of conversations and their kernels.
//!
//! Sessions are created on first use, closed explicitly, or pruned after an
//! idle window. Closing a session is the moment its kernel is torn down; the
//! pool holds no reference to session state beyond the id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::session::Session;
use crate::kernel::KernelPool;

/// Manages all live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    cancel_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    pool: Arc<KernelPool>,
}

impl SessionManager {
    pub fn new(pool: Arc<KernelPool>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
            pool,
        }
    }

    /// Create a fresh session.
    pub async fn create(&self) -> Arc<Mutex<Session>> {
        let session = Arc::new(Mutex::new(Session::new()));
        let id = session.lock().await.id;

        self.sessions.write().await.insert(id, Arc::clone(&session));
        tracing::info!(session_id = %id, "Created session");
        session
    }

    /// Look up an existing session.
    pub async fn get(&self, id: Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(&id).map(Arc::clone)
    }

    /// Cancellation token for a session, created on first request.
    ///
    /// Cancelling it aborts the session's in-flight turn; a later turn gets
    /// a fresh token.
    pub async fn cancel_token(&self, id: Uuid) -> CancellationToken {
        {
            let tokens = self.cancel_tokens.read().await;
            if let Some(token) = tokens.get(&id) {
                if !token.is_cancelled() {
                    return token.clone();
                }
            }
        }

        let mut tokens = self.cancel_tokens.write().await;
        // Double-check after acquiring write lock
        if let Some(token) = tokens.get(&id) {
            if !token.is_cancelled() {
                return token.clone();
            }
        }
        let token = CancellationToken::new();
        tokens.insert(id, token.clone());
        token
    }

    /// Cancel a session's in-flight turn, if any.
    pub async fn cancel(&self, id: Uuid) {
        if let Some(token) = self.cancel_tokens.read().await.get(&id) {
            token.cancel();
        }
    }

    /// Close a session: cancel any in-flight work, drop the history, and
    /// tear down the kernel. Idempotent.
    pub async fn close(&self, id: Uuid) {
        self.cancel(id).await;
        self.cancel_tokens.write().await.remove(&id);

        let removed = self.sessions.write().await.remove(&id).is_some();
        self.pool.release(id).await;

        if removed {
            tracing::info!(session_id = %id, "Closed session");
        }
    }

    /// Remove sessions idle for longer than `max_idle`, tearing down their
    /// kernels. Sessions with an active turn are skipped.
    ///
    /// Returns the number of sessions pruned.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let cutoff = chrono::Utc::now() - chrono::TimeDelta::seconds(max_idle.as_secs() as i64);

        let stale: Vec<Uuid> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter_map(|(id, session)| {
                    // Try to lock; skip if contended (a turn is running)
                    let sess = session.try_lock().ok()?;
                    (sess.last_active_at < cutoff).then_some(*id)
                })
                .collect()
        };

        for id in &stale {
            self.close(*id).await;
        }

        if !stale.is_empty() {
            tracing::info!(
                "Pruned {} idle session(s) (idle > {}s)",
                stale.len(),
                max_idle.as_secs()
            );
        }

        stale.len()
    }

    /// Spawn the periodic sweeper that prunes idle sessions and evicts idle
    /// kernels. Runs until the returned token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        max_idle: Duration,
        interval: Duration,
    ) -> CancellationToken {
        let manager = Arc::clone(self);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.prune_idle(max_idle).await;
                        manager.pool.evict_idle().await;
                    }
                }
            }
        });

        shutdown
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
