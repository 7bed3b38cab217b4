//! Bounded pool of per-session kernels.
//!
//! One slot per session; each slot holds at most one live kernel. The slot's
//! async mutex serializes executions for that kernel (FIFO, so same-session
//! requests run in submission order). Pool accounting is shared across
//! sessions; kernels never are.
//!
//! Eviction discards interpreter state: the next execution in that session
//! starts from a fresh interpreter. This is documented, observable behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::config::KernelSettings;
use crate::kernel::error::{KernelError, Result};
use crate::kernel::process::KernelProcess;

/// One session's kernel slot.
#[derive(Debug)]
pub struct KernelSlot {
    session_id: Uuid,
    kernel: Mutex<Option<KernelProcess>>,
    last_used: StdMutex<Instant>,
}

impl KernelSlot {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            kernel: Mutex::new(None),
            last_used: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }
}

/// Handle a session holds to its slot. Does not own the kernel process;
/// the pool does.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    slot: Arc<KernelSlot>,
}

impl KernelHandle {
    /// Lock the slot for one execution. The guard serializes access to the
    /// kernel; holding it is what "in-flight" means to the pool.
    pub async fn lock(&self) -> MutexGuard<'_, Option<KernelProcess>> {
        self.slot.kernel.lock().await
    }

    /// Record activity for LRU ordering.
    pub fn touch(&self) {
        self.slot.touch();
    }

    /// Session this handle belongs to.
    pub fn session_id(&self) -> Uuid {
        self.slot.session_id
    }
}

/// The pool itself: slot registry plus capacity and LRU accounting.
pub struct KernelPool {
    settings: KernelSettings,
    slots: RwLock<HashMap<Uuid, Arc<KernelSlot>>>,
}

impl KernelPool {
    pub fn new(settings: KernelSettings) -> Self {
        Self {
            settings,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    /// Get the session's kernel, spawning one if needed.
    ///
    /// Fails with [`KernelError::ResourceExhausted`] when the pool is at its
    /// maximum and no idle kernel can be evicted to make room.
    pub async fn acquire(&self, session_id: Uuid) -> Result<KernelHandle> {
        self.acquire_with(session_id, None).await
    }

    /// Like [`acquire`](Self::acquire), with a memory ceiling override that
    /// applies only if this call spawns the kernel. Ceilings are fixed at
    /// process creation.
    pub async fn acquire_with(
        &self,
        session_id: Uuid,
        memory_limit_mb: Option<u64>,
    ) -> Result<KernelHandle> {
        let slot = self.get_or_create_slot(session_id).await;
        let handle = KernelHandle { slot: Arc::clone(&slot) };

        {
            let mut guard = slot.kernel.lock().await;
            let alive = guard.as_mut().is_some_and(|k| k.is_alive());
            if !alive {
                if let Some(mut dead) = guard.take() {
                    // Crashed or resource-killed since last use; reap it.
                    dead.kill().await;
                    tracing::warn!(%session_id, "Replacing dead kernel on acquire");
                }
                self.ensure_capacity(session_id).await?;
                *guard = Some(self.spawn_kernel(memory_limit_mb).await?);
            }
        }

        slot.touch();
        Ok(handle)
    }

    async fn spawn_kernel(&self, memory_limit_mb: Option<u64>) -> Result<KernelProcess> {
        match memory_limit_mb {
            Some(mb) => {
                let settings = KernelSettings {
                    memory_limit_mb: mb,
                    ..self.settings.clone()
                };
                KernelProcess::spawn(&settings).await
            }
            None => KernelProcess::spawn(&self.settings).await,
        }
    }

    /// Tear down the session's kernel but keep the slot. Idempotent.
    pub async fn evict(&self, session_id: Uuid) {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(&session_id).cloned()
        };
        let Some(slot) = slot else { return };

        let mut guard = slot.kernel.lock().await;
        if let Some(mut kernel) = guard.take() {
            kernel.kill().await;
            tracing::info!(%session_id, "Kernel evicted");
        }
    }

    /// Remove the session's slot entirely (session close). Idempotent.
    pub async fn release(&self, session_id: Uuid) {
        let slot = {
            let mut slots = self.slots.write().await;
            slots.remove(&session_id)
        };
        if let Some(slot) = slot {
            let mut guard = slot.kernel.lock().await;
            if let Some(mut kernel) = guard.take() {
                kernel.kill().await;
            }
            tracing::debug!(%session_id, "Kernel slot released");
        }
    }

    /// Replace the session's kernel with a fresh one, discarding state.
    ///
    /// Interrupts first, then force-kills after the caller-supplied grace
    /// period if the process has not exited.
    pub async fn restart(
        &self,
        session_id: Uuid,
        grace: std::time::Duration,
    ) -> Result<KernelHandle> {
        let slot = self.get_or_create_slot(session_id).await;

        {
            let mut guard = slot.kernel.lock().await;
            if let Some(mut old) = guard.take() {
                old.interrupt();
                tokio::time::sleep(grace).await;
                old.kill().await;
            }
            // Capacity cannot regress here: we just freed this session's kernel.
            *guard = Some(KernelProcess::spawn(&self.settings).await?);
        }

        slot.touch();
        tracing::info!(%session_id, "Kernel restarted");
        Ok(KernelHandle { slot })
    }

    /// Spawn a replacement kernel into an already-locked slot.
    ///
    /// Used by the supervisor after a timeout, where the slot guard is held
    /// and the old process has already been killed.
    pub(crate) async fn respawn_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<KernelProcess>>,
    ) -> Result<()> {
        debug_assert!(guard.is_none(), "respawn over a live kernel");
        **guard = Some(KernelProcess::spawn(&self.settings).await?);
        Ok(())
    }

    /// Evict kernels idle longer than the configured window. Returns how
    /// many were terminated.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<Arc<KernelSlot>> = {
            let slots = self.slots.read().await;
            slots.values().cloned().collect()
        };

        let mut evicted = 0;
        for slot in slots {
            if slot.idle_for() < self.settings.idle_window {
                continue;
            }
            // Busy slots are in-flight, never idle; skip if contended.
            let Ok(mut guard) = slot.kernel.try_lock() else {
                continue;
            };
            if let Some(mut kernel) = guard.take() {
                kernel.kill().await;
                evicted += 1;
                tracing::info!(session_id = %slot.session_id, "Idle kernel evicted");
            }
        }
        evicted
    }

    /// Number of live kernels. Busy slots count as live.
    pub async fn live_kernels(&self) -> usize {
        let slots = self.slots.read().await;
        let mut live = 0;
        for slot in slots.values() {
            match slot.kernel.try_lock() {
                Ok(mut guard) => {
                    if guard.as_mut().is_some_and(|k| k.is_alive()) {
                        live += 1;
                    }
                }
                Err(_) => live += 1,
            }
        }
        live
    }

    async fn get_or_create_slot(&self, session_id: Uuid) -> Arc<KernelSlot> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&session_id) {
                return Arc::clone(slot);
            }
        }

        let mut slots = self.slots.write().await;
        // Double-check after acquiring the write lock.
        if let Some(slot) = slots.get(&session_id) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(KernelSlot::new(session_id));
        slots.insert(session_id, Arc::clone(&slot));
        slot
    }

    /// Make room for one more kernel, evicting the least-recently-used idle
    /// kernel if the pool is full.
    async fn ensure_capacity(&self, requesting: Uuid) -> Result<()> {
        loop {
            let (live, lru) = {
                let slots = self.slots.read().await;
                let mut live = 0;
                let mut lru: Option<(Arc<KernelSlot>, std::time::Duration)> = None;
                for slot in slots.values() {
                    // The requesting slot is locked by our caller and holds
                    // no kernel; it is accounted for by the `< max` check.
                    if slot.session_id == requesting {
                        continue;
                    }
                    match slot.kernel.try_lock() {
                        Ok(mut guard) => {
                            if guard.as_mut().is_some_and(|k| k.is_alive()) {
                                live += 1;
                                let idle = slot.idle_for();
                                if lru.as_ref().map(|(_, d)| idle > *d).unwrap_or(true) {
                                    lru = Some((Arc::clone(slot), idle));
                                }
                            }
                        }
                        // Contended slot: an execution is in flight, so the
                        // kernel is live and not evictable.
                        Err(_) => live += 1,
                    }
                }
                (live, lru)
            };

            if live < self.settings.max_kernels {
                return Ok(());
            }

            let Some((victim, _)) = lru else {
                return Err(KernelError::ResourceExhausted {
                    limit: self.settings.max_kernels,
                });
            };

            let Ok(mut guard) = victim.kernel.try_lock() else {
                // Raced with a new execution; re-evaluate.
                continue;
            };
            if let Some(mut kernel) = guard.take() {
                kernel.kill().await;
                tracing::info!(
                    session_id = %victim.session_id,
                    "Evicted LRU kernel under pool pressure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::interpreter_available;

    fn python_missing() -> bool {
        !interpreter_available("python3")
    }

    fn pool_settings(max: usize) -> KernelSettings {
        KernelSettings {
            max_kernels: max,
            ..KernelSettings::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_kernel() {
        if python_missing() {
            return;
        }
        let pool = KernelPool::new(pool_settings(4));
        let session = Uuid::new_v4();

        let h1 = pool.acquire(session).await.unwrap();
        let pid1 = h1.lock().await.as_ref().unwrap().pid();

        let h2 = pool.acquire(session).await.unwrap();
        let pid2 = h2.lock().await.as_ref().unwrap().pid();

        assert_eq!(pid1, pid2);
        assert_eq!(pool.live_kernels().await, 1);
        pool.release(session).await;
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        if python_missing() {
            return;
        }
        let pool = KernelPool::new(pool_settings(4));
        let session = Uuid::new_v4();

        pool.acquire(session).await.unwrap();
        assert_eq!(pool.live_kernels().await, 1);

        pool.evict(session).await;
        assert_eq!(pool.live_kernels().await, 0);

        // Second eviction of an already-idle slot is a no-op, not an error.
        pool.evict(session).await;
        assert_eq!(pool.live_kernels().await, 0);

        // And evicting a session the pool has never seen is fine too.
        pool.evict(Uuid::new_v4()).await;
        pool.release(session).await;
    }

    #[tokio::test]
    async fn test_capacity_evicts_lru_idle_kernel() {
        if python_missing() {
            return;
        }
        let pool = KernelPool::new(pool_settings(1));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        pool.acquire(a).await.unwrap();
        assert_eq!(pool.live_kernels().await, 1);

        // A is idle, so B's acquire evicts it rather than failing.
        pool.acquire(b).await.unwrap();
        assert_eq!(pool.live_kernels().await, 1);

        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn test_capacity_exhausted_when_all_busy() {
        if python_missing() {
            return;
        }
        let pool = KernelPool::new(pool_settings(1));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let handle_a = pool.acquire(a).await.unwrap();
        let _in_flight = handle_a.lock().await;

        let err = pool.acquire(b).await.unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { limit: 1 }));

        drop(_in_flight);
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn test_restart_discards_state() {
        if python_missing() {
            return;
        }
        let pool = KernelPool::new(pool_settings(2));
        let session = Uuid::new_v4();

        let h = pool.acquire(session).await.unwrap();
        let old_pid = h.lock().await.as_ref().unwrap().pid();

        let h2 = pool
            .restart(session, std::time::Duration::from_millis(50))
            .await
            .unwrap();
        let new_pid = h2.lock().await.as_ref().unwrap().pid();

        assert_ne!(old_pid, new_pid);
        pool.release(session).await;
    }

    #[tokio::test]
    async fn test_evict_idle_respects_window() {
        if python_missing() {
            return;
        }
        let settings = KernelSettings {
            max_kernels: 2,
            idle_window: std::time::Duration::from_secs(3600),
            ..KernelSettings::default()
        };
        let pool = KernelPool::new(settings);
        let session = Uuid::new_v4();
        pool.acquire(session).await.unwrap();

        // Freshly used kernel is inside the idle window.
        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(pool.live_kernels().await, 1);
        pool.release(session).await;
    }
}
