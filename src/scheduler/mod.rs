//! First-come-first-served single-slot model scheduler.
//!
//! At most one backend subprocess exists at a time. `lock` hands the
//! current backend to concurrent request handlers; a request for a
//! different model waits until every holder has called `unlock`, then
//! swaps the subprocess. An optional idle reaper stops the backend once
//! it has gone unused for the configured timeout.

pub mod backend;

#[cfg(all(test, unix))]
mod concurrency_tests;
#[cfg(all(test, unix))]
pub(crate) mod testsupport;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ramalama::{self, Ramalama};
pub use backend::{Backend, BackendDead, UpstreamClient};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("nonexistent model")]
    NoSuchModel,
    #[error("request cancelled")]
    Cancelled,
    #[error("failed to start backend: {0}")]
    Spawn(#[source] ramalama::Error),
    #[error("failed to list models: {0}")]
    List(#[source] ramalama::Error),
}

/// Backend slot. Rules, all under the slot mutex:
/// - `backend` may only be replaced while `users` is 0.
/// - `idle_at` is meaningful only while `backend` is present and
///   `users` is 0.
struct Slot {
    backend: Option<Arc<Backend>>,
    model: String,
    users: usize,
    idle_at: Instant,
}

pub struct FcfsScheduler {
    tool: Ramalama,
    /// Fixed loopback port every backend binds to; the single-slot
    /// design means it is never contended.
    port: u16,
    idle_timeout: Duration,

    /// Serializes model-transition decisions: only one `lock` call at a
    /// time proceeds past the existence check.
    serial: Mutex<()>,
    slot: Mutex<Slot>,
    /// Broadcast for every slot change: users reaching zero, a new
    /// holder arriving, an idle deadline passing. Waiters re-check
    /// their predicate under the slot mutex.
    changed: Notify,

    /// Names known to the serving tool, rebuilt from `list` on a miss.
    models: Mutex<HashSet<String>>,
}

impl FcfsScheduler {
    pub fn new(tool: Ramalama, port: u16, idle_timeout: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            tool,
            port,
            idle_timeout,
            serial: Mutex::new(()),
            slot: Mutex::new(Slot {
                backend: None,
                model: String::new(),
                users: 0,
                idle_at: Instant::now(),
            }),
            changed: Notify::new(),
            models: Mutex::new(HashSet::new()),
        });

        if !idle_timeout.is_zero() {
            tokio::spawn(run_idle_reaper(Arc::clone(&scheduler)));
        }

        scheduler
    }

    /// Wait until a ready backend for `model` is available and register
    /// as a user of it. Every successful call obliges the caller to
    /// `unlock` exactly once. Access to the backend is shared, not
    /// exclusive.
    pub async fn lock(
        &self,
        ctx: &CancellationToken,
        model: &str,
    ) -> Result<Arc<Backend>, LockError> {
        if !self.model_exists(model).await? {
            return Err(LockError::NoSuchModel);
        }

        let _serial = self.serial.lock().await;

        if ctx.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let mut slot = self.slot.lock().await;

        if let Some(backend) = slot.backend.clone()
            && slot.model == model
            && !backend.exited.is_cancelled()
        {
            slot.users += 1;
            self.changed.notify_waiters();
            return Ok(backend);
        }

        // Drain: a different model may not swap the backend out from
        // under in-flight holders. Same-model callers never reach this
        // point while the backend is live; they take the fast path.
        while slot.users > 0 {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(slot);
            notified.await;
            slot = self.slot.lock().await;
        }

        if let Some(old) = slot.backend.take() {
            old.cancel.cancel();
            old.exited.cancelled().await;
        }

        info!(model, port = self.port, "starting backend");
        let backend = Backend::spawn(&self.tool, model, self.port)
            .await
            .map_err(LockError::Spawn)?;
        slot.backend = Some(Arc::clone(&backend));
        slot.model = model.to_string();

        // The slot mutex stays held while waiting, so the idle reaper
        // cannot tear down the backend before it gains its first user.
        // On cancellation the backend is left installed: the next
        // request may still want it.
        tokio::select! {
            _ = ctx.cancelled() => Err(LockError::Cancelled),
            _ = backend.ready.cancelled() => {
                slot.users += 1;
                Ok(backend)
            }
        }
    }

    /// Release one hold on `backend`. A backend that has already been
    /// swapped out is ignored; its reaper released its resources.
    pub async fn unlock(&self, backend: &Arc<Backend>) {
        let mut slot = self.slot.lock().await;
        let is_current = slot
            .backend
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, backend));
        if is_current {
            slot.users -= 1;
            if slot.users == 0 {
                slot.idle_at = Instant::now();
            }
            self.changed.notify_waiters();
        }
    }

    async fn model_exists(&self, model: &str) -> Result<bool, LockError> {
        let mut cache = self.models.lock().await;
        if cache.contains(model) {
            return Ok(true);
        }

        let models = self.tool.list_models().await.map_err(LockError::List)?;
        cache.clear();
        cache.extend(models.into_iter().map(|m| m.name));
        Ok(cache.contains(model))
    }

    #[cfg(test)]
    pub(crate) async fn current_model(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.backend.as_ref().map(|_| slot.model.clone())
    }

    #[cfg(test)]
    pub(crate) async fn user_count(&self) -> usize {
        self.slot.lock().await.users
    }
}

/// Tear down the backend once it has been idle for the configured
/// timeout. Holds the slot mutex except while parked, so it can never
/// stop a backend that has just gained a user.
async fn run_idle_reaper(scheduler: Arc<FcfsScheduler>) {
    let mut slot = scheduler.slot.lock().await;
    loop {
        let idle = slot.backend.is_some() && slot.users == 0;
        if !idle {
            let notified = scheduler.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(slot);
            notified.await;
            slot = scheduler.slot.lock().await;
            continue;
        }

        let deadline = slot.idle_at + scheduler.idle_timeout;
        if deadline > Instant::now() {
            // Arm a one-shot timer that re-broadcasts once the deadline
            // passes. It takes the slot mutex before notifying, so the
            // wakeup cannot slip in before this task has parked.
            let timer = Arc::clone(&scheduler);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let _slot = timer.slot.lock().await;
                timer.changed.notify_waiters();
            });
            let notified = scheduler.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(slot);
            notified.await;
            slot = scheduler.slot.lock().await;
            continue;
        }

        info!(timeout = ?scheduler.idle_timeout, "stopping backend after idle timeout");
        if let Some(backend) = slot.backend.take() {
            backend.cancel.cancel();
            backend.exited.cancelled().await;
            if let Some(Err(e)) = backend.exit_status() {
                warn!(error = %e, "idle-stopped backend wait failed");
            }
        }
    }
}
