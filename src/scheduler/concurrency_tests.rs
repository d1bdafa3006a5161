//! Concurrency tests for the FCFS single-slot scheduler.
//!
//! Uses a stub serving tool (shell script) plus a local health listener
//! to validate the slot invariants: one subprocess at a time, no swap
//! while holders remain, same-model sharing, idle reaping.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::scheduler::testsupport::{health_server, serve_invocations, stub_tool};
    use crate::scheduler::{FcfsScheduler, LockError};

    async fn scheduler(idle_timeout: Duration) -> (tempfile::TempDir, Arc<FcfsScheduler>) {
        let (port, _server) = health_server().await;
        let (dir, tool) = stub_tool(None);
        (dir, FcfsScheduler::new(tool, port, idle_timeout))
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_lock_spawns_and_unlock_releases() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;

        let backend = sched.lock(&ctx(), "a").await.unwrap();
        assert!(backend.ready().is_cancelled());
        assert_eq!(sched.user_count().await, 1);
        assert_eq!(sched.current_model().await.as_deref(), Some("a"));

        sched.unlock(&backend).await;
        assert_eq!(sched.user_count().await, 0);
        // The backend stays loaded for the next request.
        assert_eq!(sched.current_model().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_unknown_model_no_spawn() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;
        let tool = sched.tool.clone();

        let err = sched.lock(&ctx(), "zzz").await.unwrap_err();
        assert!(matches!(err, LockError::NoSuchModel));
        assert!(serve_invocations(&tool).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_admission() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = sched.lock(&cancelled, "a").await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }

    /// Five concurrent holders of the same model share one subprocess.
    #[tokio::test]
    async fn test_same_model_shares_backend() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;
        let tool = sched.tool.clone();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let sched = Arc::clone(&sched);
            handles.push(tokio::spawn(async move {
                let backend = sched.lock(&ctx(), "a").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                sched.unlock(&backend).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(serve_invocations(&tool).len(), 1, "expected a single spawn");
        assert_eq!(sched.user_count().await, 0);
    }

    /// A request for a different model waits for the current holder to
    /// release, then swaps: spawns happen in arrival order and the
    /// second begins only after the first's unlock.
    #[tokio::test]
    async fn test_swap_waits_for_drain() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;
        let tool = sched.tool.clone();

        let first = sched.lock(&ctx(), "a").await.unwrap();

        let swapper = {
            let sched = Arc::clone(&sched);
            tokio::spawn(async move {
                let backend = sched.lock(&ctx(), "b").await.unwrap();
                sched.unlock(&backend).await;
            })
        };

        // The swapper must not replace the backend while "a" is held.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!swapper.is_finished());
        assert_eq!(sched.current_model().await.as_deref(), Some("a"));
        assert_eq!(serve_invocations(&tool).len(), 1);

        sched.unlock(&first).await;
        tokio::time::timeout(Duration::from_secs(10), swapper)
            .await
            .expect("swap did not complete")
            .unwrap();

        assert_eq!(sched.current_model().await.as_deref(), Some("b"));
        let spawns = serve_invocations(&tool);
        assert_eq!(spawns.len(), 2);
        assert!(spawns[0].ends_with(" a"));
        assert!(spawns[1].ends_with(" b"));
    }

    /// A later same-model request reuses the backend even while another
    /// caller already holds it (no restart in between).
    #[tokio::test]
    async fn test_fcfs_same_model_no_restart() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;
        let tool = sched.tool.clone();

        let first = sched.lock(&ctx(), "a").await.unwrap();
        let second = sched.lock(&ctx(), "a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sched.user_count().await, 2);
        assert_eq!(serve_invocations(&tool).len(), 1);

        sched.unlock(&first).await;
        sched.unlock(&second).await;
        assert_eq!(sched.user_count().await, 0);
    }

    /// With an idle timeout, the backend is torn down after the last
    /// unlock, and the next request respawns it.
    #[tokio::test]
    async fn test_idle_reap_and_respawn() {
        let (_dir, sched) = scheduler(Duration::from_millis(200)).await;
        let tool = sched.tool.clone();

        let backend = sched.lock(&ctx(), "a").await.unwrap();
        sched.unlock(&backend).await;

        tokio::time::timeout(Duration::from_secs(10), backend.exited().cancelled())
            .await
            .expect("idle reaper did not stop the backend");

        // Give the reaper a beat to clear the slot after the exit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sched.current_model().await, None);

        let backend = sched.lock(&ctx(), "a").await.unwrap();
        sched.unlock(&backend).await;
        assert_eq!(serve_invocations(&tool).len(), 2);
    }

    /// An active holder blocks the idle reaper indefinitely.
    #[tokio::test]
    async fn test_idle_reaper_spares_active_backend() {
        let (_dir, sched) = scheduler(Duration::from_millis(100)).await;

        let backend = sched.lock(&ctx(), "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!backend.exited().is_cancelled());
        assert_eq!(sched.current_model().await.as_deref(), Some("a"));

        sched.unlock(&backend).await;
    }

    /// Lock/unlock balance across a burst of mixed-model requests:
    /// users return to zero and only one backend survives.
    #[tokio::test]
    async fn test_balanced_counts_under_load() {
        let (_dir, sched) = scheduler(Duration::ZERO).await;

        let mut handles = Vec::new();
        for i in 0..12u32 {
            let sched = Arc::clone(&sched);
            let model = if i % 2 == 0 { "a" } else { "b" };
            handles.push(tokio::spawn(async move {
                let backend = sched.lock(&ctx(), model).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                sched.unlock(&backend).await;
            }));
        }
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .expect("locker wedged")
                .unwrap();
        }

        assert_eq!(sched.user_count().await, 0);
        let model = sched.current_model().await;
        assert!(model.as_deref() == Some("a") || model.as_deref() == Some("b"));
    }
}
