//! One running child of the serving tool, bound to a loopback port.
//!
//! A backend carries three lifecycle signals:
//! - `ready` fires once the health probe succeeds, or once the child
//!   exits before ever becoming healthy. It says "you may try now",
//!   never "the backend is usable" — consumers must also check `exited`.
//! - `exited` fires exactly once after the child is reaped. By the time
//!   it is observable, `port` reads as 0.
//! - `cancel` requests graceful shutdown; safe to trigger any number of
//!   times, including after exit.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ramalama::{self, Ramalama, ServeArgs};

#[derive(Debug, Error)]
#[error("backend is dead")]
pub struct BackendDead;

#[derive(Debug)]
pub struct Backend {
    /// Loopback port the child serves on; 0 once the child has exited.
    /// Readers observe either a live port or 0, never a stale value
    /// after `exited`.
    port: RwLock<u16>,
    pub(crate) ready: CancellationToken,
    pub(crate) exited: CancellationToken,
    pub(crate) cancel: CancellationToken,
    /// Wait outcome, recorded before `exited` fires.
    exit_status: std::sync::Mutex<Option<std::io::Result<ExitStatus>>>,
    http: reqwest::Client,
}

/// Client handle scoped to a `with_client` callback. The backend's port
/// may be freed and reused once the callback returns, so the handle must
/// not escape it.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(format!("{}{}", self.base_url, path))
    }
}

impl Backend {
    /// Spawn `ramalama serve` for `model` on `port` and start the
    /// readiness and reaper tasks.
    pub(crate) async fn spawn(
        tool: &Ramalama,
        model: &str,
        port: u16,
    ) -> Result<Arc<Self>, ramalama::Error> {
        let mut cmd = tool.serve_command(&ServeArgs {
            model: model.to_string(),
            port,
            alias: None,
        })?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            // If the reaper task is torn down with the child still
            // running (runtime shutdown), don't leave an orphan.
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(ramalama::Error::Spawn)?;
        let pid = child.id();
        debug!(model, port, pid = ?pid, "spawned serving tool");

        let backend = Arc::new(Self {
            port: RwLock::new(port),
            ready: CancellationToken::new(),
            exited: CancellationToken::new(),
            cancel: CancellationToken::new(),
            exit_status: std::sync::Mutex::new(None),
            http: reqwest::Client::new(),
        });

        backend.spawn_cancel_watcher(pid);

        tokio::spawn(run_readiness_probe(Arc::clone(&backend)));
        tokio::spawn(reap(child, Arc::clone(&backend)));

        Ok(backend)
    }

    /// On unix, translate `cancel` into SIGINT so the serving tool can
    /// stop any container it manages before exiting. A hard kill would
    /// leave the container running.
    #[cfg(unix)]
    fn spawn_cancel_watcher(&self, pid: Option<u32>) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = pid else { return };
        let cancel = self.cancel.clone();
        let exited = self.exited.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = exited.cancelled() => {}
                _ = cancel.cancelled() => {
                    // The child may have been reaped between the wakeup
                    // and here; the freed PID must not be signalled.
                    if exited.is_cancelled() {
                        return;
                    }
                    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                        warn!(pid, error = %e, "failed to send SIGINT to serving tool");
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn spawn_cancel_watcher(&self, _pid: Option<u32>) {
        warn!(
            "graceful shutdown of ramalama not supported on this platform, \
             model switching may not work correctly"
        );
    }

    /// Base URL of the child's HTTP server, or `BackendDead` once the
    /// port has been freed.
    pub async fn base_url(&self) -> Result<String, BackendDead> {
        let port = self.port.read().await;
        if *port == 0 {
            return Err(BackendDead);
        }
        Ok(format!("http://127.0.0.1:{}", *port))
    }

    /// Run `f` with a client bound to the backend's port. The port
    /// read-lock is held for the duration of the callback, so the port
    /// cannot be freed and reused underneath it.
    pub async fn with_client<T, F, Fut>(&self, f: F) -> Result<T, BackendDead>
    where
        F: FnOnce(UpstreamClient) -> Fut,
        Fut: Future<Output = T>,
    {
        let port = self.port.read().await;
        if *port == 0 {
            return Err(BackendDead);
        }
        let client = UpstreamClient {
            http: self.http.clone(),
            base_url: format!("http://127.0.0.1:{}", *port),
        };
        Ok(f(client).await)
    }

    /// Signal that fires when the health probe has succeeded or the
    /// child has exited; see the module docs for how to interpret it.
    pub fn ready(&self) -> &CancellationToken {
        &self.ready
    }

    pub fn exited(&self) -> &CancellationToken {
        &self.exited
    }

    /// Exit outcome recorded by the reaper; `None` while running.
    pub fn exit_status(&self) -> Option<std::io::Result<ExitStatus>> {
        let guard = self.exit_status.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|r| match r {
            Ok(status) => Ok(*status),
            Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
        })
    }

    async fn healthy(&self) -> bool {
        let url = {
            let port = self.port.read().await;
            if *port == 0 {
                return false;
            }
            // /health is llama-server's readiness endpoint.
            format!("http://127.0.0.1:{}/health", *port)
        };
        match self.http.get(url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }
}

/// Poll the child's health endpoint at ~1 Hz until it answers 200, then
/// fire `ready`. Also fires `ready` if the child exits first so no
/// waiter is ever stuck.
async fn run_readiness_probe(backend: Arc<Backend>) {
    loop {
        if backend.healthy().await {
            break;
        }
        if backend.exited.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    backend.ready.cancel();
}

/// Wait for the child, record the outcome, zero the port, then fire
/// `exited`. The port write must complete first: anyone who observes
/// `exited` and then reads `port` sees 0.
async fn reap(mut child: tokio::process::Child, backend: Arc<Backend>) {
    #[cfg(unix)]
    let status = child.wait().await;

    // Without SIGINT delivery, `cancel` has to terminate the child here.
    #[cfg(not(unix))]
    let status = tokio::select! {
        status = child.wait() => status,
        _ = backend.cancel.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match &status {
        Ok(s) => debug!(status = %s, "serving tool exited"),
        Err(e) => warn!(error = %e, "failed to reap serving tool"),
    }

    {
        let mut guard = backend
            .exit_status
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(status);
    }

    *backend.port.write().await = 0;
    backend.exited.cancel();
    // After `exited`, so the watcher never takes a natural exit for a
    // stop request and signals the reaped PID.
    backend.cancel.cancel();
}
