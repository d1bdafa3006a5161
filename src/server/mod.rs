//! HTTP surface: OpenAI-compatible, Ollama-compatible, and upstream
//! pass-through routes over one shared state.

mod ollama;
mod ollama_types;
mod openai;
mod proxy;
mod upstream;


use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ramalama::{self, Ramalama};
use crate::scheduler::FcfsScheduler;

/// External model names replace `/` so they can appear as a single URL
/// path segment. Distinct canonical names may collide after mangling;
/// the demangle cache keeps the last writer.
pub fn default_mangler(name: &str) -> String {
    name.replace('/', "_")
}

#[derive(Clone)]
pub struct AppState {
    pub ramalama: Ramalama,
    pub scheduler: Arc<FcfsScheduler>,
    pub mangler: fn(&str) -> String,
    http: reqwest::Client,
    demangle_cache: Arc<RwLock<HashMap<String, String>>>,
}

#[derive(Debug, Error)]
pub(crate) enum DemangleError {
    #[error("unknown model name")]
    Unknown,
    #[error(transparent)]
    List(#[from] ramalama::Error),
}

impl AppState {
    pub fn new(ramalama: Ramalama, scheduler: Arc<FcfsScheduler>) -> Self {
        Self {
            ramalama,
            scheduler,
            mangler: default_mangler,
            http: reqwest::Client::new(),
            demangle_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Map a mangled name back to its canonical form. On a miss the
    /// cache is repopulated from the tool's current model list.
    pub(crate) async fn demangle(&self, mangled: &str) -> Result<String, DemangleError> {
        if let Some(name) = self.demangle_cache.read().await.get(mangled) {
            return Ok(name.clone());
        }

        let models = self.ramalama.list_models().await?;
        let mut cache = self.demangle_cache.write().await;
        for model in models {
            cache.insert((self.mangler)(&model.name), model.name);
        }
        cache.get(mangled).cloned().ok_or(DemangleError::Unknown)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/models", get(openai::models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        // Ollama-compatible endpoints
        .route("/api/version", get(ollama::version))
        .route("/api/tags", get(ollama::tags))
        .route("/api/chat", post(ollama::chat))
        // llama-swap style passthrough
        .route("/upstream/", get(upstream::index))
        .route("/upstream/{model}/", any(upstream::proxy_upstream_root))
        .route("/upstream/{model}/{*rest}", any(upstream::proxy_upstream))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(req: Request) -> StatusCode {
    warn!(uri = %req.uri(), "unhandled endpoint");
    StatusCode::NOT_FOUND
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
}
