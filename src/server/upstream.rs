//! llama-swap style passthrough: `/upstream/{model}/...` exposes the
//! backend's whole HTTP surface under a mangled model name, and
//! `/upstream/` lists the models as links.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use tracing::{error, warn};

use super::proxy::dispatch;
use super::{AppState, DemangleError};

/// Proxy `/upstream/{model}/{rest}` to `/{rest}` on the backend for the
/// demangled model.
pub(crate) async fn proxy_upstream(
    State(state): State<AppState>,
    Path((model, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy_to_backend(state, model, rest, req).await
}

/// `/upstream/{model}/` with nothing after the slash maps to the
/// backend's root.
pub(crate) async fn proxy_upstream_root(
    State(state): State<AppState>,
    Path(model): Path<String>,
    req: Request,
) -> Response {
    proxy_to_backend(state, model, String::new(), req).await
}

async fn proxy_to_backend(
    state: AppState,
    model: String,
    rest: String,
    req: Request,
) -> Response {
    let canonical = match state.demangle(&model).await {
        Ok(name) => name,
        Err(DemangleError::Unknown) => {
            warn!(model = %model, "unknown upstream model name");
            return (StatusCode::BAD_REQUEST, "invalid model name").into_response();
        }
        Err(DemangleError::List(e)) => {
            error!(error = %e, "failed to get models");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (parts, body) = req.into_parts();
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let target = format!("/{rest}{query}");

    let body = reqwest::Body::wrap_stream(body.into_data_stream());
    dispatch(state, &canonical, parts, body, Some(target)).await
}

/// HTML index of models linking to their mangled upstream URLs.
pub(crate) async fn index(State(state): State<AppState>) -> Response {
    let models = match state.ramalama.list_models().await {
        Ok(models) => models,
        Err(e) => {
            error!(error = %e, "failed to get models");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut page = String::from("<html><body><p>Models:</p><ul>");
    for model in models {
        let mangled = escape(&(state.mangler)(&model.name));
        let name = escape(&model.name);
        page.push_str(&format!(r#"<li><a href="/upstream/{mangled}/">{name}</a></li>"#));
    }
    page.push_str("</ul></body></html>");
    Html(page).into_response()
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
