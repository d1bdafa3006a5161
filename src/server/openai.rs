//! OpenAI-compatible endpoints. The completion endpoints are plain
//! pass-throughs once the model has been extracted and admitted.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use super::AppState;
use super::proxy::proxy_model_request;
use crate::ramalama;

#[derive(Debug, Serialize)]
pub(crate) struct OaiModel {
    pub id: String,
    /// Always `"model"`.
    pub object: &'static str,
    /// Unix seconds.
    pub created: i64,
    pub owned_by: &'static str,
}

pub(crate) async fn models(State(state): State<AppState>) -> Response {
    let rama_models = match state.ramalama.list_models().await {
        Ok(models) => models,
        Err(e) => {
            error!(error = %e, "failed to get models");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error: E_MODEL_GET",
            )
                .into_response();
        }
    };

    let models = match convert_model_list(rama_models) {
        Ok(models) => models,
        Err(e) => {
            error!(error = %e, "failed to convert models");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error: E_MODEL_LIST_CONVERT",
            )
                .into_response();
        }
    };

    Json(models).into_response()
}

fn convert_model_list(models: Vec<ramalama::Model>) -> Result<Vec<OaiModel>, chrono::ParseError> {
    models
        .into_iter()
        .map(|m| {
            let modified = chrono::DateTime::parse_from_rfc3339(&m.modified)?;
            Ok(OaiModel {
                id: m.name,
                object: "model",
                created: modified.timestamp(),
                owned_by: "rama-swap",
            })
        })
        .collect()
}

pub(crate) async fn chat_completions(State(state): State<AppState>, req: Request) -> Response {
    proxy_model_request(state, req).await
}

pub(crate) async fn completions(State(state): State<AppState>, req: Request) -> Response {
    proxy_model_request(state, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, modified: &str) -> ramalama::Model {
        ramalama::Model {
            name: name.to_string(),
            modified: modified.to_string(),
            size: 1,
        }
    }

    #[test]
    fn test_convert_model_list() {
        let converted =
            convert_model_list(vec![model("a", "2024-01-01T00:00:00Z")]).unwrap();
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].id, "a");
        assert_eq!(converted[0].object, "model");
        assert_eq!(converted[0].created, 1704067200);
        assert_eq!(converted[0].owned_by, "rama-swap");
    }

    #[test]
    fn test_convert_model_list_accepts_offsets() {
        let converted =
            convert_model_list(vec![model("a", "2024-01-01T02:00:00+02:00")]).unwrap();
        assert_eq!(converted[0].created, 1704067200);
    }

    #[test]
    fn test_convert_model_list_rejects_bad_timestamp() {
        assert!(convert_model_list(vec![model("a", "yesterday")]).is_err());
    }
}
