//! Ollama-compatible endpoints.
//!
//! `/api/chat` translates the Ollama chat request into an OpenAI
//! chat-completion call against the locked backend and re-emits the
//! SSE deltas as NDJSON frames. Durations in the terminal frame are
//! nanoseconds, per the Ollama wire format.

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use super::ollama_types::{
    ChatFinalResponse, ChatRequest, ChatResponse, Message, ModelDetails, OllamaModel,
    TagsResponse, VersionResponse,
};
use super::proxy::{Lease, lock_or_reply};
use super::AppState;
use crate::scheduler::UpstreamClient;

const NDJSON: &str = "application/x-ndjson";

pub(crate) async fn version() -> Json<VersionResponse> {
    Json(VersionResponse { version: "0.11.10" })
}

pub(crate) async fn tags(State(state): State<AppState>) -> Response {
    let rama_models = match state.ramalama.list_models().await {
        Ok(models) => models,
        Err(e) => {
            error!(error = %e, "failed to get models");
            return (StatusCode::INTERNAL_SERVER_ERROR, "E_MODEL_GET\n").into_response();
        }
    };

    let models = rama_models
        .into_iter()
        .map(|m| OllamaModel {
            name: m.name.clone(),
            model: m.name,
            modified_at: m.modified,
            size: m.size,
            digest: String::new(),
            details: ModelDetails {
                format: "gguf".to_string(),
                ..ModelDetails::default()
            },
        })
        .collect();

    Json(TagsResponse { models }).into_response()
}

pub(crate) async fn chat(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "failed to decode chat request");
            return (StatusCode::BAD_REQUEST, "missing or invalid 'model' key").into_response();
        }
    };
    let Some(model) = request.model.clone() else {
        return (StatusCode::BAD_REQUEST, "missing or invalid 'model' key").into_response();
    };

    let backend = match lock_or_reply(&state, &model).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };
    let lease = Lease::new(state.scheduler.clone(), backend.clone());

    // The backend is always driven in streaming mode; a non-streaming
    // client just gets the deltas accumulated into the final frame.
    let payload = json!({
        "model": &model,
        "messages": oai_messages(&request.messages),
        "stream": true,
    });
    let start = Instant::now();

    if request.stream {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
        tokio::spawn(async move {
            let _lease = lease;
            let pumped = backend
                .with_client(|client| pump_frames(client, model, payload, start, tx))
                .await;
            match pumped {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "chat stream translation failed"),
                Err(e) => error!(error = %e, "chat stream translation failed"),
            }
        });

        ndjson_response(Body::from_stream(ReceiverStream::new(rx)))
    } else {
        let completed = backend
            .with_client(|client| accumulate_frames(client, model, payload, start))
            .await;
        drop(lease);
        let frame = match completed {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                error!(error = %e, "chat translation failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
            Err(e) => {
                error!(error = %e, "chat translation failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };
        match ndjson_line(&frame) {
            Ok(line) => ndjson_response(Body::from(line)),
            Err(e) => {
                error!(error = %e, "failed to encode chat response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn oai_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect()
}

fn ndjson_response(body: Body) -> Response {
    ([(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

fn ndjson_line<T: Serialize>(frame: &T) -> serde_json::Result<Bytes> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn final_frame(
    model: String,
    content: String,
    start: Instant,
    first_token: Option<Instant>,
    eval_count: i64,
) -> ChatFinalResponse {
    let eval_duration = first_token.map(|t| t.elapsed()).unwrap_or_default();
    ChatFinalResponse {
        response: ChatResponse {
            model,
            created_at: now_rfc3339(),
            message: Message::assistant(content),
            done: true,
        },
        total_duration: start.elapsed().as_nanos() as i64,
        load_duration: 0,
        prompt_eval_count: 0,
        prompt_eval_duration: 0,
        eval_count,
        eval_duration: eval_duration.as_nanos() as i64,
    }
}

/// Stream the backend's SSE deltas to the client as one NDJSON frame
/// per token, then the terminal frame. A closed receiver means the
/// client hung up; the backend stream is simply dropped.
async fn pump_frames(
    client: UpstreamClient,
    model: String,
    payload: Value,
    start: Instant,
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
) -> anyhow::Result<()> {
    let response = client
        .post("/v1/chat/completions")
        .json(&payload)
        .send()
        .await?
        .error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut eval_count = 0i64;
    let mut first_token = None;

    while let Some(chunk) = stream.next().await {
        for event in decoder.decode(&chunk?) {
            let Some(content) = delta_content(&event) else {
                continue;
            };
            if first_token.is_none() {
                first_token = Some(Instant::now());
            }
            eval_count += 1;
            let frame = ChatResponse {
                model: model.clone(),
                created_at: now_rfc3339(),
                message: Message::assistant(content),
                done: false,
            };
            if tx.send(Ok(ndjson_line(&frame)?)).await.is_err() {
                return Ok(());
            }
        }
    }

    let frame = final_frame(model, String::new(), start, first_token, eval_count);
    let _ = tx.send(Ok(ndjson_line(&frame)?)).await;
    Ok(())
}

/// Drive the same backend stream but collect the content for a single
/// terminal frame (`stream: false` clients).
async fn accumulate_frames(
    client: UpstreamClient,
    model: String,
    payload: Value,
    start: Instant,
) -> anyhow::Result<ChatFinalResponse> {
    let response = client
        .post("/v1/chat/completions")
        .json(&payload)
        .send()
        .await?
        .error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut content = String::new();
    let mut eval_count = 0i64;
    let mut first_token = None;

    while let Some(chunk) = stream.next().await {
        for event in decoder.decode(&chunk?) {
            let Some(delta) = delta_content(&event) else {
                continue;
            };
            if first_token.is_none() {
                first_token = Some(Instant::now());
            }
            eval_count += 1;
            content.push_str(&delta);
        }
    }

    Ok(final_frame(model, content, start, first_token, eval_count))
}

fn delta_content(event: &Value) -> Option<String> {
    let content = event["choices"][0]["delta"]["content"].as_str()?;
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

/// Line-buffering decoder for `data: {...}` SSE events; `data: [DONE]`
/// and non-data lines are dropped.
#[derive(Default)]
struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                continue;
            }
            if let Ok(event) = serde_json::from_str(data) {
                events.push(event);
            }
        }
        events
    }
}
