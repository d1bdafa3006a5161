//! Shared helpers for scheduler and endpoint tests: a stub serving tool
//! backed by a shell script, and a local HTTP server standing in for the
//! child's OpenAI-compatible surface.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tempfile::TempDir;

use crate::ramalama::Ramalama;

/// Models the stub tool reports from `list --json`.
pub(crate) const STUB_LIST_JSON: &str = r#"[
  {"Name":"a","Modified":"2024-01-01T00:00:00Z","Size":1},
  {"Name":"b","Modified":"2024-02-02T00:00:00Z","Size":2},
  {"Name":"org/model","Modified":"2024-03-03T00:00:00Z","Size":3}
]"#;

/// Write a stub serving-tool script. Every invocation appends its argv
/// to `<script>.log`; `list` prints the fixed model list; `serve` runs
/// `serve_body`, which defaults to parking until SIGINT/SIGTERM.
pub(crate) fn stub_tool(serve_body: Option<&str>) -> (TempDir, Ramalama) {
    let serve_body = serve_body.unwrap_or(
        "trap 'exit 0' INT TERM\nwhile :; do sleep 0.05; done",
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stub-ramalama");

    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        "#!/bin/sh\n\
         echo \"$@\" >> \"$0.log\"\n\
         if [ \"$1\" = list ]; then\n\
           cat <<'EOF'\n{STUB_LIST_JSON}\nEOF\n\
           exit 0\n\
         fi\n\
         {serve_body}\n",
    )
    .unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let tool = Ramalama {
        command: vec![path.to_string_lossy().into_owned()],
    };
    (dir, tool)
}

/// Argv lines of `serve` invocations recorded by the stub script.
pub(crate) fn serve_invocations(tool: &Ramalama) -> Vec<String> {
    let log = format!("{}.log", tool.command[0]);
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter(|line| line.starts_with("serve "))
        .map(str::to_string)
        .collect()
}

/// Serve the given router on an OS-assigned loopback port.
pub(crate) async fn serve_router(app: Router) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (port, handle)
}

/// A minimal stand-in for the serving tool's HTTP side: answers the
/// readiness probe with 200.
pub(crate) async fn health_server() -> (u16, tokio::task::JoinHandle<()>) {
    serve_router(Router::new().route("/health", get(|| async { StatusCode::OK }))).await
}
