use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, put};
use axum::{Json, Router};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::daemon::child::Status;
use crate::daemon::host;
use crate::daemon::discovery;
use crate::daemon::metrics::{self as daemon_metrics, HTTP_DURATION, HTTP_ERRORS, HTTP_REQUESTS};
use crate::daemon::supervisor::Supervisor;

/// Narrow capability surface the control plane drives. The supervisor-backed
/// [`Manager`] is the production implementation; tests inject fakes.
pub trait SvcManager: Send + Sync {
    /// Full reload: hangup the daemon itself.
    fn restart(&self) -> anyhow::Result<()>;
    /// Hangup each live child; the daemon itself is untouched.
    fn reload(&self) -> anyhow::Result<()>;
    /// `port command` per running child plus an `All N, List M` summary.
    fn list(&self) -> anyhow::Result<String>;
    /// External config-update hook.
    fn update(&self) -> anyhow::Result<()>;
    /// Terminate the daemon.
    fn stop(&self) -> anyhow::Result<()>;
    fn health(&self) -> bool;
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SvcManagerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl SvcManagerResponse {
    fn ok() -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                v: Some("ok".to_string()),
                err: None,
            }),
        )
    }

    fn err(e: impl std::fmt::Display) -> (StatusCode, Json<Self>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self {
                v: None,
                err: Some(e.to_string()),
            }),
        )
    }
}

/// Supervisor-backed control-plane implementation.
pub struct Manager {
    supervisor: Arc<Supervisor>,
}

impl Manager {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

impl SvcManager for Manager {
    fn restart(&self) -> anyhow::Result<()> {
        signal::kill(nix::unistd::getpid(), Signal::SIGHUP).context("hangup self")
    }

    fn reload(&self) -> anyhow::Result<()> {
        let children = self.supervisor.children();
        anyhow::ensure!(!children.is_empty(), "no child processes");
        let mut errs = Vec::new();
        for child in children {
            if child.status() == Status::Exited {
                continue;
            }
            let Some(pid) = child.pid() else { continue };
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                errs.push(format!("cmd: {} pid: {pid} kill failed: {e}", child.command_line()));
            }
        }
        anyhow::ensure!(errs.is_empty(), "{}", errs.join("; "));
        Ok(())
    }

    fn list(&self) -> anyhow::Result<String> {
        let children = self.supervisor.children();
        let sockets = host::listening_sockets().context("listening sockets")?;
        let mut body = String::new();
        let mut listed = 0usize;
        for child in &children {
            if child.status() != Status::Running {
                continue;
            }
            let Some(pid) = child.pid() else { continue };
            let Some(addr) = sockets.get(&pid) else { continue };
            body.push_str(host::parse_port(addr));
            body.push(' ');
            body.push_str(&child.command_line());
            body.push('\n');
            listed += 1;
        }
        body.push_str(&format!("All {}, List {}", children.len(), listed));
        Ok(body)
    }

    fn update(&self) -> anyhow::Result<()> {
        git_pull()
    }

    fn stop(&self) -> anyhow::Result<()> {
        signal::kill(nix::unistd::getpid(), Signal::SIGTERM).context("terminate self")
    }

    fn health(&self) -> bool {
        true
    }
}

/// `git pull` of the config repo, with SSH_ASKPASS stripped so a headless
/// daemon never blocks on a password prompt.
fn git_pull() -> anyhow::Result<()> {
    let checkout = std::process::Command::new("git")
        .args(["checkout", "master"])
        .status()
        .context("run git checkout")?;
    anyhow::ensure!(checkout.success(), "git checkout exited with {checkout}");

    let mut cmd = std::process::Command::new("git");
    cmd.args(["pull", "origin", "master"]).env_remove("SSH_ASKPASS");
    let pull = cmd.status().context("run git pull")?;
    anyhow::ensure!(pull.success(), "git pull exited with {pull}");
    Ok(())
}

#[derive(Clone)]
pub struct WebState {
    pub manager: Arc<dyn SvcManager>,
    pub supervisor: Arc<Supervisor>,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/restart", put(restart))
        .route("/reload", put(reload))
        .route("/update", put(update))
        .route("/stop", put(stop))
        .route("/list", get(list).put(list))
        .route("/discovery", get(http_sd))
        .route("/metrics", get(exposition))
        .route("/health", any(health))
        .layer(middleware::from_fn(track_requests))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Bind the control plane port. A bind failure here is a fatal startup error.
pub async fn bind(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control plane on {addr}"))
}

/// Serve the control plane until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: WebState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "control plane listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("control plane server")
}

/// Run the update hook when `?update` is present. `Ok(None)` means proceed;
/// `Ok(Some(resp))` is the error response to return without side effects.
async fn maybe_update(
    state: &WebState,
    query: &HashMap<String, String>,
) -> Option<(StatusCode, Json<SvcManagerResponse>)> {
    if !query.contains_key("update") {
        return None;
    }
    let mgr = Arc::clone(&state.manager);
    let res = tokio::task::spawn_blocking(move || mgr.update()).await;
    match res {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(SvcManagerResponse::err(format!("update failed: {e}"))),
        Err(e) => Some(SvcManagerResponse::err(format!("update failed: {e}"))),
    }
}

async fn restart(
    State(state): State<WebState>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Some(resp) = maybe_update(&state, &query).await {
        return resp;
    }
    match state.manager.restart() {
        Ok(()) => SvcManagerResponse::ok(),
        Err(e) => SvcManagerResponse::err(e),
    }
}

async fn reload(
    State(state): State<WebState>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Some(resp) = maybe_update(&state, &query).await {
        return resp;
    }
    match state.manager.reload() {
        Ok(()) => SvcManagerResponse::ok(),
        Err(e) => SvcManagerResponse::err(e),
    }
}

async fn update(State(state): State<WebState>) -> impl IntoResponse {
    let mgr = Arc::clone(&state.manager);
    match tokio::task::spawn_blocking(move || mgr.update()).await {
        Ok(Ok(())) => SvcManagerResponse::ok(),
        Ok(Err(e)) => SvcManagerResponse::err(e),
        Err(e) => SvcManagerResponse::err(e),
    }
}

async fn stop(State(state): State<WebState>) -> impl IntoResponse {
    match state.manager.stop() {
        Ok(()) => SvcManagerResponse::ok(),
        Err(e) => SvcManagerResponse::err(e),
    }
}

async fn list(State(state): State<WebState>) -> Response {
    let mgr = Arc::clone(&state.manager);
    match tokio::task::spawn_blocking(move || mgr.list()).await {
        Ok(Ok(body)) => body.into_response(),
        Ok(Err(e)) => SvcManagerResponse::err(e).into_response(),
        Err(e) => SvcManagerResponse::err(e).into_response(),
    }
}

async fn http_sd(State(state): State<WebState>) -> Json<Vec<discovery::TargetGroup>> {
    Json(discovery::http_sd(&state.supervisor))
}

async fn exposition(State(state): State<WebState>) -> String {
    daemon_metrics::render(&state.supervisor)
}

async fn health(State(state): State<WebState>) -> Response {
    if state.manager.health() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "unhealthy").into_response()
    }
}

async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors_headers(resp.headers_mut());
    resp
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,AccessToken,X-CSRF-Token, Authorization, Token"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS, PUT, DELETE"),
    );
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();
    let started = Instant::now();

    let resp = next.run(req).await;

    let status = resp.status().as_u16().to_string();
    let labels = [
        ("method", method),
        ("endpoint", endpoint),
        ("status", status),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_DURATION, &labels).record(started.elapsed().as_secs_f64());
    if resp.status().is_server_error() || resp.status().is_client_error() {
        metrics::counter!(HTTP_ERRORS, &labels).increment(1);
    }
    resp
}
