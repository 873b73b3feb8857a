//! Federation server: accept delegations idempotently and run them on
//! the local task machinery.
//!
//! Every request must carry both the origin node id header and a bearer
//! token matching an enabled peer; tokens are compared as SHA-256
//! digests in constant time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use sb_domain::config::FederationConfig;
use sb_domain::error::{Error, Result};
use sb_store::subagents::SubagentResult;
use sb_store::{FederationRun, IdempotencyOutcome, RunStatus};
use sb_tools::ToolContext;

use crate::federation::{DelegationRequest, HealthStatus, HEADER_IDEMPOTENCY_KEY, HEADER_NODE_ID};
use crate::state::Shared;
use crate::subagents::task::{self, TaskSpec};
use crate::subagents::SubagentPool;
use crate::tools_builtin;

#[derive(Clone)]
pub struct FederationServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    shared: Arc<Shared>,
    pool: Arc<SubagentPool>,
    /// node id → SHA-256 digest of the peer's bearer token, computed once.
    peer_token_hashes: HashMap<String, Vec<u8>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl FederationServer {
    pub fn new(shared: Arc<Shared>, pool: Arc<SubagentPool>) -> Self {
        let peer_token_hashes = shared
            .config
            .runtime
            .federation
            .peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| (p.id.clone(), Sha256::digest(p.auth_token.as_bytes()).to_vec()))
            .collect();

        Self {
            inner: Arc::new(ServerInner {
                shared,
                pool,
                peer_token_hashes,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn config(&self) -> &FederationConfig {
        &self.inner.shared.config.runtime.federation
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/federation/delegations", post(submit))
            .route("/api/federation/delegations/:id", get(status_handler))
            .route("/api/federation/delegations/:id/result", get(result_handler))
            .route("/api/federation/delegations/:id/cancel", post(cancel_handler))
            .route("/api/federation/health", get(health_handler))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                require_peer_auth,
            ))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind and serve in the background; returns the bound address.
    pub async fn bind(&self, addr: &str) -> Result<std::net::SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;
        let local_addr = listener.local_addr().map_err(Error::Io)?;
        let router = self.router();
        let shutdown = self.inner.shutdown.clone();

        self.inner.tracker.spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "federation server exited");
            }
        });
        tracing::info!(%local_addr, "federation server listening");
        Ok(local_addr)
    }

    pub async fn stop(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("federation executors outlived grace period");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn require_peer_auth(
    State(server): State<FederationServer>,
    req: Request,
    next: Next,
) -> Response {
    let headers = req.headers();

    let Some(node_id) = headers.get(HEADER_NODE_ID).and_then(|v| v.to_str().ok()) else {
        return api_error(StatusCode::UNAUTHORIZED, "missing node id header");
    };

    let allowlist = &server.config().allow_from_node_ids;
    if !allowlist.is_empty() && !allowlist.iter().any(|id| id == node_id) {
        return api_error(StatusCode::FORBIDDEN, "origin node is not allowed");
    }

    let Some(expected_hash) = server.inner.peer_token_hashes.get(node_id) else {
        return api_error(StatusCode::FORBIDDEN, "unknown origin node");
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return api_error(StatusCode::UNAUTHORIZED, "invalid peer token");
    }

    next.run(req).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/federation/delegations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn submit(
    State(server): State<FederationServer>,
    headers: HeaderMap,
    Json(request): Json<DelegationRequest>,
) -> Response {
    if request.task.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "task must not be empty");
    }

    // Present and verified by the auth middleware.
    let origin = headers
        .get(HEADER_NODE_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let idempotency_key = headers
        .get(HEADER_IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let shared = &server.inner.shared;
    let config = server.config();
    let timeout_sec = if request.timeout_sec == 0 {
        config.default_timeout_sec
    } else {
        request.timeout_sec
    };
    let make_run = || FederationRun {
        id: shared.ids.next(),
        origin_node_id: origin.clone(),
        idempotency_key: idempotency_key.clone(),
        status: RunStatus::Queued,
        task: request.task.clone(),
        label: request.label.clone(),
        peer_id: None,
        delivery_attempts: Vec::new(),
        route_decision: None,
        timeout_sec,
        max_attempts: request.max_attempts.max(1),
        context: request.context.clone(),
        result: None,
        error: None,
        usage_tokens: 0,
        created_at: chrono::Utc::now(),
        started_at: None,
        finished_at: None,
    };

    let run = if idempotency_key.is_empty() {
        let run = make_run();
        shared.store.federation.insert(run.clone());
        run
    } else {
        let (run, outcome) =
            shared
                .store
                .federation
                .resolve_or_insert(&origin, &idempotency_key, make_run);
        if outcome == IdempotencyOutcome::Hit {
            shared.counters.idempotency_hit();
            tracing::debug!(run_id = %run.id, origin = %origin, "idempotency hit");
            return Json(run).into_response();
        }
        run
    };

    shared
        .store
        .federation
        .append_event(&run.id, "queued", &format!("delegation accepted from {origin}"));

    let executor = server.clone();
    let run_id = run.id.clone();
    let span = tracing::info_span!("federation_run", run_id = %run_id, origin = %origin);
    server
        .inner
        .tracker
        .spawn(async move { execute_delegation(executor, run_id).await }.instrument(span));

    Json(run).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read / cancel / health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn status_handler(
    State(server): State<FederationServer>,
    Path(id): Path<String>,
) -> Response {
    match server.inner.shared.store.federation.get(&id) {
        Some(run) => Json(run).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("unknown run {id}")),
    }
}

async fn result_handler(
    State(server): State<FederationServer>,
    Path(id): Path<String>,
) -> Response {
    match server.inner.shared.store.federation.get(&id) {
        Some(run) if run.status.is_terminal() => Json(run).into_response(),
        Some(_) => api_error(StatusCode::BAD_REQUEST, format!("run {id} is not terminal")),
        None => api_error(StatusCode::NOT_FOUND, format!("unknown run {id}")),
    }
}

async fn cancel_handler(
    State(server): State<FederationServer>,
    Path(id): Path<String>,
) -> Response {
    let shared = &server.inner.shared;
    let Some(run) = shared.store.federation.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, format!("unknown run {id}"));
    };

    if !run.status.is_terminal() {
        shared
            .store
            .federation
            .update(&id, |r| r.finish(RunStatus::Cancelled));
        shared
            .store
            .federation
            .append_event(&id, "cancelled", "cancel requested");
        shared.cancel.cancel(&id);
    }

    match shared.store.federation.get(&id) {
        Some(run) => Json(run).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("unknown run {id}")),
    }
}

async fn health_handler(State(server): State<FederationServer>) -> Json<HealthStatus> {
    let shared = &server.inner.shared;
    let pool = &server.inner.pool;
    // Delegations run on the local subagent machinery, so the health view
    // covers both queues.
    let queue_depth =
        shared.store.federation.count_in_status(RunStatus::Queued) + pool.queued_runs();
    let active_runs =
        shared.store.federation.count_in_status(RunStatus::Running) + pool.active_runs();
    let config = server.config();
    Json(HealthStatus {
        peer_id: config.node_id.clone(),
        available: queue_depth < config.max_queue,
        queue_depth,
        max_queue: config.max_queue,
        active_runs,
        updated_at: chrono::Utc::now(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum AttemptEnd {
    Succeeded(String),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

/// Run an accepted delegation on the local task machinery, mirroring the
/// subagent worker protocol (retries, classification, cancellation).
async fn execute_delegation(server: FederationServer, run_id: String) {
    let shared = &server.inner.shared;
    let Some(run) = shared.store.federation.get(&run_id) else {
        return;
    };
    if run.status.is_terminal() {
        return;
    }

    let backoff = Duration::from_secs(shared.config.runtime.subagents.retry_backoff_sec);
    let scope = format!("federation:{run_id}");

    for attempt in 1..=run.max_attempts {
        if shared
            .store
            .federation
            .get(&run_id)
            .map_or(true, |r| r.status.is_terminal())
        {
            // Cancelled between attempts.
            return;
        }

        shared.store.federation.update(&run_id, |r| {
            r.status = RunStatus::Running;
            r.started_at = Some(chrono::Utc::now());
        });
        shared.store.federation.append_event(
            &run_id,
            "running",
            &format!("attempt {attempt} of {}", run.max_attempts),
        );

        let token = shared.cancel.register(&run_id);
        let registry = tools_builtin::build_task_registry(
            shared,
            &server.inner.pool,
            ToolContext {
                channel: "federation".into(),
                chat_id: run.origin_node_id.clone(),
                session_id: scope.clone(),
                sender_id: run.origin_node_id.clone(),
                subagent_depth: 1,
                allow_writes: shared.config.runtime.subagents.allow_writes,
            },
        );
        let spec = TaskSpec {
            run_id: &run_id,
            session_id: &scope,
            scope: scope.clone(),
            task: &run.task,
            context: &run.context,
            deadline: Instant::now() + Duration::from_secs(run.timeout_sec),
        };

        let end = tokio::select! {
            _ = server.inner.shutdown.cancelled() => AttemptEnd::Cancelled,
            _ = token.cancelled() => AttemptEnd::Cancelled,
            outcome = task::execute_task(shared, &registry, spec) => match outcome {
                Ok(output) => AttemptEnd::Succeeded(output),
                Err(Error::Timeout(msg)) => AttemptEnd::TimedOut(msg),
                Err(e) => AttemptEnd::Failed(e.to_string()),
            },
        };
        shared.cancel.remove(&run_id);

        match end {
            AttemptEnd::Succeeded(output) => {
                let usage_tokens = shared.store.budget.counter(&scope).total_tokens;
                let summary = task::summarize(&output);
                shared.store.federation.update(&run_id, |r| {
                    r.result = Some(SubagentResult {
                        summary: summary.clone(),
                        output: output.clone(),
                        artifact_paths: Vec::new(),
                    });
                    r.usage_tokens = usage_tokens;
                    r.finish(RunStatus::Succeeded);
                });
                shared
                    .store
                    .federation
                    .append_event(&run_id, "succeeded", &summary);
                return;
            }
            AttemptEnd::Cancelled => {
                // The cancel endpoint usually wrote the terminal state
                // already; the shutdown path writes it here.
                let still_open = shared
                    .store
                    .federation
                    .get(&run_id)
                    .is_some_and(|r| !r.status.is_terminal());
                if still_open {
                    shared
                        .store
                        .federation
                        .update(&run_id, |r| r.finish(RunStatus::Cancelled));
                    shared
                        .store
                        .federation
                        .append_event(&run_id, "cancelled", "run cancelled");
                }
                return;
            }
            AttemptEnd::Failed(message) | AttemptEnd::TimedOut(message)
                if attempt < run.max_attempts =>
            {
                shared.store.federation.append_event(
                    &run_id,
                    "retrying",
                    &format!("attempt {attempt} failed ({message}); backoff {}s", backoff.as_secs()),
                );
                tokio::select! {
                    _ = server.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            AttemptEnd::Failed(message) => {
                finish_failed(shared, &run_id, RunStatus::Failed, &message);
                return;
            }
            AttemptEnd::TimedOut(message) => {
                finish_failed(shared, &run_id, RunStatus::TimedOut, &message);
                return;
            }
        }
    }
}

fn finish_failed(shared: &Shared, run_id: &str, status: RunStatus, message: &str) {
    shared.store.federation.update(run_id, |r| {
        r.error = Some(message.to_owned());
        r.finish(status);
    });
    shared
        .store
        .federation
        .append_event(run_id, status.as_str(), message);
}
