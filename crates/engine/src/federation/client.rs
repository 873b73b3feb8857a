//! Outgoing delegations: peer delivery with retries, local mirroring,
//! and completion watching.
//!
//! One idempotency key is minted per submission and reused for every
//! retry against every peer, so a peer that accepted a request the
//! origin never saw the response to will answer the retry with the same
//! run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use sb_domain::config::{FederationConfig, PeerConfig};
use sb_domain::error::{Error, Result};
use sb_domain::message::{OutboundMessage, SOURCE_FEDERATION};
use sb_store::{DeliveryAttempt, FederationRun};

use crate::federation::routing::{self, RoutingRequest};
use crate::federation::{DelegationRequest, HEADER_IDEMPOTENCY_KEY, HEADER_NODE_ID};
use crate::state::Shared;

/// Consecutive poll failures tolerated before a watcher gives up.
const MAX_POLL_FAILURES: u32 = 5;

/// A delegation plus the client-side routing and notification fields.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub request: DelegationRequest,
    pub required_capabilities: Vec<String>,
    pub preferred_roles: Vec<String>,
    pub preferred_peer_id: Option<String>,
    /// Block until the remote run is terminal instead of watching in the
    /// background.
    pub wait: bool,
    /// Originating session, used for the completion notification.
    pub session_id: String,
    pub channel: String,
    pub chat_id: String,
}

pub struct FederationClient {
    shared: Arc<Shared>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl FederationClient {
    pub fn new(shared: Arc<Shared>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            shared,
            http,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn config(&self) -> &FederationConfig {
        &self.shared.config.runtime.federation
    }

    // ── Delegation ───────────────────────────────────────────────────

    /// Route, deliver, and mirror a delegation. With `wait` the returned
    /// run is terminal; otherwise it is the freshly accepted run and a
    /// background watcher follows it.
    pub async fn delegate(self: &Arc<Self>, opts: SpawnOptions) -> Result<FederationRun> {
        let config = self.config();
        if !config.enabled {
            return Err(Error::InvalidRequest("federation is disabled".into()));
        }
        if opts.request.task.trim().is_empty() {
            return Err(Error::InvalidRequest("task must not be empty".into()));
        }

        let idempotency_key = self.shared.ids.next();
        let (candidates, decision) = routing::select_candidates(
            &config.peers,
            &RoutingRequest {
                required_capabilities: &opts.required_capabilities,
                preferred_roles: &opts.preferred_roles,
                preferred_peer_id: opts.preferred_peer_id.as_deref(),
            },
        );
        if candidates.is_empty() {
            return Err(Error::InvalidRequest(decision.reason));
        }
        tracing::debug!(
            candidates = ?decision.candidate_peer_ids,
            "routing decision made"
        );

        let mut attempts: Vec<DeliveryAttempt> = Vec::new();
        let mut last_error = None;

        for peer in &candidates {
            for attempt in 1..=config.max_retries + 1 {
                let started_at = Utc::now();
                let outcome = self
                    .post_delegation(peer, &opts.request, &idempotency_key)
                    .await;
                let finished_at = Utc::now();

                match outcome {
                    Ok(remote) => {
                        attempts.push(DeliveryAttempt {
                            peer_id: peer.id.clone(),
                            attempt,
                            status_code: Some(200),
                            error: None,
                            retryable: false,
                            started_at,
                            finished_at,
                        });

                        let mut local = remote;
                        local.peer_id = Some(peer.id.clone());
                        local.route_decision = Some(decision.clone());
                        local.delivery_attempts = attempts;
                        self.shared.store.federation.insert(local.clone());
                        tracing::info!(run_id = %local.id, peer = %peer.id, "delegation accepted");

                        if opts.wait {
                            return self.poll_until_terminal(peer.clone(), local.id).await;
                        }
                        self.spawn_watcher(peer.clone(), local.id.clone(), opts.clone());
                        return Ok(local);
                    }
                    Err(e) => {
                        let retryable = e.is_retryable_request();
                        let status_code = match &e {
                            Error::PeerRequest { status, .. } => *status,
                            _ => None,
                        };
                        tracing::warn!(
                            peer = %peer.id,
                            attempt,
                            retryable,
                            error = %e,
                            "delegation delivery failed"
                        );
                        attempts.push(DeliveryAttempt {
                            peer_id: peer.id.clone(),
                            attempt,
                            status_code,
                            error: Some(e.to_string()),
                            retryable,
                            started_at,
                            finished_at,
                        });
                        last_error = Some(e);
                        if !retryable {
                            break;
                        }
                    }
                }
            }
            if !config.fallback_enabled {
                break;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("delegation delivery failed".into())))
    }

    /// Cancel a delegated run on its peer and mirror the outcome.
    pub async fn cancel(&self, run_id: &str) -> Result<FederationRun> {
        let local = self
            .shared
            .store
            .federation
            .get(run_id)
            .ok_or_else(|| Error::NotFound(format!("federation run {run_id}")))?;
        let peer_id = local
            .peer_id
            .clone()
            .ok_or_else(|| Error::InvalidRequest("run has no assigned peer".into()))?;
        let peer = self
            .config()
            .peers
            .iter()
            .find(|p| p.id == peer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))?;

        let remote = self
            .request_run(
                self.http
                    .post(self.peer_url(&peer, &format!("/api/federation/delegations/{run_id}/cancel"))),
                &peer,
            )
            .await?;
        self.mirror(&remote);
        Ok(remote)
    }

    pub async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("federation watchers outlived grace period");
        }
    }

    // ── HTTP plumbing ────────────────────────────────────────────────

    fn peer_url(&self, peer: &PeerConfig, path: &str) -> String {
        format!("{}{path}", peer.base_url.trim_end_matches('/'))
    }

    async fn post_delegation(
        &self,
        peer: &PeerConfig,
        request: &DelegationRequest,
        idempotency_key: &str,
    ) -> Result<FederationRun> {
        let builder = self
            .http
            .post(self.peer_url(peer, "/api/federation/delegations"))
            .header(HEADER_IDEMPOTENCY_KEY, idempotency_key)
            .json(request);
        self.request_run(builder, peer).await
    }

    async fn fetch_status(&self, peer: &PeerConfig, run_id: &str) -> Result<FederationRun> {
        let builder = self
            .http
            .get(self.peer_url(peer, &format!("/api/federation/delegations/{run_id}")));
        self.request_run(builder, peer).await
    }

    async fn fetch_result(&self, peer: &PeerConfig, run_id: &str) -> Result<FederationRun> {
        let builder = self.http.get(
            self.peer_url(peer, &format!("/api/federation/delegations/{run_id}/result")),
        );
        self.request_run(builder, peer).await
    }

    /// Attach auth headers, send, and map the response to a run.
    async fn request_run(
        &self,
        builder: reqwest::RequestBuilder,
        peer: &PeerConfig,
    ) -> Result<FederationRun> {
        let response = builder
            .bearer_auth(&peer.auth_token)
            .header(HEADER_NODE_ID, &self.config().node_id)
            .send()
            .await
            .map_err(|e| Error::PeerRequest {
                peer: peer.id.clone(),
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PeerRequest {
                peer: peer.id.clone(),
                status: Some(status.as_u16()),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            });
        }

        response
            .json::<FederationRun>()
            .await
            .map_err(|e| Error::PeerRequest {
                peer: peer.id.clone(),
                status: None,
                message: format!("invalid run payload: {e}"),
            })
    }

    // ── Mirroring ────────────────────────────────────────────────────

    /// Copy remote progress onto the local record. Once the local record
    /// is terminal the store rejects further writes.
    fn mirror(&self, remote: &FederationRun) {
        self.shared.store.federation.update(&remote.id, |local| {
            local.status = remote.status;
            local.result = remote.result.clone();
            local.error = remote.error.clone();
            local.usage_tokens = remote.usage_tokens;
            local.started_at = remote.started_at;
            local.finished_at = remote.finished_at;
        });
    }

    async fn poll_until_terminal(
        &self,
        peer: PeerConfig,
        run_id: String,
    ) -> Result<FederationRun> {
        let interval = Duration::from_millis(self.config().poll_interval_ms.max(50));
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(Error::Other("federation client stopping".into()));
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let remote = match self.fetch_status(&peer, &run_id).await {
                Ok(remote) => {
                    failures = 0;
                    remote
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(run_id, failures, error = %e, "status poll failed");
                    if failures >= MAX_POLL_FAILURES {
                        return Err(e);
                    }
                    continue;
                }
            };
            self.mirror(&remote);

            if remote.status.is_terminal() {
                let settled = if remote.status == sb_store::RunStatus::Succeeded
                    && remote.result.is_none()
                {
                    match self.fetch_result(&peer, &run_id).await {
                        Ok(full) => {
                            self.mirror(&full);
                            full
                        }
                        Err(e) => {
                            tracing::warn!(run_id, error = %e, "result fetch failed");
                            remote
                        }
                    }
                } else {
                    remote
                };
                return Ok(self
                    .shared
                    .store
                    .federation
                    .get(&run_id)
                    .unwrap_or(settled));
            }
        }
    }

    /// Background completion watcher: poll until terminal, bump the
    /// federation/peer usage counters, and announce the outcome.
    fn spawn_watcher(self: &Arc<Self>, peer: PeerConfig, run_id: String, opts: SpawnOptions) {
        let client = self.clone();
        let span = tracing::info_span!("federation_watch", run_id = %run_id, peer = %peer.id);
        self.tracker.spawn(
            async move {
                let run = match client.poll_until_terminal(peer.clone(), run_id.clone()).await {
                    Ok(run) => run,
                    Err(e) => {
                        tracing::warn!(error = %e, "federation watcher gave up");
                        return;
                    }
                };

                client
                    .shared
                    .store
                    .budget
                    .add_usage(&format!("federation:{run_id}"), run.usage_tokens);
                client
                    .shared
                    .store
                    .budget
                    .add_usage(&format!("peer:{}", peer.id), run.usage_tokens);

                let detail = run
                    .result
                    .as_ref()
                    .map(|r| r.summary.clone())
                    .or_else(|| run.error.clone())
                    .unwrap_or_default();
                let name = run.label.clone().unwrap_or_else(|| run.id.clone());
                let text = format!(
                    "Federated task {name} {} on peer {}: {detail}",
                    run.status.as_str(),
                    peer.id
                );
                client.shared.outbound.send(
                    OutboundMessage::reply(&opts.channel, &opts.chat_id, text, &opts.session_id)
                        .with_completion(SOURCE_FEDERATION, &run.id, run.status.as_str()),
                );
            }
            .instrument(span),
        );
    }
}
