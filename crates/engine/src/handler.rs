//! Turn execution: one inbound message becomes one LLM tool loop.
//!
//! The handler is the payload of a session actor: at most one turn per
//! session runs at a time. A turn loads recent history, loops the
//! provider with tool dispatch under the budget guard, persists the user
//! and assistant turns, emits the outbound reply, appends the daily log
//! entry, and checkpoints the session. Persistence failures never block
//! the reply path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use sb_domain::error::{Error, LimitError, Result};
use sb_domain::message::{InboundMessage, OutboundMessage, CLI_CHANNEL};
use sb_domain::tool::{Message, Role};
use sb_providers::ChatRequest;
use sb_store::{DailyLogEntry, ToolEvent, Turn};
use sb_tools::ToolContext;

use crate::actor::{ActorHandler, ActorPayload};
use crate::budget::SoftWarning;
use crate::federation::FederationClient;
use crate::state::Shared;
use crate::subagents::SubagentPool;
use crate::tools_builtin;

/// Substituted when a turn produces no assistant text.
pub const NO_RESPONSE: &str = "(no response)";

pub struct SessionHandler {
    session_id: String,
    shared: Arc<Shared>,
    pool: Arc<SubagentPool>,
    federation: Option<Arc<FederationClient>>,
    /// Loaded from the checkpoint on spawn; suppresses replayed requests.
    last_request_id: Option<String>,
}

impl SessionHandler {
    pub fn new(
        session_id: String,
        shared: Arc<Shared>,
        pool: Arc<SubagentPool>,
        federation: Option<Arc<FederationClient>>,
    ) -> Self {
        let last_request_id = shared
            .store
            .sessions
            .checkpoint(&session_id)
            .map(|cp| cp.last_request_id);
        Self {
            session_id,
            shared,
            pool,
            federation,
            last_request_id,
        }
    }
}

#[async_trait::async_trait]
impl ActorHandler for SessionHandler {
    async fn handle(
        &mut self,
        payload: ActorPayload,
        shutdown: &CancellationToken,
    ) -> Result<String> {
        let ActorPayload::ProcessMessage(msg) = payload;
        let span = tracing::info_span!(
            "turn",
            session_id = %self.session_id,
            request_id = %msg.request_id,
            channel = %msg.channel,
        );
        self.process(msg, shutdown).instrument(span).await
    }
}

impl SessionHandler {
    async fn process(
        &mut self,
        msg: InboundMessage,
        shutdown: &CancellationToken,
    ) -> Result<String> {
        if shutdown.is_cancelled() {
            return Err(Error::Other("engine is stopping".into()));
        }

        // A submission replaying the checkpointed request id has already
        // been handled; answer with the persisted reply instead of
        // executing the turn again.
        if !msg.request_id.is_empty()
            && self.last_request_id.as_deref() == Some(msg.request_id.as_str())
        {
            tracing::debug!(request_id = %msg.request_id, "duplicate submission suppressed");
            let last_reply = self
                .shared
                .store
                .turns
                .window(&self.session_id, 2)
                .into_iter()
                .rev()
                .find(|t| t.role == Role::Assistant)
                .map(|t| t.content);
            return Ok(last_reply.unwrap_or_else(|| NO_RESPONSE.to_owned()));
        }
        tracing::debug!("turn started");

        let shared = self.shared.clone();
        let defaults = &shared.config.agents.defaults;
        let deadline = Instant::now() + Duration::from_secs(defaults.turn_timeout_sec);

        // ── Phase 1: context ─────────────────────────────────────────
        let history = shared
            .store
            .turns
            .window(&self.session_id, defaults.clamped_history_window());
        let system_prompt = shared.system_prompt.as_ref()(&msg);

        let tool_ctx = ToolContext {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            session_id: self.session_id.clone(),
            sender_id: msg.sender_id.clone(),
            subagent_depth: msg.subagent_depth(),
            allow_writes: shared.config.runtime.subagents.allow_writes,
        };
        let registry = tools_builtin::build_registry(
            &shared,
            &self.pool,
            self.federation.as_ref(),
            tool_ctx,
        );
        let tool_defs = registry.definitions();

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(&system_prompt));
        messages.extend(history.iter().map(turn_to_message));
        messages.push(Message::user(&msg.content));

        // Scope keys this turn charges against.
        let mut scopes = vec!["global".to_owned(), format!("session:{}", self.session_id)];
        if let Some(run_id) = msg.subagent_run_id() {
            scopes.push(format!("subagent:{run_id}"));
        }
        let planned = defaults.max_tokens as u64;

        // ── Phase 2: tool loop ───────────────────────────────────────
        let mut final_content = String::new();
        let mut warnings: Vec<SoftWarning> = Vec::new();

        for iteration in 0..defaults.max_tool_iterations {
            tracing::debug!(iteration, "tool loop iteration");

            let reservation = match shared.budget.preflight(&scopes, planned) {
                Ok(reservation) => reservation,
                Err(limit) => {
                    final_content = blocked_message(&limit);
                    break;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                shared.budget.abort(&reservation);
                return Err(Error::Timeout("turn deadline exceeded".into()));
            }

            let request = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                model: defaults.model.clone(),
                max_tokens: Some(defaults.max_tokens),
                temperature: defaults.temperature,
            };

            let response = tokio::select! {
                _ = shutdown.cancelled() => {
                    shared.budget.abort(&reservation);
                    return Err(Error::Other("engine is stopping".into()));
                }
                outcome = tokio::time::timeout(remaining, shared.provider.chat(request)) => {
                    match outcome {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => {
                            shared.budget.abort(&reservation);
                            shared.counters.provider_error();
                            return Err(e);
                        }
                        Err(_) => {
                            shared.budget.abort(&reservation);
                            shared.counters.provider_error();
                            return Err(Error::Timeout("provider call exceeded turn deadline".into()));
                        }
                    }
                }
            };

            let outcome =
                shared
                    .budget
                    .commit(&reservation, response.usage, response.content.len());
            merge_warnings(&mut warnings, outcome.warnings);
            shared.store.daily.record_usage(outcome.total_tokens);

            if response.tool_calls.is_empty() {
                final_content = response.content;
                break;
            }

            // Tool dispatch: sequential, each under its own timeout capped
            // by the remaining turn time.
            messages.push(Message::assistant_with_calls(
                &response.content,
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let tool_timeout =
                    Duration::from_secs(defaults.tool_timeout_sec).min(remaining.max(Duration::from_millis(1)));

                let (output, is_error) = registry
                    .dispatch(&call.tool_name, call.arguments.clone(), tool_timeout)
                    .await;
                if is_error {
                    tracing::debug!(tool = %call.tool_name, "tool returned an error; continuing loop");
                }

                shared.store.tool_events.append(&ToolEvent {
                    id: shared.ids.next(),
                    session_id: self.session_id.clone(),
                    tool_name: call.tool_name.clone(),
                    input: call.arguments.clone(),
                    output: output.clone(),
                    created_at: chrono::Utc::now(),
                });
                messages.push(Message::tool_result(&call.call_id, &output));
            }
        }

        // ── Phase 3: finalize ────────────────────────────────────────
        if final_content.is_empty() {
            final_content = NO_RESPONSE.to_owned();
        }
        if !warnings.is_empty() {
            final_content.push_str(&warning_footer(&warnings));
        }

        let mut user_turn = Turn::new(
            shared.ids.next(),
            &self.session_id,
            Role::User,
            &msg.content,
        );
        user_turn.created_at = msg.created_at.unwrap_or_else(chrono::Utc::now);
        shared.store.turns.append(&user_turn);
        shared.store.turns.append(&Turn::new(
            shared.ids.next(),
            &self.session_id,
            Role::Assistant,
            &final_content,
        ));
        shared
            .store
            .sessions
            .save_meta(&self.session_id, &msg.channel, &msg.chat_id);

        if msg.channel != CLI_CHANNEL {
            shared.outbound.send(OutboundMessage::reply(
                &msg.channel,
                &msg.chat_id,
                &final_content,
                &self.session_id,
            ));
        }

        shared.store.daily.append(&DailyLogEntry::new(
            &msg.channel,
            &self.session_id,
            &msg.content,
            &final_content,
        ));
        shared
            .store
            .sessions
            .save_checkpoint(&self.session_id, &msg.request_id);
        self.last_request_id = Some(msg.request_id.clone());

        tracing::debug!("turn finished");
        Ok(final_content)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn turn_to_message(turn: &Turn) -> Message {
    Message {
        role: turn.role,
        content: turn.content.clone(),
        tool_calls: turn.tool_calls.clone(),
        tool_call_id: turn.tool_call_id.clone(),
    }
}

/// The user-visible message for a budget-blocked turn.
fn blocked_message(limit: &LimitError) -> String {
    format!(
        "Token safety blocked this request for scope {} (used {}, reserved {}, requested {}, limit {}).",
        limit.scope, limit.used, limit.reserved, limit.requested, limit.limit
    )
}

/// Keep one warning per scope, preferring the highest usage percentage.
fn merge_warnings(into: &mut Vec<SoftWarning>, new: Vec<SoftWarning>) {
    for warning in new {
        match into.iter_mut().find(|w| w.scope == warning.scope) {
            Some(existing) => {
                if warning.used_pct > existing.used_pct {
                    *existing = warning;
                }
            }
            None => into.push(warning),
        }
    }
}

fn warning_footer(warnings: &[SoftWarning]) -> String {
    let mut footer = String::from("\n\n[Token safety]");
    for w in warnings {
        footer.push_str(&format!(
            " scope {} at {}% of its hard limit (threshold {}%).",
            w.scope, w.used_pct, w.threshold_pct
        ));
    }
    footer
}
