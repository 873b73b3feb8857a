//! Engine-owned tools and the per-request registry builder.
//!
//! A fresh registry is built for every inbound request with the request's
//! context injected: governance tools over the token-safety settings,
//! subagent lifecycle tools, the federation spawn tool, and whatever the
//! host's tool factory contributes. Nothing mutable is shared between
//! sessions through a registry.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use sb_domain::error::Result;
use sb_domain::tool::ToolDefinition;
use sb_store::{ContextMode, ContextPacket, SubagentRun};
use sb_tools::{Tool, ToolContext, ToolRegistry};

use crate::federation::{DelegationRequest, FederationClient, SpawnOptions};
use crate::state::Shared;
use crate::subagents::{SubagentPool, SubagentRequest};

const NOT_AUTHORIZED: &str = "not authorized to modify token safety settings";

/// The registry a session turn runs with.
pub fn build_registry(
    shared: &Arc<Shared>,
    pool: &Arc<SubagentPool>,
    federation: Option<&Arc<FederationClient>>,
    ctx: ToolContext,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new(ctx);
    register_host_tools(shared, &mut registry);
    register_governance_tools(shared, &mut registry);
    register_subagent_tools(shared, pool, &mut registry);
    if let Some(client) = federation {
        if shared.config.runtime.federation.enabled {
            registry.register(Arc::new(FederationSpawnTool {
                client: client.clone(),
            }));
        }
    }
    registry
}

/// The registry a background run (subagent or federation executor) runs
/// with: host tools plus the subagent lifecycle tools, no governance.
pub fn build_task_registry(
    shared: &Arc<Shared>,
    pool: &Arc<SubagentPool>,
    ctx: ToolContext,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new(ctx);
    register_host_tools(shared, &mut registry);
    register_subagent_tools(shared, pool, &mut registry);
    registry
}

fn register_host_tools(shared: &Arc<Shared>, registry: &mut ToolRegistry) {
    if let Some(factory) = &shared.tool_factory {
        for tool in factory.as_ref()(registry.context()) {
            registry.register(tool);
        }
    }
}

fn register_governance_tools(shared: &Arc<Shared>, registry: &mut ToolRegistry) {
    registry.register(Arc::new(BudgetStatusTool {
        shared: shared.clone(),
    }));
    registry.register(Arc::new(BudgetSetLimitsTool {
        shared: shared.clone(),
    }));
    registry.register(Arc::new(BudgetSetEnabledTool {
        shared: shared.clone(),
    }));
}

fn register_subagent_tools(
    shared: &Arc<Shared>,
    pool: &Arc<SubagentPool>,
    registry: &mut ToolRegistry,
) {
    let config = &shared.config.runtime.subagents;
    if !config.enabled {
        return;
    }
    if registry.context().subagent_depth < config.max_depth {
        registry.register(Arc::new(SubagentSpawnTool {
            shared: shared.clone(),
            pool: pool.clone(),
        }));
    }
    registry.register(Arc::new(SubagentWaitTool { pool: pool.clone() }));
    registry.register(Arc::new(SubagentStatusTool { pool: pool.clone() }));
    registry.register(Arc::new(SubagentResultTool { pool: pool.clone() }));
    registry.register(Arc::new(SubagentCancelTool { pool: pool.clone() }));
}

fn object_schema(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Compact JSON view of a run for tool output.
fn run_brief(run: &SubagentRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.id,
        "status": run.status.as_str(),
        "label": run.label,
        "attempt": run.attempt,
        "summary": run.result.as_ref().map(|r| r.summary.clone()),
        "error": run.error,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Governance tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BudgetStatusTool {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Tool for BudgetStatusTool {
    fn name(&self) -> &str {
        "budget_status"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "budget_status".into(),
            description: "Report token safety settings and per-scope usage counters.".into(),
            parameters: object_schema(serde_json::json!({}), &[]),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, _arguments: serde_json::Value) -> Result<String> {
        let settings = self.shared.budget.effective_settings();
        let version = self
            .shared
            .store
            .budget
            .safety_override()
            .map(|o| o.version)
            .unwrap_or(0);

        let mut scopes = Vec::new();
        for (scope, hard_limit, soft_pct) in [
            (
                "global".to_owned(),
                settings.global_hard_limit_tokens,
                settings.global_soft_threshold_pct,
            ),
            (
                format!("session:{}", ctx.session_id),
                settings.session_hard_limit_tokens,
                settings.session_soft_threshold_pct,
            ),
        ] {
            let counter = self.shared.store.budget.counter(&scope);
            scopes.push(serde_json::json!({
                "scope": scope,
                "used": counter.total_tokens,
                "reserved": counter.reserved_tokens,
                "hard_limit": hard_limit,
                "soft_threshold_pct": soft_pct,
            }));
        }

        Ok(serde_json::json!({
            "enabled": settings.enabled,
            "mode": settings.mode,
            "override_version": version,
            "scopes": scopes,
        })
        .to_string())
    }
}

#[derive(Deserialize, Default)]
struct SetLimitsArgs {
    #[serde(default)]
    global_hard_limit_tokens: Option<u64>,
    #[serde(default)]
    global_soft_threshold_pct: Option<u64>,
    #[serde(default)]
    session_hard_limit_tokens: Option<u64>,
    #[serde(default)]
    session_soft_threshold_pct: Option<u64>,
    #[serde(default)]
    subagent_run_hard_limit_tokens: Option<u64>,
    #[serde(default)]
    subagent_run_soft_threshold_pct: Option<u64>,
}

struct BudgetSetLimitsTool {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Tool for BudgetSetLimitsTool {
    fn name(&self) -> &str {
        "budget_set_limits"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "budget_set_limits".into(),
            description:
                "Update token safety limits. Only trusted writers may call this; omitted fields keep their current value."
                    .into(),
            parameters: object_schema(
                serde_json::json!({
                    "global_hard_limit_tokens": { "type": "integer" },
                    "global_soft_threshold_pct": { "type": "integer" },
                    "session_hard_limit_tokens": { "type": "integer" },
                    "session_soft_threshold_pct": { "type": "integer" },
                    "subagent_run_hard_limit_tokens": { "type": "integer" },
                    "subagent_run_soft_threshold_pct": { "type": "integer" },
                }),
                &[],
            ),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String> {
        if !self
            .shared
            .budget
            .is_trusted_writer(&ctx.channel, &ctx.sender_id)
        {
            return Ok(NOT_AUTHORIZED.into());
        }

        let args: SetLimitsArgs = serde_json::from_value(arguments).unwrap_or_default();
        let mut settings = self.shared.budget.effective_settings();
        if let Some(v) = args.global_hard_limit_tokens {
            settings.global_hard_limit_tokens = v;
        }
        if let Some(v) = args.global_soft_threshold_pct {
            settings.global_soft_threshold_pct = v;
        }
        if let Some(v) = args.session_hard_limit_tokens {
            settings.session_hard_limit_tokens = v;
        }
        if let Some(v) = args.session_soft_threshold_pct {
            settings.session_soft_threshold_pct = v;
        }
        if let Some(v) = args.subagent_run_hard_limit_tokens {
            settings.subagent_run_hard_limit_tokens = v;
        }
        if let Some(v) = args.subagent_run_soft_threshold_pct {
            settings.subagent_run_soft_threshold_pct = v;
        }

        let record = self.shared.store.budget.set_safety_override(settings);
        self.shared.budget.invalidate_cache();
        tracing::info!(
            writer = %format!("{}:{}", ctx.channel, ctx.sender_id),
            version = record.version,
            "token safety limits updated"
        );

        Ok(serde_json::json!({
            "updated": true,
            "version": record.version,
            "global_hard_limit_tokens": record.settings.global_hard_limit_tokens,
            "session_hard_limit_tokens": record.settings.session_hard_limit_tokens,
            "subagent_run_hard_limit_tokens": record.settings.subagent_run_hard_limit_tokens,
        })
        .to_string())
    }
}

#[derive(Deserialize)]
struct SetEnabledArgs {
    enabled: bool,
}

struct BudgetSetEnabledTool {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Tool for BudgetSetEnabledTool {
    fn name(&self) -> &str {
        "budget_set_enabled"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "budget_set_enabled".into(),
            description: "Enable or disable token safety enforcement. Trusted writers only.".into(),
            parameters: object_schema(
                serde_json::json!({ "enabled": { "type": "boolean" } }),
                &["enabled"],
            ),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String> {
        if !self
            .shared
            .budget
            .is_trusted_writer(&ctx.channel, &ctx.sender_id)
        {
            return Ok(NOT_AUTHORIZED.into());
        }

        let args: SetEnabledArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return Ok(format!("invalid arguments: {e}")),
        };

        let mut settings = self.shared.budget.effective_settings();
        settings.enabled = args.enabled;
        let record = self.shared.store.budget.set_safety_override(settings);
        self.shared.budget.invalidate_cache();

        Ok(serde_json::json!({
            "updated": true,
            "version": record.version,
            "enabled": record.settings.enabled,
        })
        .to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagent tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct SpawnArgs {
    task: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    context_mode: Option<ContextMode>,
    #[serde(default)]
    timeout_sec: Option<u64>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    wait_timeout_sec: Option<u64>,
}

struct SubagentSpawnTool {
    shared: Arc<Shared>,
    pool: Arc<SubagentPool>,
}

#[async_trait::async_trait]
impl Tool for SubagentSpawnTool {
    fn name(&self) -> &str {
        "subagent_spawn"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "subagent_spawn".into(),
            description:
                "Run a task in the background. Returns the run id immediately unless wait is true."
                    .into(),
            parameters: object_schema(
                serde_json::json!({
                    "task": { "type": "string", "description": "What the subagent should do" },
                    "label": { "type": "string" },
                    "context_mode": { "type": "string", "enum": ["minimal", "session", "session_memory"] },
                    "timeout_sec": { "type": "integer" },
                    "max_attempts": { "type": "integer" },
                    "wait": { "type": "boolean" },
                    "wait_timeout_sec": { "type": "integer" },
                }),
                &["task"],
            ),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String> {
        let args: SpawnArgs = serde_json::from_value(arguments)
            .map_err(|e| sb_domain::error::Error::InvalidRequest(format!("bad arguments: {e}")))?;

        let mode = args.context_mode.unwrap_or_default();
        let history = if mode == ContextMode::Minimal {
            Vec::new()
        } else {
            let window = self.shared.config.agents.defaults.clamped_history_window();
            self.shared
                .store
                .turns
                .window(&ctx.session_id, window)
                .iter()
                .map(|t| sb_domain::tool::Message {
                    role: t.role,
                    content: t.content.clone(),
                    tool_calls: t.tool_calls.clone(),
                    tool_call_id: t.tool_call_id.clone(),
                })
                .collect()
        };

        let run = self.pool.enqueue(SubagentRequest {
            session_id: ctx.session_id.clone(),
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
            task: args.task,
            label: args.label,
            context: ContextPacket {
                mode,
                history,
                ..Default::default()
            },
            timeout_sec: args.timeout_sec,
            max_attempts: args.max_attempts,
            depth: ctx.subagent_depth + 1,
            artifact_dir: None,
        })?;

        if args.wait {
            let timeout = Duration::from_secs(
                args.wait_timeout_sec.unwrap_or(run.timeout_sec.saturating_add(5)),
            );
            let runs = self.pool.wait(&[run.id.clone()], timeout).await;
            if let Some(settled) = runs.first() {
                return Ok(run_brief(settled).to_string());
            }
        }
        Ok(run_brief(&run).to_string())
    }
}

#[derive(Deserialize)]
struct WaitArgs {
    run_ids: Vec<String>,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

struct SubagentWaitTool {
    pool: Arc<SubagentPool>,
}

#[async_trait::async_trait]
impl Tool for SubagentWaitTool {
    fn name(&self) -> &str {
        "subagent_wait"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "subagent_wait".into(),
            description: "Wait until the given runs are terminal or the timeout elapses.".into(),
            parameters: object_schema(
                serde_json::json!({
                    "run_ids": { "type": "array", "items": { "type": "string" } },
                    "timeout_sec": { "type": "integer" },
                }),
                &["run_ids"],
            ),
        }
    }

    async fn invoke(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String> {
        let args: WaitArgs = serde_json::from_value(arguments)
            .map_err(|e| sb_domain::error::Error::InvalidRequest(format!("bad arguments: {e}")))?;
        let timeout = Duration::from_secs(args.timeout_sec.unwrap_or(60));
        let runs = self.pool.wait(&args.run_ids, timeout).await;
        let briefs: Vec<serde_json::Value> = runs.iter().map(run_brief).collect();
        Ok(serde_json::Value::Array(briefs).to_string())
    }
}

#[derive(Deserialize)]
struct RunIdArgs {
    run_id: String,
}

macro_rules! run_id_tool {
    ($tool:ident, $name:literal, $desc:literal, $call:expr) => {
        struct $tool {
            pool: Arc<SubagentPool>,
        }

        #[async_trait::async_trait]
        impl Tool for $tool {
            fn name(&self) -> &str {
                $name
            }

            fn definition(&self) -> ToolDefinition {
                ToolDefinition {
                    name: $name.into(),
                    description: $desc.into(),
                    parameters: object_schema(
                        serde_json::json!({ "run_id": { "type": "string" } }),
                        &["run_id"],
                    ),
                }
            }

            async fn invoke(
                &self,
                _ctx: &ToolContext,
                arguments: serde_json::Value,
            ) -> Result<String> {
                let args: RunIdArgs = serde_json::from_value(arguments).map_err(|e| {
                    sb_domain::error::Error::InvalidRequest(format!("bad arguments: {e}"))
                })?;
                #[allow(clippy::redundant_closure_call)]
                let run = ($call)(&self.pool, &args.run_id)?;
                Ok(run_brief(&run).to_string())
            }
        }
    };
}

run_id_tool!(
    SubagentStatusTool,
    "subagent_status",
    "Report the current state of a background run.",
    |pool: &Arc<SubagentPool>, id: &str| pool.status(id)
);
run_id_tool!(
    SubagentResultTool,
    "subagent_result",
    "Fetch the outcome of a finished background run.",
    |pool: &Arc<SubagentPool>, id: &str| pool.result(id)
);
run_id_tool!(
    SubagentCancelTool,
    "subagent_cancel",
    "Cancel a background run. Idempotent on finished runs.",
    |pool: &Arc<SubagentPool>, id: &str| pool.cancel(id)
);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Federation tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct FederationSpawnArgs {
    task: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    preferred_roles: Vec<String>,
    #[serde(default)]
    preferred_peer_id: Option<String>,
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

struct FederationSpawnTool {
    client: Arc<FederationClient>,
}

#[async_trait::async_trait]
impl Tool for FederationSpawnTool {
    fn name(&self) -> &str {
        "federation_spawn"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "federation_spawn".into(),
            description: "Delegate a task to a remote peer node.".into(),
            parameters: object_schema(
                serde_json::json!({
                    "task": { "type": "string" },
                    "label": { "type": "string" },
                    "required_capabilities": { "type": "array", "items": { "type": "string" } },
                    "preferred_roles": { "type": "array", "items": { "type": "string" } },
                    "preferred_peer_id": { "type": "string" },
                    "wait": { "type": "boolean" },
                    "timeout_sec": { "type": "integer" },
                }),
                &["task"],
            ),
        }
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String> {
        let args: FederationSpawnArgs = serde_json::from_value(arguments)
            .map_err(|e| sb_domain::error::Error::InvalidRequest(format!("bad arguments: {e}")))?;

        let run = self
            .client
            .delegate(SpawnOptions {
                request: DelegationRequest {
                    task: args.task,
                    label: args.label,
                    timeout_sec: args.timeout_sec.unwrap_or(0),
                    max_attempts: 0,
                    context: ContextPacket::default(),
                },
                required_capabilities: args.required_capabilities,
                preferred_roles: args.preferred_roles,
                preferred_peer_id: args.preferred_peer_id,
                wait: args.wait,
                session_id: ctx.session_id.clone(),
                channel: ctx.channel.clone(),
                chat_id: ctx.chat_id.clone(),
            })
            .await?;

        Ok(serde_json::json!({
            "run_id": run.id,
            "peer_id": run.peer_id,
            "status": run.status.as_str(),
            "summary": run.result.as_ref().map(|r| r.summary.clone()),
        })
        .to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
