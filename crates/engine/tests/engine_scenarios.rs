//! End-to-end scenarios through the engine facade: budget enforcement,
//! governance tools, tool errors as data, and subagent fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sb_domain::config::Config;
use sb_domain::message::InboundMessage;
use sb_domain::tool::{Role, ToolCall, ToolDefinition};
use sb_engine::Engine;
use sb_providers::{ScriptedProvider, ScriptedReply};
use sb_store::RunStatus;
use sb_tools::{Tool, ToolContext};

const SESSION: &str = "cli:local";

fn build_engine(
    provider: Arc<ScriptedProvider>,
    mutate: impl FnOnce(&mut Config),
) -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    mutate(&mut config);
    let engine = Engine::builder(config)
        .state_path(dir.path())
        .provider(provider)
        .build()
        .unwrap();
    (dir, engine)
}

fn inbound(content: &str) -> InboundMessage {
    InboundMessage::new("cli", "local", "user", content)
}

fn call(id: &str, tool: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        call_id: id.into(),
        tool_name: tool.into(),
        arguments,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget enforcement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn hard_budget_block_happens_before_any_provider_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let (_dir, engine) = build_engine(provider.clone(), |config| {
        config.runtime.token_safety.global_hard_limit_tokens = 1;
        config.agents.defaults.max_tokens = 2;
    });

    let reply = engine.ask(inbound("hello")).await.unwrap();
    assert!(reply.contains("Token safety blocked this request for scope global"));
    assert_eq!(provider.call_count(), 0, "preflight must fail before the provider");

    // Exactly two turns persisted, in submission order.
    let turns = engine.store().turns.window(SESSION, 10);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "hello");
    assert_eq!(turns[1].role, Role::Assistant);
    assert!(turns[1].content.contains("Token safety blocked"));

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn provider_failure_aborts_the_reservation() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::Error("upstream overloaded".into()));
    let (_dir, engine) = build_engine(provider, |config| {
        config.runtime.token_safety.global_hard_limit_tokens = 1_000;
    });

    let err = engine.ask(inbound("hello")).await.unwrap_err();
    assert!(err.to_string().contains("upstream overloaded"));
    assert_eq!(engine.counters().provider_errors, 1);

    // The aborted reservation left no tokens reserved.
    let counter = engine.store().budget.counter("global");
    assert_eq!(counter.reserved_tokens, 0);
    assert_eq!(counter.total_tokens, 0);

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn soft_threshold_appends_token_safety_footer() {
    let provider = Arc::new(ScriptedProvider::new());
    let (_dir, engine) = build_engine(provider, |config| {
        // Usage of 15 against a 16-token limit is over the 80% threshold.
        config.runtime.token_safety.global_hard_limit_tokens = 16;
        config.agents.defaults.max_tokens = 1;
    });

    let reply = engine.ask(inbound("hi")).await.unwrap();
    assert!(reply.contains("[Token safety]"));
    assert!(reply.contains("scope global"));

    engine.stop(Duration::from_millis(500)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Governance tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn trusted_writer_updates_limit_then_reads_status() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::ToolCalls {
        content: String::new(),
        calls: vec![call(
            "c1",
            "budget_set_limits",
            serde_json::json!({"global_hard_limit_tokens": 17}),
        )],
    });
    provider.push(ScriptedReply::ToolCalls {
        content: String::new(),
        calls: vec![call("c2", "budget_status", serde_json::json!({}))],
    });
    provider.push(ScriptedReply::Text("limits updated".into()));

    let (_dir, engine) = build_engine(provider, |config| {
        config.runtime.token_safety.trusted_writers = vec!["cli:user".into()];
    });

    let reply = engine.ask(inbound("set the global limit to 17")).await.unwrap();
    assert_eq!(reply, "limits updated");

    // Override record present with the new limit.
    let record = engine.store().budget.safety_override().unwrap();
    assert_eq!(record.settings.global_hard_limit_tokens, 17);
    assert_eq!(record.version, 1);

    // The status read reported the overridden limit for scope global.
    let events = engine.store().tool_events.list(SESSION);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].tool_name, "budget_status");
    assert!(events[1].output.contains("\"hard_limit\":17"));

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn untrusted_sender_cannot_mutate_settings() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::ToolCalls {
        content: String::new(),
        calls: vec![call(
            "c1",
            "budget_set_enabled",
            serde_json::json!({"enabled": false}),
        )],
    });
    provider.push(ScriptedReply::Text("done".into()));

    let (_dir, engine) = build_engine(provider, |config| {
        config.runtime.token_safety.trusted_writers = vec!["cli:user".into()];
    });

    let mut msg = inbound("disable token safety");
    msg.sender_id = "intruder".into();
    engine.ask(msg).await.unwrap();

    // No override persisted; the tool answered with the denial text.
    assert!(engine.store().budget.safety_override().is_none());
    let events = engine.store().tool_events.list(SESSION);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].output, "not authorized to modify token safety settings");

    engine.stop(Duration::from_millis(500)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool failures are data
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FailingTool;

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fragile"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fragile".into(),
            description: "Always fails".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        _arguments: serde_json::Value,
    ) -> sb_domain::error::Result<String> {
        Err(sb_domain::error::Error::Other("disk on fire".into()))
    }
}

#[tokio::test]
async fn tool_failure_becomes_tool_output_and_the_loop_continues() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::ToolCalls {
        content: String::new(),
        calls: vec![call("c1", "fragile", serde_json::json!({}))],
    });
    provider.push(ScriptedReply::Text("recovered anyway".into()));

    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::builder(Config::default())
        .state_path(dir.path())
        .provider(provider.clone())
        .tool_factory(Arc::new(|_ctx| vec![Arc::new(FailingTool) as Arc<dyn Tool>]))
        .build()
        .unwrap();

    let reply = engine.ask(inbound("try the fragile tool")).await.unwrap();
    assert_eq!(reply, "recovered anyway");

    // The failure was recorded and fed back as the tool result.
    let events = engine.store().tool_events.list(SESSION);
    assert_eq!(events.len(), 1);
    assert!(events[0].output.contains("disk on fire"));

    // The second provider request carried the error as a tool message.
    let requests = provider.requests();
    let followup = &requests[1];
    let tool_msg = followup
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content.contains("disk on fire"));

    engine.stop(Duration::from_millis(500)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagent fan-out / fan-in
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn fanout_of_eight_subagents_respects_concurrency_bound() {
    // The session and the subagent workers share one provider, so the
    // reply is chosen per request: the opening user message fans out,
    // a conversation carrying tool results is the session's second call,
    // and anything else is a subagent doing its part.
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_delay(Duration::from_millis(200))
            .with_responder(Arc::new(|req| {
                if req.messages.iter().any(|m| m.role == Role::Tool) {
                    return ScriptedReply::Text("fanout complete".into());
                }
                let last = req.messages.last().map(|m| m.content.as_str()).unwrap_or("");
                if last == "fan out" {
                    let calls = (0..8)
                        .map(|i| ToolCall {
                            call_id: format!("c{i}"),
                            tool_name: "subagent_spawn".into(),
                            arguments: serde_json::json!({
                                "task": format!("part {i}"),
                                "label": format!("part-{i}"),
                            }),
                        })
                        .collect();
                    ScriptedReply::ToolCalls {
                        content: String::new(),
                        calls,
                    }
                } else {
                    ScriptedReply::Text("part done".into())
                }
            })),
    );

    let (_dir, engine) = build_engine(provider.clone(), |config| {
        config.runtime.subagents.max_concurrent = 4;
    });

    let started = Instant::now();
    let reply = engine.ask(inbound("fan out")).await.unwrap();
    assert_eq!(reply, "fanout complete");

    // Collect the spawned run ids from the tool outputs.
    let run_ids: Vec<String> = engine
        .store()
        .tool_events
        .list(SESSION)
        .iter()
        .filter(|e| e.tool_name == "subagent_spawn")
        .map(|e| {
            let parsed: serde_json::Value = serde_json::from_str(&e.output).unwrap();
            parsed["run_id"].as_str().unwrap().to_owned()
        })
        .collect();
    assert_eq!(run_ids.len(), 8);

    let runs = engine
        .subagents()
        .wait(&run_ids, Duration::from_secs(10))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(runs.len(), 8);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
    // Two session calls plus one per subagent.
    assert_eq!(provider.call_count(), 10);
    // 8 × 200 ms on 4 workers is ideally 400 ms; the whole exchange
    // (including the two 200 ms session calls) stays well under 3× that
    // plus the session overhead.
    assert!(elapsed < Duration::from_millis(2500), "fanout took {elapsed:?}");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn completion_reinjection_feeds_the_session() {
    let provider = Arc::new(ScriptedProvider::new().with_responder(Arc::new(|req| {
        if req.messages.iter().any(|m| m.role == Role::Tool) {
            return ScriptedReply::Text("spawned".into());
        }
        let last = req.messages.last().map(|m| m.content.as_str()).unwrap_or("");
        if last == "spawn one" {
            ScriptedReply::ToolCalls {
                content: String::new(),
                calls: vec![call(
                    "c1",
                    "subagent_spawn",
                    serde_json::json!({"task": "background job"}),
                )],
            }
        } else if last.starts_with("Subagent ") {
            ScriptedReply::Text("noted".into())
        } else {
            ScriptedReply::Text("job done".into())
        }
    })));
    let (_dir, engine) = build_engine(provider, |config| {
        config.runtime.subagents.reinject_on_complete = true;
    });

    let reply = engine.ask(inbound("spawn one")).await.unwrap();
    assert_eq!(reply, "spawned");

    // The completion summary comes back as a fresh user turn.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let turns = engine.store().turns.window(SESSION, 20);
        let reinjected = turns
            .iter()
            .any(|t| t.role == Role::User && t.content.starts_with("Subagent "));
        if reinjected {
            break;
        }
        assert!(Instant::now() < deadline, "reinjection never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.stop(Duration::from_millis(500)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence side effects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn turn_checkpoints_and_daily_log_are_written() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::Text(
        "Done for now, waiting on your approval.".into(),
    ));
    let (_dir, engine) = build_engine(provider, |_| {});

    let mut msg = inbound("deploy the service");
    msg.request_id = "req-123".into();
    engine.ask(msg).await.unwrap();

    // Checkpoint carries the last request id.
    let checkpoint = engine.store().sessions.checkpoint(SESSION).unwrap();
    assert_eq!(checkpoint.last_request_id, "req-123");

    // Session metadata reflects the routing fields.
    let record = engine.store().sessions.get(SESSION).unwrap();
    assert_eq!(record.last_channel.as_deref(), Some("cli"));
    assert_eq!(record.last_chat_id.as_deref(), Some("local"));

    // The daily log entry detected the follow-up marker.
    let today = chrono::Utc::now().date_naive().to_string();
    let entries = engine.store().daily.entries(&today);
    let entry = entries.iter().find(|e| e.session_id == SESSION).unwrap();
    assert_eq!(entry.intent, "deploy the service");
    assert!(entry.follow_up, "'waiting on' must flag follow-up");

    // Daily usage accumulated the scripted 15 tokens.
    assert_eq!(engine.store().daily.usage_for(&today), 15);

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn non_cli_channels_get_an_outbound_reply() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::Text("pong".into()));
    let (_dir, engine) = build_engine(provider, |_| {});
    let mut outbound = engine.take_outbound().unwrap();

    engine
        .ask(InboundMessage::new("telegram", "chat-9", "user", "ping"))
        .await
        .unwrap();

    let out = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.channel, "telegram");
    assert_eq!(out.chat_id, "chat-9");
    assert_eq!(out.content, "pong");
    assert_eq!(out.metadata["session_id"], "telegram:chat-9");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn cli_channel_stays_quiet_on_the_outbound_queue() {
    let provider = Arc::new(ScriptedProvider::new());
    let (_dir, engine) = build_engine(provider, |_| {});
    let mut outbound = engine.take_outbound().unwrap();

    engine.ask(inbound("hello")).await.unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(200), outbound.recv()).await;
    assert!(nothing.is_err(), "cli replies are returned in-process only");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn empty_provider_reply_becomes_the_canonical_string() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(ScriptedReply::Text(String::new()));
    let (_dir, engine) = build_engine(provider, |_| {});

    let reply = engine.ask(inbound("say nothing")).await.unwrap();
    assert_eq!(reply, "(no response)");

    engine.stop(Duration::from_millis(500)).await;
}
