//! The task loop one background run executes.
//!
//! A slimmer sibling of the session turn loop: conversation seeded from
//! the run's context packet, budget charged to `global` plus the run's
//! own scope, tools dispatched sequentially under the remaining run time.

use std::time::{Duration, Instant};

use sb_domain::error::{Error, Result};
use sb_domain::tool::Message;
use sb_providers::ChatRequest;
use sb_store::{ContextMode, ContextPacket, ToolEvent};
use sb_tools::ToolRegistry;

use crate::state::Shared;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a background task agent. Complete the task and reply with the result.";

/// Everything the loop needs for one run attempt.
pub(crate) struct TaskSpec<'a> {
    pub run_id: &'a str,
    pub session_id: &'a str,
    /// Budget scope of this run (`subagent:<id>` or `federation:<id>`).
    pub scope: String,
    pub task: &'a str,
    pub context: &'a ContextPacket,
    pub deadline: Instant,
}

/// Run the loop to completion. The caller owns the overall timeout and
/// cancellation; deadline exhaustion inside surfaces as `Error::Timeout`.
pub(crate) async fn execute_task(
    shared: &Shared,
    registry: &ToolRegistry,
    spec: TaskSpec<'_>,
) -> Result<String> {
    let defaults = &shared.config.agents.defaults;
    let tool_defs = registry.definitions();
    let mut messages = build_messages(spec.task, spec.context);
    let scopes = vec!["global".to_owned(), spec.scope.clone()];
    let planned = defaults.max_tokens as u64;

    for iteration in 0..defaults.max_tool_iterations {
        tracing::debug!(run_id = spec.run_id, iteration, "task loop iteration");

        let reservation = shared
            .budget
            .preflight(&scopes, planned)
            .map_err(Error::Budget)?;

        let remaining = spec.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            shared.budget.abort(&reservation);
            return Err(Error::Timeout("task deadline exceeded".into()));
        }

        let request = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            model: defaults.model.clone(),
            max_tokens: Some(defaults.max_tokens),
            temperature: defaults.temperature,
        };

        let response = match tokio::time::timeout(remaining, shared.provider.chat(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                shared.budget.abort(&reservation);
                shared.counters.provider_error();
                return Err(e);
            }
            Err(_) => {
                shared.budget.abort(&reservation);
                return Err(Error::Timeout("provider call exceeded task deadline".into()));
            }
        };

        let outcome = shared
            .budget
            .commit(&reservation, response.usage, response.content.len());
        shared.store.daily.record_usage(outcome.total_tokens);

        if response.tool_calls.is_empty() {
            return Ok(response.content);
        }

        messages.push(Message::assistant_with_calls(
            &response.content,
            response.tool_calls.clone(),
        ));
        for call in &response.tool_calls {
            let remaining = spec.deadline.saturating_duration_since(Instant::now());
            let tool_timeout = Duration::from_secs(defaults.tool_timeout_sec)
                .min(remaining.max(Duration::from_millis(1)));

            let (output, _is_error) = registry
                .dispatch(&call.tool_name, call.arguments.clone(), tool_timeout)
                .await;

            shared.store.tool_events.append(&ToolEvent {
                id: shared.ids.next(),
                session_id: spec.session_id.to_owned(),
                tool_name: call.tool_name.clone(),
                input: call.arguments.clone(),
                output: output.clone(),
                created_at: chrono::Utc::now(),
            });
            messages.push(Message::tool_result(&call.call_id, &output));
        }
    }

    Err(Error::Other(format!(
        "tool loop limit reached ({} iterations)",
        shared.config.agents.defaults.max_tool_iterations
    )))
}

/// System prompt plus the context packet's blocks, then the task.
pub(crate) fn build_messages(task: &str, context: &ContextPacket) -> Vec<Message> {
    let base = context
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
    let system = match context.mode {
        ContextMode::Minimal => base,
        ContextMode::Session | ContextMode::SessionMemory => format!(
            "{base}\n\nYou are continuing work for an ongoing conversation; recent history follows."
        ),
    };

    let mut messages = vec![Message::system(system)];
    if context.mode != ContextMode::Minimal {
        messages.extend(context.history.iter().cloned());
    }
    if context.mode == ContextMode::SessionMemory {
        if let Some(memory) = &context.memory {
            messages.push(Message::user(format!("Relevant memory:\n{memory}")));
        }
    }
    if !context.attachment_paths.is_empty() {
        messages.push(Message::user(format!(
            "Attachment paths:\n{}",
            context.attachment_paths.join("\n")
        )));
    }
    messages.push(Message::user(task));
    messages
}

/// First 237 code points of the output, `...`-suffixed when longer.
pub(crate) fn summarize(output: &str) -> String {
    const SUMMARY_CHARS: usize = 237;
    match output.char_indices().nth(SUMMARY_CHARS) {
        Some((idx, _)) => format!("{}...", &output[..idx]),
        None => output.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::tool::Role;

    #[test]
    fn summarize_short_output_is_unchanged() {
        assert_eq!(summarize("done"), "done");
    }

    #[test]
    fn summarize_long_output_truncates_with_ellipsis() {
        let long = "x".repeat(500);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), 240);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn summarize_is_char_safe() {
        let long = "é".repeat(300);
        let summary = summarize(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 240);
    }

    #[test]
    fn minimal_mode_has_system_and_task_only() {
        let context = ContextPacket::default();
        let messages = build_messages("do the thing", &context);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "do the thing");
    }

    #[test]
    fn session_mode_includes_history() {
        let context = ContextPacket {
            mode: ContextMode::Session,
            history: vec![Message::user("earlier"), Message::assistant("reply")],
            ..Default::default()
        };
        let messages = build_messages("task", &context);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "earlier");
        assert!(messages[0].content.contains("recent history follows"));
    }

    #[test]
    fn session_memory_mode_adds_memory_block() {
        let context = ContextPacket {
            mode: ContextMode::SessionMemory,
            memory: Some("user prefers short answers".into()),
            ..Default::default()
        };
        let messages = build_messages("task", &context);
        assert!(messages
            .iter()
            .any(|m| m.content.starts_with("Relevant memory:")));
    }

    #[test]
    fn attachments_block_lists_paths() {
        let context = ContextPacket {
            attachment_paths: vec!["/a.txt".into(), "/b.png".into()],
            ..Default::default()
        };
        let messages = build_messages("task", &context);
        let attachment_msg = messages
            .iter()
            .find(|m| m.content.starts_with("Attachment paths:"))
            .unwrap();
        assert!(attachment_msg.content.contains("/a.txt"));
        assert!(attachment_msg.content.contains("/b.png"));
    }
}
