//! Deterministic in-process provider.
//!
//! Replies are popped from a queue in order; the queue exhausted, the
//! default reply repeats. Supports an artificial per-call delay and a
//! `Hang` reply that never resolves, which lets tests exercise timeout
//! and cancellation paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use sb_domain::error::{Error, Result};
use sb_domain::tool::ToolCall;

use crate::traits::{ChatRequest, ChatResponse, LlmCapabilities, LlmProvider, Usage};

/// One canned provider reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Plain assistant text.
    Text(String),
    /// Assistant text plus tool calls.
    ToolCalls {
        content: String,
        calls: Vec<ToolCall>,
    },
    /// Fail the call.
    Error(String),
    /// Never resolve. The caller's timeout or cancellation must fire.
    Hang,
}

/// Picks the reply for a request when queue order would be racy (e.g.
/// several conversations sharing one provider).
pub type Responder = dyn Fn(&ChatRequest) -> ScriptedReply + Send + Sync;

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    default_reply: ScriptedReply,
    /// When set, replies come from here instead of the queue.
    responder: Option<std::sync::Arc<Responder>>,
    /// Usage attached to every successful reply; `None` simulates a
    /// provider that reports no usage.
    usage: Option<Usage>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: ScriptedReply::Text("ok".into()),
            responder: None,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply to pop on the next call.
    pub fn push(&self, reply: ScriptedReply) -> &Self {
        self.replies.lock().push_back(reply);
        self
    }

    pub fn with_default(mut self, reply: ScriptedReply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_responder(mut self, responder: std::sync::Arc<Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Number of completed `chat` calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let reply = match &self.responder {
            Some(responder) => responder(&req),
            None => self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone()),
        };
        self.requests.lock().push(req);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            ScriptedReply::Text(content) => Ok(ChatResponse {
                content,
                tool_calls: Vec::new(),
                finish_reason: Some("stop".into()),
                usage: self.usage,
            }),
            ScriptedReply::ToolCalls { content, calls } => Ok(ChatResponse {
                content,
                tool_calls: calls,
                finish_reason: Some("tool_calls".into()),
                usage: self.usage,
            }),
            ScriptedReply::Error(message) => Err(Error::Provider {
                provider: "scripted".into(),
                message,
            }),
            ScriptedReply::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }

    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities {
            tool_use: true,
            reports_usage: self.usage.is_some(),
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pops_replies_in_order_then_falls_back() {
        let provider = ScriptedProvider::new();
        provider.push(ScriptedReply::Text("first".into()));
        provider.push(ScriptedReply::Text("second".into()));

        let r1 = provider.chat(ChatRequest::default()).await.unwrap();
        let r2 = provider.chat(ChatRequest::default()).await.unwrap();
        let r3 = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(r1.content, "first");
        assert_eq!(r2.content, "second");
        assert_eq!(r3.content, "ok");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_provider_error() {
        let provider = ScriptedProvider::new();
        provider.push(ScriptedReply::Error("overloaded".into()));
        let err = provider.chat(ChatRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn hang_reply_never_resolves() {
        let provider = ScriptedProvider::new();
        provider.push(ScriptedReply::Hang);
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            provider.chat(ChatRequest::default()),
        )
        .await;
        assert!(result.is_err(), "expected the call to still be pending");
    }

    #[tokio::test]
    async fn records_requests() {
        let provider = ScriptedProvider::new();
        let mut req = ChatRequest::default();
        req.model = Some("test-model".into());
        provider.chat(req).await.unwrap();
        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model.as_deref(), Some("test-model"));
    }

    #[tokio::test]
    async fn responder_overrides_the_queue() {
        let provider = ScriptedProvider::new().with_responder(std::sync::Arc::new(|req| {
            let last = req.messages.last().map(|m| m.content.as_str()).unwrap_or("");
            ScriptedReply::Text(format!("saw: {last}"))
        }));
        provider.push(ScriptedReply::Text("ignored".into()));

        let mut req = ChatRequest::default();
        req.messages.push(sb_domain::tool::Message::user("ping"));
        let resp = provider.chat(req).await.unwrap();
        assert_eq!(resp.content, "saw: ping");
    }

    #[tokio::test]
    async fn usage_none_reports_capability() {
        let provider = ScriptedProvider::new().with_usage(None);
        assert!(!provider.capabilities().reports_usage);
        let resp = provider.chat(ChatRequest::default()).await.unwrap();
        assert!(resp.usage.is_none());
    }
}
