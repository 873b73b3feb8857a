//! The engine facade: wiring, submit/ask, and lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sb_domain::config::{Config, ConfigSeverity};
use sb_domain::error::{Error, Result};
use sb_domain::message::{InboundMessage, OutboundMessage};
use sb_providers::LlmProvider;
use sb_store::Store;

use crate::actor::{ActorPayload, ActorSystem};
use crate::budget::BudgetGuard;
use crate::cancel::CancelMap;
use crate::federation::{FederationClient, FederationServer};
use crate::handler::SessionHandler;
use crate::ids::IdGenerator;
use crate::metrics::{Counters, CountersSnapshot};
use crate::outbound::OutboundQueue;
use crate::state::{Shared, SystemPromptFn, ToolFactory};
use crate::subagents::SubagentPool;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EngineBuilder {
    config: Config,
    state_path: Option<PathBuf>,
    store: Option<Arc<Store>>,
    provider: Option<Arc<dyn LlmProvider>>,
    system_prompt: Option<Arc<SystemPromptFn>>,
    tool_factory: Option<Arc<ToolFactory>>,
}

impl EngineBuilder {
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Use an already-open store instead of `state_path`.
    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Collaborator that assembles the per-request system prompt.
    pub fn system_prompt(mut self, f: Arc<SystemPromptFn>) -> Self {
        self.system_prompt = Some(f);
        self
    }

    /// Collaborator that contributes the host's file/exec/web tools.
    pub fn tool_factory(mut self, f: Arc<ToolFactory>) -> Self {
        self.tool_factory = Some(f);
        self
    }

    /// Wire everything together. Spawns the pool workers and the sweep
    /// task, so this must run inside a Tokio runtime.
    pub fn build(self) -> Result<Engine> {
        // ── Config validation ────────────────────────────────────────
        let issues = self.config.validate();
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                ConfigSeverity::Error => tracing::error!("config: {issue}"),
            }
        }
        if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
            return Err(Error::Config(format!(
                "validation failed with {} error(s)",
                issues
                    .iter()
                    .filter(|i| i.severity == ConfigSeverity::Error)
                    .count()
            )));
        }

        let config = Arc::new(self.config);
        let store = match (self.store, &self.state_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Store::open(path)?,
            (None, None) => {
                return Err(Error::Config("either store or state_path is required".into()))
            }
        };
        let provider = self
            .provider
            .ok_or_else(|| Error::Config("an LLM provider is required".into()))?;

        // ── Shared services ──────────────────────────────────────────
        let counters = Arc::new(Counters::new());
        let (outbound, outbound_rx) =
            OutboundQueue::new(config.runtime.outbound_capacity, counters.clone());
        let shared = Arc::new(Shared {
            config: config.clone(),
            store: store.clone(),
            provider,
            budget: BudgetGuard::new(store, config.runtime.token_safety.clone()),
            outbound,
            ids: IdGenerator::new(),
            counters,
            system_prompt: self
                .system_prompt
                .unwrap_or_else(|| Arc::new(|_msg: &InboundMessage| DEFAULT_SYSTEM_PROMPT.to_owned())),
            tool_factory: self.tool_factory,
            cancel: CancelMap::new(),
        });

        // ── Execution plane ──────────────────────────────────────────
        let pool = SubagentPool::start(shared.clone());
        let federation = if config.runtime.federation.enabled {
            Some(FederationClient::new(shared.clone()))
        } else {
            None
        };

        let factory_shared = shared.clone();
        let factory_pool = pool.clone();
        let factory_federation = federation.clone();
        let actors = ActorSystem::new(
            Box::new(move |session_id| {
                Box::new(SessionHandler::new(
                    session_id.to_owned(),
                    factory_shared.clone(),
                    factory_pool.clone(),
                    factory_federation.clone(),
                ))
            }),
            config.runtime.mailbox_size,
            Duration::from_secs(config.runtime.actor_idle_ttl_sec),
        );

        // Completion reinjection feeds the session's next turn.
        {
            let actors = actors.clone();
            let reinject_shared = shared.clone();
            pool.set_reinjector(Arc::new(move |mut msg: InboundMessage| {
                if msg.request_id.is_empty() {
                    msg.request_id = reinject_shared.ids.next();
                }
                msg.created_at.get_or_insert_with(chrono::Utc::now);
                let key = msg.session_id.clone();
                if let Err(e) = actors.submit(&key, ActorPayload::ProcessMessage(msg)) {
                    tracing::warn!(session_id = %key, error = %e, "reinjection dropped");
                }
            }));
        }

        let federation_server = config
            .runtime
            .federation
            .enabled
            .then(|| FederationServer::new(shared.clone(), pool.clone()));

        // ── Maintenance: reservation and idempotency sweeps ──────────
        let shutdown = CancellationToken::new();
        {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let interval = Duration::from_secs(
                (config.runtime.token_safety.reservation_ttl_sec / 2).max(1),
            );
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let swept = shared.budget.sweep();
                    if swept > 0 {
                        tracing::debug!(swept, "expired budget reservations collected");
                    }
                    shared.store.federation.sweep_idempotency(chrono::Utc::now());
                }
            });
        }

        Ok(Engine {
            shared,
            actors,
            pool,
            federation,
            federation_server,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Engine {
    shared: Arc<Shared>,
    actors: Arc<ActorSystem>,
    pool: Arc<SubagentPool>,
    federation: Option<Arc<FederationClient>>,
    federation_server: Option<FederationServer>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            state_path: None,
            store: None,
            provider: None,
            system_prompt: None,
            tool_factory: None,
        }
    }

    /// Fire-and-forget: enqueue the message for its session actor.
    pub fn submit(&self, mut msg: InboundMessage) -> Result<()> {
        self.normalize(&mut msg);
        let key = msg.session_id.clone();
        self.actors.submit(&key, ActorPayload::ProcessMessage(msg))
    }

    /// Enqueue and wait for the handler's final text.
    pub async fn ask(&self, mut msg: InboundMessage) -> Result<String> {
        self.normalize(&mut msg);
        let key = msg.session_id.clone();
        self.actors.ask(&key, ActorPayload::ProcessMessage(msg)).await
    }

    /// Take the outbound receiver. Yields `None` after the first call.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound_rx.lock().take()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    pub fn subagents(&self) -> &Arc<SubagentPool> {
        &self.pool
    }

    pub fn federation(&self) -> Option<&Arc<FederationClient>> {
        self.federation.as_ref()
    }

    /// Bind the federation server (when federation is enabled) and return
    /// the bound address.
    pub async fn serve_federation(&self, addr: &str) -> Result<std::net::SocketAddr> {
        match &self.federation_server {
            Some(server) => server.bind(addr).await,
            None => Err(Error::Config("federation is disabled".into())),
        }
    }

    /// Graceful shutdown: sweeps stop, the actor system drains, pool
    /// workers and federation tasks observe cancellation.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        self.actors.stop(grace).await;
        self.pool.stop(grace).await;
        if let Some(client) = &self.federation {
            client.stop(grace).await;
        }
        if let Some(server) = &self.federation_server {
            server.stop(grace).await;
        }
        tracing::info!("engine stopped");
    }

    fn normalize(&self, msg: &mut InboundMessage) {
        if msg.request_id.is_empty() {
            msg.request_id = self.shared.ids.next();
        }
        msg.created_at.get_or_insert_with(chrono::Utc::now);
        if msg.session_id.is_empty() {
            msg.session_id = format!("{}:{}", msg.channel, msg.chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_providers::ScriptedProvider;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(Config::default())
            .state_path(dir.path())
            .provider(Arc::new(ScriptedProvider::new()))
            .build()
            .unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn ask_returns_provider_reply() {
        let (_dir, engine) = engine();
        let reply = engine
            .ask(InboundMessage::new("cli", "local", "user", "hello"))
            .await
            .unwrap();
        assert_eq!(reply, "ok");
        engine.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn session_id_defaults_to_channel_and_chat() {
        let (_dir, engine) = engine();
        engine
            .ask(InboundMessage::new("telegram", "42", "user", "hi"))
            .await
            .unwrap();
        let record = engine.store().sessions.get("telegram:42").unwrap();
        assert_eq!(record.last_channel.as_deref(), Some("telegram"));
        engine.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn replayed_request_id_is_answered_from_the_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(sb_providers::ScriptedReply::Text("first answer".into()));
        let engine = Engine::builder(Config::default())
            .state_path(dir.path())
            .provider(provider.clone())
            .build()
            .unwrap();

        let mut msg = InboundMessage::new("cli", "local", "user", "question");
        msg.request_id = "req-1".into();
        let first = engine.ask(msg.clone()).await.unwrap();
        assert_eq!(first, "first answer");

        // A webhook retry replays the same request id: no new turn runs.
        let second = engine.ask(msg).await.unwrap();
        assert_eq!(second, "first answer");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(engine.store().turns.window("cli:local", 10).len(), 2);

        engine.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn take_outbound_yields_once() {
        let (_dir, engine) = engine();
        assert!(engine.take_outbound().is_some());
        assert!(engine.take_outbound().is_none());
        engine.stop(Duration::from_millis(500)).await;
    }

    #[test]
    fn build_without_provider_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Engine::builder(Config::default())
            .state_path(dir.path())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_config_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.runtime.mailbox_size = 0;
        let err = Engine::builder(config)
            .state_path(dir.path())
            .provider(Arc::new(ScriptedProvider::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
