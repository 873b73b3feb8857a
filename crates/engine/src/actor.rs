//! Keyed mailboxes: per-session serialization with idle eviction.
//!
//! Requests with the same key are processed one at a time, in submission
//! order, by a handler built lazily on first submission. Each mailbox
//! runs a worker that reads envelopes, invokes the handler, and delivers
//! the result on the envelope's reply channel. When the idle timer fires
//! the worker removes its own map entry, drops its sender, and then
//! drains the receiver to completion: a submit that raced the eviction
//! is still processed, because `recv()` only returns `None` once every
//! sender clone is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sb_domain::error::{Error, Result};
use sb_domain::message::InboundMessage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload & handler contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The tagged payload an actor processes. Today only message processing;
/// the variant leaves room for future kinds.
pub enum ActorPayload {
    ProcessMessage(InboundMessage),
}

/// The per-key handler driven by a mailbox worker.
#[async_trait::async_trait]
pub trait ActorHandler: Send {
    /// Handle one payload. `shutdown` fires when the system is stopping;
    /// long operations should observe it.
    async fn handle(
        &mut self,
        payload: ActorPayload,
        shutdown: &CancellationToken,
    ) -> Result<String>;
}

/// Builds a handler for a key on first submission.
pub type HandlerFactory = dyn Fn(&str) -> Box<dyn ActorHandler> + Send + Sync;

/// Observability callback invoked with the actor key.
pub type ActorHook = dyn Fn(&str) + Send + Sync;

struct Envelope {
    payload: ActorPayload,
    reply: Option<oneshot::Sender<Result<String>>>,
}

#[derive(Default)]
struct Hooks {
    on_spawn: Option<Arc<ActorHook>>,
    on_evict: Option<Arc<ActorHook>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    mailboxes: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    factory: Box<HandlerFactory>,
    mailbox_size: usize,
    idle_ttl: Duration,
    hooks: RwLock<Hooks>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct ActorSystem {
    inner: Arc<Inner>,
}

impl ActorSystem {
    pub fn new(
        factory: Box<HandlerFactory>,
        mailbox_size: usize,
        idle_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                mailboxes: Mutex::new(HashMap::new()),
                factory,
                mailbox_size: mailbox_size.max(1),
                idle_ttl,
                hooks: RwLock::new(Hooks::default()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Install spawn/evict hooks, each invoked exactly once per mailbox
    /// lifecycle.
    pub fn set_hooks(&self, on_spawn: Arc<ActorHook>, on_evict: Arc<ActorHook>) {
        let mut hooks = self.inner.hooks.write();
        hooks.on_spawn = Some(on_spawn);
        hooks.on_evict = Some(on_evict);
    }

    /// Fire-and-forget submission.
    pub fn submit(&self, key: &str, payload: ActorPayload) -> Result<()> {
        self.send(key, payload, None)
    }

    /// Submit and wait for the handler's result.
    pub async fn ask(&self, key: &str, payload: ActorPayload) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(key, payload, Some(tx))?;
        rx.await
            .map_err(|_| Error::ActorTerminated(key.to_owned()))?
    }

    /// Number of live mailboxes.
    pub fn active_actors(&self) -> usize {
        self.inner.mailboxes.lock().len()
    }

    /// Drain mailboxes within `grace`. Running handlers see the cancelled
    /// shutdown token.
    pub async fn stop(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.mailboxes.lock().clear();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "actor workers outlived grace period");
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn send(
        &self,
        key: &str,
        payload: ActorPayload,
        reply: Option<oneshot::Sender<Result<String>>>,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ActorTerminated(key.to_owned()));
        }

        let mut envelope = Envelope { payload, reply };
        // A send that finds a closed mailbox retries once against a
        // freshly spawned actor.
        for _ in 0..2 {
            let tx = self.sender_for(key);
            match tx.try_send(envelope) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(Error::MailboxFull(key.to_owned()));
                }
                Err(mpsc::error::TrySendError::Closed(env)) => {
                    envelope = env;
                    let mut mailboxes = self.inner.mailboxes.lock();
                    if mailboxes.get(key).is_some_and(|t| t.same_channel(&tx)) {
                        mailboxes.remove(key);
                    }
                }
            }
        }
        Err(Error::ActorTerminated(key.to_owned()))
    }

    fn sender_for(&self, key: &str) -> mpsc::Sender<Envelope> {
        let mut mailboxes = self.inner.mailboxes.lock();
        if let Some(tx) = mailboxes.get(key) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.mailbox_size);
        mailboxes.insert(key.to_owned(), tx.clone());
        drop(mailboxes);

        if let Some(on_spawn) = self.inner.hooks.read().on_spawn.clone() {
            on_spawn.as_ref()(key);
        }
        tracing::debug!(key, "actor spawned");

        let handler = (self.inner.factory)(key);
        self.inner.tracker.spawn(worker_loop(
            self.inner.clone(),
            key.to_owned(),
            tx.clone(),
            rx,
            handler,
        ));
        tx
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    key: String,
    self_tx: mpsc::Sender<Envelope>,
    mut rx: mpsc::Receiver<Envelope>,
    mut handler: Box<dyn ActorHandler>,
) {
    let idle = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break false,
            env = rx.recv() => match env {
                Some(env) => deliver(&mut handler, env, &inner.shutdown).await,
                None => break false,
            },
            _ = tokio::time::sleep(inner.idle_ttl) => break true,
        }
    };

    if idle {
        // Remove our entry unless a newer mailbox already replaced it.
        {
            let mut mailboxes = inner.mailboxes.lock();
            if mailboxes.get(&key).is_some_and(|t| t.same_channel(&self_tx)) {
                mailboxes.remove(&key);
            }
        }
        drop(self_tx);
        // Drain submissions that raced the eviction; recv() returns None
        // once every transient sender clone is gone.
        while let Some(env) = rx.recv().await {
            deliver(&mut handler, env, &inner.shutdown).await;
        }
    } else {
        // Shutdown or cleared map: drain what is already queued so the
        // grace period can empty mailboxes. Handlers see the cancelled
        // token and are expected to return promptly.
        while let Ok(env) = rx.try_recv() {
            deliver(&mut handler, env, &inner.shutdown).await;
        }
    }

    if let Some(on_evict) = inner.hooks.read().on_evict.clone() {
        on_evict.as_ref()(&key);
    }
    tracing::debug!(key, "actor evicted");
}

async fn deliver(
    handler: &mut Box<dyn ActorHandler>,
    env: Envelope,
    shutdown: &CancellationToken,
) {
    let result = handler.handle(env.payload, shutdown).await;
    match env.reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "actor handler failed");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
