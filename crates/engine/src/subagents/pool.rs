//! Bounded worker pool for background runs.
//!
//! A fixed set of workers pops run ids from a bounded queue; all run
//! state lives on the persisted record, so retry counters survive a
//! restart. Requeues after a failure happen through a detached
//! sleep-then-send task, keeping the worker slot free during backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use sb_domain::config::SubagentsConfig;
use sb_domain::error::{Error, Result};
use sb_domain::message::{
    InboundMessage, OutboundMessage, META_SOURCE, SOURCE_SUBAGENT, SOURCE_SUBAGENT_REINJECTED,
};
use sb_store::{ContextPacket, RunStatus, SubagentRun};
use sb_tools::ToolContext;

use crate::state::Shared;
use crate::subagents::task::{self, TaskSpec};
use crate::tools_builtin;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a caller hands to [`SubagentPool::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct SubagentRequest {
    pub session_id: String,
    pub channel: String,
    pub chat_id: String,
    pub task: String,
    pub label: Option<String>,
    pub context: ContextPacket,
    /// `None` uses the pool default.
    pub timeout_sec: Option<u64>,
    /// `None` uses the pool default.
    pub max_attempts: Option<u32>,
    pub depth: u32,
    /// `None` places artifacts under `<artifact_root>/<run_id>`.
    pub artifact_dir: Option<PathBuf>,
}

/// Callback that feeds a completion summary back into the engine as a new
/// inbound message.
pub type Reinjector = dyn Fn(InboundMessage) + Send + Sync;

enum RunEnd {
    Succeeded(String),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

pub struct SubagentPool {
    shared: Arc<Shared>,
    config: SubagentsConfig,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    reinjector: RwLock<Option<Arc<Reinjector>>>,
}

impl SubagentPool {
    /// Spawn the worker set and return the pool handle.
    pub fn start(shared: Arc<Shared>) -> Arc<Self> {
        let config = shared.config.runtime.subagents.clamped();
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue.max(1));

        let pool = Arc::new(Self {
            shared,
            config: config.clone(),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            reinjector: RwLock::new(None),
        });

        for worker_id in 0..config.max_concurrent {
            let worker = pool.clone();
            pool.tracker
                .spawn(async move { worker.worker_loop(worker_id).await });
        }
        tracing::info!(
            workers = config.max_concurrent,
            queue = config.max_queue,
            "subagent pool started"
        );
        pool
    }

    /// Install the completion-reinjection callback (wired by the engine).
    pub fn set_reinjector(&self, reinjector: Arc<Reinjector>) {
        *self.reinjector.write() = Some(reinjector);
    }

    pub fn queued_runs(&self) -> usize {
        self.shared
            .store
            .subagent_runs
            .count_in_status(RunStatus::Queued)
    }

    pub fn active_runs(&self) -> usize {
        self.shared
            .store
            .subagent_runs
            .count_in_status(RunStatus::Running)
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Validate, persist as `queued`, and hand the run to the workers.
    pub fn enqueue(&self, req: SubagentRequest) -> Result<SubagentRun> {
        if !self.config.enabled {
            return Err(Error::InvalidRequest("subagents are disabled".into()));
        }
        if req.task.trim().is_empty() {
            return Err(Error::InvalidRequest("task must not be empty".into()));
        }
        if req.depth > self.config.max_depth {
            return Err(Error::InvalidRequest(format!(
                "subagent depth {} exceeds limit {}",
                req.depth, self.config.max_depth
            )));
        }
        if self.queue_tx.capacity() == 0 {
            return Err(Error::QueueFull);
        }

        let id = self.shared.ids.next();
        let artifact_dir = req
            .artifact_dir
            .unwrap_or_else(|| self.artifact_root().join(&id));

        let run = SubagentRun {
            id: id.clone(),
            session_id: req.session_id,
            channel: req.channel,
            chat_id: req.chat_id,
            task: req.task,
            label: req.label,
            status: RunStatus::Queued,
            attempt: 0,
            max_attempts: req.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            timeout_sec: req.timeout_sec.unwrap_or(self.config.default_timeout_sec),
            depth: req.depth,
            artifact_dir,
            context: req.context,
            result: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            notified: false,
        };
        self.shared.store.subagent_runs.insert(run.clone());
        self.shared
            .store
            .subagent_runs
            .append_event(&id, "queued", "run created");

        if self.queue_tx.try_send(id.clone()).is_err() {
            // Lost the capacity race; the record reflects the rejection.
            self.shared.store.subagent_runs.update(&id, |r| {
                r.error = Some("queue full".into());
                r.finish(RunStatus::Failed);
            });
            return Err(Error::QueueFull);
        }
        tracing::debug!(run_id = %id, "subagent run enqueued");
        Ok(run)
    }

    /// Block until every requested run is terminal or the timeout elapses.
    /// Returns the latest known state for each id that exists.
    pub async fn wait(&self, run_ids: &[String], timeout: Duration) -> Vec<SubagentRun> {
        let deadline = Instant::now() + timeout;
        loop {
            let runs: Vec<SubagentRun> = run_ids
                .iter()
                .filter_map(|id| self.shared.store.subagent_runs.get(id))
                .collect();

            let settled =
                runs.len() == run_ids.len() && runs.iter().all(|r| r.status.is_terminal());
            let remaining = deadline.saturating_duration_since(Instant::now());
            if settled || remaining.is_zero() {
                return runs;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(remaining)).await;
        }
    }

    pub fn status(&self, run_id: &str) -> Result<SubagentRun> {
        self.shared
            .store
            .subagent_runs
            .get(run_id)
            .ok_or_else(|| Error::NotFound(format!("subagent run {run_id}")))
    }

    /// The run's outcome; requires a terminal state.
    pub fn result(&self, run_id: &str) -> Result<SubagentRun> {
        let run = self.status(run_id)?;
        if !run.status.is_terminal() {
            return Err(Error::NotTerminal(run_id.to_owned()));
        }
        Ok(run)
    }

    /// Cancel a run. Idempotent on already-terminal runs.
    pub fn cancel(&self, run_id: &str) -> Result<SubagentRun> {
        let run = self.status(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        self.shared
            .store
            .subagent_runs
            .update(run_id, |r| r.finish(RunStatus::Cancelled));
        self.shared
            .store
            .subagent_runs
            .append_event(run_id, "cancelled", "cancel requested");
        self.shared.cancel.cancel(run_id);
        self.notify_terminal(run_id);
        self.status(run_id)
    }

    /// Stop the workers. In-flight runs observe the cancelled context.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("subagent workers outlived grace period");
        }
    }

    // ── Worker protocol ──────────────────────────────────────────────

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let run_id = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                id = async { self.queue_rx.lock().await.recv().await } => match id {
                    Some(id) => id,
                    None => return,
                },
            };
            let span = tracing::info_span!("subagent_run", run_id = %run_id, worker_id);
            self.run_one(&run_id).instrument(span).await;
        }
    }

    async fn run_one(self: &Arc<Self>, run_id: &str) {
        let Some(run) = self.shared.store.subagent_runs.get(run_id) else {
            return;
        };
        if run.status.is_terminal() {
            // Cancelled while queued.
            return;
        }

        let attempt = run.attempt + 1;
        self.shared.store.subagent_runs.update(run_id, |r| {
            r.status = RunStatus::Running;
            r.started_at = Some(chrono::Utc::now());
            r.attempt = attempt;
        });
        self.shared.store.subagent_runs.append_event(
            run_id,
            "running",
            &format!("attempt {attempt} of {}", run.max_attempts),
        );

        let token = self.shared.cancel.register(run_id);
        let registry = tools_builtin::build_task_registry(
            &self.shared,
            self,
            ToolContext {
                channel: run.channel.clone(),
                chat_id: run.chat_id.clone(),
                session_id: run.session_id.clone(),
                sender_id: "subagent".into(),
                subagent_depth: run.depth,
                allow_writes: self.config.allow_writes,
            },
        );
        let spec = TaskSpec {
            run_id,
            session_id: &run.session_id,
            scope: format!("subagent:{run_id}"),
            task: &run.task,
            context: &run.context,
            deadline: Instant::now() + Duration::from_secs(run.timeout_sec),
        };

        let end = tokio::select! {
            _ = self.shutdown.cancelled() => RunEnd::Cancelled,
            _ = token.cancelled() => RunEnd::Cancelled,
            outcome = task::execute_task(&self.shared, &registry, spec) => match outcome {
                Ok(output) => RunEnd::Succeeded(output),
                Err(Error::Timeout(msg)) => RunEnd::TimedOut(msg),
                Err(e) => RunEnd::Failed(e.to_string()),
            },
        };
        self.shared.cancel.remove(run_id);

        match end {
            RunEnd::Succeeded(output) => {
                let artifact_paths = self.write_artifacts(run_id, &output);
                let summary = task::summarize(&output);
                self.shared.store.subagent_runs.update(run_id, |r| {
                    r.result = Some(sb_store::subagents::SubagentResult {
                        summary: summary.clone(),
                        output: output.clone(),
                        artifact_paths: artifact_paths.clone(),
                    });
                    r.finish(RunStatus::Succeeded);
                });
                self.shared
                    .store
                    .subagent_runs
                    .append_event(run_id, "succeeded", &summary);
                self.notify_terminal(run_id);
            }
            RunEnd::Failed(message) | RunEnd::TimedOut(message)
                if attempt < run.max_attempts =>
            {
                self.shared.counters.subagent_retry();
                self.shared.store.subagent_runs.update(run_id, |r| {
                    r.status = RunStatus::Queued;
                    r.started_at = None;
                    r.error = Some(message.clone());
                });
                self.shared.store.subagent_runs.append_event(
                    run_id,
                    "retrying",
                    &format!(
                        "attempt {attempt} failed ({message}); backoff {}s",
                        self.config.retry_backoff_sec
                    ),
                );
                self.requeue_after_backoff(run_id.to_owned());
            }
            RunEnd::Failed(message) => {
                self.finish_with_error(run_id, RunStatus::Failed, &message);
            }
            RunEnd::TimedOut(message) => {
                self.finish_with_error(run_id, RunStatus::TimedOut, &message);
            }
            RunEnd::Cancelled => {
                // An external cancel already wrote the terminal state; the
                // pool-stop path writes it here.
                let still_open = self
                    .shared
                    .store
                    .subagent_runs
                    .get(run_id)
                    .is_some_and(|r| !r.status.is_terminal());
                if still_open {
                    self.shared
                        .store
                        .subagent_runs
                        .update(run_id, |r| r.finish(RunStatus::Cancelled));
                    self.shared
                        .store
                        .subagent_runs
                        .append_event(run_id, "cancelled", "run cancelled");
                }
                self.notify_terminal(run_id);
            }
        }
    }

    fn finish_with_error(&self, run_id: &str, status: RunStatus, message: &str) {
        self.shared.store.subagent_runs.update(run_id, |r| {
            r.error = Some(message.to_owned());
            r.finish(status);
        });
        self.shared
            .store
            .subagent_runs
            .append_event(run_id, status.as_str(), message);
        self.notify_terminal(run_id);
    }

    fn requeue_after_backoff(self: &Arc<Self>, run_id: String) {
        let pool = self.clone();
        let backoff = Duration::from_secs(self.config.retry_backoff_sec);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = pool.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            if pool.queue_tx.try_send(run_id.clone()).is_err() {
                pool.finish_with_error(&run_id, RunStatus::Failed, "queue full on retry");
            }
        });
    }

    fn write_artifacts(&self, run_id: &str, output: &str) -> Vec<String> {
        let Some(run) = self.shared.store.subagent_runs.get(run_id) else {
            return Vec::new();
        };
        if let Err(e) = std::fs::create_dir_all(&run.artifact_dir) {
            tracing::warn!(run_id, error = %e, "failed to create artifact dir");
            return Vec::new();
        }

        let mut paths = Vec::new();
        let result_path = run.artifact_dir.join("result.txt");
        match std::fs::write(&result_path, output) {
            Ok(()) => paths.push(result_path.display().to_string()),
            Err(e) => tracing::warn!(run_id, error = %e, "failed to write result artifact"),
        }

        let context_path = run.artifact_dir.join("context.json");
        let context_json = serde_json::to_vec_pretty(&run.context).unwrap_or_default();
        match std::fs::write(&context_path, context_json) {
            Ok(()) => paths.push(context_path.display().to_string()),
            Err(e) => tracing::warn!(run_id, error = %e, "failed to write context artifact"),
        }
        paths
    }

    fn notify_terminal(&self, run_id: &str) {
        if !self.config.notify_on_complete {
            return;
        }
        let Some(run) = self.shared.store.subagent_runs.get(run_id) else {
            return;
        };
        if !run.status.is_terminal() {
            return;
        }
        // Exactly one notification per run.
        if !self.shared.store.subagent_runs.mark_notified(run_id) {
            return;
        }

        let name = run.label.clone().unwrap_or_else(|| run.id.clone());
        let detail = run
            .result
            .as_ref()
            .map(|r| r.summary.clone())
            .or_else(|| run.error.clone())
            .unwrap_or_default();
        let text = format!("Subagent {name} {}: {detail}", run.status.as_str());

        self.shared.outbound.send(
            OutboundMessage::reply(&run.channel, &run.chat_id, &text, &run.session_id)
                .with_completion(SOURCE_SUBAGENT, run_id, run.status.as_str()),
        );

        if self.config.reinject_on_complete {
            if let Some(reinject) = self.reinjector.read().clone() {
                let mut msg = InboundMessage::new(&run.channel, &run.chat_id, "subagent", text);
                msg.session_id = run.session_id.clone();
                msg.metadata.insert(
                    META_SOURCE.into(),
                    serde_json::Value::String(SOURCE_SUBAGENT_REINJECTED.into()),
                );
                reinject.as_ref()(msg);
            }
        }
    }

    fn artifact_root(&self) -> PathBuf {
        if self.config.artifact_root.is_absolute() {
            self.config.artifact_root.clone()
        } else {
            self.shared.store.state_path().join(&self.config.artifact_root)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil;
    use sb_providers::{ScriptedProvider, ScriptedReply};

    fn request(task: &str) -> SubagentRequest {
        SubagentRequest {
            session_id: "s1".into(),
            channel: "telegram".into(),
            chat_id: "c1".into(),
            task: task.into(),
            depth: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_reaches_succeeded_with_artifacts() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(ScriptedReply::Text("computed 42".into()));
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider, |_| {});
        let pool = SubagentPool::start(shared.clone());

        let run = pool.enqueue(request("compute")).unwrap();
        let runs = pool
            .wait(&[run.id.clone()], Duration::from_secs(5))
            .await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);

        let result = runs[0].result.as_ref().unwrap();
        assert_eq!(result.output, "computed 42");
        assert_eq!(result.summary, "computed 42");
        assert_eq!(result.artifact_paths.len(), 2);
        for path in &result.artifact_paths {
            assert!(std::path::Path::new(path).exists());
        }

        // Audit trail: creation event plus a terminal event.
        let events = shared.store.subagent_runs.events(&run.id);
        assert_eq!(events.first().unwrap().event_type, "queued");
        assert_eq!(events.last().unwrap().event_type, "succeeded");

        pool.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn failed_run_retries_then_exhausts() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(ScriptedReply::Error("boom 1".into()));
        provider.push(ScriptedReply::Error("boom 2".into()));
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider, |config| {
            config.runtime.subagents.max_attempts = 2;
            config.runtime.subagents.retry_backoff_sec = 0;
        });
        let pool = SubagentPool::start(shared.clone());

        let run = pool.enqueue(request("explode")).unwrap();
        let runs = pool
            .wait(&[run.id.clone()], Duration::from_secs(5))
            .await;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].attempt, 2);
        assert!(runs[0].error.as_deref().unwrap().contains("boom 2"));
        assert_eq!(shared.counters.snapshot().subagent_retries, 1);

        pool.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn hanging_run_times_out() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(ScriptedReply::Hang);
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider, |config| {
            config.runtime.subagents.max_attempts = 1;
        });
        let pool = SubagentPool::start(shared.clone());

        let mut req = request("hang");
        req.timeout_sec = Some(0);
        let run = pool.enqueue(req).unwrap();
        let runs = pool
            .wait(&[run.id.clone()], Duration::from_secs(5))
            .await;
        assert_eq!(runs[0].status, RunStatus::TimedOut);

        pool.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn cancel_while_running_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(ScriptedReply::Hang);
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider, |config| {
            config.runtime.subagents.max_attempts = 3;
        });
        let pool = SubagentPool::start(shared.clone());

        let run = pool.enqueue(request("hang forever")).unwrap();
        // Let the worker pick it up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.status(&run.id).unwrap().status, RunStatus::Running);

        let cancelled = pool.cancel(&run.id).unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        // Cancel is idempotent, and the run never resurrects.
        let again = pool.cancel(&run.id).unwrap();
        assert_eq!(again.status, RunStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.status(&run.id).unwrap().status, RunStatus::Cancelled);
        assert_eq!(pool.status(&run.id).unwrap().attempt, 1);

        pool.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn depth_above_limit_is_rejected() {
        let (_dir, shared, _rx) = testutil::test_shared(|config| {
            config.runtime.subagents.max_depth = 2;
        });
        let pool = SubagentPool::start(shared);
        let mut req = request("too deep");
        req.depth = 3;
        let err = pool.enqueue(req).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        pool.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn full_queue_rejects_with_queue_full() {
        let provider = Arc::new(ScriptedProvider::new().with_default(ScriptedReply::Hang));
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider, |config| {
            config.runtime.subagents.max_concurrent = 1;
            config.runtime.subagents.max_queue = 1;
        });
        let pool = SubagentPool::start(shared);

        // First run occupies the worker, second fills the queue.
        pool.enqueue(request("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.enqueue(request("b")).unwrap();

        let err = pool.enqueue(request("c")).unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        pool.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn completion_emits_outbound_notification() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push(ScriptedReply::Text("all done".into()));
        let (_dir, shared, mut outbound_rx) = testutil::shared_with_provider(provider, |_| {});
        let pool = SubagentPool::start(shared);

        let run = pool.enqueue(request("notify me")).unwrap();
        pool.wait(&[run.id.clone()], Duration::from_secs(5)).await;

        let out = outbound_rx.recv().await.unwrap();
        assert_eq!(out.channel, "telegram");
        assert!(out.content.contains("succeeded"));
        assert_eq!(out.metadata["source"], "subagent");
        assert_eq!(out.metadata["run_id"], run.id.as_str());
        assert_eq!(out.metadata["status"], "succeeded");

        pool.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn fanout_respects_bounded_concurrency() {
        let provider = Arc::new(
            ScriptedProvider::new().with_delay(Duration::from_millis(200)),
        );
        let (_dir, shared, _rx) = testutil::shared_with_provider(provider.clone(), |config| {
            config.runtime.subagents.max_concurrent = 4;
        });
        let pool = SubagentPool::start(shared);

        let started = Instant::now();
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(pool.enqueue(request(&format!("task {i}"))).unwrap().id);
        }
        let runs = pool.wait(&ids, Duration::from_secs(10)).await;
        let elapsed = started.elapsed();

        assert_eq!(runs.len(), 8);
        assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
        assert_eq!(provider.call_count(), 8);
        // 8 tasks of 200 ms on 4 workers: ideal 400 ms; allow 3x.
        assert!(
            elapsed <= Duration::from_millis(1200),
            "fanout took {elapsed:?}"
        );

        pool.stop(Duration::from_millis(500)).await;
    }
}
