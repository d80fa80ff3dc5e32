//! Composition root: admission → history context → generation → history
//! append → release → metrics.
//!
//! The RAG pipeline itself is an external collaborator consumed through
//! [`AnswerGenerator`]; this module wraps it with admission control and
//! session bookkeeping and guarantees the admission slot is released exactly
//! once whatever the downstream outcome.

use crate::admission::AdmissionController;
use crate::metrics::{AggregateStats, MetricsRecorder};
use crate::session::{Message, SessionInfo, SessionStore, SessionStoreStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use usher_common::{Config, Error, Result};
use uuid::Uuid;

/// Metric tag for end-to-end query handling.
pub const OP_QUERY: &str = "query";

// ============================================================================
// External collaborator seams
// ============================================================================

/// Output of the downstream RAG/LLM pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    /// Generated answer text.
    pub text: String,
    /// Reference identifiers the answer was grounded on.
    pub sources: Vec<String>,
}

/// The retrieval + generation pipeline consumed by this core.
///
/// Invoked once per admitted request, inside the running ticket's lifetime.
/// Implementations own their own cancellation and timeout behavior.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Produce an answer for `query` given the selected history context.
    async fn retrieve_and_generate(
        &self,
        query: &str,
        history: &[Message],
    ) -> anyhow::Result<GeneratedAnswer>;
}

/// Health probe result for one collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the collaborator considers itself usable.
    pub healthy: bool,
    /// Human-readable detail.
    pub detail: String,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// A passing probe.
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    /// A failing probe.
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }
}

/// Capability interface for anything that can report its health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe the collaborator.
    async fn check_health(&self) -> HealthStatus;
}

// ============================================================================
// Answers and status
// ============================================================================

/// Result of one submitted query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Generated answer text.
    pub text: String,
    /// Reference identifiers the answer was grounded on.
    pub sources: Vec<String>,
    /// Session the exchange was recorded under.
    pub session_id: String,
    /// End-to-end handling time, admission wait included.
    pub processing_time: Duration,
}

/// Combined point-in-time view of the whole core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Admission occupancy and counters.
    pub admission: crate::admission::AdmissionSnapshot,
    /// Session store counters.
    pub sessions: SessionStoreStats,
    /// End-to-end query statistics over the configured window.
    pub query_stats: AggregateStats,
}

/// Aggregated health over all registered collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// True when every component probe passed.
    pub healthy: bool,
    /// Per-component probe results.
    pub components: Vec<(String, HealthStatus)>,
}

// ============================================================================
// Query system
// ============================================================================

struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the admission controller, session store, metrics recorder, and the
/// generator collaborator. One instance per process; tests build as many
/// independent instances as they need.
pub struct QuerySystem {
    config: Config,
    admission: AdmissionController,
    sessions: Arc<SessionStore>,
    recorder: Arc<MetricsRecorder>,
    generator: Arc<dyn AnswerGenerator>,
    health_targets: Vec<(String, Arc<dyn HealthCheck>)>,
    sweeper: std::sync::Mutex<Option<SweeperHandle>>,
}

impl QuerySystem {
    /// Build the core from configuration and the generation collaborator.
    pub fn new<G>(config: Config, generator: Arc<G>) -> Result<Self>
    where
        G: AnswerGenerator + HealthCheck + 'static,
    {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        let recorder = Arc::new(MetricsRecorder::new(&config.metrics));
        let admission = AdmissionController::new(config.admission.clone(), recorder.clone())?;
        let sessions = Arc::new(SessionStore::new(&config.session));
        let health_target: Arc<dyn HealthCheck> = generator.clone();
        Ok(Self {
            config,
            admission,
            sessions,
            recorder,
            generator,
            health_targets: vec![("generator".to_string(), health_target)],
            sweeper: std::sync::Mutex::new(None),
        })
    }

    /// Answer a query within one admitted request.
    ///
    /// Composes admit → select history context → generate → append exchange →
    /// release → record. Backpressure errors surface synchronously; the
    /// admission slot is released exactly once on every path.
    pub async fn submit_query(&self, session_id: &str, query: &str) -> Result<Answer> {
        let started = tokio::time::Instant::now();
        let request_id = Uuid::new_v4();

        let permit = match self.admission.admit(request_id).await {
            Ok(permit) => permit,
            Err(err) => {
                self.recorder.record(OP_QUERY, started.elapsed(), false);
                return Err(err);
            }
        };

        let context = self.sessions.select_relevant(
            session_id,
            query,
            self.config.session.max_context_messages,
        );
        debug!(
            request_id = %request_id,
            session_id,
            context_len = context.len(),
            "dispatching to generator"
        );

        match self.generator.retrieve_and_generate(query, &context).await {
            Ok(generated) => {
                self.sessions
                    .append(session_id, Message::user(session_id, query))?;
                self.sessions.append(
                    session_id,
                    Message::assistant(session_id, &generated.text, generated.sources.clone()),
                )?;
                permit.complete();
                let processing_time = started.elapsed();
                self.recorder.record(OP_QUERY, processing_time, true);
                Ok(Answer {
                    text: generated.text,
                    sources: generated.sources,
                    session_id: session_id.to_string(),
                    processing_time,
                })
            }
            Err(err) => {
                permit.fail();
                self.recorder.record(OP_QUERY, started.elapsed(), false);
                error!(request_id = %request_id, session_id, "generation failed: {err:#}");
                Err(Error::Generation(err.to_string()))
            }
        }
    }

    /// Drop a session and all of its history.
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.clear(session_id);
    }

    /// Conversation history for a session, most recent `limit` messages.
    /// A `limit` of zero means no limit.
    pub fn get_history(&self, session_id: &str, limit: usize) -> Vec<Message> {
        self.sessions.get_history(session_id, limit)
    }

    /// Summaries of known sessions, newest activity first.
    pub fn list_sessions(&self, active_only: bool) -> Vec<SessionInfo> {
        self.sessions.list_sessions(active_only)
    }

    /// End-to-end query statistics over the configured metrics window.
    pub fn get_system_metrics(&self) -> AggregateStats {
        self.recorder.get_stats(Some(OP_QUERY), self.config.metrics.window())
    }

    /// Combined admission/session/query status.
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            admission: self.admission.snapshot(),
            sessions: self.sessions.stats(),
            query_stats: self.get_system_metrics(),
        }
    }

    /// Probe every registered collaborator.
    pub async fn health(&self) -> SystemHealth {
        let mut components = Vec::with_capacity(self.health_targets.len());
        for (name, target) in &self.health_targets {
            components.push((name.clone(), target.check_health().await));
        }
        SystemHealth {
            healthy: components.iter().all(|(_, status)| status.healthy),
            components,
        }
    }

    /// The admission controller, for runtime reconfiguration and
    /// cancellation.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// The session store, for direct maintenance entry points.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Start the periodic retention sweep.
    ///
    /// Runs independently of request traffic so idle sessions still age out.
    /// Idempotent; a second call replaces nothing and does nothing.
    pub fn start_retention_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        let interval = self.config.session.cleanup_interval();
        let sessions = self.sessions.clone();
        let recorder = self.recorder.clone();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick is not a sweep
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let sessions_evicted = sessions.evict_expired(now);
                        let samples_pruned = recorder.prune(now);
                        debug!(sessions_evicted, samples_pruned, "retention sweep finished");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *slot = Some(SweeperHandle { shutdown, task });
        info!(interval_secs = interval.as_secs(), "retention sweeper started");
    }

    /// Stop the retention sweeper, if running, and wait for it to exit.
    pub async fn shutdown(&self) {
        let handle = {
            let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
            slot.take()
        };
        if let Some(SweeperHandle { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            let _ = task.await;
            info!("retention sweeper stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageRole;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Generator stub: canned answer, optional delay, optional failure.
    struct StubGenerator {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubGenerator {
        fn new() -> Self {
            Self {
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl AnswerGenerator for StubGenerator {
        async fn retrieve_and_generate(
            &self,
            query: &str,
            history: &[Message],
        ) -> anyhow::Result<GeneratedAnswer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                anyhow::bail!("model backend unreachable");
            }
            Ok(GeneratedAnswer {
                text: format!("answer to '{query}' with {} context messages", history.len()),
                sources: vec!["doc-1".to_string()],
            })
        }
    }

    #[async_trait]
    impl HealthCheck for StubGenerator {
        async fn check_health(&self) -> HealthStatus {
            if self.fail {
                HealthStatus::unhealthy("backend unreachable")
            } else {
                HealthStatus::healthy("ok")
            }
        }
    }

    fn system(generator: StubGenerator) -> QuerySystem {
        QuerySystem::new(Config::default(), Arc::new(generator)).unwrap()
    }

    #[tokio::test]
    async fn test_submit_query_records_exchange() {
        let system = system(StubGenerator::new());
        let answer = system.submit_query("s1", "what is usher?").await.unwrap();
        assert!(answer.text.contains("what is usher?"));
        assert_eq!(answer.sources, vec!["doc-1".to_string()]);

        let history = system.get_history("s1", 0);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].sources, vec!["doc-1".to_string()]);

        let stats = system.get_system_metrics();
        assert_eq!(stats.count, 1);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_generation_failure_releases_slot_and_keeps_history_clean() {
        let system = system(StubGenerator::failing());
        let err = system.submit_query("s1", "q").await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));

        // Failed exchanges are not recorded in history
        assert!(system.get_history("s1", 0).is_empty());

        // The slot was released; the next query is admitted
        let status = system.status();
        assert_eq!(status.admission.running, 0);
        assert_eq!(status.admission.total_failed, 1);
    }

    #[tokio::test]
    async fn test_history_context_grows_across_turns() {
        let system = system(StubGenerator::new());
        system.submit_query("s1", "first").await.unwrap();
        let answer = system.submit_query("s1", "second").await.unwrap();
        // The second turn sees the first exchange as context
        assert!(answer.text.contains("2 context messages"));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let system = system(StubGenerator::new());
        system.submit_query("s1", "q").await.unwrap();
        system.clear_session("s1");
        assert!(system.get_history("s1", 0).is_empty());
    }

    #[tokio::test]
    async fn test_health_aggregation() {
        let healthy = system(StubGenerator::new());
        let report = healthy.health().await;
        assert!(report.healthy);
        assert_eq!(report.components.len(), 1);
        assert_eq!(report.components[0].0, "generator");

        let unhealthy = system(StubGenerator::failing());
        assert!(!unhealthy.health().await.healthy);
    }

    #[tokio::test]
    async fn test_status_reflects_sessions() {
        let system = system(StubGenerator::new());
        system.submit_query("a", "q1").await.unwrap();
        system.submit_query("b", "q2").await.unwrap();

        let status = system.status();
        assert_eq!(status.sessions.total_sessions, 2);
        assert_eq!(status.sessions.total_messages, 4);
        assert_eq!(status.admission.total_completed, 2);
        assert_eq!(system.list_sessions(false).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_sweeper_lifecycle() {
        let mut config = Config::default();
        config.session.cleanup_interval_hours = 1;
        let system = QuerySystem::new(config, Arc::new(StubGenerator::new())).unwrap();

        system.start_retention_sweeper();
        // Starting twice is a no-op
        system.start_retention_sweeper();

        // Let a few virtual sweep intervals elapse
        tokio::time::sleep(Duration::from_secs(3 * 3600 + 10)).await;
        system.shutdown().await;
        // Shutdown again is harmless
        system.shutdown().await;
    }

    mod health_mock {
        use super::*;
        use mockall::mock;

        mock! {
            pub Collaborator {}

            #[async_trait]
            impl HealthCheck for Collaborator {
                async fn check_health(&self) -> HealthStatus;
            }
        }

        #[tokio::test]
        async fn test_health_check_trait_is_mockable() {
            let mut collaborator = MockCollaborator::new();
            collaborator
                .expect_check_health()
                .times(1)
                .returning(|| HealthStatus::unhealthy("probe failed"));

            let status = collaborator.check_health().await;
            assert!(!status.healthy);
            assert_eq!(status.detail, "probe failed");
        }
    }
}
