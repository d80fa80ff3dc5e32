//! Integration tests for the usher core.
//!
//! Exercises the composed system (admission + sessions + metrics around a
//! stub generator) plus the cross-component properties each piece guarantees.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use usher_common::{Config, Error};
use usher_core::{
    AnswerGenerator, GeneratedAnswer, HealthCheck, HealthStatus, Message, QuerySystem,
    SessionStore,
};

/// Stub pipeline: echoes the query after an optional delay.
struct StubGenerator {
    delay: Duration,
    calls: AtomicUsize,
}

impl StubGenerator {
    fn instant() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnswerGenerator for StubGenerator {
    async fn retrieve_and_generate(
        &self,
        query: &str,
        _history: &[Message],
    ) -> anyhow::Result<GeneratedAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        Ok(GeneratedAnswer {
            text: format!("echo: {query}"),
            sources: vec!["stub://doc".to_string()],
        })
    }
}

#[async_trait]
impl HealthCheck for StubGenerator {
    async fn check_health(&self) -> HealthStatus {
        HealthStatus::healthy("stub ready")
    }
}

fn config(max_concurrent: usize, max_queue: usize, rate_per_minute: u32) -> Config {
    let mut config = Config::default();
    config.admission.max_concurrent_requests = max_concurrent;
    config.admission.max_queue_size = max_queue;
    config.admission.rate_limit_per_minute = rate_per_minute;
    config
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission Scenarios
// ─────────────────────────────────────────────────────────────────────────────

/// Two slots and a queue of one: of four concurrent 100ms requests, two run
/// immediately, one queues and later runs, one is rejected with queue-full.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturation_scenario_two_slots_one_queue() {
    let system = Arc::new(
        QuerySystem::new(
            config(2, 1, 10_000),
            Arc::new(StubGenerator::with_delay(Duration::from_millis(100))),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..4 {
        let system = system.clone();
        handles.push(tokio::spawn(async move {
            system.submit_query(&format!("session-{i}"), "question").await
        }));
    }

    // All four arrive well within the generator's 100ms
    tokio::time::sleep(Duration::from_millis(30)).await;
    let mid_flight = system.status().admission;
    assert_eq!(mid_flight.running, 2);
    assert_eq!(mid_flight.queued, 1);

    let mut succeeded = 0;
    let mut queue_full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::QueueFull { .. }) => queue_full += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(succeeded, 3);
    assert_eq!(queue_full, 1);

    let settled = system.status().admission;
    assert_eq!(settled.running, 0);
    assert_eq!(settled.total_completed, 3);
    assert_eq!(settled.total_rejected_queue_full, 1);
}

/// Rate cap of two per minute: the third request in the same minute fails
/// with a positive retry-after.
#[tokio::test]
async fn test_rate_limit_scenario() {
    let system = QuerySystem::new(config(10, 10, 2), Arc::new(StubGenerator::instant())).unwrap();

    system.submit_query("s1", "first").await.unwrap();
    system.submit_query("s1", "second").await.unwrap();

    let err = system.submit_query("s1", "third").await.unwrap_err();
    match err {
        Error::RateLimited { retry_after } => {
            assert!(retry_after > Duration::ZERO);
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected rate limit, got {other}"),
    }
}

/// A queued request waiting past the admission timeout is rejected while the
/// running request keeps its slot.
#[tokio::test(start_paused = true)]
async fn test_queued_request_timeout_scenario() {
    let mut config = config(1, 10, 10_000);
    config.admission.request_timeout_secs = 1;
    let system = Arc::new(
        QuerySystem::new(
            config,
            Arc::new(StubGenerator::with_delay(Duration::from_secs(10))),
        )
        .unwrap(),
    );

    let slow = tokio::spawn({
        let system = system.clone();
        async move { system.submit_query("slow", "q").await }
    });
    tokio::task::yield_now().await;

    let waiter = tokio::spawn({
        let system = system.clone();
        async move { system.submit_query("waiter", "q").await }
    });

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::AdmissionTimeout));

    slow.await.unwrap().unwrap();
    assert_eq!(system.status().admission.total_timed_out, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Session History Properties
// ─────────────────────────────────────────────────────────────────────────────

/// Messages appended to one session never appear in another's history.
#[tokio::test]
async fn test_session_isolation_through_the_service() {
    let system = QuerySystem::new(Config::default(), Arc::new(StubGenerator::instant())).unwrap();

    system.submit_query("alice", "alice's question").await.unwrap();
    system.submit_query("bob", "bob's question").await.unwrap();

    let alice = system.get_history("alice", 0);
    let bob = system.get_history("bob", 0);
    assert!(alice.iter().all(|m| m.session_id == "alice"));
    assert!(bob.iter().all(|m| m.session_id == "bob"));
    assert!(!alice.iter().any(|m| m.content.contains("bob")));
    assert!(!bob.iter().any(|m| m.content.contains("alice")));
}

/// After more appends than the bound, exactly the most recent `max` remain.
#[test]
fn test_history_bound_keeps_most_recent() {
    let mut session = usher_common::SessionConfig::default();
    session.max_history_size = 3;
    let store = SessionStore::new(&session);

    for content in ["M1", "M2", "M3", "M4", "M5"] {
        store.append("s1", Message::user("s1", content)).unwrap();
    }

    let contents: Vec<String> = store
        .get_history("s1", 10)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["M3", "M4", "M5"]);
}

/// Selected context is at most `k` messages, each a verbatim member of the
/// session's history.
#[test]
fn test_select_relevant_is_a_history_subsequence() {
    let store = SessionStore::new(&usher_common::SessionConfig::default());
    for i in 0..20 {
        store
            .append("s1", Message::user("s1", format!("message {i}")))
            .unwrap();
    }

    let history = store.get_history("s1", 0);
    let selected = store.select_relevant("s1", "message", 5);
    assert!(selected.len() <= 5);
    for message in &selected {
        assert!(history.iter().any(|m| m.id == message.id));
    }
}

/// Messages past the retention period disappear from subsequent reads.
#[test]
fn test_retention_eviction() {
    let mut session = usher_common::SessionConfig::default();
    session.retention_period_days = 1;
    let store = SessionStore::new(&session);

    store.append("s1", Message::user("s1", "stale")).unwrap();
    let later = chrono::Utc::now() + chrono::Duration::days(2);
    assert_eq!(store.evict_expired(later), 1);
    assert!(store.get_history("s1", 0).is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end
// ─────────────────────────────────────────────────────────────────────────────

/// A conversation accumulates history, surfaces sources, and reports metrics.
#[tokio::test]
async fn test_conversation_round_trip() {
    let system = QuerySystem::new(Config::default(), Arc::new(StubGenerator::instant())).unwrap();

    let first = system.submit_query("s1", "what is admission control?").await.unwrap();
    assert_eq!(first.text, "echo: what is admission control?");
    assert_eq!(first.sources, vec!["stub://doc".to_string()]);

    system.submit_query("s1", "and backpressure?").await.unwrap();

    let history = system.get_history("s1", 0);
    assert_eq!(history.len(), 4);
    assert!(history[0].sources.is_empty());
    assert_eq!(history[1].sources, vec!["stub://doc".to_string()]);

    let stats = system.get_system_metrics();
    assert_eq!(stats.count, 2);
    assert!((stats.success_rate - 1.0).abs() < 1e-9);

    let health = system.health().await;
    assert!(health.healthy);
}

/// A config file drives the composed system's limits end to end.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_system_built_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usher.json");
    std::fs::write(
        &path,
        r#"{"admission": {"max_concurrent_requests": 1, "max_queue_size": 0, "rate_limit_per_minute": 1000}}"#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    let system = Arc::new(
        QuerySystem::new(
            config,
            Arc::new(StubGenerator::with_delay(Duration::from_millis(80))),
        )
        .unwrap(),
    );

    let busy = tokio::spawn({
        let system = system.clone();
        async move { system.submit_query("s1", "slow question").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One slot, no queue: the second request is shed immediately
    let err = system.submit_query("s2", "eager question").await.unwrap_err();
    assert!(matches!(err, Error::QueueFull { .. }));
    busy.await.unwrap().unwrap();
}

/// Status reporting serializes for whatever transport layer sits above.
#[tokio::test]
async fn test_status_serializes_to_json() {
    let system = QuerySystem::new(Config::default(), Arc::new(StubGenerator::instant())).unwrap();
    system.submit_query("s1", "q").await.unwrap();

    let status = serde_json::to_value(system.status()).unwrap();
    assert_eq!(status["admission"]["total_completed"], 1);
    assert_eq!(status["sessions"]["total_sessions"], 1);
    assert_eq!(status["query_stats"]["count"], 1);
}

/// Hot reconfiguration applies to requests admitted afterwards.
#[tokio::test]
async fn test_runtime_reconfiguration() {
    let system = QuerySystem::new(config(1, 0, 10_000), Arc::new(StubGenerator::instant())).unwrap();

    let mut raised = usher_common::AdmissionConfig::default();
    raised.max_concurrent_requests = 5;
    raised.rate_limit_per_minute = 10_000;
    system.admission().reconfigure(raised).unwrap();

    // With one slot this second concurrent admit would have failed;
    // after the raise both run at once
    let id_a = uuid::Uuid::new_v4();
    let id_b = uuid::Uuid::new_v4();
    let permit_a = system.admission().admit(id_a).await.unwrap();
    let permit_b = system.admission().admit(id_b).await.unwrap();
    assert_eq!(system.status().admission.running, 2);
    permit_a.complete();
    permit_b.complete();
}
