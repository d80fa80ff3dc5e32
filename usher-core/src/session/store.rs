//! In-memory session store with per-session critical sections.
//!
//! Each session owns its own lock, so appends on different sessions never
//! contend while appends on the same session serialize. The map itself is a
//! sharded concurrent map; store operations never hold a map guard and a
//! session lock at the same time.

use super::relevance::{RecencyPolicy, RelevancePolicy};
use super::types::{Message, SessionInfo, SessionStoreStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use usher_common::{Error, Result, SessionConfig};

struct SessionState {
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    messages: VecDeque<Message>,
    /// Set under the lock when the session is dropped from the map, so an
    /// append racing the retention sweep re-inserts instead of writing into
    /// a detached entry.
    retired: bool,
}

struct SessionEntry {
    state: Mutex<SessionState>,
}

impl SessionEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                created_at: now,
                last_activity: now,
                messages: VecDeque::new(),
                retired: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-session conversation history with bounded size and age.
///
/// Sessions are created implicitly on first append and destroyed by
/// [`clear`](SessionStore::clear) or by [`evict_expired`](SessionStore::evict_expired)
/// once every retained message has aged out.
pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionEntry>>,
    max_history_size: usize,
    retention_period: chrono::Duration,
    policy: Arc<dyn RelevancePolicy>,
}

impl SessionStore {
    /// Create a store from configuration with the default recency policy.
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_policy(config, Arc::new(RecencyPolicy))
    }

    /// Create a store with an explicit relevance policy.
    pub fn with_policy(config: &SessionConfig, policy: Arc<dyn RelevancePolicy>) -> Self {
        Self {
            sessions: DashMap::new(),
            max_history_size: config.max_history_size.max(1),
            retention_period: chrono::Duration::from_std(config.retention_period())
                .unwrap_or_else(|_| chrono::Duration::days(30)),
            policy,
        }
    }

    /// Append a message, evicting the oldest message(s) first when the
    /// history bound would be exceeded. The new message is never dropped.
    pub fn append(&self, session_id: &str, message: Message) -> Result<()> {
        if message.session_id != session_id {
            error!(
                session_id,
                message_session = %message.session_id,
                "attempted cross-session append"
            );
            return Err(Error::SessionIsolation(format!(
                "message for '{}' appended to '{}'",
                message.session_id, session_id
            )));
        }

        loop {
            let entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionEntry::new(Utc::now())))
                .clone();

            let mut state = entry.lock();
            if state.retired {
                // Lost a race with eviction; the map slot is gone, retry
                continue;
            }

            while state.messages.len() >= self.max_history_size {
                state.messages.pop_front();
            }
            state.messages.push_back(message);
            state.last_activity = Utc::now();

            if state.messages.len() > self.max_history_size {
                // Defensive: cannot happen with the pre-eviction above, but
                // recover by forced eviction rather than surface the breach
                let excess = state.messages.len() - self.max_history_size;
                state.messages.drain(..excess);
                warn!(
                    session_id,
                    excess,
                    "{}",
                    Error::HistoryBoundExceeded(session_id.to_string())
                );
            }

            debug!(session_id, count = state.messages.len(), "appended message");
            return Ok(());
        }
    }

    /// Get the most recent `limit` messages in insertion order.
    /// A `limit` of zero means no limit.
    pub fn get_history(&self, session_id: &str, limit: usize) -> Vec<Message> {
        let Some(entry) = self.sessions.get(session_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let state = entry.lock();
        let skip = if limit == 0 {
            0
        } else {
            state.messages.len().saturating_sub(limit)
        };
        state.messages.iter().skip(skip).cloned().collect()
    }

    /// Select at most `max_items` history messages pertinent to `query`,
    /// using the configured relevance policy.
    pub fn select_relevant(&self, session_id: &str, query: &str, max_items: usize) -> Vec<Message> {
        let history = self.get_history(session_id, 0);
        self.policy.select(&history, query, max_items)
    }

    /// Remove a session and all of its messages.
    ///
    /// Returns whether the session existed.
    pub fn clear(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, entry)) => {
                let mut state = entry.lock();
                state.retired = true;
                state.messages.clear();
                info!(session_id, "cleared session");
                true
            }
            None => false,
        }
    }

    /// Remove every message older than the retention period, dropping
    /// sessions that end up empty.
    ///
    /// Returns the number of sessions evicted. Runs from the time-triggered
    /// sweeper, independent of read/write traffic.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions_evicted = 0usize;
        let mut messages_evicted = 0usize;

        self.sessions.retain(|_, entry| {
            let mut state = entry.lock();
            let before = state.messages.len();
            let retention = self.retention_period;
            state.messages.retain(|m| now - m.timestamp <= retention);
            messages_evicted += before - state.messages.len();

            if state.messages.is_empty() {
                state.retired = true;
                sessions_evicted += 1;
                false
            } else {
                true
            }
        });

        if messages_evicted > 0 {
            info!(messages_evicted, sessions_evicted, "retention sweep evicted history");
        }
        sessions_evicted
    }

    /// Look up one session's summary.
    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = self.sessions.get(session_id).map(|e| e.value().clone())?;
        let state = entry.lock();
        Some(SessionInfo {
            session_id: session_id.to_string(),
            created_at: state.created_at,
            last_activity: state.last_activity,
            message_count: state.messages.len(),
        })
    }

    /// List sessions ordered by last activity, newest first.
    ///
    /// With `active_only`, sessions idle past the retention period are
    /// skipped.
    pub fn list_sessions(&self, active_only: bool) -> Vec<SessionInfo> {
        let cutoff = Utc::now() - self.retention_period;
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|item| {
                let state = item.value().lock();
                SessionInfo {
                    session_id: item.key().clone(),
                    created_at: state.created_at,
                    last_activity: state.last_activity,
                    message_count: state.messages.len(),
                }
            })
            .filter(|info| !active_only || info.last_activity >= cutoff)
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Store-wide counters.
    pub fn stats(&self) -> SessionStoreStats {
        let mut total_messages = 0usize;
        let mut total_sessions = 0usize;
        for item in self.sessions.iter() {
            total_sessions += 1;
            total_messages += item.value().lock().messages.len();
        }
        SessionStoreStats {
            total_sessions,
            total_messages,
            max_history_size: self.max_history_size,
            retention_period_secs: self.retention_period.num_seconds().max(0) as u64,
        }
    }
}
