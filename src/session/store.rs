//! In-memory conversation store
//!
//! Each session sits behind its own mutex; the outer map is only locked long
//! enough to find or insert a session, so appends to different sessions never
//! wait on each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Maximum number of turns retained per session
pub const MAX_TURNS: usize = 50;

/// Idle time after which a session expires
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Number of turns handed to the LLM as conversation context
pub const DEFAULT_CONTEXT_TURNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session expired: {0}")]
    Expired(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Expired,
}

/// Reference to an audited tool invocation made while producing a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInvocationRef {
    pub correlation_id: String,
    pub server: String,
    pub tool: String,
    pub ok: bool,
}

/// One message in a session's history. Never modified after append.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocationRef>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_invocations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tool_invocations(mut self, refs: Vec<ToolInvocationRef>) -> Self {
        self.tool_invocations = refs;
        self
    }
}

/// Snapshot of a session for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
    turns: VecDeque<Turn>,
    state: SessionState,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            last_active: Instant::now(),
            last_active_at: Utc::now(),
            turns: VecDeque::new(),
            state: SessionState::Active,
        }
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        Instant::now().saturating_duration_since(self.last_active) >= timeout
    }

    /// Lazily flips an idle session to expired and reports whether it may be used.
    fn ensure_live(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if self.state == SessionState::Active && self.is_idle(timeout) {
            tracing::info!(session_id = %self.id, "Session expired on access");
            self.state = SessionState::Expired;
        }
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Expired => Err(SessionError::Expired(self.id.clone())),
        }
    }

    fn refresh(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = Utc::now();
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One session instance, pinned independently of its id.
///
/// A session that is deleted or swept is always expired first, so writes
/// through a handle taken before that fail even after the id is reused.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
    timeout: Duration,
    max_turns: usize,
}

impl SessionHandle {
    /// Append a turn, dropping the oldest turns to stay within the cap
    pub fn append(&self, turn: Turn) -> Result<(), SessionError> {
        let mut session = lock(&self.session);
        session.ensure_live(self.timeout)?;

        while session.turns.len() >= self.max_turns {
            session.turns.pop_front();
        }
        session.turns.push_back(turn);
        session.refresh();
        Ok(())
    }

    /// The last `max_turns` turns, oldest first
    pub fn recent_context(&self, max_turns: usize) -> Result<Vec<Turn>, SessionError> {
        let mut session = lock(&self.session);
        session.ensure_live(self.timeout)?;

        let skip = session.turns.len().saturating_sub(max_turns);
        Ok(session.turns.iter().skip(skip).cloned().collect())
    }
}

/// Owns every session and its turns
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    timeout: Duration,
    max_turns: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_limits(SESSION_TIMEOUT, MAX_TURNS)
    }

    pub fn with_limits(timeout: Duration, max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
            max_turns: max_turns.max(1),
        }
    }

    fn get(&self, id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn bind(&self, id: &str) -> Result<SessionHandle, SessionError> {
        Ok(SessionHandle {
            session: self.get(id)?,
            timeout: self.timeout,
            max_turns: self.max_turns,
        })
    }

    /// Pin the live session currently stored under `id`
    pub fn handle(&self, id: &str) -> Result<SessionHandle, SessionError> {
        let handle = self.bind(id)?;
        lock(&handle.session).ensure_live(self.timeout)?;
        Ok(handle)
    }

    /// Create a session with a fresh identifier
    pub fn create(&self) -> String {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = loop {
            let candidate = format!("session_{:08x}", rand::random::<u32>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id.clone(), Arc::new(Mutex::new(Session::new(id.clone()))));
        tracing::info!(session_id = %id, "Session created");
        id
    }

    /// Get-or-create a session under a client-chosen id.
    ///
    /// An existing live session is touched; an expired one is reported as such
    /// rather than silently replaced.
    pub fn open(&self, id: &str) -> Result<(), SessionError> {
        match self.touch(id) {
            Err(SessionError::NotFound(_)) => {}
            touched => return touched,
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(id) {
            // Lost a race with another opener
            let mut session = lock(existing);
            session.ensure_live(self.timeout)?;
            session.refresh();
            return Ok(());
        }
        sessions.insert(
            id.to_string(),
            Arc::new(Mutex::new(Session::new(id.to_string()))),
        );
        tracing::info!(session_id = %id, "Session opened");
        Ok(())
    }

    /// Append a turn, dropping the oldest turns to stay within the cap
    #[cfg(test)]
    pub fn append(&self, id: &str, turn: Turn) -> Result<(), SessionError> {
        self.bind(id)?.append(turn)
    }

    /// The last `max_turns` turns, oldest first
    #[cfg(test)]
    pub fn recent_context(&self, id: &str, max_turns: usize) -> Result<Vec<Turn>, SessionError> {
        self.bind(id)?.recent_context(max_turns)
    }

    /// Refresh last-active on a live session
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        let mut session = lock(&session);
        session.ensure_live(self.timeout)?;
        session.refresh();
        Ok(())
    }

    pub fn mark_expired(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        lock(&session).state = SessionState::Expired;
        Ok(())
    }

    pub fn stats(&self, id: &str) -> Result<SessionStats, SessionError> {
        let session = self.get(id)?;
        let mut session = lock(&session);
        // Stats are still reported for an expired session
        let _ = session.ensure_live(self.timeout);
        Ok(SessionStats {
            session_id: session.id.clone(),
            state: session.state,
            turn_count: session.turns.len(),
            created_at: session.created_at,
            last_active: session.last_active_at,
        })
    }

    /// Drop a session. Outstanding handles see it as expired.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(session) => {
                lock(&session).state = SessionState::Expired;
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions
            .iter()
            .filter(|s| {
                let s = lock(s);
                s.state == SessionState::Active && !s.is_idle(self.timeout)
            })
            .count()
    }

    /// Remove every expired or idle session and return their ids.
    ///
    /// Candidates are collected under the read lock and re-checked under the
    /// write lock, so a session touched in between survives the sweep.
    pub fn sweep_expired(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| {
                let s = lock(s);
                s.state == SessionState::Expired || s.is_idle(self.timeout)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if candidates.is_empty() {
            return candidates;
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        candidates
            .into_iter()
            .filter(|id| {
                let still_expired = sessions.get(id).is_some_and(|s| {
                    let mut s = lock(s);
                    s.ensure_live(self.timeout).is_err()
                });
                if still_expired {
                    sessions.remove(id);
                }
                still_expired
            })
            .collect()
    }
}
