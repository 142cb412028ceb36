//! Build session and build request bookkeeping.
//!
//! The build backend depends on two managers created by the orchestrator: a
//! session manager tracking client sessions attached over the API, and a
//! build manager tracking in-flight build requests so they can be cancelled.

use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A client session attached to the build backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub opened_at: SystemTime,
}

/// Tracks attached build sessions.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session. Re-attaching an id replaces the previous entry.
    pub fn open(&self, id: impl Into<String>, name: impl Into<String>) -> SessionInfo {
        let info = SessionInfo {
            id: id.into(),
            name: name.into(),
            opened_at: SystemTime::now(),
        };
        tracing::debug!(session = %info.id, name = %info.name, "Build session opened");
        self.sessions.insert(info.id.clone(), info.clone());
        info
    }

    pub fn close(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Drop every session, returning how many were attached.
    pub fn close_all(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }
}

/// Tracks in-flight build requests.
#[derive(Debug, Default)]
pub struct BuildManager {
    builds: DashMap<String, CancellationToken>,
}

impl BuildManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a build and hand back the token its worker must observe.
    pub fn register(&self, build_id: impl Into<String>) -> CancellationToken {
        let token = CancellationToken::new();
        self.builds.insert(build_id.into(), token.clone());
        token
    }

    /// Forget a finished build.
    pub fn complete(&self, build_id: &str) {
        self.builds.remove(build_id);
    }

    /// Cancel a build by id. Unknown ids are reported, not an error.
    pub fn cancel(&self, build_id: &str) -> bool {
        match self.builds.remove(build_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(build = %build_id, "Build cancelled");
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> usize {
        self.builds.len()
    }

    /// Cancel every in-flight build.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.builds.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }
}
