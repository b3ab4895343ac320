//! Durable session state keyed by (user, working directory).

mod active;
mod manager;
mod storage;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{BackendKind, BackendSessionId};

pub use active::{ActiveRunGuard, ActiveRuns};
pub use manager::{CommitUpdate, SessionManager};
pub use storage::{FileSessionStore, MemorySessionStore, SessionStore};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session record is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session store unavailable: {0}")]
    Unavailable(String),
}

/// Identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub directory: PathBuf,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            user_id: user_id.into(),
            directory: directory.into(),
        }
    }

    /// Stable file-system safe name for this key.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.directory.to_string_lossy().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.directory.display())
    }
}

/// Caller-facing session handle.
///
/// `Pending` is a placeholder handed out before any backend has issued a
/// session id. It is a different type from [`BackendSessionId`], so it cannot
/// be passed as a resume token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum SessionRef {
    Pending(String),
    Active(Uuid),
}

impl SessionRef {
    pub fn placeholder() -> Self {
        SessionRef::Pending(format!("pending-{}", Uuid::new_v4()))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, SessionRef::Pending(_))
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRef::Pending(id) => f.write_str(id),
            SessionRef::Active(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub session_ref: SessionRef,
    pub backend_session_id: Option<BackendSessionId>,
    pub backend_kind: Option<BackendKind>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub turn_count: u64,
    pub accumulated_cost: f64,
}

impl Session {
    /// A fresh session with a placeholder ref and no backend state.
    pub fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            session_ref: SessionRef::placeholder(),
            backend_session_id: None,
            backend_kind: None,
            created_at: now,
            last_active_at: now,
            turn_count: 0,
            accumulated_cost: 0.0,
        }
    }

    /// The backend id to resume from. Never set while the ref is a placeholder.
    pub fn resume_token(&self) -> Option<&BackendSessionId> {
        match self.session_ref {
            SessionRef::Pending(_) => None,
            SessionRef::Active(_) => self.backend_session_id.as_ref(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        match (now - self.last_active_at).to_std() {
            Ok(idle) => idle > idle_timeout,
            // last_active_at is in the future; clock skew, not idleness.
            Err(_) => false,
        }
    }
}
