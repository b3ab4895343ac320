use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Session, SessionKey, SessionRef, SessionStore, StorageError};
use crate::model::BackendSessionId;

/// Post-run changes applied to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitUpdate {
    /// Id reported by the backend, if any. `None` keeps the previous id.
    pub backend_session_id: Option<BackendSessionId>,
    pub cost_delta: f64,
    /// Turns the run reported; a committed run counts as at least one.
    pub turns: u32,
}

/// Resolves, expires and commits sessions on top of a [`SessionStore`].
///
/// Expiry is evaluated lazily on `resolve`. Nothing is written until `commit`.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, idle_timeout: Duration) -> Self {
        Self {
            store,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn resolve(&self, key: &SessionKey) -> Result<Session, StorageError> {
        self.resolve_at(key, Utc::now()).await
    }

    /// Returns the stored session, or a fresh placeholder session when none
    /// exists or the stored one has been idle longer than the timeout.
    #[instrument(skip(self), fields(session = %key))]
    pub async fn resolve_at(
        &self,
        key: &SessionKey,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        match self.store.load_session(key).await? {
            Some(session) if !session.is_expired(now, self.idle_timeout) => {
                debug!(session_ref = %session.session_ref, "resumed session");
                Ok(session)
            }
            Some(session) => {
                info!(
                    last_active_at = %session.last_active_at,
                    "session expired; starting fresh"
                );
                Ok(Session::new(key.clone(), now))
            }
            None => {
                debug!("no stored session; starting fresh");
                Ok(Session::new(key.clone(), now))
            }
        }
    }

    pub async fn commit(
        &self,
        session: &Session,
        update: CommitUpdate,
    ) -> Result<Session, StorageError> {
        self.commit_at(session, update, Utc::now()).await
    }

    /// Persists the post-run state and returns the saved row.
    ///
    /// A placeholder ref becomes a stable ref once a backend has issued an id.
    #[instrument(skip(self, session, update), fields(session = %session.key))]
    pub async fn commit_at(
        &self,
        session: &Session,
        update: CommitUpdate,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        let mut next = session.clone();
        if let Some(id) = update.backend_session_id {
            next.backend_kind = Some(id.kind());
            next.backend_session_id = Some(id);
            if next.session_ref.is_pending() {
                next.session_ref = SessionRef::Active(Uuid::new_v4());
            }
        }
        next.turn_count += u64::from(update.turns.max(1));
        if update.cost_delta.is_finite() && update.cost_delta > 0.0 {
            next.accumulated_cost += update.cost_delta;
        }
        next.last_active_at = now;

        self.store.save_session(&next).await?;
        debug!(
            session_ref = %next.session_ref,
            turn_count = next.turn_count,
            accumulated_cost = next.accumulated_cost,
            "committed session"
        );
        Ok(next)
    }

    /// Deletes every session idle longer than the timeout. Returns the count.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        for session in self.store.list_sessions().await? {
            if session.is_expired(now, self.idle_timeout)
                && self.store.delete_session(&session.key).await?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept expired sessions");
        }
        Ok(removed)
    }
}
