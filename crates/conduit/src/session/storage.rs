use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Session, SessionKey, StorageError};

/// Storage collaborator for session rows. Each call is atomic per row; rows
/// for different keys never contend.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<Session>, StorageError>;

    async fn save_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Returns whether a row was removed.
    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError>;

    async fn list_sessions(&self) -> Result<Vec<Session>, StorageError>;
}

/// Process-local store; rows are sharded so no lock spans sessions.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    rows: DashMap<SessionKey, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<Session>, StorageError> {
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.rows.insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError> {
        Ok(self.rows.remove(key).is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        Ok(self.rows.iter().map(|row| row.value().clone()).collect())
    }
}

/// One pretty-printed JSON file per session, named by the key digest.
///
/// Writes go to a unique temporary file that is then renamed over the row, so
/// readers see either the old or the new row.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn row_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<Session>, StorageError> {
        let content = match fs::read(self.row_path(key)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session: Session = serde_json::from_slice(&content)?;
        if session.key != *key {
            return Err(StorageError::Unavailable(format!(
                "row {} holds session {}, expected {}",
                key.digest(),
                session.key,
                key
            )));
        }
        Ok(Some(session))
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.row_path(&session.key);
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let content = serde_json::to_vec_pretty(session)?;
        fs::write(&temp_path, &content).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(session = %session.key, path = %path.display(), "saved session");
        Ok(())
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError> {
        match fs::remove_file(self.row_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path).await?;
            match serde_json::from_slice::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        sessions.sort_by(|a, b| a.last_active_at.cmp(&b.last_active_at));
        Ok(sessions)
    }
}
