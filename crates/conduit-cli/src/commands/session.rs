use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use conduit::config::Settings;
use conduit::session::{FileSessionStore, Session, SessionKey, SessionManager, SessionStore};

fn session_manager(settings: &Settings) -> Result<SessionManager> {
    let store = FileSessionStore::new(settings.sessions_dir()?);
    Ok(SessionManager::new(Arc::new(store), settings.idle_timeout()))
}

pub async fn handle_session_show(settings: &Settings, user: &str, dir: &Path) -> Result<()> {
    let directory = std::fs::canonicalize(dir)
        .with_context(|| format!("directory {} is not accessible", dir.display()))?;
    let key = SessionKey::new(user, directory);
    let sessions = session_manager(settings)?;

    match sessions.store().load_session(&key).await? {
        Some(session) => {
            println!("{}", serde_json::to_string_pretty(&session)?);
            if session.is_expired(Utc::now(), sessions.idle_timeout()) {
                eprintln!("(expired: the next run starts a fresh session)");
            }
        }
        None => println!("No session for {}", key),
    }
    Ok(())
}

pub async fn handle_session_list(settings: &Settings, json: bool) -> Result<()> {
    let sessions = session_manager(settings)?.store().list_sessions().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }
    for session in &sessions {
        println!("{}", summary(session));
    }
    Ok(())
}

pub async fn handle_session_sweep(settings: &Settings) -> Result<()> {
    let removed = session_manager(settings)?.sweep_expired(Utc::now()).await?;
    println!("Removed {} expired session(s)", removed);
    Ok(())
}

fn summary(session: &Session) -> String {
    let backend = session
        .backend_kind
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} - {} [{}] turns: {}, cost: ${:.4}, last active: {}",
        session.key,
        session.session_ref,
        backend,
        session.turn_count,
        session.accumulated_cost,
        session.last_active_at.format("%Y-%m-%d %H:%M:%S")
    )
}
