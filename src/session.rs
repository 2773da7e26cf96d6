//! Persisted chat sessions.
//!
//! All sessions live in one JSON document (`sessions/sessions.json`) that is
//! rewritten atomically on every change. A session id also scopes the
//! answer cache, so the same question in two sessions is answered twice.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KbError, KbResult};
use crate::models::Origin;
use crate::storage::{read_json, write_json};

pub const SESSIONS_FILE: &str = "sessions.json";
const DEFAULT_TITLE: &str = "New chat";
const TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(sessions_dir: &Path) -> Self {
        Self {
            path: sessions_dir.join(SESSIONS_FILE),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> KbResult<Vec<Session>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Load, apply `f`, save; serialised against other writers in this process.
    fn update<T>(&self, f: impl FnOnce(&mut Vec<Session>) -> KbResult<T>) -> KbResult<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = self.read_all()?;
        let out = f(&mut sessions)?;
        write_json(&self.path, &sessions)?;
        Ok(out)
    }

    pub fn create(&self, title: Option<&str>) -> KbResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.unwrap_or(DEFAULT_TITLE).to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };
        self.update(|all| {
            all.push(session.clone());
            Ok(())
        })?;
        tracing::debug!(id = %session.id, "created session");
        Ok(session)
    }

    /// Summaries, most recently updated first.
    pub fn list(&self) -> KbResult<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .read_all()?
            .into_iter()
            .map(|s| SessionSummary {
                message_count: s.messages.len(),
                id: s.id,
                title: s.title,
                updated_at: s.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    pub fn get(&self, id: &str) -> KbResult<Option<Session>> {
        Ok(self.read_all()?.into_iter().find(|s| s.id == id))
    }

    /// Append a message. The first user message replaces the default title.
    pub fn add_message(&self, id: &str, role: Role, content: &str, origin: Option<Origin>) -> KbResult<()> {
        self.update(|all| {
            let session = all
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| KbError::NotFound(format!("session {}", id)))?;
            let now = Utc::now();
            if role == Role::User && session.title == DEFAULT_TITLE && session.messages.is_empty() {
                session.title = content.trim().chars().take(TITLE_CHARS).collect();
            }
            session.messages.push(ChatMessage {
                role,
                content: content.to_string(),
                timestamp: now,
                origin,
            });
            session.updated_at = now;
            Ok(())
        })
    }

    /// The last `limit` messages of a session, oldest first.
    pub fn history(&self, id: &str, limit: Option<usize>) -> KbResult<Vec<ChatMessage>> {
        let session = self
            .get(id)?
            .ok_or_else(|| KbError::NotFound(format!("session {}", id)))?;
        let messages = session.messages;
        let skip = limit.map_or(0, |n| messages.len().saturating_sub(n));
        Ok(messages.into_iter().skip(skip).collect())
    }

    /// Write one session as pretty JSON to `dest`.
    pub fn export(&self, id: &str, dest: &Path) -> KbResult<()> {
        let session = self
            .get(id)?
            .ok_or_else(|| KbError::NotFound(format!("session {}", id)))?;
        write_json(dest, &session)
    }

    pub fn delete(&self, id: &str) -> KbResult<bool> {
        self.update(|all| {
            let before = all.len();
            all.retain(|s| s.id != id);
            Ok(all.len() != before)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_add_and_history() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let session = store.create(None).unwrap();

        store
            .add_message(&session.id, Role::User, "What is the capital of France?", None)
            .unwrap();
        store
            .add_message(&session.id, Role::Assistant, "Paris.", Some(Origin::Semantic))
            .unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.title, "What is the capital of France?");
        assert_eq!(loaded.messages.len(), 2);

        let last = store.history(&session.id, Some(1)).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].content, "Paris.");
        assert_eq!(last[0].origin, Some(Origin::Semantic));
    }

    #[test]
    fn test_list_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let a = store.create(Some("first")).unwrap();
        store.create(Some("second")).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.delete(&a.id).unwrap());
        assert!(!store.delete(&a.id).unwrap());
        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "second");
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let err = store.add_message("nope", Role::User, "hi", None).unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_export_writes_session_json() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(&tmp.path().join("sessions"));
        let session = store.create(Some("export me")).unwrap();
        let dest = tmp.path().join("out/session.json");
        store.export(&session.id, &dest).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&dest).unwrap()).unwrap();
        assert_eq!(json["title"], "export me");
        assert_eq!(json["id"], session.id.as_str());
    }
}
