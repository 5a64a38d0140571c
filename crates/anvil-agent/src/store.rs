use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use anvil_llm::{ChatMessage, Role, Usage};

use crate::errors::StorageError;

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Header record, the first line of every session journal. Usage counters
/// accumulate across turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub workspace_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub subagent_depth: usize,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub usage_input_tokens: u64,
    #[serde(default)]
    pub usage_output_tokens: u64,
    #[serde(default)]
    pub usage_total_tokens: u64,
    #[serde(default)]
    pub usage_cache_read_tokens: u64,
    #[serde(default)]
    pub usage_cache_write_tokens: u64,
}

impl SessionHeader {
    pub fn accumulate_usage(&mut self, usage: &Usage) {
        self.usage_input_tokens += usage.input_tokens;
        self.usage_output_tokens += usage.output_tokens;
        self.usage_total_tokens += usage.total_tokens;
        self.usage_cache_read_tokens += usage.cache_read_tokens;
        self.usage_cache_write_tokens += usage.cache_write_tokens;
        self.updated_at = utc_now_iso();
    }
}

/// Identity under which a session is created on first access.
#[derive(Clone, Debug, Default)]
pub struct SessionSeed {
    pub provider: String,
    pub model: String,
    pub workspace_dir: String,
    pub parent_session_id: Option<String>,
    pub subagent_depth: usize,
}

/// Immutable view of one session at a point in time.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub header: SessionHeader,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JournalRecord {
    Header(SessionHeader),
    Message {
        message: ChatMessage,
        timestamp: String,
    },
}

struct SessionState {
    header: SessionHeader,
    messages: Vec<ChatMessage>,
}

/// Append-only per-session journal store. The store is the sole writer;
/// readers obtain snapshots. One JSONL file per session: a leading header
/// record, then one message record per line. Appends are flushed to disk
/// before returning; prefix rewrites go through a temp file and an atomic
/// rename so concurrent readers never observe a torn journal.
pub struct SessionStore {
    root: PathBuf,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Use the requested id when non-blank, otherwise mint a short one.
    pub fn resolve_session_id(requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().simple().to_string()[..12].to_string(),
        }
    }

    /// Load the session from disk, creating it if absent. The seed refreshes
    /// the header's provider/model/workspace fields on every open.
    pub fn open(&self, session_id: &str, seed: &SessionSeed) -> Result<SessionSnapshot, StorageError> {
        let mut sessions = self.lock_sessions();
        if !sessions.contains_key(session_id) {
            let state = self.load_or_create(session_id, seed)?;
            sessions.insert(session_id.to_string(), state);
        } else if let Some(state) = sessions.get_mut(session_id) {
            state.header.provider = seed.provider.clone();
            state.header.model = seed.model.clone();
            state.header.workspace_dir = seed.workspace_dir.clone();
            if seed.parent_session_id.is_some() {
                state.header.parent_session_id = seed.parent_session_id.clone();
            }
            state.header.updated_at = utc_now_iso();
            self.rewrite(session_id, state)?;
        }
        let state = sessions
            .get(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;
        Ok(snapshot_of(state))
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, StorageError> {
        let sessions = self.lock_sessions();
        let state = sessions
            .get(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;
        Ok(snapshot_of(state))
    }

    pub fn header(&self, session_id: &str) -> Result<SessionHeader, StorageError> {
        Ok(self.snapshot(session_id)?.header)
    }

    /// Append one message. Missing sessions auto-initialize with a default
    /// header.
    pub fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), StorageError> {
        let mut sessions = self.lock_sessions();
        if !sessions.contains_key(session_id) {
            let state = self.load_or_create(session_id, &SessionSeed::default())?;
            sessions.insert(session_id.to_string(), state);
        }
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;

        let record = JournalRecord::Message {
            message: message.clone(),
            timestamp: utc_now_iso(),
        };
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;

        state.messages.push(message);
        state.header.updated_at = utc_now_iso();
        Ok(())
    }

    /// Append an internal bookkeeping note so it shows up in the transcript.
    pub fn add_system_note(&self, session_id: &str, text: &str) -> Result<(), StorageError> {
        self.append(
            session_id,
            ChatMessage::assistant(format!("[System Message] {text}"))
                .with_created_at(utc_now_iso()),
        )
    }

    /// Replace everything before `up_to_index` with a single summary
    /// message, rewriting the journal atomically.
    pub fn replace_prefix(
        &self,
        session_id: &str,
        up_to_index: usize,
        summary: ChatMessage,
    ) -> Result<(), StorageError> {
        let mut sessions = self.lock_sessions();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;
        let up_to = up_to_index.min(state.messages.len());
        let mut messages = Vec::with_capacity(state.messages.len() - up_to + 1);
        messages.push(summary);
        messages.extend(state.messages[up_to..].iter().cloned());
        state.messages = messages;
        state.header.updated_at = utc_now_iso();
        self.rewrite(session_id, state)
    }

    /// Apply a header patch and persist it.
    pub fn update_header<F>(&self, session_id: &str, patch: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SessionHeader),
    {
        let mut sessions = self.lock_sessions();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;
        patch(&mut state.header);
        state.header.updated_at = utc_now_iso();
        self.rewrite(session_id, state)
    }

    /// Clear the conversation, keeping the header.
    pub fn reset(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.lock_sessions();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::UnknownSession(session_id.to_string()))?;
        state.messages.clear();
        state.header.updated_at = utc_now_iso();
        self.rewrite(session_id, state)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .filter(|ch| ch.is_alphanumeric() || *ch == '-' || *ch == '_')
            .collect();
        let safe = if safe.is_empty() {
            "default".to_string()
        } else {
            safe
        };
        self.root.join(format!("{safe}.jsonl"))
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        self.sessions.lock().expect("session store mutex poisoned")
    }

    fn load_or_create(
        &self,
        session_id: &str,
        seed: &SessionSeed,
    ) -> Result<SessionState, StorageError> {
        let path = self.session_path(session_id);
        if !path.is_file() {
            let now = utc_now_iso();
            let state = SessionState {
                header: SessionHeader {
                    session_id: session_id.to_string(),
                    provider: seed.provider.clone(),
                    model: seed.model.clone(),
                    workspace_dir: seed.workspace_dir.clone(),
                    parent_session_id: seed.parent_session_id.clone(),
                    subagent_depth: seed.subagent_depth,
                    created_at: now.clone(),
                    updated_at: now,
                    usage_input_tokens: 0,
                    usage_output_tokens: 0,
                    usage_total_tokens: 0,
                    usage_cache_read_tokens: 0,
                    usage_cache_write_tokens: 0,
                },
                messages: Vec::new(),
            };
            self.rewrite(session_id, &state)?;
            return Ok(state);
        }

        let raw = fs::read_to_string(&path)?;
        let mut header: Option<SessionHeader> = None;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // Corrupt lines are skipped rather than poisoning the session.
            let Ok(record) = serde_json::from_str::<JournalRecord>(line) else {
                continue;
            };
            match record {
                JournalRecord::Header(found) => header = Some(found),
                JournalRecord::Message { message, .. } => messages.push(message),
            }
        }

        let now = utc_now_iso();
        let mut header = header.unwrap_or_else(|| SessionHeader {
            session_id: session_id.to_string(),
            provider: seed.provider.clone(),
            model: seed.model.clone(),
            workspace_dir: seed.workspace_dir.clone(),
            parent_session_id: seed.parent_session_id.clone(),
            subagent_depth: seed.subagent_depth,
            created_at: now.clone(),
            updated_at: now.clone(),
            usage_input_tokens: 0,
            usage_output_tokens: 0,
            usage_total_tokens: 0,
            usage_cache_read_tokens: 0,
            usage_cache_write_tokens: 0,
        });
        header.provider = seed.provider.clone();
        header.model = seed.model.clone();
        header.workspace_dir = seed.workspace_dir.clone();
        if seed.parent_session_id.is_some() {
            header.parent_session_id = seed.parent_session_id.clone();
        }
        header.updated_at = now;

        let state = SessionState { header, messages };
        self.rewrite(session_id, &state)?;
        Ok(state)
    }

    /// Write the full journal to `<session>.jsonl.tmp` and rename over the
    /// original.
    fn rewrite(&self, session_id: &str, state: &SessionState) -> Result<(), StorageError> {
        let path = self.session_path(session_id);
        let tmp_path = path.with_extension("jsonl.tmp");

        let mut lines = Vec::with_capacity(state.messages.len() + 1);
        lines.push(serde_json::to_string(&JournalRecord::Header(
            state.header.clone(),
        ))?);
        for message in &state.messages {
            lines.push(serde_json::to_string(&JournalRecord::Message {
                message: message.clone(),
                timestamp: message
                    .created_at
                    .clone()
                    .unwrap_or_else(utc_now_iso),
            })?);
        }

        let mut file = File::create(&tmp_path)?;
        file.write_all(lines.join("\n").as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn snapshot_of(state: &SessionState) -> SessionSnapshot {
    SessionSnapshot {
        header: state.header.clone(),
        messages: state.messages.clone(),
    }
}

/// Index of the last message with the given role, used by `continue_run`
/// validation.
pub fn last_role(messages: &[ChatMessage]) -> Option<Role> {
    messages.last().map(|message| message.role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_session_id_prefers_requested_value() {
        assert_eq!(
            SessionStore::resolve_session_id(Some("  abc ")),
            "abc".to_string()
        );
        let minted = SessionStore::resolve_session_id(None);
        assert_eq!(minted.len(), 12);
    }

    #[test]
    fn session_path_sanitizes_hostile_ids() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).expect("store");
        let path = store.session_path("../../etc/passwd");
        assert_eq!(path, dir.path().join("etcpasswd.jsonl"));
    }

    #[test]
    fn journal_round_trips_header_and_messages() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).expect("store");
        let seed = SessionSeed {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            workspace_dir: "/tmp".to_string(),
            ..SessionSeed::default()
        };
        store.open("s1", &seed).expect("open");
        store
            .append("s1", ChatMessage::user("hello"))
            .expect("append");

        // A fresh store instance must see the same state from disk.
        let reopened = SessionStore::new(dir.path()).expect("store");
        let snapshot = reopened.open("s1", &seed).expect("reopen");
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "hello");
        assert_eq!(snapshot.header.provider, "openai");
    }
}
