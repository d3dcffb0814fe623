use remcli_protocol::{
    ACTIVE_SESSION_WINDOW_MS, Artifact, ArtifactId, Machine, MachineId, Message, MessageContent,
    Session, SessionId, now_ms,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

/// Result of an optimistic-concurrency write. On a mismatch the caller gets
/// the current version and current value back so it can merge and retry.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Success { version: u64, value: Option<String> },
    VersionMismatch { version: u64, value: Option<String> },
    NotFound,
}

/// Whether `create_session` minted a new session or rebound an existing tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpsert {
    Created,
    Rebound,
}

/// One page of the cursor-driven session listing.
#[derive(Debug, Clone)]
pub struct SessionsPage {
    pub sessions: Vec<Session>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

pub const CURSOR_PREFIX: &str = "cursor_v1_";

#[derive(Default, Serialize, Deserialize)]
pub(crate) struct StoreInner {
    pub(crate) sessions: HashMap<SessionId, Session>,
    pub(crate) tag_index: HashMap<String, SessionId>,
    pub(crate) messages: HashMap<SessionId, Vec<Message>>,
    pub(crate) machines: HashMap<MachineId, Machine>,
    pub(crate) artifacts: HashMap<ArtifactId, Artifact>,
    pub(crate) user_seq: u64,
    pub(crate) session_seqs: HashMap<SessionId, u64>,
}

/// The authoritative in-memory state. All mutation happens under the write
/// lock; sequence allocation and the dependent field writes share the same
/// critical section.
pub struct Store {
    inner: RwLock<StoreInner>,
    dirty: Arc<Notify>,
}

impl Store {
    pub fn new() -> Self {
        Self::from_inner(StoreInner::default())
    }

    pub(crate) fn from_inner(inner: StoreInner) -> Self {
        Self {
            inner: RwLock::new(inner),
            dirty: Arc::new(Notify::new()),
        }
    }

    /// Handle the snapshot writer waits on. Notified after every mutation.
    pub fn dirty_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.dirty)
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    // -- sequence counters --------------------------------------------------

    /// Sole source of per-user sequence numbers.
    pub fn next_user_seq(&self) -> u64 {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.user_seq += 1;
        inner.user_seq
    }

    /// Sole source of per-session sequence numbers.
    pub fn next_session_seq(&self, session_id: &str) -> u64 {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let seq = inner.session_seqs.entry(session_id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    // -- sessions -----------------------------------------------------------

    /// Create a session for `tag`, or rebind an existing one: same id, fresh
    /// metadata, bumped metadata version, marked active.
    pub fn create_session(
        &self,
        tag: &str,
        metadata: &str,
        data_encryption_key: Option<String>,
    ) -> (Session, SessionUpsert) {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");

        if let Some(id) = inner.tag_index.get(tag).cloned() {
            let session = inner
                .sessions
                .get_mut(&id)
                .expect("tag index points at a live session");
            session.metadata = metadata.to_string();
            session.metadata_version += 1;
            if data_encryption_key.is_some() {
                session.data_encryption_key = data_encryption_key;
            }
            session.active = true;
            session.active_at = now;
            session.updated_at = now;
            let session = session.clone();
            drop(inner);
            self.mark_dirty();
            return (session, SessionUpsert::Rebound);
        }

        inner.user_seq += 1;
        let seq = inner.user_seq;
        let session = Session {
            id: Uuid::new_v4().to_string(),
            tag: tag.to_string(),
            seq,
            metadata: metadata.to_string(),
            metadata_version: 1,
            agent_state: None,
            agent_state_version: 1,
            data_encryption_key,
            active: true,
            active_at: now,
            created_at: now,
            updated_at: now,
        };
        inner.tag_index.insert(tag.to_string(), session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        drop(inner);
        self.mark_dirty();
        (session, SessionUpsert::Created)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .sessions
            .get(id)
            .cloned()
    }

    pub fn get_session_by_tag(&self, tag: &str) -> Option<Session> {
        let inner = self.inner.read().expect("store lock poisoned");
        let id = inner.tag_index.get(tag)?;
        inner.sessions.get(id).cloned()
    }

    /// All sessions, most recently updated first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Sessions that are active and pinged within the activity window.
    pub fn list_active_sessions(&self, limit: usize) -> Vec<Session> {
        let cutoff = now_ms().saturating_sub(ACTIVE_SESSION_WINDOW_MS);
        let inner = self.inner.read().expect("store lock poisoned");
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.active && s.active_at > cutoff)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.active_at.cmp(&a.active_at).then(a.id.cmp(&b.id)));
        sessions.truncate(limit);
        sessions
    }

    /// Cursor-paged listing ordered by creation seq. The cursor is the id of
    /// the last session of the previous page (`cursor_v1_<id>`); an unknown
    /// cursor restarts from the beginning.
    pub fn sessions_page(
        &self,
        cursor: Option<&str>,
        limit: usize,
        changed_since: Option<u64>,
    ) -> SessionsPage {
        let inner = self.inner.read().expect("store lock poisoned");
        let after_seq = cursor
            .and_then(|c| c.strip_prefix(CURSOR_PREFIX))
            .and_then(|id| inner.sessions.get(id))
            .map(|s| s.seq)
            .unwrap_or(0);

        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.seq > after_seq)
            .filter(|s| changed_since.is_none_or(|since| s.updated_at > since))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.seq);
        let has_more = sessions.len() > limit;
        sessions.truncate(limit);
        let next_cursor = if has_more {
            sessions.last().map(|s| format!("{CURSOR_PREFIX}{}", s.id))
        } else {
            None
        };
        SessionsPage {
            sessions,
            next_cursor,
            has_more,
        }
    }

    pub fn delete_session(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(session) = inner.sessions.remove(id) else {
            return false;
        };
        inner.tag_index.remove(&session.tag);
        inner.messages.remove(id);
        inner.session_seqs.remove(id);
        drop(inner);
        self.mark_dirty();
        true
    }

    pub fn update_session_metadata(
        &self,
        id: &str,
        value: &str,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(session) = inner.sessions.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if session.metadata_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: session.metadata_version,
                value: Some(session.metadata.clone()),
            };
        }
        session.metadata = value.to_string();
        session.metadata_version += 1;
        session.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: session.metadata_version,
            value: Some(session.metadata.clone()),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    pub fn update_session_agent_state(
        &self,
        id: &str,
        value: Option<String>,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(session) = inner.sessions.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if session.agent_state_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: session.agent_state_version,
                value: session.agent_state.clone(),
            };
        }
        session.agent_state = value;
        session.agent_state_version += 1;
        session.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: session.agent_state_version,
            value: session.agent_state.clone(),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    /// Refresh activity; no version change.
    pub fn set_session_active(&self, id: &str, active: bool) -> bool {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(session) = inner.sessions.get_mut(id) else {
            return false;
        };
        session.active = active;
        session.active_at = now;
        session.updated_at = now;
        drop(inner);
        self.mark_dirty();
        true
    }

    // -- messages -----------------------------------------------------------

    /// Append a message, allocating the per-session seq and refreshing the
    /// session's activity in the same critical section. Returns `None` when
    /// the session does not exist.
    pub fn append_message(
        &self,
        session_id: &str,
        content: MessageContent,
        local_id: Option<String>,
    ) -> Option<Message> {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        if !inner.sessions.contains_key(session_id) {
            return None;
        }
        let seq = {
            let counter = inner.session_seqs.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq,
            content,
            local_id,
            created_at: now,
            updated_at: now,
        };
        inner
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        let session = inner
            .sessions
            .get_mut(session_id)
            .expect("session presence checked above");
        session.active = true;
        session.active_at = now;
        session.updated_at = now;
        drop(inner);
        self.mark_dirty();
        Some(message)
    }

    /// Last `limit` messages, newest first.
    pub fn list_messages(&self, session_id: &str, limit: usize) -> Vec<Message> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(messages) = inner.messages.get(session_id) else {
            return Vec::new();
        };
        messages.iter().rev().take(limit).cloned().collect()
    }

    // -- machines -----------------------------------------------------------

    pub fn upsert_machine(
        &self,
        id: &str,
        metadata: &str,
        daemon_state: Option<String>,
        data_encryption_key: Option<String>,
    ) -> (Machine, bool) {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(machine) = inner.machines.get_mut(id) {
            machine.metadata = metadata.to_string();
            machine.metadata_version += 1;
            if daemon_state.is_some() {
                machine.daemon_state = daemon_state;
                machine.daemon_state_version += 1;
            }
            if data_encryption_key.is_some() {
                machine.data_encryption_key = data_encryption_key;
            }
            machine.active = true;
            machine.active_at = now;
            machine.updated_at = now;
            let machine = machine.clone();
            drop(inner);
            self.mark_dirty();
            return (machine, false);
        }

        inner.user_seq += 1;
        let seq = inner.user_seq;
        let machine = Machine {
            id: id.to_string(),
            seq,
            metadata: metadata.to_string(),
            metadata_version: 1,
            daemon_state,
            daemon_state_version: 1,
            data_encryption_key,
            active: true,
            active_at: now,
            created_at: now,
            updated_at: now,
        };
        inner.machines.insert(id.to_string(), machine.clone());
        drop(inner);
        self.mark_dirty();
        (machine, true)
    }

    pub fn get_machine(&self, id: &str) -> Option<Machine> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .machines
            .get(id)
            .cloned()
    }

    pub fn list_machines(&self) -> Vec<Machine> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut machines: Vec<Machine> = inner.machines.values().cloned().collect();
        machines.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        machines
    }

    pub fn update_machine_metadata(
        &self,
        id: &str,
        value: &str,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(machine) = inner.machines.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if machine.metadata_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: machine.metadata_version,
                value: Some(machine.metadata.clone()),
            };
        }
        machine.metadata = value.to_string();
        machine.metadata_version += 1;
        machine.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: machine.metadata_version,
            value: Some(machine.metadata.clone()),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    pub fn update_machine_daemon_state(
        &self,
        id: &str,
        value: Option<String>,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(machine) = inner.machines.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if machine.daemon_state_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: machine.daemon_state_version,
                value: machine.daemon_state.clone(),
            };
        }
        machine.daemon_state = value;
        machine.daemon_state_version += 1;
        machine.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: machine.daemon_state_version,
            value: machine.daemon_state.clone(),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    pub fn set_machine_active(&self, id: &str, active: bool) -> bool {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(machine) = inner.machines.get_mut(id) else {
            return false;
        };
        machine.active = active;
        machine.active_at = now;
        machine.updated_at = now;
        drop(inner);
        self.mark_dirty();
        true
    }

    // -- artifacts ----------------------------------------------------------

    /// Create an artifact. Returns `None` when the id is already taken.
    pub fn create_artifact(
        &self,
        id: &str,
        header: &str,
        body: &str,
        data_encryption_key: Option<String>,
    ) -> Option<Artifact> {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.artifacts.contains_key(id) {
            return None;
        }
        inner.user_seq += 1;
        let seq = inner.user_seq;
        let artifact = Artifact {
            id: id.to_string(),
            seq,
            header: header.to_string(),
            header_version: 1,
            body: body.to_string(),
            body_version: 1,
            data_encryption_key,
            created_at: now,
            updated_at: now,
        };
        inner.artifacts.insert(id.to_string(), artifact.clone());
        drop(inner);
        self.mark_dirty();
        Some(artifact)
    }

    pub fn get_artifact(&self, id: &str) -> Option<Artifact> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .artifacts
            .get(id)
            .cloned()
    }

    pub fn update_artifact_header(
        &self,
        id: &str,
        value: &str,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(artifact) = inner.artifacts.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if artifact.header_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: artifact.header_version,
                value: Some(artifact.header.clone()),
            };
        }
        artifact.header = value.to_string();
        artifact.header_version += 1;
        artifact.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: artifact.header_version,
            value: Some(artifact.header.clone()),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    pub fn update_artifact_body(
        &self,
        id: &str,
        value: &str,
        expected_version: u64,
    ) -> WriteOutcome {
        let now = now_ms();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(artifact) = inner.artifacts.get_mut(id) else {
            return WriteOutcome::NotFound;
        };
        if artifact.body_version != expected_version {
            return WriteOutcome::VersionMismatch {
                version: artifact.body_version,
                value: Some(artifact.body.clone()),
            };
        }
        artifact.body = value.to_string();
        artifact.body_version += 1;
        artifact.updated_at = now;
        let outcome = WriteOutcome::Success {
            version: artifact.body_version,
            value: Some(artifact.body.clone()),
        };
        drop(inner);
        self.mark_dirty();
        outcome
    }

    pub fn delete_artifact(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let removed = inner.artifacts.remove(id).is_some();
        drop(inner);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    // -- snapshot plumbing --------------------------------------------------

    pub(crate) fn export(&self) -> StoreInner {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreInner {
            sessions: inner.sessions.clone(),
            tag_index: inner.tag_index.clone(),
            messages: inner.messages.clone(),
            machines: inner.machines.clone(),
            artifacts: inner.artifacts.clone(),
            user_seq: inner.user_seq,
            session_seqs: inner.session_seqs.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_session_active_at(&self, id: &str, active_at: u64) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(session) = inner.sessions.get_mut(id) {
            session.active_at = active_at;
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
