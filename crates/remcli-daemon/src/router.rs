//! Pub/sub fan-out of update and ephemeral events to scoped connections.
//!
//! The router holds non-owning references to connections: each entry is an
//! outbound channel sender, and a connection that disappears between lookup
//! and emit simply drops the frame.

use remcli_protocol::{EphemeralEvent, MachineId, ServerFrame, SessionId, UpdateEnvelope};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type ConnId = u64;

/// What an authenticated connection is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionScope {
    User,
    Session(SessionId),
    Machine(MachineId),
}

/// Recipient selection for an emit. Pure predicate over connection scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientFilter {
    UserScopedOnly,
    /// User-scoped connections plus the one session's own connections.
    SessionScoped(SessionId),
    /// User-scoped connections plus the one machine's own connections.
    MachineScoped(MachineId),
    AllAuthenticated,
}

impl RecipientFilter {
    pub fn admits(&self, scope: &ConnectionScope) -> bool {
        match self {
            RecipientFilter::UserScopedOnly => matches!(scope, ConnectionScope::User),
            RecipientFilter::SessionScoped(sid) => match scope {
                ConnectionScope::User => true,
                ConnectionScope::Session(s) => s == sid,
                ConnectionScope::Machine(_) => false,
            },
            RecipientFilter::MachineScoped(mid) => match scope {
                ConnectionScope::User => true,
                ConnectionScope::Machine(m) => m == mid,
                ConnectionScope::Session(_) => false,
            },
            RecipientFilter::AllAuthenticated => true,
        }
    }
}

struct Registered {
    scope: ConnectionScope,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
pub struct EventRouter {
    connections: Mutex<HashMap<ConnId, Registered>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        &self,
        scope: ConnectionScope,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections
            .lock()
            .expect("router lock poisoned")
            .insert(id, Registered { scope, sender });
        id
    }

    pub fn detach(&self, id: ConnId) {
        self.connections
            .lock()
            .expect("router lock poisoned")
            .remove(&id);
    }

    pub fn scope_of(&self, id: ConnId) -> Option<ConnectionScope> {
        self.connections
            .lock()
            .expect("router lock poisoned")
            .get(&id)
            .map(|c| c.scope.clone())
    }

    /// Deliver a sequenced update to every connection the filter admits,
    /// except the sender.
    pub fn emit_update(
        &self,
        envelope: UpdateEnvelope,
        filter: &RecipientFilter,
        skip: Option<ConnId>,
    ) {
        self.emit(ServerFrame::Update { envelope }, filter, skip);
    }

    /// Deliver a transient event. Same recipient selection, no ordering
    /// guarantee on the receiving side.
    pub fn emit_ephemeral(
        &self,
        event: EphemeralEvent,
        filter: &RecipientFilter,
        skip: Option<ConnId>,
    ) {
        self.emit(ServerFrame::Ephemeral { event }, filter, skip);
    }

    fn emit(&self, frame: ServerFrame, filter: &RecipientFilter, skip: Option<ConnId>) {
        let connections = self.connections.lock().expect("router lock poisoned");
        for (id, conn) in connections.iter() {
            if skip == Some(*id) || !filter.admits(&conn.scope) {
                continue;
            }
            // A closed channel means the connection is mid-teardown.
            let _ = conn.sender.send(frame.clone());
        }
    }

    /// Send a frame to one specific connection. Returns false when it is gone.
    pub fn send_to(&self, id: ConnId, frame: ServerFrame) -> bool {
        let connections = self.connections.lock().expect("router lock poisoned");
        match connections.get(&id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }
}
