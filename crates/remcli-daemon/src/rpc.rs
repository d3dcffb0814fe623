//! Method registry and call forwarding between connections.
//!
//! A method name belongs to at most one connection. Calls are forwarded as
//! `rpc-request` frames carrying a correlation id; the owning registrant must
//! answer with an `rpc-response` for the same id within the deadline.

use crate::router::{ConnId, EventRouter};
use remcli_protocol::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("method already registered: {0}")]
    AlreadyRegistered(String),
    #[error("method not registered: {0}")]
    NotRegistered(String),
    #[error("method registered by another connection: {0}")]
    NotOwner(String),
    #[error("no handler for method: {0}")]
    NoHandler(String),
    #[error("rpc call timed out after {}s", RPC_CALL_TIMEOUT.as_secs())]
    Timeout,
    #[error("handler connection closed")]
    HandlerGone,
}

struct Pending {
    owner: ConnId,
    reply: oneshot::Sender<serde_json::Value>,
}

pub struct RpcRegistry {
    router: Arc<EventRouter>,
    methods: Mutex<HashMap<String, ConnId>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_call_id: AtomicU64,
}

impl RpcRegistry {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self {
            router,
            methods: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(0),
        }
    }

    pub fn register(&self, method: &str, conn: ConnId) -> Result<(), RpcError> {
        let mut methods = self.methods.lock().expect("rpc lock poisoned");
        if methods.contains_key(method) {
            return Err(RpcError::AlreadyRegistered(method.to_string()));
        }
        methods.insert(method.to_string(), conn);
        Ok(())
    }

    pub fn unregister(&self, method: &str, conn: ConnId) -> Result<(), RpcError> {
        let mut methods = self.methods.lock().expect("rpc lock poisoned");
        match methods.get(method) {
            None => Err(RpcError::NotRegistered(method.to_string())),
            Some(owner) if *owner != conn => Err(RpcError::NotOwner(method.to_string())),
            Some(_) => {
                methods.remove(method);
                Ok(())
            }
        }
    }

    /// Forward a call to the method's owner and await its acknowledgement.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let owner = {
            let methods = self.methods.lock().expect("rpc lock poisoned");
            methods
                .get(method)
                .copied()
                .ok_or_else(|| RpcError::NoHandler(method.to_string()))?
        };

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("rpc lock poisoned")
            .insert(call_id, Pending { owner, reply: tx });

        let sent = self.router.send_to(
            owner,
            ServerFrame::RpcRequest {
                id: call_id,
                method: method.to_string(),
                params,
            },
        );
        if !sent {
            self.pending
                .lock()
                .expect("rpc lock poisoned")
                .remove(&call_id);
            return Err(RpcError::HandlerGone);
        }

        match tokio::time::timeout(RPC_CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            // Sender dropped: the owner disconnected mid-call.
            Ok(Err(_)) => Err(RpcError::HandlerGone),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("rpc lock poisoned")
                    .remove(&call_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Resolve a pending call from an `rpc-response` frame. Only the owning
    /// connection may acknowledge its own requests.
    pub fn handle_response(&self, conn: ConnId, call_id: u64, result: serde_json::Value) {
        let mut pending = self.pending.lock().expect("rpc lock poisoned");
        let Some(entry) = pending.get(&call_id) else {
            return;
        };
        if entry.owner != conn {
            tracing::debug!(call_id, conn, "ignoring rpc ack from non-owner connection");
            return;
        }
        if let Some(entry) = pending.remove(&call_id) {
            let _ = entry.reply.send(result);
        }
    }

    /// Drop everything a departing connection owned: its method bindings and
    /// any calls still waiting on it.
    pub fn disconnect(&self, conn: ConnId) -> Vec<String> {
        let mut methods = self.methods.lock().expect("rpc lock poisoned");
        let removed: Vec<String> = methods
            .iter()
            .filter_map(|(method, owner)| (*owner == conn).then(|| method.clone()))
            .collect();
        for method in &removed {
            methods.remove(method);
        }
        drop(methods);

        let mut pending = self.pending.lock().expect("rpc lock poisoned");
        pending.retain(|_, entry| entry.owner != conn);
        removed
    }

    #[cfg(test)]
    fn owner_of(&self, method: &str) -> Option<ConnId> {
        self.methods
            .lock()
            .expect("rpc lock poisoned")
            .get(method)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ConnectionScope;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (
        Arc<EventRouter>,
        Arc<RpcRegistry>,
        ConnId,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let router = Arc::new(EventRouter::new());
        let registry = Arc::new(RpcRegistry::new(Arc::clone(&router)));
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = router.attach(ConnectionScope::Machine("m1".into()), tx);
        (router, registry, conn, rx)
    }

    #[test]
    fn register_is_exclusive_until_disconnect() {
        let (router, registry, conn, _rx) = setup();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let other = router.attach(ConnectionScope::User, tx2);

        registry.register("bash", conn).unwrap();
        assert_eq!(
            registry.register("bash", other),
            Err(RpcError::AlreadyRegistered("bash".into()))
        );
        assert_eq!(
            registry.unregister("bash", other),
            Err(RpcError::NotOwner("bash".into()))
        );

        let removed = registry.disconnect(conn);
        assert_eq!(removed, vec!["bash".to_string()]);
        registry.register("bash", other).unwrap();
        assert_eq!(registry.owner_of("bash"), Some(other));
    }

    #[test]
    fn unregister_unknown_method_fails() {
        let (_router, registry, conn, _rx) = setup();
        assert_eq!(
            registry.unregister("nope", conn),
            Err(RpcError::NotRegistered("nope".into()))
        );
    }

    #[tokio::test]
    async fn call_round_trips_through_the_owner() {
        let (_router, registry, conn, mut rx) = setup();
        registry.register("bash", conn).unwrap();

        let reg = Arc::clone(&registry);
        let call = tokio::spawn(async move { reg.call("bash", json!("ls")).await });

        let frame = rx.recv().await.unwrap();
        let (id, method, params) = match frame {
            ServerFrame::RpcRequest { id, method, params } => (id, method, params),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(method, "bash");
        assert_eq!(params, json!("ls"));

        registry.handle_response(conn, id, json!("ok\n"));
        assert_eq!(call.await.unwrap().unwrap(), json!("ok\n"));
    }

    #[tokio::test]
    async fn call_without_binding_fails_fast() {
        let (_router, registry, _conn, _rx) = setup();
        assert_eq!(
            registry.call("missing", json!(null)).await,
            Err(RpcError::NoHandler("missing".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_when_owner_never_acks() {
        let (_router, registry, conn, mut rx) = setup();
        registry.register("slow", conn).unwrap();

        let reg = Arc::clone(&registry);
        let call = tokio::spawn(async move { reg.call("slow", json!({})).await });
        // Absorb the request but never acknowledge it.
        let _ = rx.recv().await.unwrap();

        tokio::time::advance(RPC_CALL_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(call.await.unwrap(), Err(RpcError::Timeout));
        assert!(registry.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_from_non_owner_is_ignored() {
        let (router, registry, conn, mut rx) = setup();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let imposter = router.attach(ConnectionScope::User, tx2);
        registry.register("bash", conn).unwrap();

        let reg = Arc::clone(&registry);
        let call = tokio::spawn(async move { reg.call("bash", json!({})).await });
        let id = match rx.recv().await.unwrap() {
            ServerFrame::RpcRequest { id, .. } => id,
            other => panic!("unexpected frame: {other:?}"),
        };

        registry.handle_response(imposter, id, json!("spoofed"));
        registry.handle_response(conn, id, json!("real"));
        assert_eq!(call.await.unwrap().unwrap(), json!("real"));
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_calls() {
        let (_router, registry, conn, mut rx) = setup();
        registry.register("bash", conn).unwrap();

        let reg = Arc::clone(&registry);
        let call = tokio::spawn(async move { reg.call("bash", json!({})).await });
        let _ = rx.recv().await.unwrap();

        registry.disconnect(conn);
        assert_eq!(call.await.unwrap(), Err(RpcError::HandlerGone));
    }
}
