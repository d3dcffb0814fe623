pub mod paths;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier for a session.
pub type SessionId = String;
/// Client-supplied identifier for a machine.
pub type MachineId = String;
/// Client-supplied identifier for an artifact.
pub type ArtifactId = String;

/// Connect-URL protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed WebSocket endpoint path on the public plane.
pub const WS_PATH: &str = "/v1/updates";

/// A session counts as active if it pinged within this window.
pub const ACTIVE_SESSION_WINDOW_MS: u64 = 15 * 60 * 1000;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Message bodies are stored wrapped; the daemon never looks inside `c`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub t: String,
    pub c: String,
}

impl MessageContent {
    pub fn encrypted(c: impl Into<String>) -> Self {
        Self {
            t: "encrypted".to_string(),
            c: c.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub tag: String,
    pub seq: u64,
    pub metadata: String,
    pub metadata_version: u64,
    pub agent_state: Option<String>,
    pub agent_state_version: u64,
    pub data_encryption_key: Option<String>,
    pub active: bool,
    pub active_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    pub seq: u64,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub seq: u64,
    pub metadata: String,
    pub metadata_version: u64,
    pub daemon_state: Option<String>,
    pub daemon_state_version: u64,
    pub data_encryption_key: Option<String>,
    pub active: bool,
    pub active_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: ArtifactId,
    pub seq: u64,
    pub header: String,
    pub header_version: u64,
    pub body: String,
    pub body_version: u64,
    pub data_encryption_key: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A value paired with the version produced by the write that set it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Option<String>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// WebSocket handshake
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    UserScoped,
    SessionScoped,
    MachineScoped,
}

/// First frame a client must send after the WebSocket upgrade.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthHandshake {
    pub token: String,
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
}

// ---------------------------------------------------------------------------
// Client -> server frames
// ---------------------------------------------------------------------------

/// Frames sent by connected clients. Frames that expect a callback carry a
/// client-chosen `id`; the server answers with a `result` frame echoing it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Message {
        sid: SessionId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<String>,
    },
    SessionAlive {
        sid: SessionId,
        time: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<bool>,
    },
    SessionEnd {
        sid: SessionId,
        time: u64,
    },
    UpdateMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        sid: SessionId,
        metadata: String,
        expected_version: u64,
    },
    UpdateState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        sid: SessionId,
        agent_state: Option<String>,
        expected_version: u64,
    },
    MachineAlive {
        machine_id: MachineId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<u64>,
    },
    MachineUpdateMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        machine_id: MachineId,
        metadata: String,
        expected_version: u64,
    },
    MachineUpdateState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        machine_id: MachineId,
        daemon_state: Option<String>,
        expected_version: u64,
    },
    ArtifactCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        artifact_id: ArtifactId,
        header: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_encryption_key: Option<String>,
    },
    ArtifactRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        artifact_id: ArtifactId,
    },
    ArtifactUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_expected_version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_expected_version: Option<u64>,
    },
    ArtifactDelete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        artifact_id: ArtifactId,
    },
    UsageReport {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        tokens: serde_json::Value,
        cost: serde_json::Value,
    },
    RpcRegister {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        method: String,
    },
    RpcUnregister {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        method: String,
    },
    RpcCall {
        id: u64,
        method: String,
        params: serde_json::Value,
    },
    RpcResponse {
        id: u64,
        result: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// A persistent, sequenced notification of a state change.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub id: String,
    pub seq: u64,
    pub body: UpdateBody,
    pub created_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum UpdateBody {
    #[serde(rename_all = "camelCase")]
    NewSession { session: Session },
    #[serde(rename_all = "camelCase")]
    UpdateSession {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_state: Option<VersionedValue>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteSession { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    NewMessage {
        session_id: SessionId,
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    NewMachine { machine: Machine },
    #[serde(rename_all = "camelCase")]
    UpdateMachine {
        machine_id: MachineId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        daemon_state: Option<VersionedValue>,
    },
    #[serde(rename_all = "camelCase")]
    NewArtifact { artifact: Artifact },
    #[serde(rename_all = "camelCase")]
    UpdateArtifact {
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<VersionedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<VersionedValue>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteArtifact { artifact_id: ArtifactId },
    // Carried for client compatibility; the P2P daemon never emits these.
    UpdateAccount { account: serde_json::Value },
    RelationshipUpdated { relationship: serde_json::Value },
    NewFeedPost { post: serde_json::Value },
    KvBatchUpdate { changes: serde_json::Value },
}

/// Transient notifications with no ordering or replay guarantee.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EphemeralEvent {
    #[serde(rename_all = "camelCase")]
    Activity {
        id: SessionId,
        active: bool,
        active_at: u64,
        thinking: bool,
    },
    #[serde(rename_all = "camelCase")]
    MachineActivity {
        id: MachineId,
        active: bool,
        active_at: u64,
    },
    #[serde(rename_all = "camelCase")]
    Usage {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        tokens: serde_json::Value,
        cost: serde_json::Value,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    MachineStatus { machine_id: MachineId, status: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    AuthResult {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Update {
        #[serde(flatten)]
        envelope: UpdateEnvelope,
    },
    Ephemeral { event: EphemeralEvent },
    RpcRequest {
        id: u64,
        method: String,
        params: serde_json::Value,
    },
    RpcRegistered { method: String },
    RpcUnregistered { method: String },
    RpcError { method: String, message: String },
    Result {
        id: u64,
        #[serde(flatten)]
        payload: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Spawn / supervisor contracts
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionRequest {
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default)]
    pub approved_new_directory_creation: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpawnOutcome {
    #[serde(rename_all = "camelCase")]
    Success { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    NeedsDirectoryApproval { directory: String },
    #[serde(rename_all = "camelCase")]
    Error { error_message: String },
}

/// Body of the child self-report webhook (`POST /session-started`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedReport {
    pub session_id: SessionId,
    pub metadata: SessionStartedMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedMetadata {
    pub host_pid: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartedBy {
    Daemon,
    External,
}

/// Snapshot of one tracked child, as returned by the control plane.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackedChildInfo {
    pub pid: u32,
    pub started_by: StartedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_window: Option<String>,
    pub directory_created: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Daemon state file
// ---------------------------------------------------------------------------

/// On-disk record of the running daemon. Single JSON object, single writer.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub pid: u32,
    pub http_port: u16,
    pub p2p_port: u16,
    pub p2p_host: String,
    /// Shared secret, base64 (standard, padded).
    pub p2p_shared_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    pub start_time: u64,
    pub started_with_cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
    pub log_path: String,
}

/// JSON payload carried in the connect-URL fragment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectPayload {
    pub mode: String,
    pub host: String,
    /// 0 signals tunnel mode; `host` then carries the full URL.
    pub port: u16,
    /// Shared secret, base64.
    pub key: String,
    pub v: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_body_uses_kebab_case_discriminators() {
        let body = UpdateBody::NewSession {
            session: Session {
                id: "s1".into(),
                tag: "t1".into(),
                seq: 1,
                metadata: "AAAA".into(),
                metadata_version: 1,
                agent_state: None,
                agent_state_version: 0,
                data_encryption_key: None,
                active: true,
                active_at: 5,
                created_at: 5,
                updated_at: 5,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["t"], "new-session");
        assert_eq!(v["session"]["metadataVersion"], 1);

        let v = serde_json::to_value(UpdateBody::DeleteArtifact {
            artifact_id: "a1".into(),
        })
        .unwrap();
        assert_eq!(v["t"], "delete-artifact");
        assert_eq!(v["artifactId"], "a1");
    }

    #[test]
    fn server_frame_update_flattens_envelope() {
        let frame = ServerFrame::Update {
            envelope: UpdateEnvelope {
                id: "u1".into(),
                seq: 7,
                body: UpdateBody::DeleteSession {
                    session_id: "s1".into(),
                },
                created_at: 9,
            },
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "update");
        assert_eq!(v["seq"], 7);
        assert_eq!(v["body"]["t"], "delete-session");
        assert_eq!(v["createdAt"], 9);
    }

    #[test]
    fn ephemeral_keeps_its_own_type_tag() {
        let frame = ServerFrame::Ephemeral {
            event: EphemeralEvent::Activity {
                id: "s1".into(),
                active: true,
                active_at: 3,
                thinking: false,
            },
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "ephemeral");
        assert_eq!(v["event"]["type"], "activity");
        assert_eq!(v["event"]["activeAt"], 3);
    }

    #[test]
    fn client_frame_round_trips() {
        let raw = json!({
            "type": "update-metadata",
            "id": 4,
            "sid": "s1",
            "metadata": "AAAA",
            "expectedVersion": 3,
        });
        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ClientFrame::UpdateMetadata {
                id,
                sid,
                expected_version,
                ..
            } => {
                assert_eq!(id, Some(4));
                assert_eq!(sid, "s1");
                assert_eq!(expected_version, 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn spawn_outcome_wire_tags() {
        let v = serde_json::to_value(SpawnOutcome::Success {
            session_id: "S1".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "success", "sessionId": "S1"}));

        let v = serde_json::to_value(SpawnOutcome::NeedsDirectoryApproval {
            directory: "/tmp/x".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "needsDirectoryApproval");

        let v = serde_json::to_value(SpawnOutcome::Error {
            error_message: "boom".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "error", "errorMessage": "boom"}));
    }

    #[test]
    fn session_started_report_reads_host_pid() {
        let raw = json!({
            "sessionId": "S1",
            "metadata": {"hostPid": 4321, "agent": "claude"},
        });
        let report: SessionStartedReport = serde_json::from_value(raw).unwrap();
        assert_eq!(report.metadata.host_pid, 4321);
        assert_eq!(report.metadata.extra["agent"], "claude");
    }

    #[test]
    fn state_file_round_trips_camel_case() {
        let state = StateFile {
            pid: 42,
            http_port: 1000,
            p2p_port: 2000,
            p2p_host: "192.168.1.2".into(),
            p2p_shared_secret: "c2VjcmV0".into(),
            tunnel_url: None,
            start_time: 1,
            started_with_cli_version: "1.0.0".into(),
            last_heartbeat: None,
            log_path: "/tmp/daemon.log".into(),
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["httpPort"], 1000);
        assert_eq!(v["p2pSharedSecret"], "c2VjcmV0");
        assert_eq!(v["startedWithCliVersion"], "1.0.0");
        assert!(v.get("tunnelUrl").is_none());
        let back: StateFile = serde_json::from_value(v).unwrap();
        assert_eq!(back.pid, 42);
    }
}
