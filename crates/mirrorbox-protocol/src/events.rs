//! Runtime events published by the sandbox bridge.
//!
//! Events travel over a bounded broadcast channel. Slow observers may lag and
//! miss events; none of them carry state that cannot be re-read from the
//! engine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the workspace runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Idle,
    Booting,
    Ready,
    /// Boot failed; actions are blocked until boot is retried.
    Error { message: String },
}

impl WorkspaceStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkspaceStatus::Ready)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkspaceStatus::Idle => "idle",
            WorkspaceStatus::Booting => "booting",
            WorkspaceStatus::Ready => "ready",
            WorkspaceStatus::Error { .. } => "error",
        }
    }
}

/// Event emitted by the runtime for UI observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    /// The workspace status changed.
    Status { status: WorkspaceStatus },

    /// A command process was spawned.
    ProcessStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        command: String,
    },

    /// The active command process terminated.
    ProcessExited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        exit_code: i32,
    },

    /// A process announced a listening dev server.
    #[serde(rename = "server-ready")]
    ServerReady { port: u16, url: String },

    /// A process that announced a server exited unsuccessfully.
    #[serde(rename = "server-crash")]
    ServerCrash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        exit_code: i32,
    },

    /// The mirror was rebuilt from the sandbox filesystem.
    Synced { file_count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&WorkspaceStatus::Error {
            message: "no shell".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"error","message":"no shell"}"#);
        assert_eq!(WorkspaceStatus::default(), WorkspaceStatus::Idle);
    }

    #[test]
    fn test_event_tags() {
        let json = serde_json::to_string(&SandboxEvent::ServerReady {
            port: 5173,
            url: "http://localhost:5173".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"server-ready\""));

        let json = serde_json::to_string(&SandboxEvent::Synced { file_count: 3 }).unwrap();
        assert!(json.contains("\"type\":\"synced\""));
    }
}
