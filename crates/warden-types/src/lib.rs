//! Shared vocabulary types for the warden host and its operators.

/// Lifecycle of the watchdog loop for one instance.
///
/// Only the supervisor loop transitions this; callback handlers and
/// operator calls enqueue intents instead of mutating it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WatchdogState {
    Offline,
    Starting,
    Online,
    HardRebooting,
    Restoring,
    DelayedRestart,
}

/// One of the two interchangeable on-disk build slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            SlotId::A => "a",
            SlotId::B => "b",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "a" => Some(SlotId::A),
            "b" => Some(SlotId::B),
            _ => None,
        }
    }
}

/// Sandboxing level the engine must be launched with for a given build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum SecurityLevel {
    Ultrasafe,
    Safe,
    Trusted,
}

/// A finished compiled build, produced by the external compiler and
/// staged into one of the two slots. Immutable once produced; newer
/// artifacts supersede (never mutate) older ones.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompileArtifact {
    pub slot: SlotId,
    pub revision: String,
    pub minimum_security_level: SecurityLevel,
    pub interop_version: Option<String>,
}

/// Enough state to re-acquire a still-running server process after the
/// host service itself restarts, instead of killing and relaunching it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReattachInfo {
    pub pid: u32,
    pub port: u16,
    pub comms_key: String,
    pub interop_version: Option<String>,
    pub reboot_expected: bool,
    pub active_artifact: Option<CompileArtifact>,
}

/// Lock-free status read published by the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub state: WatchdogState,
    pub current_port: Option<u16>,
    pub pid: Option<u32>,
    pub active_artifact: Option<CompileArtifact>,
    pub staged_artifact: Option<CompileArtifact>,
    pub soft_shutdown_requested: bool,
    pub soft_restart_requested: bool,
}

impl StatusSnapshot {
    pub fn offline() -> Self {
        Self {
            state: WatchdogState::Offline,
            current_port: None,
            pid: None,
            active_artifact: None,
            staged_artifact: None,
            soft_shutdown_requested: false,
            soft_restart_requested: false,
        }
    }
}

/// Routing hint for fire-and-forget chat notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NotifyCategory {
    Lifecycle,
    Deploy,
    Chat,
    Admin,
}
