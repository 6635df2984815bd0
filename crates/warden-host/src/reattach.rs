//! Persistence for reattach state.
//!
//! The record is written whenever the supervisor may lose ownership of
//! a still-running server (service shutdown, or across a relaunch in
//! case the service itself dies mid-restart), read exactly once at
//! startup, and cleared after a successful reattach handshake or an
//! explicit detach.

use std::path::PathBuf;

use anyhow::Context;
use warden_types::ReattachInfo;

pub trait ReattachStore: Send + Sync {
    fn save(&self, info: &ReattachInfo) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Option<ReattachInfo>>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// JSON file next to the instance data, written atomically via a temp
/// file and rename so a concurrent service kill never leaves half a
/// record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReattachStore for JsonFileStore {
    fn save(&self, info: &ReattachInfo) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("create reattach dir")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(info).context("serialize reattach info")?;
        std::fs::write(&tmp, data).context("write reattach tmp file")?;
        std::fs::rename(&tmp, &self.path).context("persist reattach file")?;
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Option<ReattachInfo>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read reattach file"),
        };
        match serde_json::from_str::<ReattachInfo>(&data) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // A corrupt record is as good as none; a cold start follows.
                tracing::warn!(error = %e, path = %self.path.display(), "discarding unreadable reattach record");
                Ok(None)
            }
        }
    }

    fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("remove reattach file"),
        }
    }
}

/// Whether `pid` refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0: existence probe only. EPERM still means alive.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_types::{CompileArtifact, SecurityLevel, SlotId};

    fn sample() -> ReattachInfo {
        ReattachInfo {
            pid: 4242,
            port: 5200,
            comms_key: "k".repeat(64),
            interop_version: Some("2.1.0".to_string()),
            reboot_expected: false,
            active_artifact: Some(CompileArtifact {
                slot: SlotId::B,
                revision: "deadbeef".to_string(),
                minimum_security_level: SecurityLevel::Safe,
                interop_version: Some("2.1.0".to_string()),
            }),
        }
    }

    #[test]
    fn save_load_clear_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("reattach.json"));

        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_record_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reattach.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::new(path);
        assert!(store.load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        // Far beyond any configurable pid_max.
        assert!(!pid_alive(99_999_999));
    }
}
