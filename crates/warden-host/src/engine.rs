//! A/B-style staging for engine runtime installations.
//!
//! Layout under `<instance>/engine/`:
//!   versions/<version>/   installed runtimes
//!   staging/<version>/    at most one version waiting to go active
//!   active                indirection naming the active version
//!
//! A staged version is promoted either by an explicit `apply` while the
//! server is offline, or by the supervisor at the next pre-launch safe
//! point. The version backing the live deployment can never be deleted
//! or overwritten.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::staging::indirection;

pub const ACTIVE_LINK: &str = "active";
const VERSIONS_DIR: &str = "versions";
const STAGING_DIR: &str = "staging";

/// Name of the engine daemon binary inside an installed version.
pub const ENGINE_BINARY: &str = "bin/engined";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine version {0} is in use by the live deployment")]
    VersionInUse(String),
    #[error("engine version {0} is not installed")]
    NotInstalled(String),
    #[error("no engine version is staged")]
    NothingStaged,
    #[error("no engine version is active")]
    NoActiveVersion,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of an apply attempt while a server may be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The staged version is now active.
    Applied(String),
    /// The active version is in use; the staged version stays queued
    /// for the next natural restart.
    Deferred(String),
}

#[derive(Debug)]
pub struct EngineVersionStager {
    root: PathBuf,
    lock: Mutex<()>,
}

impl EngineVersionStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(self.root.join(VERSIONS_DIR))?;
        std::fs::create_dir_all(self.root.join(STAGING_DIR))?;
        Ok(())
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(VERSIONS_DIR).join(version)
    }

    fn staging_dir(&self, version: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(version)
    }

    fn active_link(&self) -> PathBuf {
        self.root.join(ACTIVE_LINK)
    }

    /// Version the `active` indirection currently names, if any.
    pub fn active_version(&self) -> Result<Option<String>, EngineError> {
        Ok(indirection::read(&self.active_link())?)
    }

    /// Path of the engine daemon for the active version.
    pub fn server_executable(&self) -> Result<PathBuf, EngineError> {
        let version = self.active_version()?.ok_or(EngineError::NoActiveVersion)?;
        Ok(self.version_dir(&version).join(ENGINE_BINARY))
    }

    fn staged_version_locked(&self) -> Result<Option<String>, EngineError> {
        let dir = self.root.join(STAGING_DIR);
        let mut entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match entries.next() {
            Some(entry) => Ok(entry?.file_name().to_str().map(str::to_string)),
            None => Ok(None),
        }
    }

    /// Version queued for promotion, if any.
    pub async fn staged_version(&self) -> Result<Option<String>, EngineError> {
        let _guard = self.lock.lock().await;
        self.staged_version_locked()
    }

    /// Move an already-extracted runtime tree into the staging area.
    /// A previously staged version is superseded; the active version
    /// cannot be overwritten.
    pub async fn stage(&self, version: &str, contents: &Path) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;

        if self.active_version()?.as_deref() == Some(version) {
            return Err(EngineError::VersionInUse(version.to_string()));
        }

        if let Some(old) = self.staged_version_locked()? {
            std::fs::remove_dir_all(self.staging_dir(&old))?;
        }
        std::fs::rename(contents, self.staging_dir(version))?;
        tracing::info!(version, "engine version staged");
        Ok(())
    }

    fn promote_locked(&self, version: &str) -> Result<(), EngineError> {
        let target = self.version_dir(version);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(self.staging_dir(version), &target)?;
        indirection::replace(&self.active_link(), version)?;
        tracing::info!(version, "engine version active");
        Ok(())
    }

    /// Promote the staged version now if the server is offline;
    /// otherwise leave it queued and report the deferral.
    pub async fn apply(&self, process_online: bool) -> Result<ApplyOutcome, EngineError> {
        let _guard = self.lock.lock().await;
        let version = self.staged_version_locked()?.ok_or(EngineError::NothingStaged)?;

        if process_online {
            tracing::info!(version, "active engine in use; apply deferred to next restart");
            return Ok(ApplyOutcome::Deferred(version));
        }

        self.promote_locked(&version)?;
        Ok(ApplyOutcome::Applied(version))
    }

    /// Pre-launch safe point: promote whatever is staged, if anything.
    /// Returns the promoted version.
    pub async fn apply_pending(&self) -> Result<Option<String>, EngineError> {
        let _guard = self.lock.lock().await;
        match self.staged_version_locked()? {
            Some(version) => {
                self.promote_locked(&version)?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// Remove an installed version. The active version fails fast with
    /// a named condition and nothing on disk changes.
    pub async fn delete(&self, version: &str) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;

        if self.active_version()?.as_deref() == Some(version) {
            return Err(EngineError::VersionInUse(version.to_string()));
        }
        let dir = self.version_dir(version);
        if !dir.exists() {
            return Err(EngineError::NotInstalled(version.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(version, "engine version deleted");
        Ok(())
    }

    pub async fn installed_versions(&self) -> Result<Vec<String>, EngineError> {
        let _guard = self.lock.lock().await;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join(VERSIONS_DIR))? {
            if let Some(name) = entry?.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}
