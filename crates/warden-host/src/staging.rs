//! A/B build slots and the `live` indirection the server reads from.
//!
//! Exactly one slot is live at any observable instant. Deployments
//! write into the non-live slot and swap the indirection at a safe
//! point; the swap is a temp-link-plus-rename, so a concurrent reader
//! never sees a missing or half-updated target.

use std::path::PathBuf;

use tokio::sync::Mutex;
use warden_types::SlotId;

pub const LIVE_LINK: &str = "live";
/// Marker the running server drops inside the slot it currently has
/// open, and removes when it lets go of that build.
pub const LOCK_MARKER: &str = ".held-by-server";

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("live indirection points outside the managed slots: {0}")]
    ForeignLiveTarget(String),
    #[error("live indirection missing; staging layout not initialized")]
    NotInitialized,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Atomic pointer-replacement primitive behind the `live` name.
///
/// Native symlinks where the platform has them, an atomically renamed
/// pointer file elsewhere; the contract is identical: a reader always
/// resolves to exactly one target.
pub(crate) mod indirection {
    use std::io;
    use std::path::Path;

    #[cfg(unix)]
    pub fn replace(link: &Path, target: &str) -> io::Result<()> {
        let tmp = link.with_file_name(format!(
            "{}.swap",
            link.file_name().and_then(|n| n.to_str()).unwrap_or("live")
        ));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(target, &tmp)?;
        std::fs::rename(&tmp, link)
    }

    #[cfg(unix)]
    pub fn read(link: &Path) -> io::Result<Option<String>> {
        match std::fs::read_link(link) {
            Ok(target) => Ok(Some(target.to_string_lossy().into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(not(unix))]
    pub fn replace(link: &Path, target: &str) -> io::Result<()> {
        let tmp = link.with_file_name(format!(
            "{}.swap",
            link.file_name().and_then(|n| n.to_str()).unwrap_or("live")
        ));
        std::fs::write(&tmp, target)?;
        std::fs::rename(&tmp, link)
    }

    #[cfg(not(unix))]
    pub fn read(link: &Path) -> io::Result<Option<String>> {
        match std::fs::read_to_string(link) {
            Ok(target) => Ok(Some(target.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug)]
pub struct StagingSwapper {
    root: PathBuf,
    // Two concurrent deployments to the same instance serialize here,
    // never race on the indirection.
    deploy_lock: Mutex<()>,
}

impl StagingSwapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            deploy_lock: Mutex::new(()),
        }
    }

    pub fn slot_path(&self, slot: SlotId) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    fn live_link_path(&self) -> PathBuf {
        self.root.join(LIVE_LINK)
    }

    fn lock_marker_path(&self, slot: SlotId) -> PathBuf {
        self.slot_path(slot).join(LOCK_MARKER)
    }

    /// Create both slots and point `live` at slot A if nothing is live
    /// yet. Idempotent.
    pub fn ensure_layout(&self) -> Result<(), StagingError> {
        std::fs::create_dir_all(self.slot_path(SlotId::A))?;
        std::fs::create_dir_all(self.slot_path(SlotId::B))?;
        if indirection::read(&self.live_link_path())?.is_none() {
            indirection::replace(&self.live_link_path(), SlotId::A.dir_name())?;
        }
        Ok(())
    }

    /// Which slot `live` currently resolves to.
    pub fn live_slot(&self) -> Result<SlotId, StagingError> {
        let target =
            indirection::read(&self.live_link_path())?.ok_or(StagingError::NotInitialized)?;
        SlotId::from_dir_name(&target).ok_or(StagingError::ForeignLiveTarget(target))
    }

    /// Absolute path the server should be launched from.
    pub fn live_dir(&self) -> Result<PathBuf, StagingError> {
        Ok(self.slot_path(self.live_slot()?))
    }

    /// The slot a new deployment may write into: the one not referenced
    /// by `live`. Self-healing: if the server still holds the slot that
    /// ought to be writable (its lock marker is present), the
    /// indirection is stale from an interrupted swap — un-swap `live`
    /// back onto the held slot and hand out the other one.
    pub async fn writable_slot(&self) -> Result<(SlotId, PathBuf), StagingError> {
        let _guard = self.deploy_lock.lock().await;

        let live = self.live_slot()?;
        let other = live.other();

        if self.slot_held(other) && !self.slot_held(live) {
            tracing::warn!(
                held = other.dir_name(),
                stale_live = live.dir_name(),
                "live indirection is stale; un-swapping onto the slot the server holds"
            );
            indirection::replace(&self.live_link_path(), other.dir_name())?;
            return Ok((live, self.slot_path(live)));
        }

        Ok((other, self.slot_path(other)))
    }

    /// Atomically repoint `live` at `slot`. Fails closed: on any error
    /// the previously live slot remains live.
    pub async fn swap(&self, slot: SlotId) -> Result<(), StagingError> {
        let _guard = self.deploy_lock.lock().await;
        indirection::replace(&self.live_link_path(), slot.dir_name())?;
        tracing::info!(live = slot.dir_name(), "live slot swapped");
        Ok(())
    }

    /// Whether the running server still has `slot` open, as reported by
    /// its transient lock marker.
    pub fn slot_held(&self, slot: SlotId) -> bool {
        self.lock_marker_path(slot).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn swapper() -> (TempDir, StagingSwapper) {
        let tmp = TempDir::new().unwrap();
        let s = StagingSwapper::new(tmp.path().join("game"));
        s.ensure_layout().unwrap();
        (tmp, s)
    }

    #[tokio::test]
    async fn fresh_layout_is_live_a_writable_b() {
        let (_tmp, s) = swapper();
        assert_eq!(s.live_slot().unwrap(), SlotId::A);
        let (slot, path) = s.writable_slot().await.unwrap();
        assert_eq!(slot, SlotId::B);
        assert!(path.ends_with("b"));
    }

    #[tokio::test]
    async fn swap_flips_live_and_writable() {
        let (_tmp, s) = swapper();
        s.swap(SlotId::B).await.unwrap();
        assert_eq!(s.live_slot().unwrap(), SlotId::B);
        let (slot, _) = s.writable_slot().await.unwrap();
        assert_eq!(slot, SlotId::A);
    }

    #[tokio::test]
    async fn live_always_resolves_to_exactly_one_slot() {
        let (_tmp, s) = swapper();
        for i in 0..50 {
            let target = if i % 2 == 0 { SlotId::B } else { SlotId::A };
            s.swap(target).await.unwrap();
            let live = s.live_slot().unwrap();
            assert!(live == SlotId::A || live == SlotId::B);
            assert_eq!(live, target);
        }
    }

    #[tokio::test]
    async fn stale_indirection_unswaps_onto_held_slot() {
        let (_tmp, s) = swapper();
        // Server still holds A, but an interrupted deployment left
        // `live` pointing at B.
        std::fs::write(s.slot_path(SlotId::A).join(LOCK_MARKER), b"").unwrap();
        s.swap(SlotId::B).await.unwrap();

        let (slot, _) = s.writable_slot().await.unwrap();
        assert_eq!(slot, SlotId::B, "held slot must not be handed out");
        assert_eq!(s.live_slot().unwrap(), SlotId::A, "live healed onto held slot");
    }

    #[tokio::test]
    async fn held_live_slot_is_normal_case() {
        let (_tmp, s) = swapper();
        // Server holds the live slot: nothing to heal.
        std::fs::write(s.slot_path(SlotId::A).join(LOCK_MARKER), b"").unwrap();
        let (slot, _) = s.writable_slot().await.unwrap();
        assert_eq!(slot, SlotId::B);
        assert_eq!(s.live_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn uninitialized_root_reports_not_initialized() {
        let tmp = TempDir::new().unwrap();
        let s = StagingSwapper::new(tmp.path().join("game"));
        assert!(matches!(
            s.live_slot().unwrap_err(),
            StagingError::NotInitialized
        ));
    }
}
