//! Persistent metadata handle (`spec.md` §6 "Persisted state").
//!
//! The core does not persist anything; the ordering engine owns a
//! key/value object store whose only two keys this shim cares about at
//! boot are `ERASE_METADATA_ON_STARTUP` and `START_NEW_EPOCH`. This crate
//! does not implement that store — it is handed one and, when the erase
//! key is set, removes on-disk key-view files matching a known prefix
//! before the ordering engine reinitializes.

use std::path::{Path, PathBuf};

/// Narrow capability over the ordering engine's metadata store
/// (`spec.md` §6). Implemented by whatever owns the actual key/value
/// object store; this crate only reads the two startup keys it needs.
pub trait PersistentMetadataStore: Send + Sync {
    /// `true` if `ERASE_METADATA_ON_STARTUP` is set.
    fn erase_metadata_on_startup(&self) -> bool;

    /// `true` if `START_NEW_EPOCH` is set.
    fn start_new_epoch(&self) -> bool;

    /// Clears both startup keys once they have been acted on, so a
    /// subsequent restart does not re-trigger the same startup behavior.
    fn clear_startup_keys(&self);
}

/// Removes on-disk key-view files under `data_dir` whose name starts
/// with `prefix`, mirroring the original ordering engine's erase-on-boot
/// behavior (`spec.md` §6).
///
/// Errors removing an individual file are logged and skipped rather than
/// propagated — a half-erased directory is still safer on restart than
/// refusing to boot.
pub fn erase_key_view_files(data_dir: &Path, prefix: &str) -> std::io::Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) {
            continue;
        }
        let path: PathBuf = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to erase key-view file"),
        }
    }
    Ok(removed)
}

/// Runs the boot-time metadata check: erases key-view files if
/// `ERASE_METADATA_ON_STARTUP` is set, then clears both startup keys.
pub fn run_startup_sequence(
    store: &dyn PersistentMetadataStore,
    data_dir: &Path,
    key_view_prefix: &str,
) -> std::io::Result<()> {
    if store.erase_metadata_on_startup() {
        let removed = erase_key_view_files(data_dir, key_view_prefix)?;
        tracing::info!(removed, "erased key-view files on startup");
    }
    if store.start_new_epoch() {
        tracing::info!("starting new epoch per persisted metadata");
    }
    store.clear_startup_keys();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeStore {
        erase: AtomicBool,
        new_epoch: AtomicBool,
        cleared: Mutex<bool>,
    }

    impl PersistentMetadataStore for FakeStore {
        fn erase_metadata_on_startup(&self) -> bool {
            self.erase.load(Ordering::Relaxed)
        }

        fn start_new_epoch(&self) -> bool {
            self.new_epoch.load(Ordering::Relaxed)
        }

        fn clear_startup_keys(&self) {
            *self.cleared.lock().unwrap() = true;
            self.erase.store(false, Ordering::Relaxed);
            self.new_epoch.store(false, Ordering::Relaxed);
        }
    }

    #[test]
    fn erase_removes_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kv_view_0001"), b"x").unwrap();
        std::fs::write(dir.path().join("kv_view_0002"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let removed = erase_key_view_files(dir.path(), "kv_view_").unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("unrelated.txt").exists());
        assert!(!dir.path().join("kv_view_0001").exists());
    }

    #[test]
    fn erase_on_missing_dir_is_a_noop() {
        let removed = erase_key_view_files(Path::new("/no/such/directory"), "kv_view_").unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn startup_sequence_clears_keys_after_acting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kv_view_0001"), b"x").unwrap();
        let store = FakeStore {
            erase: AtomicBool::new(true),
            new_epoch: AtomicBool::new(false),
            cleared: Mutex::new(false),
        };
        run_startup_sequence(&store, dir.path(), "kv_view_").unwrap();
        assert!(*store.cleared.lock().unwrap());
        assert!(!store.erase_metadata_on_startup());
    }
}
