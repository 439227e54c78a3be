//! Endpoint cleanup across the process lifecycle.
//!
//! Every socket file a bus member binds is recorded in a process-wide
//! registry. A single exit hook, installed on first use, removes whatever
//! is still recorded when the process exits normally, so endpoints do not
//! outlive their process even when `close()` was never called.
//!
//! [`EndpointGuard`] ties one recorded endpoint to its owner: dropping the
//! guard removes the file, [`EndpointGuard::release`] does so explicitly
//! and reports the outcome.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use tracing::{debug, warn};

static OWNED_ENDPOINTS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
static EXIT_HOOK: Once = Once::new();

fn owned() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    OWNED_ENDPOINTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Record `path` as owned by this process and make sure the exit hook is
/// installed.
pub fn register(path: &Path) {
    install_exit_hook();
    owned().insert(path.to_path_buf());
    debug!(path = %path.display(), "Registered endpoint for exit cleanup");
}

/// Forget `path` without touching the file. Returns whether it was owned.
pub fn unregister(path: &Path) -> bool {
    owned().remove(path)
}

/// Endpoints currently owned by this process.
pub fn owned_endpoints() -> Vec<PathBuf> {
    owned().iter().cloned().collect()
}

/// Remove every owned endpoint file, tolerating files already gone.
///
/// Returns the number of files actually removed.
pub fn cleanup_owned_endpoints() -> usize {
    let paths = std::mem::take(&mut *owned());
    paths
        .iter()
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

extern "C" fn on_process_exit() {
    cleanup_owned_endpoints();
}

fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `on_process_exit` is a plain `extern "C" fn()` that only
        // touches process-global state guarded by a mutex.
        let rc = unsafe { nix::libc::atexit(on_process_exit) };
        if rc != 0 {
            warn!("Failed to install exit hook; endpoints may outlive the process");
        }
    });
}

/// Ownership of one bound endpoint file.
#[derive(Debug)]
pub struct EndpointGuard {
    path: PathBuf,
    armed: bool,
}

impl EndpointGuard {
    /// Take ownership of the endpoint at `path`.
    pub fn claim(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        register(&path);
        Self { path, armed: true }
    }

    /// The owned path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the endpoint file now and give up ownership.
    pub fn release(mut self) -> io::Result<()> {
        self.armed = false;
        unregister(&self.path);
        std::fs::remove_file(&self.path)
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unregister(&self.path);
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Cleaned up endpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to clean up endpoint"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn touch(path: &Path) {
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    #[serial]
    fn test_guard_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ns-1.sock");
        touch(&path);

        {
            let guard = EndpointGuard::claim(&path);
            assert_eq!(guard.path(), path.as_path());
            assert!(owned_endpoints().contains(&path));
        }

        assert!(!path.exists());
        assert!(!owned_endpoints().contains(&path));
    }

    #[test]
    #[serial]
    fn test_release_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ns-2.sock");
        touch(&path);

        let guard = EndpointGuard::claim(&path);
        std::fs::remove_file(&path).unwrap();

        let err = guard.release().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!owned_endpoints().contains(&path));
    }

    #[test]
    #[serial]
    fn test_path_can_be_reclaimed_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ns-3.sock");
        touch(&path);

        let first = EndpointGuard::claim(&path);
        first.release().unwrap();

        touch(&path);
        let second = EndpointGuard::claim(&path);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    #[serial]
    fn test_cleanup_tolerates_absent_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("ns-4.sock");
        let absent = dir.path().join("ns-5.sock");
        touch(&present);

        register(&present);
        register(&absent);

        assert_eq!(cleanup_owned_endpoints(), 1);
        assert!(!present.exists());
        assert!(!owned_endpoints().contains(&present));
        assert!(!owned_endpoints().contains(&absent));
    }
}
