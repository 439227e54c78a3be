//! Peer discovery.
//!
//! Lists the base directory and returns every socket that belongs to the
//! namespace (`{base_path}/{namespace}-*.sock`), excluding the caller's own
//! address. The result is a snapshot taken at call time; stale sockets
//! left behind by dead members are included and fail later, on connect.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::address::member_uid;

/// The base directory could not be listed.
#[derive(Debug, Clone, Error)]
#[error("Failed to scan {path}: {message}")]
pub struct ScanError {
    pub path: PathBuf,
    pub kind: std::io::ErrorKind,
    pub message: String,
}

impl ScanError {
    fn new(path: &Path, e: &std::io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Find the addresses of all other members of `namespace`.
///
/// Addresses are returned sorted.
pub async fn find_peers(
    base_path: &Path,
    namespace: &str,
    self_address: &Path,
) -> Result<Vec<PathBuf>, ScanError> {
    let mut entries = tokio::fs::read_dir(base_path)
        .await
        .map_err(|e| ScanError::new(base_path, &e))?;

    let mut peers = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(ScanError::new(base_path, &e)),
        };

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if member_uid(name, namespace).is_none() {
            continue;
        }

        let path = entry.path();
        if path == self_address {
            continue;
        }

        // Entries can vanish between listing and stat
        match entry.file_type().await {
            Ok(ft) if ft.is_socket() => peers.push(path),
            Ok(_) => debug!(path = %path.display(), "Skipping non-socket entry"),
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable entry"),
        }
    }

    peers.sort();
    debug!(
        namespace = %namespace,
        base_path = %base_path.display(),
        found = peers.len(),
        "Discovered peers"
    );
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[tokio::test]
    async fn test_finds_namespace_sockets_except_self() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        let _l1 = UnixListener::bind(base.join("ns-1.sock")).unwrap();
        let _l2 = UnixListener::bind(base.join("ns-2.sock")).unwrap();
        let _l3 = UnixListener::bind(base.join("ns-3.sock")).unwrap();
        let _other = UnixListener::bind(base.join("other-1.sock")).unwrap();
        let _longer = UnixListener::bind(base.join("ns-extra-4.sock")).unwrap();

        let peers = find_peers(base, "ns", &base.join("ns-2.sock")).await.unwrap();
        assert_eq!(peers, vec![base.join("ns-1.sock"), base.join("ns-3.sock")]);
    }

    #[tokio::test]
    async fn test_includes_stale_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        drop(UnixListener::bind(base.join("ns-9.sock")).unwrap());

        let peers = find_peers(base, "ns", &base.join("ns-1.sock")).await.unwrap();
        assert_eq!(peers, vec![base.join("ns-9.sock")]);
    }

    #[tokio::test]
    async fn test_skips_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ns-5.sock"), b"not a socket").unwrap();

        let peers = find_peers(dir.path(), "ns", &dir.path().join("ns-1.sock"))
            .await
            .unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = find_peers(&missing, "ns", &missing.join("ns-1.sock"))
            .await
            .unwrap_err();
        assert_eq!(err.path, missing);
        assert_eq!(err.kind, std::io::ErrorKind::NotFound);
    }
}
