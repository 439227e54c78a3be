//! Endpoint addressing.
//!
//! Maps a `(namespace, uid)` pair to the Unix socket path a bus member
//! listens on:
//!
//! ```text
//! {base_path}/{namespace}-{uid}.sock
//! ```
//!
//! Uids never contain `-`, so the last `-` in a file name always separates
//! the namespace from the uid. That keeps [`resolve`] injective and lets
//! discovery tell `ns-7.sock` apart from `ns-extra-7.sock`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default base path for bus sockets.
pub const DEFAULT_BASE_PATH: &str = "/tmp";

/// File name suffix for bus sockets.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Separator between namespace and uid in a socket file name.
pub const UID_SEPARATOR: char = '-';

/// Longest path accepted for a Unix socket (`sun_path` minus the NUL).
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Errors raised while validating addressing inputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Cannot create a bus member without a namespace")]
    MissingNamespace,

    #[error("Invalid namespace '{0}': must not contain '/' or NUL")]
    InvalidNamespace(String),

    #[error("Invalid uid '{0}': must be non-empty, non-numeric text without '-', '/', '*' or NUL")]
    InvalidUid(String),

    #[error("Socket path too long ({len} bytes, max {MAX_SOCKET_PATH_LEN}): {path}")]
    PathTooLong { path: String, len: usize },
}

/// Identifier of a bus member, unique among live members of a namespace.
///
/// Defaults to the OS process id. Numeric uids serialize as JSON numbers,
/// named uids as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Uid {
    /// Numeric uid, typically a process id.
    Num(u64),
    /// Free-form uid.
    Name(String),
}

impl Uid {
    /// Uid of the current process.
    pub fn current_process() -> Self {
        Uid::Num(nix::unistd::getpid().as_raw() as u64)
    }

    /// Check that the uid can be embedded in a socket file name.
    pub fn validate(&self) -> Result<(), AddressError> {
        match self {
            Uid::Num(_) => Ok(()),
            Uid::Name(name) => {
                // numeric text would alias Uid::Num
                let bad = name.is_empty()
                    || name.parse::<u64>().is_ok()
                    || name
                        .chars()
                        .any(|c| c == UID_SEPARATOR || c == '/' || c == '*' || c == '\0');
                if bad {
                    Err(AddressError::InvalidUid(name.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::current_process()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uid::Num(n) => write!(f, "{n}"),
            Uid::Name(s) => f.write_str(s),
        }
    }
}

impl FromStr for Uid {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Uid::from(s))
    }
}

impl From<u32> for Uid {
    fn from(n: u32) -> Self {
        Uid::Num(n as u64)
    }
}

impl From<u64> for Uid {
    fn from(n: u64) -> Self {
        Uid::Num(n)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        s.parse::<u64>()
            .map(Uid::Num)
            .unwrap_or_else(|_| Uid::Name(s.to_string()))
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        match s.parse::<u64>() {
            Ok(n) => Uid::Num(n),
            Err(_) => Uid::Name(s),
        }
    }
}

/// Check that a namespace can be embedded in a socket file name.
pub fn validate_namespace(namespace: &str) -> Result<(), AddressError> {
    if namespace.is_empty() {
        return Err(AddressError::MissingNamespace);
    }
    if namespace.contains('/') || namespace.contains('\0') {
        return Err(AddressError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

/// Resolve the socket path for `(namespace, uid)` under `base_path`.
///
/// Pure; callers validate inputs first (see [`resolve_checked`]).
pub fn resolve(base_path: &Path, namespace: &str, uid: &Uid) -> PathBuf {
    base_path.join(format!("{namespace}{UID_SEPARATOR}{uid}{SOCKET_SUFFIX}"))
}

/// Validate inputs, then [`resolve`], rejecting paths too long to bind.
pub fn resolve_checked(
    base_path: &Path,
    namespace: &str,
    uid: &Uid,
) -> Result<PathBuf, AddressError> {
    validate_namespace(namespace)?;
    uid.validate()?;

    let path = resolve(base_path, namespace, uid);
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH_LEN {
        return Err(AddressError::PathTooLong {
            path: path.display().to_string(),
            len,
        });
    }
    Ok(path)
}

/// Return the uid part of `file_name` if it names a socket of `namespace`.
///
/// `ns-7.sock` belongs to `ns`; `ns-extra-7.sock` does not.
pub fn member_uid<'a>(file_name: &'a str, namespace: &str) -> Option<&'a str> {
    let uid = file_name
        .strip_prefix(namespace)?
        .strip_prefix(UID_SEPARATOR)?
        .strip_suffix(SOCKET_SUFFIX)?;

    if uid.is_empty() || uid.contains(UID_SEPARATOR) {
        None
    } else {
        Some(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_resolve_format() {
        let path = resolve(Path::new("/tmp"), "ns", &Uid::Num(42));
        assert_eq!(path, PathBuf::from("/tmp/ns-42.sock"));

        let path = resolve(Path::new("/run/app"), "ns", &Uid::from("worker"));
        assert_eq!(path, PathBuf::from("/run/app/ns-worker.sock"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let a = resolve(Path::new("/tmp"), "ns", &Uid::Num(1));
        let b = resolve(Path::new("/tmp"), "ns", &Uid::Num(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolve_is_injective_for_valid_pairs() {
        let namespaces = ["a", "a-b", "ab", "a-b-c", "x.y"];
        let uids = [
            Uid::Num(1),
            Uid::Num(12),
            Uid::from("b"),
            Uid::from("c"),
            Uid::from("1x"),
        ];

        let mut seen = HashSet::new();
        for ns in namespaces {
            for uid in &uids {
                let path = resolve_checked(Path::new("/tmp"), ns, uid).unwrap();
                assert!(seen.insert(path), "collision for ({ns}, {uid})");
            }
        }
    }

    #[test]
    fn test_uid_with_separator_rejected() {
        // "a" + "b-c" would collide with "a-b" + "c"
        let err = resolve_checked(Path::new("/tmp"), "a", &Uid::from("b-c")).unwrap_err();
        assert_eq!(err, AddressError::InvalidUid("b-c".to_string()));
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let err = resolve_checked(Path::new("/tmp"), "", &Uid::Num(1)).unwrap_err();
        assert_eq!(err, AddressError::MissingNamespace);
    }

    #[test]
    fn test_namespace_with_slash_rejected() {
        assert!(matches!(
            validate_namespace("a/b"),
            Err(AddressError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn test_empty_and_wildcard_uid_rejected() {
        assert!(Uid::from("").validate().is_err());
        assert!(Uid::from("*").validate().is_err());
    }

    #[test]
    fn test_numeric_text_uid_normalised() {
        assert_eq!(Uid::from("7"), Uid::Num(7));
        assert_eq!(Uid::from("7".to_string()), Uid::Num(7));
        // constructed directly it would alias ns-7.sock
        assert!(Uid::Name("7".to_string()).validate().is_err());
    }

    #[test]
    fn test_overlong_path_rejected() {
        let ns = "n".repeat(120);
        let err = resolve_checked(Path::new("/tmp"), &ns, &Uid::Num(1)).unwrap_err();
        assert!(matches!(err, AddressError::PathTooLong { .. }));
    }

    #[test]
    fn test_member_uid() {
        assert_eq!(member_uid("ns-7.sock", "ns"), Some("7"));
        assert_eq!(member_uid("ns-worker.sock", "ns"), Some("worker"));
        assert_eq!(member_uid("ns-extra-7.sock", "ns"), None);
        assert_eq!(member_uid("ns-.sock", "ns"), None);
        assert_eq!(member_uid("ns-7.pipe", "ns"), None);
        assert_eq!(member_uid("other-7.sock", "ns"), None);
        assert_eq!(member_uid("ns7.sock", "ns"), None);
    }

    #[test]
    fn test_uid_parse_and_serde() {
        assert_eq!("42".parse::<Uid>().unwrap(), Uid::Num(42));
        assert_eq!("w1".parse::<Uid>().unwrap(), Uid::from("w1"));

        assert_eq!(serde_json::to_string(&Uid::Num(2)).unwrap(), "2");
        assert_eq!(serde_json::to_string(&Uid::from("w")).unwrap(), "\"w\"");
        assert_eq!(serde_json::from_str::<Uid>("3").unwrap(), Uid::Num(3));
    }

    #[test]
    fn test_default_uid_is_process_id() {
        assert_eq!(Uid::default(), Uid::Num(std::process::id() as u64));
    }
}
