//! SCP-style endpoint parsing: `[user@]host:path` vs local paths.
//!
//! A bare local path is the common case; a path is only treated as remote
//! when it unambiguously looks like `host:path` and isn't a Windows drive
//! letter or an absolute/relative/home-rooted local path.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// One side of a transfer (source or destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Endpoint {
    /// Parse a single SCP-style endpoint string.
    pub fn parse(spec: &str) -> Result<Self, crate::error::TransferError> {
        if spec.is_empty() {
            return Err(crate::error::TransferError::ParseError(spec.to_string()));
        }

        if looks_local(spec) {
            return Ok(Endpoint {
                path: spec.to_string(),
                is_local: true,
                host: None,
                user: None,
                port: default_port(),
                key_file: None,
            });
        }

        if let Some(colon) = remote_colon_index(spec) {
            let (userhost, path) = (&spec[..colon], &spec[colon + 1..]);
            let (user, host) = match userhost.split_once('@') {
                Some((u, h)) => (Some(u.to_string()), h.to_string()),
                None => (None, userhost.to_string()),
            };
            if host.is_empty() {
                return Err(crate::error::TransferError::ParseError(spec.to_string()));
            }
            return Ok(Endpoint {
                // Empty remote path means "remote home"; resolved later via
                // `resolve_home` once the session is open.
                path: path.to_string(),
                is_local: false,
                host: Some(host),
                user,
                port: default_port(),
                key_file: None,
            });
        }

        // Doesn't match the remote grammar either: treat as local (rule 3).
        Ok(Endpoint {
            path: spec.to_string(),
            is_local: true,
            host: None,
            user: None,
            port: default_port(),
            key_file: None,
        })
    }

    /// Fill in an empty remote path with the home directory resolved from
    /// the session (`$HOME` or SFTP's normalized CWD). No-op for local
    /// endpoints or endpoints that already have a path.
    pub fn resolve_home(&mut self, home: &str) {
        if !self.is_local && self.path.is_empty() {
            self.path = home.to_string();
        }
    }

    /// `user@host:port:abs_path` for remote, `abs_path` for local -- the
    /// string fed into the task-id fingerprint.
    pub fn canonical_string(&self, cwd: &Path, home: &Path) -> String {
        if self.is_local {
            absolutize(&self.path, cwd, home)
                .to_string_lossy()
                .into_owned()
        } else {
            let host = self.host.as_deref().unwrap_or_default();
            let abs = if self.path.is_empty() {
                "~".to_string()
            } else {
                self.path.clone()
            };
            match &self.user {
                Some(u) => format!("{u}@{host}:{}:{abs}", self.port),
                None => format!("{host}:{}:{abs}", self.port),
            }
        }
    }
}

/// Rule 1: unambiguous local forms.
fn looks_local(spec: &str) -> bool {
    spec == "." || spec.starts_with('/') || spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('~')
}

/// Rule 2: `[user@]host:path` where `host` has no `/` before the first `:`
/// and the colon isn't a Windows drive letter position (`C:\...`).
fn remote_colon_index(spec: &str) -> Option<usize> {
    let colon = spec.find(':')?;

    // Windows drive letter: a single ASCII letter immediately before the colon,
    // with nothing else preceding it (`C:`, not `xC:` or `user@C:`).
    if colon == 1 && spec.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }

    let userhost = &spec[..colon];
    if userhost.is_empty() || userhost.contains('/') {
        return None;
    }

    Some(colon)
}

/// Expand `~` against `home` and make relative paths absolute against `cwd`.
/// Purely lexical -- does not touch the filesystem or require the path to
/// exist, since the destination commonly doesn't yet.
pub fn absolutize(path: &str, cwd: &Path, home: &Path) -> PathBuf {
    let expanded: PathBuf = if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    };

    let joined = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    normalize_lexically(&joined)
}

/// Resolve `.`/`..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Stable 64-hex task fingerprint: `SHA-256(canon(src) || "\u{2192}" || canon(dst))`.
/// Independent of `TransferConfig`, so changing `--parallel` still resumes.
pub fn task_id(src: &Endpoint, dst: &Endpoint, cwd: &Path, home: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src.canonical_string(cwd, home).as_bytes());
    hasher.update("\u{2192}".as_bytes());
    hasher.update(dst.canonical_string(cwd, home).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_local() {
        let e = Endpoint::parse("/tmp/a.bin").unwrap();
        assert!(e.is_local);
        assert_eq!(e.path, "/tmp/a.bin");
    }

    #[test]
    fn parses_dot_and_dotdot_relative() {
        assert!(Endpoint::parse("./a.bin").unwrap().is_local);
        assert!(Endpoint::parse("../a.bin").unwrap().is_local);
        assert!(Endpoint::parse(".").unwrap().is_local);
    }

    #[test]
    fn parses_home_relative_as_local() {
        assert!(Endpoint::parse("~/a.bin").unwrap().is_local);
    }

    #[test]
    fn parses_remote_userhost_path() {
        let e = Endpoint::parse("alice@example.com:/srv/data/a.bin").unwrap();
        assert!(!e.is_local);
        assert_eq!(e.user.as_deref(), Some("alice"));
        assert_eq!(e.host.as_deref(), Some("example.com"));
        assert_eq!(e.path, "/srv/data/a.bin");
    }

    #[test]
    fn parses_remote_host_only() {
        let e = Endpoint::parse("example.com:a.bin").unwrap();
        assert!(!e.is_local);
        assert_eq!(e.user, None);
        assert_eq!(e.path, "a.bin");
    }

    #[test]
    fn empty_remote_path_means_home() {
        let e = Endpoint::parse("example.com:").unwrap();
        assert!(!e.is_local);
        assert_eq!(e.path, "");
    }

    #[test]
    fn windows_drive_letter_is_local() {
        let e = Endpoint::parse("C:\\Users\\test\\file.txt").unwrap();
        assert!(e.is_local);
    }

    #[test]
    fn relative_plain_path_is_local_fallback() {
        // No colon at all -- falls through to rule 3.
        let e = Endpoint::parse("data/a.bin").unwrap();
        assert!(e.is_local);
    }

    #[test]
    fn host_with_slash_before_colon_is_local() {
        // `/abs/path:suffix` -- the userhost segment contains a `/`, so it
        // can't be a remote spec; but this already matches rule 1 (starts
        // with `/`), so it's local either way.
        let e = Endpoint::parse("/abs/path:suffix").unwrap();
        assert!(e.is_local);
    }

    #[test]
    fn resolve_home_fills_empty_remote_path() {
        let mut e = Endpoint::parse("example.com:").unwrap();
        e.resolve_home("/home/alice");
        assert_eq!(e.path, "/home/alice");
    }

    #[test]
    fn task_id_is_stable_and_order_sensitive() {
        let cwd = PathBuf::from("/work");
        let home = PathBuf::from("/home/alice");
        let src = Endpoint::parse("/tmp/a.bin").unwrap();
        let dst = Endpoint::parse("alice@example.com:/srv/a.bin").unwrap();

        let id1 = task_id(&src, &dst, &cwd, &home);
        let id2 = task_id(&src, &dst, &cwd, &home);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);

        let reversed = task_id(&dst, &src, &cwd, &home);
        assert_ne!(id1, reversed);
    }

    #[test]
    fn task_id_independent_of_config() {
        // task_id only takes endpoints, never TransferConfig -- the type
        // signature itself is the proof; this test pins the expectation
        // that identical endpoints always produce identical ids regardless
        // of anything else the caller might vary.
        let cwd = PathBuf::from("/work");
        let home = PathBuf::from("/home/alice");
        let src = Endpoint::parse("/tmp/big.bin").unwrap();
        let dst = Endpoint::parse("example.com:/data/big.bin").unwrap();
        assert_eq!(
            task_id(&src, &dst, &cwd, &home),
            task_id(&src, &dst, &cwd, &home)
        );
    }
}
