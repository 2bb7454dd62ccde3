use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use directories::ProjectDirs;
use russh_keys::key::PublicKey;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Decision returned by an [`AuthPolicy`] for a single public-key offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

/// Pluggable policy for inbound public-key authentication. The reference
/// implementation ([`AcceptAllPolicy`]) accepts every key offered, which is
/// appropriate for a transparent proxy that defers real authorization to the
/// upstream host, but callers can supply a stricter policy.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn check_public_key(&self, user: &str, key: &PublicKey) -> AuthDecision;
}

#[derive(Debug, Default)]
pub struct AcceptAllPolicy;

#[async_trait]
impl AuthPolicy for AcceptAllPolicy {
    async fn check_public_key(&self, _user: &str, _key: &PublicKey) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Pluggable policy for verifying the upstream host key on the outbound leg.
/// The reference implementation ([`AcceptAnyHostKeyPolicy`]) trusts whatever
/// key the upstream presents, mirroring `ssh.InsecureIgnoreHostKey()` in the
/// original Go implementation. This is a known MITM weakness, documented as
/// an open design question rather than hidden.
#[async_trait]
pub trait HostKeyPolicy: Send + Sync {
    async fn check_server_key(&self, server_public_key: &PublicKey) -> bool;
}

#[derive(Debug, Default)]
pub struct AcceptAnyHostKeyPolicy;

#[async_trait]
impl HostKeyPolicy for AcceptAnyHostKeyPolicy {
    async fn check_server_key(&self, _server_public_key: &PublicKey) -> bool {
        true
    }
}

/// On-disk representation of the server config, loaded from TOML and merged
/// with CLI overrides (CLI wins). Mirrors the shape of
/// `shelldeck_core::config::app_config::AppConfig`, scaled down to what a
/// headless proxy process needs.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub upstream_user: Option<String>,
    pub host_key: Option<String>,
    pub client_identity: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ProxyError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load the file at `path` if it exists; otherwise fall back to an empty
    /// config so that CLI flags alone can fully specify the server.
    pub fn load_if_present(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Fully resolved runtime configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub upstream_addr: String,
    pub upstream_user: String,
    pub host_key_path: PathBuf,
    pub client_identity_path: PathBuf,
    pub log_level: String,
}

impl ServerConfig {
    /// Default location checked when no `--config` flag is given: a
    /// `sshproxy.toml` in the current directory if one exists, falling back
    /// to the platform config directory (`~/.config/sshproxy/sshproxy.toml`
    /// on Linux) the way `AppConfig::config_path()` does, since a headless
    /// proxy is just as often started from a service manager with an
    /// unrelated working directory as from a terminal in-place.
    pub fn default_config_path() -> PathBuf {
        let local = PathBuf::from("sshproxy.toml");
        if local.exists() {
            return local;
        }
        match ProjectDirs::from("", "", "sshproxy") {
            Some(dirs) => dirs.config_dir().join("sshproxy.toml"),
            None => local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = FileConfig::load_if_present(&path).unwrap();
        assert!(cfg.listen.is_none());
    }

    #[test]
    fn parses_a_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sshproxy.toml");
        std::fs::write(
            &path,
            r#"
            listen = "0.0.0.0:2222"
            upstream = "localhost:22"
            upstream_user = "proxy"
            "#,
        )
        .unwrap();

        let cfg = FileConfig::load(&path).unwrap();
        assert_eq!(cfg.listen.as_deref(), Some("0.0.0.0:2222"));
        assert_eq!(cfg.upstream.as_deref(), Some("localhost:22"));
        assert_eq!(cfg.upstream_user.as_deref(), Some("proxy"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sshproxy.toml");
        std::fs::write(&path, "this is not toml = = =").unwrap();

        let err = FileConfig::load(&path).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigParse { .. }));
    }
}
