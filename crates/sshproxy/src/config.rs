use std::path::PathBuf;

use sshproxy_core::config::FileConfig;
use sshproxy_core::ServerConfig;

use crate::Cli;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("--listen/listen must be set (CLI flag or config file)")]
    MissingListenAddr,
    #[error("invalid --listen/listen address: {0}")]
    InvalidListenAddr(std::net::AddrParseError),
    #[error("--upstream/upstream must be set (CLI flag or config file)")]
    MissingUpstreamAddr,
    #[error("--host-key/host_key must be set (CLI flag or config file)")]
    MissingHostKeyPath,
    #[error("--client-identity/client_identity must be set (CLI flag or config file)")]
    MissingClientIdentityPath,
}

/// Merges CLI flags over file config, CLI winning on any field present in
/// both, and fills in the few fields that carry sensible defaults.
pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<ServerConfig, ResolveError> {
    let listen_addr = cli
        .listen
        .map(Ok)
        .or_else(|| file.listen.as_deref().map(|s| s.parse()))
        .transpose()
        .map_err(ResolveError::InvalidListenAddr)?
        .ok_or(ResolveError::MissingListenAddr)?;

    let upstream_addr = cli
        .upstream
        .clone()
        .or_else(|| file.upstream.clone())
        .ok_or(ResolveError::MissingUpstreamAddr)?;

    let upstream_user = cli
        .upstream_user
        .clone()
        .or_else(|| file.upstream_user.clone())
        .unwrap_or_else(|| "proxy".to_string());

    let host_key_path: PathBuf = cli
        .host_key
        .clone()
        .or_else(|| file.host_key.clone().map(PathBuf::from))
        .ok_or(ResolveError::MissingHostKeyPath)?;

    let client_identity_path: PathBuf = cli
        .client_identity
        .clone()
        .or_else(|| file.client_identity.clone().map(PathBuf::from))
        .ok_or(ResolveError::MissingClientIdentityPath)?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| file.log_level.clone())
        .unwrap_or_else(|| "sshproxy=info,warn".to_string());

    Ok(ServerConfig {
        listen_addr,
        upstream_addr,
        upstream_user,
        host_key_path,
        client_identity_path,
        log_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["sshproxy"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn cli_alone_is_sufficient() {
        let cli = cli(&[
            "--listen",
            "127.0.0.1:2222",
            "--upstream",
            "localhost:22",
            "--host-key",
            "host_key",
            "--client-identity",
            "client_key",
        ]);
        let resolved = resolve(&cli, &FileConfig::default()).unwrap();
        assert_eq!(resolved.upstream_addr, "localhost:22");
        assert_eq!(resolved.upstream_user, "proxy");
    }

    #[test]
    fn cli_overrides_file() {
        let cli = cli(&["--upstream", "from-cli:22"]);
        let file = FileConfig {
            listen: Some("127.0.0.1:2222".to_string()),
            upstream: Some("from-file:22".to_string()),
            upstream_user: Some("alice".to_string()),
            host_key: Some("host_key".to_string()),
            client_identity: Some("client_key".to_string()),
            log_level: None,
        };
        let resolved = resolve(&cli, &file).unwrap();
        assert_eq!(resolved.upstream_addr, "from-cli:22");
        assert_eq!(resolved.upstream_user, "alice");
    }

    #[test]
    fn missing_listen_is_an_error() {
        let cli = cli(&["--upstream", "localhost:22"]);
        let err = resolve(&cli, &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ResolveError::MissingListenAddr));
    }
}
