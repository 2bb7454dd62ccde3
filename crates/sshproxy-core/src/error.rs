use std::io;
use std::net::SocketAddr;

/// Flat error type for every fallible operation in the proxy, from config
/// loading through channel splicing. Config/key/bind errors are fatal and
/// meant to be surfaced by `main` as a non-zero exit; per-connection and
/// per-channel errors are logged and the connection/channel is torn down.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("config file {path} is not valid TOML: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("key file {path} is empty")]
    EmptyKey { path: String },

    #[error("key file {path} could not be parsed: {source}")]
    KeyParse {
        path: String,
        #[source]
        source: russh_keys::Error,
    },

    #[error("inbound handshake failed: {0}")]
    Handshake(String),

    #[error("upstream dial to {addr} failed: {0}")]
    UpstreamDial { addr: String, source_msg: String },

    #[error("upstream authentication to {addr} rejected")]
    UpstreamAuthRejected { addr: String },

    #[error("opening upstream channel failed: {0}")]
    ChannelOpen(String),

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
