use std::sync::Arc;

use russh::client;
use russh_keys::key::KeyPair;

use crate::client_handler::UpstreamHandler;
use crate::config::HostKeyPolicy;
use crate::error::{ProxyError, Result};

/// Dials the fixed upstream once per inbound connection and authenticates
/// with the proxy's own client identity, mirroring
/// `shelldeck_ssh::client::SshClient::connect_direct` followed by
/// `authenticate`, minus the jump-host/keychain fallback machinery this
/// proxy doesn't need: the upstream address and identity are fixed by
/// configuration, not chosen interactively.
pub async fn dial(
    upstream_addr: &str,
    upstream_user: &str,
    client_identity: &KeyPair,
    host_key_policy: Arc<dyn HostKeyPolicy>,
) -> Result<client::Handle<UpstreamHandler>> {
    let config = Arc::new(client::Config::default());
    let handler = UpstreamHandler::new(host_key_policy);

    let mut handle = client::connect(config, upstream_addr, handler)
        .await
        .map_err(|err| ProxyError::UpstreamDial {
            addr: upstream_addr.to_string(),
            source_msg: err.to_string(),
        })?;

    let authenticated = handle
        .authenticate_publickey(upstream_user, Arc::new(client_identity.clone()))
        .await
        .map_err(|err| ProxyError::UpstreamDial {
            addr: upstream_addr.to_string(),
            source_msg: err.to_string(),
        })?;

    if !authenticated {
        return Err(ProxyError::UpstreamAuthRejected {
            addr: upstream_addr.to_string(),
        });
    }

    Ok(handle)
}
