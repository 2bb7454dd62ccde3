use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;

use crate::config::HostKeyPolicy;

/// `russh::client::Handler` for the outbound leg. Unlike
/// `shelldeck_ssh::handler::ClientHandler`, this proxy never surfaces
/// per-channel events through the handler: every opened `Channel` is read
/// directly via `.wait()` by the task that owns it (see `splicer.rs`), so
/// the only thing this handler needs to decide is whether to trust the
/// upstream's host key.
#[derive(Clone)]
pub struct UpstreamHandler {
    host_key_policy: Arc<dyn HostKeyPolicy>,
}

impl UpstreamHandler {
    pub fn new(host_key_policy: Arc<dyn HostKeyPolicy>) -> Self {
        Self { host_key_policy }
    }
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.host_key_policy.check_server_key(server_public_key).await)
    }
}
