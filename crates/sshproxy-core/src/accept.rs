use std::sync::Arc;

use russh::server::{self, Server as _};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection::ProxyServer;
use crate::error::{ProxyError, Result};

/// Binds the listening socket and serves connections until `cancel` fires.
/// `russh::server::run_on_address` already owns the accept loop internally
/// (unlike `AcceptLoop` in `ssh-channels-hub`, which drives `TcpListener`
/// directly), so cancellation here is a race between that future and the
/// token rather than a `tokio::select!` around `listener.accept()`.
pub struct AcceptLoop {
    config: Arc<ServerConfig>,
    ssh_config: Arc<server::Config>,
    mut_server: ProxyServer,
}

impl AcceptLoop {
    pub fn new(
        config: Arc<ServerConfig>,
        ssh_config: Arc<server::Config>,
        server: ProxyServer,
    ) -> Self {
        Self {
            config,
            ssh_config,
            mut_server: server,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        info!(%addr, "starting accept loop");

        tokio::select! {
            result = self.mut_server.run_on_address(self.ssh_config, addr) => {
                result.map_err(|err| ProxyError::Bind {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
                })?;
                error!("accept loop exited on its own, which should only happen on bind failure");
                Ok(())
            }
            _ = cancel.cancelled() => {
                info!("accept loop cancelled, shutting down");
                Ok(())
            }
        }
    }
}
