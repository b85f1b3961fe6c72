use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use ss_core::{CipherKind, PreSharedKey, SaltFilter};

use crate::config::Config;
use crate::error::Result;
use crate::relay::{TcpRelay, UdpRelay};

/// Owns the TCP and UDP listeners, which share one pre-shared key and one
/// salt replay filter. Both listeners run under the same root
/// cancellation token.
pub struct Server {
    tcp: TcpRelay,
    udp: UdpRelay,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self> {
        let kind = CipherKind::from_name(&config.cipher_name)
            .map_err(|e| crate::error::Error::config(e.to_string()))?;
        let psk = Arc::new(PreSharedKey::derive(&config.password, kind));
        let salt_filter = Arc::new(SaltFilter::new());

        let tcp = TcpRelay::bind(
            config.address,
            psk.clone(),
            salt_filter.clone(),
            config.log_addresses,
        )
        .await?;
        let udp = UdpRelay::bind(
            config.address,
            psk,
            salt_filter,
            std::time::Duration::from_secs(config.nat_idle_secs),
        )
        .await?;

        Ok(Self { tcp, udp })
    }

    /// Run both listeners until `shutdown` is cancelled, then return once
    /// both have drained.
    pub async fn serve(self, shutdown: CancellationToken) {
        info!("server running");
        tokio::join!(
            self.tcp.serve(shutdown.clone()),
            self.udp.serve(shutdown),
        );
        info!("server stopped");
    }
}
