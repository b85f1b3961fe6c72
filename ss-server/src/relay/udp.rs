//! UDP NAT relay (C6): main dispatch loop plus one pump task per NAT
//! entry, forwarding upstream replies back through the shadowed listen
//! socket under a fresh salt.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ss_core::{packet::MAX_DATAGRAM_SIZE, Address, PreSharedKey, SaltFilter, ShadowedPacketSocket};

use crate::nat::NatTable;

pub struct UdpRelay {
    listen: Arc<ShadowedPacketSocket>,
    nat: Arc<NatTable>,
    idle_timeout: Duration,
}

impl UdpRelay {
    pub async fn bind(
        addr: SocketAddr,
        psk: Arc<PreSharedKey>,
        salt_filter: Arc<SaltFilter>,
        idle_timeout: Duration,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(%addr, "udp relay listening");
        Ok(Self {
            listen: Arc::new(ShadowedPacketSocket::new(socket, psk, salt_filter)),
            nat: NatTable::new(),
            idle_timeout,
        })
    }

    pub async fn serve(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("udp relay shutting down");
                    return;
                }
                received = self.listen.recv_from(&mut buf) => {
                    match received {
                        Ok((client_addr, plaintext)) => {
                            if let Err(e) = self.dispatch(client_addr, plaintext, &shutdown).await {
                                debug!(error = %e, kind = e.kind_tag(), %client_addr, "udp dispatch failed");
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "udp recv failed");
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        client_addr: SocketAddr,
        plaintext: Vec<u8>,
        shutdown: &CancellationToken,
    ) -> ss_core::Result<()> {
        let (address, inner) = ss_core::socks::extract(&plaintext)?;
        let target = resolve(&address).await?;

        if let Some(upstream) = self.nat.lookup(client_addr).await {
            upstream.send_to(inner, target).await?;
            return Ok(());
        }

        let upstream = Arc::new(UdpSocket::bind((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?);
        let (generation, cancel) = self.nat.insert(client_addr, upstream.clone()).await;
        debug!(%client_addr, target = %address, generation, "udp nat entry created");
        upstream.send_to(inner, target).await?;

        let listen = self.listen.clone();
        let nat = self.nat.clone();
        let pump_cancel = cancel;
        let pump_shutdown = shutdown.child_token();
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            pump_upstream(
                upstream,
                client_addr,
                generation,
                nat,
                listen,
                pump_cancel,
                pump_shutdown,
                idle_timeout,
            )
            .await;
        });
        Ok(())
    }
}

async fn resolve(address: &Address) -> std::io::Result<SocketAddr> {
    match address {
        Address::SocketAddr(addr) => Ok(*addr),
        Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses for host")),
    }
}

/// Upstream -> client pump for one NAT entry. Reads until it idles past
/// `idle_timeout`, a read error occurs, or it is cancelled (either by a
/// generation-losing race or outer shutdown). Removes itself from the
/// NAT table on exit, guarded by its own generation number. This is the
/// only place an entry's lifetime is decided; the table itself never
/// expires entries on a separate clock.
async fn pump_upstream(
    upstream: Arc<UdpSocket>,
    client_addr: SocketAddr,
    generation: u64,
    nat: Arc<NatTable>,
    listen: Arc<ShadowedPacketSocket>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(idle_timeout) => break,
            r = upstream.recv_from(&mut buf) => r,
        };

        let (len, origin) = match recv {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, %client_addr, "upstream pump read failed");
                break;
            }
        };

        let origin_address = Address::parse(origin);
        let mut packet = match origin_address.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode origin address");
                continue;
            }
        };
        packet.extend_from_slice(&buf[..len]);

        if let Err(e) = listen.send_to(&packet, client_addr).await {
            debug!(error = %e, %client_addr, "failed to forward upstream reply");
            break;
        }
    }

    nat.remove_if_current(client_addr, generation).await;
    debug!(%client_addr, generation, "udp nat entry torn down");
}
