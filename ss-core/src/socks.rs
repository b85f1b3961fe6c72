#![forbid(unsafe_code)]

//! SOCKS5-style destination address codec (C4): wire parsing/serialization
//! against both live byte sources and in-memory slices, plus a small
//! plain-SOCKS5 handshake helper for speaking to ordinary SOCKS clients.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Maximum wire length of an Address: 1 (ATYP) + 1 (domain length) + 255
/// (domain) + 2 (port).
pub const MAX_ADDRESS_LEN: usize = 1 + 1 + 255 + 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    SocketAddr(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Encode this address in SOCKS wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(MAX_ADDRESS_LEN);
        match self {
            Address::SocketAddr(SocketAddr::V4(v4)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.ip().octets());
                out.extend_from_slice(&v4.port().to_be_bytes());
            }
            Address::SocketAddr(SocketAddr::V6(v6)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.ip().octets());
                out.extend_from_slice(&v6.port().to_be_bytes());
            }
            Address::Domain(host, port) => {
                if host.len() > 255 {
                    return Err(Error::DomainTooLong(host.len()));
                }
                out.push(ATYP_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(out)
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::SocketAddr(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// `"host:port"`, the form used for dialing and for log lines.
    pub fn format(&self) -> String {
        match self {
            Address::SocketAddr(SocketAddr::V4(v4)) => format!("{}:{}", v4.ip(), v4.port()),
            Address::SocketAddr(SocketAddr::V6(v6)) => format!("[{}]:{}", v6.ip(), v6.port()),
            Address::Domain(host, port) => format!("{host}:{port}"),
        }
    }

    /// Build the wire form of a resolved socket address, preferring the
    /// IPv4 form when the address has a v4-mapped representation.
    pub fn parse(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(_) => Address::SocketAddr(addr),
            SocketAddr::V6(v6) => {
                if let Some(v4) = v6.ip().to_ipv4_mapped() {
                    Address::SocketAddr(SocketAddr::new(IpAddr::V4(v4), v6.port()))
                } else {
                    Address::SocketAddr(addr)
                }
            }
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Abstraction over "a thing `read_from` can pull exact-length chunks
/// from" so the same parser works for a live `ShadowedStream` (which does
/// not implement `AsyncRead`) and for any ordinary `AsyncRead` socket.
#[async_trait]
pub trait ByteSource: Send {
    async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: AsyncRead + Unpin + Send> ByteSource for T {
    async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)
            .await
            .map_err(|_| Error::Truncated)?;
        Ok(buf)
    }
}

fn parse_body(atyp: u8, ipv4_ipv6_or_domain: &[u8]) -> Result<(Address, usize)> {
    match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = ipv4_ipv6_or_domain[..4].try_into().unwrap();
            let port = u16::from_be_bytes(ipv4_ipv6_or_domain[4..6].try_into().unwrap());
            Ok((
                Address::SocketAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                6,
            ))
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = ipv4_ipv6_or_domain[..16].try_into().unwrap();
            let port = u16::from_be_bytes(ipv4_ipv6_or_domain[16..18].try_into().unwrap());
            Ok((
                Address::SocketAddr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                18,
            ))
        }
        other => Err(Error::UnsupportedAddressType(other)),
    }
}

/// Read one `Address` from a live byte source: ATYP, then the
/// type-specific body.
pub async fn read_from<R: ByteSource>(src: &mut R) -> Result<Address> {
    let atyp = src.read_exact_n(1).await?[0];
    match atyp {
        ATYP_IPV4 => {
            let body = src.read_exact_n(6).await?;
            Ok(parse_body(ATYP_IPV4, &body)?.0)
        }
        ATYP_IPV6 => {
            let body = src.read_exact_n(18).await?;
            Ok(parse_body(ATYP_IPV6, &body)?.0)
        }
        ATYP_DOMAIN => {
            let len_byte = src.read_exact_n(1).await?;
            let len = len_byte[0] as usize;
            if len == 0 {
                return Err(Error::DomainLengthMissing);
            }
            let body = src.read_exact_n(len + 2).await?;
            let host = String::from_utf8_lossy(&body[..len]).into_owned();
            let port = u16::from_be_bytes(body[len..len + 2].try_into().unwrap());
            Ok(Address::Domain(host, port))
        }
        other => Err(Error::UnsupportedAddressType(other)),
    }
}

/// Parse an `Address` from the head of an in-memory packet, returning the
/// address and the remaining (unconsumed) slice.
pub fn extract(packet: &[u8]) -> Result<(Address, &[u8])> {
    let (atyp, rest) = packet.split_first().ok_or(Error::EmptyPacket)?;
    match *atyp {
        ATYP_IPV4 => {
            if rest.len() < 6 {
                return Err(Error::Truncated);
            }
            let (addr, consumed) = parse_body(ATYP_IPV4, rest)?;
            Ok((addr, &rest[consumed..]))
        }
        ATYP_IPV6 => {
            if rest.len() < 18 {
                return Err(Error::Truncated);
            }
            let (addr, consumed) = parse_body(ATYP_IPV6, rest)?;
            Ok((addr, &rest[consumed..]))
        }
        ATYP_DOMAIN => {
            let len = *rest.first().ok_or(Error::DomainLengthMissing)? as usize;
            if len == 0 {
                return Err(Error::DomainLengthMissing);
            }
            let body = rest.get(1..).ok_or(Error::Truncated)?;
            if body.len() < len + 2 {
                return Err(Error::Truncated);
            }
            let host = String::from_utf8_lossy(&body[..len]).into_owned();
            let port = u16::from_be_bytes(body[len..len + 2].try_into().unwrap());
            Ok((Address::Domain(host, port), &body[len + 2..]))
        }
        other => Err(Error::UnsupportedAddressType(other)),
    }
}

/// SOCKS5 command codes (RFC 1928 §4); only CONNECT is meaningful here.
const CMD_CONNECT: u8 = 0x01;

/// Speak plain SOCKS5 (no auth) on `stream`: method negotiation, request,
/// and a synthetic success reply for CONNECT. Used by test harnesses and
/// any collaborator that needs a real SOCKS5 front end rather than the
/// shadowed wire format.
pub async fn socks5_handshake<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let header = {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        buf
    };
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[0x05, 0x00]).await?;

    let mut req_header = [0u8; 3];
    stream.read_exact(&mut req_header).await?;
    let cmd = req_header[1];

    let address = read_from(stream).await?;

    if cmd != CMD_CONNECT {
        return Err(Error::CommandNotSupported(cmd));
    }

    stream
        .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
        .await?;

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::io::duplex;

    fn v4(ip: [u8; 4], port: u16) -> Address {
        Address::SocketAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
    }

    #[test]
    fn format_matches_host_colon_port() {
        assert_eq!(v4([127, 0, 0, 1], 8080).format(), "127.0.0.1:8080");
        assert_eq!(
            Address::Domain("example.com".into(), 443).format(),
            "example.com:443"
        );
    }

    #[test]
    fn extract_roundtrips_ipv4() {
        let addr = v4([10, 0, 0, 1], 1234);
        let bytes = addr.to_bytes().unwrap();
        let (parsed, rest) = extract(&bytes).unwrap();
        assert_eq!(parsed, addr);
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_roundtrips_ipv6() {
        let addr = Address::SocketAddr(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            53,
        ));
        let bytes = addr.to_bytes().unwrap();
        let (parsed, rest) = extract(&bytes).unwrap();
        assert_eq!(parsed, addr);
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_roundtrips_domain_and_keeps_remainder() {
        let addr = Address::Domain("example.com".into(), 80);
        let mut bytes = addr.to_bytes().unwrap();
        bytes.extend_from_slice(b"trailing-payload");
        let (parsed, rest) = extract(&bytes).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(rest, b"trailing-payload");
    }

    #[test]
    fn extract_rejects_empty_packet() {
        assert!(matches!(extract(&[]), Err(Error::EmptyPacket)));
    }

    #[test]
    fn extract_rejects_unsupported_atyp() {
        assert!(matches!(
            extract(&[0x7F, 0, 0]),
            Err(Error::UnsupportedAddressType(0x7F))
        ));
    }

    #[test]
    fn extract_rejects_truncated_domain() {
        // ATYP=domain, len=10, but only 2 bytes follow.
        let bytes = [0x03u8, 10, b'a', b'b'];
        assert!(matches!(extract(&bytes), Err(Error::Truncated)));
    }

    #[test]
    fn parse_prefers_v4_mapped_form() {
        let mapped = Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped();
        let addr = Address::parse(SocketAddr::new(IpAddr::V6(mapped), 53));
        assert_eq!(addr, v4([127, 0, 0, 1], 53));
    }

    #[tokio::test]
    async fn read_from_parses_over_a_stream() {
        let addr = Address::Domain("shadow.example".into(), 9000);
        let bytes = addr.to_bytes().unwrap();
        let (mut client, mut server) = duplex(64);
        client.write_all(&bytes).await.unwrap();
        drop(client);
        let parsed = read_from(&mut server).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn socks5_handshake_replies_and_returns_address() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let target = v4([93, 184, 216, 34], 80);
        let target_bytes = target.to_bytes().unwrap();

        let server_task = tokio::spawn(async move { socks5_handshake(&mut server).await });

        // VER, NMETHODS, METHODS
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [5, 0]);

        // VER, CMD=CONNECT, RSV, then address
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&target_bytes).await.unwrap();

        let mut success = [0u8; 10];
        client.read_exact(&mut success).await.unwrap();
        assert_eq!(success, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        let parsed = server_task.await.unwrap().unwrap();
        assert_eq!(parsed, target);
    }
}
