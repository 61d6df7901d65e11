//! SOCKS5 client handshake against Tor's SOCKS port.
//!
//! Only the subset Tor needs: no authentication, CONNECT, and IPv4 or
//! domain-name targets. Domain names are passed through so Tor resolves
//! them.
//!
//! ```text
//!   client                                   tor SocksPort
//!     │ ── 05 01 00 ──────────────────────────────► │  greeting
//!     │ ◄─────────────────────────────── 05 00 ──── │  no-auth selected
//!     │ ── 05 01 00 ATYP addr port(be16) ─────────► │  connect
//!     │ ◄──────────── 05 00 00 ATYP bound-addr ──── │  reply, drained
//! ```
//!
//! Any mismatch aborts the handshake; there is no partially connected state.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const COMMAND_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Destination of a SOCKS5 CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksTarget {
    /// Literal IPv4 endpoint.
    Ipv4(Ipv4Addr, u16),
    /// Host name resolved by Tor.
    Domain(String, u16),
}

impl SocksTarget {
    /// Picks the address type for `host`.
    ///
    /// IPv4 literals are sent as addresses; everything else, IPv6 literals
    /// included, is sent as a name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socks`] for an empty host or one longer than 255
    /// bytes.
    pub fn from_host(host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(SocksTarget::Ipv4(ip, port));
        }
        if host.is_empty() || host.len() > u8::MAX as usize {
            return Err(Error::Socks(format!(
                "host name must be 1 to 255 bytes, got {}",
                host.len()
            )));
        }
        Ok(SocksTarget::Domain(host.to_string(), port))
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            SocksTarget::Ipv4(_, port) | SocksTarget::Domain(_, port) => *port,
        }
    }

    fn connect_request(&self) -> Vec<u8> {
        let mut request = vec![SOCKS_VERSION, COMMAND_CONNECT, RESERVED];
        match self {
            SocksTarget::Ipv4(ip, _) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            SocksTarget::Domain(host, _) => {
                request.push(ATYP_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&self.port().to_be_bytes());
        request
    }
}

impl std::fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksTarget::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            SocksTarget::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

fn reply_to_string(reply: u8) -> &'static str {
    match reply {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "undefined",
    }
}

/// Opens a connection to the SOCKS port and tunnels it to `target`.
pub async fn connect(socks_addr: SocketAddr, target: &SocksTarget) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(socks_addr)
        .await
        .map_err(|e| Error::Socks(format!("failed to reach SOCKS port {}: {}", socks_addr, e)))?;
    handshake(&mut stream, target).await?;
    Ok(stream)
}

/// Runs the greeting and CONNECT exchange on an open stream.
pub async fn handshake<S>(stream: &mut S, target: &SocksTarget) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await
        .map_err(|e| Error::Socks(format!("failed to send greeting: {}", e)))?;

    let mut selection = [0u8; 2];
    stream
        .read_exact(&mut selection)
        .await
        .map_err(|e| Error::Socks(format!("failed to read method selection: {}", e)))?;
    if selection != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(Error::Socks(format!(
            "unexpected method selection {:02x} {:02x}",
            selection[0], selection[1]
        )));
    }

    stream
        .write_all(&target.connect_request())
        .await
        .map_err(|e| Error::Socks(format!("failed to send connect request: {}", e)))?;

    let mut prefix = [0u8; 5];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| Error::Socks(format!("failed to read connect reply: {}", e)))?;
    if prefix[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!(
            "invalid SOCKS version in reply: {}",
            prefix[0]
        )));
    }
    if prefix[1] != REPLY_SUCCEEDED {
        return Err(Error::Socks(format!(
            "connect to {} failed: {}",
            target,
            reply_to_string(prefix[1])
        )));
    }

    // The fifth prefix byte is the first address byte, or the domain length.
    let remaining = match prefix[3] {
        ATYP_IPV4 => 5,
        ATYP_IPV6 => 17,
        ATYP_DOMAIN => prefix[4] as usize + 2,
        atyp => {
            return Err(Error::Socks(format!("unknown address type in reply: {}", atyp)));
        }
    };
    let mut bound = vec![0u8; remaining];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| Error::Socks(format!("failed to read bound address: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake SOCKS port: answers the greeting with `selection`, then the
    /// request with `reply`. Returns the bytes of the connect request.
    async fn fake_socks(
        selection: &'static [u8],
        reply: &'static [u8],
    ) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            socket.write_all(selection).await.unwrap();
            if selection != [5, 0] {
                return Vec::new();
            }
            let mut request = vec![0u8; 64];
            let n = socket.read(&mut request).await.unwrap();
            request.truncate(n);
            socket.write_all(reply).await.unwrap();
            socket.write_all(b"tunnel").await.unwrap();
            request
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_handshake_succeeds() {
        let (addr, server) = fake_socks(&[5, 0], &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await;
        let target = SocksTarget::from_host("example.com", 443).unwrap();
        let mut stream = connect(addr, &target).await.unwrap();

        let request = server.await.unwrap();
        let mut expected = vec![5, 1, 0, 3, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(request, expected);

        let mut tail = [0u8; 6];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tunnel");
    }

    #[tokio::test]
    async fn test_rejected_method_skips_connect() {
        let (addr, server) = fake_socks(&[5, 1], &[]).await;
        let target = SocksTarget::from_host("10.0.0.1", 80).unwrap();
        let err = connect(addr, &target).await.unwrap_err();
        assert!(matches!(err, Error::Socks(_)));
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_domain_reply_is_drained() {
        let reply: &'static [u8] = &[5, 0, 0, 3, 4, b'h', b'o', b's', b't', 0, 80];
        let (addr, _server) = fake_socks(&[5, 0], reply).await;
        let target = SocksTarget::from_host("host", 80).unwrap();
        let mut stream = connect(addr, &target).await.unwrap();
        let mut tail = [0u8; 6];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tunnel");
    }

    #[tokio::test]
    async fn test_failure_reply() {
        let (addr, _server) = fake_socks(&[5, 0], &[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await;
        let target = SocksTarget::from_host("10.0.0.1", 80).unwrap();
        let err = connect(addr, &target).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let (addr, _server) = fake_socks(&[5, 0], &[5, 0, 0, 9, 0, 0, 0, 0, 0, 0]).await;
        let target = SocksTarget::from_host("10.0.0.1", 80).unwrap();
        assert!(connect(addr, &target).await.is_err());
    }

    #[test]
    fn test_target_selection() {
        assert_eq!(
            SocksTarget::from_host("127.0.0.1", 80).unwrap(),
            SocksTarget::Ipv4(Ipv4Addr::LOCALHOST, 80)
        );
        assert!(matches!(
            SocksTarget::from_host("::1", 80).unwrap(),
            SocksTarget::Domain(_, 80)
        ));
        assert!(SocksTarget::from_host(&"a".repeat(256), 80).is_err());
        assert!(SocksTarget::from_host("", 80).is_err());
    }

    #[test]
    fn test_ipv4_request_bytes() {
        let target = SocksTarget::Ipv4(Ipv4Addr::new(10, 1, 2, 3), 8080);
        assert_eq!(
            target.connect_request(),
            vec![5, 1, 0, 1, 10, 1, 2, 3, 0x1f, 0x90]
        );
    }
}
