//! Local HTTP proxy that forwards through Tor's SOCKS port.
//!
//! [`ProxyListener`] accepts connections on `127.0.0.1:<port>` and runs one
//! task per connection: parse the request, negotiate SOCKS5, relay. Live
//! connection tasks are tracked only so [`ProxyListener::shutdown`] can abort
//! them. A failing connection never affects the listener.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::LogLevel;
use crate::error::Result;
use crate::logger::plog;
use crate::relay;

/// Default listening port.
pub const DEFAULT_PROXY_PORT: u16 = 8182;

#[derive(Default)]
struct LiveConnections {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl LiveConnections {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A running HTTP-to-SOCKS proxy.
pub struct ProxyListener {
    port: u16,
    running: Arc<AtomicBool>,
    live: Arc<LiveConnections>,
    accept_loop: JoinHandle<()>,
}

impl ProxyListener {
    /// Binds `127.0.0.1:port` and starts accepting.
    ///
    /// Port 0 picks a free port; [`port`](Self::port) reports it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the port cannot be bound.
    pub async fn bind(port: u16, socks_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let port = listener.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));
        let live = Arc::new(LiveConnections::default());

        let accept_loop = tokio::spawn(accept_connections(
            listener,
            socks_addr,
            Arc::clone(&running),
            Arc::clone(&live),
        ));

        plog(
            LogLevel::Notice,
            &format!("Web proxy listening on 127.0.0.1:{} via SOCKS {}", port, socks_addr),
        );

        Ok(Self {
            port,
            running,
            live,
            accept_loop,
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL for HTTP clients.
    pub fn address(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Returns true until the accept loop stops.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of connections currently being relayed.
    pub fn active_connections(&self) -> usize {
        self.live.tasks().len()
    }

    /// Stops accepting and aborts every live relay.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.accept_loop.abort();
        for (_, task) in self.live.tasks().drain() {
            task.abort();
        }
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_connections(
    listener: TcpListener,
    socks_addr: SocketAddr,
    running: Arc<AtomicBool>,
    live: Arc<LiveConnections>,
) {
    while running.load(Ordering::SeqCst) {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                plog(LogLevel::Debug, &format!("proxy accept failed: {}", e));
                continue;
            }
        };

        let id = live.next_id.fetch_add(1, Ordering::Relaxed);
        // Hold the lock across spawn so the task cannot remove itself first.
        let mut tasks = live.tasks();
        let registry = Arc::clone(&live);
        let task = tokio::spawn(async move {
            match relay::serve(socket, socks_addr).await {
                Ok(stats) => plog(
                    LogLevel::Debug,
                    &format!(
                        "proxy connection from {} closed ({} bytes up, {} down)",
                        peer, stats.uploaded, stats.downloaded
                    ),
                ),
                Err(e) => plog(
                    LogLevel::Info,
                    &format!("proxy connection from {} failed: {}", peer, e),
                ),
            }
            registry.tasks().remove(&id);
        });
        tasks.insert(id, task.abort_handle());
    }
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Minimal SOCKS port: accepts the handshake, then echoes.
    async fn echo_socks() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    socket.read_exact(&mut greeting).await.unwrap();
                    socket.write_all(&[5, 0]).await.unwrap();
                    let mut head = [0u8; 5];
                    socket.read_exact(&mut head).await.unwrap();
                    let mut rest = vec![0u8; head[4] as usize + 2];
                    socket.read_exact(&mut rest).await.unwrap();
                    socket.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let socks = echo_socks().await;
        let proxy = ProxyListener::bind(0, socks).await.unwrap();
        assert!(proxy.is_running());
        assert_eq!(proxy.address(), format!("http://127.0.0.1:{}", proxy.port()));

        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let expected = "HTTP/1.1 200 Connection established\r\nProxy-Agent: torctl-rs\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected.as_bytes());

        client.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
        assert_eq!(proxy.active_connections(), 1);

        proxy.shutdown();
        assert!(!proxy.is_running());
        assert_eq!(proxy.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_bad_request_only_closes_its_connection() {
        let socks = echo_socks().await;
        let proxy = ProxyListener::bind(0, socks).await.unwrap();

        let mut bad = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
        bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), bad.read_to_end(&mut rest)).await;
        assert!(matches!(closed, Ok(Ok(0))));

        assert!(proxy.is_running());
        let mut good = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
        good.write_all(b"CONNECT a:1 HTTP/1.1\r\n\r\n").await.unwrap();
        let mut first = [0u8; 8];
        good.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"HTTP/1.1");
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let socks: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(ProxyListener::bind(port, socks).await.is_err());
    }
}
