//! Byte relay between a proxy client and its SOCKS-tunneled destination.
//!
//! ```text
//!   client ──► ProxyRequest ──► socks::connect ──► RelayPipeline::open ──► run
//!                                                    │
//!                     CONNECT: "<ver> 200 Connection established" to client
//!                     other:   request header (minus Proxy-*) + body to destination
//! ```
//!
//! Once open, the pipeline is a plain two-way copy with no HTTP awareness.
//! End of stream or an error in either direction tears down both sockets.
//!
//! A client that sent `Proxy-Connection: keep-alive` gets TCP keepalive
//! enabled on the tunneled destination socket.

use std::net::SocketAddr;

use socket2::SockRef;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::LogLevel;
use crate::error::Result;
use crate::logger::plog;
use crate::request::ProxyRequest;
use crate::socks::{self, SocksTarget};

/// Value of the `Proxy-Agent` header in CONNECT replies.
pub const PROXY_AGENT: &str = "torctl-rs";

/// Bytes moved by a finished pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// Client to destination.
    pub uploaded: u64,
    /// Destination to client.
    pub downloaded: u64,
}

/// An established client/destination pair.
pub struct RelayPipeline {
    client: TcpStream,
    destination: TcpStream,
    preamble: u64,
}

impl RelayPipeline {
    /// Sends the preamble for `request` and returns a pipeline ready to run.
    ///
    /// Bytes the client sent after its header are forwarded before the pump
    /// starts.
    pub async fn open(
        client: BufReader<TcpStream>,
        request: &ProxyRequest,
        mut destination: TcpStream,
    ) -> Result<Self> {
        if request.keep_alive {
            SockRef::from(&destination).set_keepalive(true)?;
        }

        let leftover = client.buffer().to_vec();
        let mut client = client.into_inner();
        let mut preamble = 0;

        if request.is_connect() {
            let reply = format!(
                "{} 200 Connection established\r\nProxy-Agent: {}\r\n\r\n",
                request.http_version, PROXY_AGENT
            );
            client.write_all(reply.as_bytes()).await?;
        } else {
            let header = request.forward_header();
            destination.write_all(header.as_bytes()).await?;
            destination.write_all(&request.body).await?;
            preamble += (header.len() + request.body.len()) as u64;
        }

        if !leftover.is_empty() {
            destination.write_all(&leftover).await?;
            preamble += leftover.len() as u64;
        }

        Ok(Self {
            client,
            destination,
            preamble,
        })
    }

    /// Pumps bytes both ways until either side closes or fails.
    pub async fn run(self) -> RelayStats {
        let Self {
            client,
            destination,
            preamble,
        } = self;
        let (mut client_read, mut client_write) = client.into_split();
        let (mut destination_read, mut destination_write) = destination.into_split();

        let mut stats = RelayStats {
            uploaded: preamble,
            downloaded: 0,
        };
        tokio::select! {
            sent = tokio::io::copy(&mut client_read, &mut destination_write) => {
                stats.uploaded += sent.unwrap_or(0);
            }
            received = tokio::io::copy(&mut destination_read, &mut client_write) => {
                stats.downloaded += received.unwrap_or(0);
            }
        }
        stats
    }
}

/// Handles one accepted proxy connection from request to teardown.
pub async fn serve(socket: TcpStream, socks_addr: SocketAddr) -> Result<RelayStats> {
    let mut reader = BufReader::new(socket);
    let request = ProxyRequest::read(&mut reader).await?;
    let target = SocksTarget::from_host(&request.host, request.port)?;

    plog(
        LogLevel::Debug,
        &format!("proxying {} via {}", request.request_line, socks_addr),
    );
    let destination = socks::connect(socks_addr, &target).await?;
    let pipeline = RelayPipeline::open(reader, &request, destination).await?;
    Ok(pipeline.run().await)
}
