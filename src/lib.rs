//! # torctl-rs
//!
//! A Tor control-protocol client with an HTTP-to-SOCKS5 relay proxy.
//!
//! # Overview
//!
//! torctl-rs talks to a running (or launched) Tor through its control port
//! and exposes two independent paths:
//!
//! - **Control**: one-shot commands ([`commands`]) over a fresh connection
//!   each, and a long-lived [`EventSession`] that demultiplexes asynchronous
//!   circuit, stream, OR-connection, bandwidth, configuration and log events.
//! - **Proxy**: a local [`ProxyListener`] that accepts plain HTTP and
//!   `CONNECT` requests, negotiates SOCKS5 with Tor's SOCKS port and relays
//!   bytes until either side closes.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`codec`] | Control-protocol line grammar and quoting |
//! | [`wire`] | Enum/flag tables for protocol tokens |
//! | [`connection`] | [`ControlEndpoint`] and the per-command [`ControlConnection`] |
//! | [`commands`] | GETINFO, GETCONF, SETCONF, SIGNAL, circuit and stream commands |
//! | [`events`] | [`EventSession`], event reassembly and dispatch |
//! | [`circuit`], [`stream`], [`orconn`], [`router`] | Parsed status records |
//! | [`status`] | [`StatusRegistry`] kept current from events |
//! | [`bytes`], [`version`] | Byte counts and Tor versions |
//! | [`socks`], [`request`], [`relay`], [`proxy`] | The HTTP-to-SOCKS proxy |
//! | [`client`] | [`Client`] facade tying everything together |
//! | [`config`], [`logger`], [`error`] | Configuration, logging, errors |
//!
//! # What This Library Does NOT Do
//!
//! - **Implement Tor**: a Tor process must be reachable or launchable
//! - **Serve SOCKS**: only the client side of SOCKS5 is spoken
//! - **Wrap every option**: configuration goes through a generic
//!   name/value channel (`GETCONF`/`SETCONF`)
//! - **Time out**: a hung socket blocks until TCP gives up or the owner
//!   shuts it down
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use torctl_rs::client::{Client, ClientOptions, ClientRemoteParams};
//!
//! #[tokio::main]
//! async fn main() -> torctl_rs::Result<()> {
//!     let params = ClientRemoteParams::new("127.0.0.1", 9051, "secret");
//!     let mut client = Client::connect(params, ClientOptions::default()).await?;
//!
//!     if let Some(proxy) = client.web_proxy() {
//!         println!("HTTP proxy at {}", proxy.address());
//!     }
//!     client.new_identity().await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Attach to a running tor
//! torctl-rs --control-port 9051 --control-pass secret
//!
//! # Launch tor and serve the proxy
//! torctl-rs --tor-path /usr/bin/tor --proxy-port 8118
//!
//! # Generate default configuration file
//! torctl-rs --generate_config torctl.conf
//! ```
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec)
//! - [RFC 1928](https://www.rfc-editor.org/rfc/rfc1928) - SOCKS Protocol Version 5

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod wire;

pub mod bytes;
pub mod circuit;
pub mod client;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logger;
pub mod orconn;
pub mod proxy;
pub mod relay;
pub mod request;
pub mod router;
pub mod socks;
pub mod status;
pub mod stream;
pub mod version;

pub use bytes::{ByteUnit, Bytes};
pub use circuit::{
    Circuit, CircuitBuildFlags, CircuitHsState, CircuitPurpose, CircuitReason, CircuitStatus,
};
pub use client::{
    Client, ClientCreateParams, ClientOptions, ClientRemoteParams, SecurePassword,
    ShutdownReason, MINIMUM_SUPPORTED_VERSION,
};
pub use config::{CliArgs, Config, LogLevel};
pub use connection::{ConnectionResponse, ControlConnection, ControlEndpoint};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventKind, EventSession, SessionState, Subscription, TorEvent};
pub use orconn::{OrConnection, OrReason, OrStatus};
pub use proxy::ProxyListener;
pub use relay::{RelayPipeline, RelayStats};
pub use request::ProxyRequest;
pub use router::{Router, RouterFlags};
pub use socks::SocksTarget;
pub use status::{RegistryChange, StatusRegistry};
pub use stream::{Stream, StreamPurpose, StreamReason, StreamStatus};
pub use version::TorVersion;
pub use wire::WireToken;

/// Crate version, as reported by the binary at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
