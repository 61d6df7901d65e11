//! Error types for torctl-rs.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! control-protocol engine and the relay proxy can report.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                  ◄── File/network I/O failures
//!   ├── Config              ◄── Invalid configuration
//!   ├── Connect             ◄── Control port unreachable (transport failure)
//!   ├── Authentication      ◄── Control port rejected the password
//!   ├── Protocol            ◄── Reply could not be parsed at all
//!   ├── Command             ◄── Tor answered with a non-2xx status code
//!   ├── Validation          ◄── Arguments rejected before anything was sent
//!   ├── UnsupportedVersion  ◄── Tor is older than the minimum supported release
//!   ├── Socks               ◄── SOCKS5 negotiation failed
//!   ├── ProxyRequest        ◄── Inbound HTTP request could not be parsed
//!   └── ProcessLaunch       ◄── The tor executable could not be started
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Scope | Recommended Action |
//! |-------|-------|-------------------|
//! | [`Connect`](Error::Connect) | One command | Check Tor is running and the control port |
//! | [`Authentication`](Error::Authentication) | Configuration | Fix the control password |
//! | [`Command`](Error::Command) | One command | Inspect the code and message Tor returned |
//! | [`Protocol`](Error::Protocol) | One command | Usually a Tor version mismatch |
//! | [`UnsupportedVersion`](Error::UnsupportedVersion) | Client | Upgrade Tor |
//! | [`Socks`](Error::Socks) | One proxied connection | Check the SOCKS port |
//! | [`ProxyRequest`](Error::ProxyRequest) | One proxied connection | Client sent a malformed request |
//!
//! Nothing in this crate retries automatically. A failed command is reported
//! once and the caller decides what to do with it.
//!
//! # Example
//!
//! ```rust,no_run
//! use torctl_rs::{commands, ControlEndpoint, Error};
//!
//! # async fn demo() {
//! let endpoint = ControlEndpoint::local(9051, "secret");
//! match commands::signal_newnym(&endpoint).await {
//!     Ok(()) => println!("new identity requested"),
//!     Err(Error::Authentication(msg)) => eprintln!("bad password: {}", msg),
//!     Err(e) => eprintln!("command failed: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::version::TorVersion;

/// Errors that can occur during torctl-rs operations.
///
/// Command-level failures (everything a single control command can hit) are
/// returned to the caller. Session and process failures are additionally
/// published through the client's shutdown notification.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values or a config file that failed to parse.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control port could not be reached.
    #[error("failed to connect to the control port: {0}")]
    Connect(String),

    /// The control port rejected the supplied password.
    ///
    /// This is a configuration problem rather than a transient failure.
    #[error("control could not be authenticated: {0}")]
    Authentication(String),

    /// A reply was missing its required shape and could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tor answered a command with a non-success status code.
    #[error("command rejected with status {code}: {message}")]
    Command {
        /// The three-digit status code of the reply.
        code: u16,
        /// The text that followed the status code.
        message: String,
    },

    /// Command arguments were rejected before anything was sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// The connected Tor is older than the minimum supported release.
    #[error("tor {found} is not supported, please use version {minimum} or higher")]
    UnsupportedVersion {
        /// Version reported by Tor.
        found: TorVersion,
        /// Minimum version this crate works with.
        minimum: TorVersion,
    },

    /// The SOCKS5 handshake with the local SOCKS port failed.
    #[error("SOCKS5 negotiation failed: {0}")]
    Socks(String),

    /// An inbound proxy request could not be parsed.
    #[error("the proxy connection failed to process: {0}")]
    ProxyRequest(String),

    /// The tor executable could not be started.
    #[error("the tor application process failed to launch: {0}")]
    ProcessLaunch(String),
}

/// Result type alias for torctl-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let err = Error::Command {
            code: 552,
            message: "Unrecognized option".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command rejected with status 552: Unrecognized option"
        );

        let err = Error::UnsupportedVersion {
            found: TorVersion::new(0, 2, 0, 1),
            minimum: TorVersion::new(0, 2, 0, 9),
        };
        assert!(err.to_string().contains("0.2.0.9 or higher"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
