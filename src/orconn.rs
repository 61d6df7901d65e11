//! OR connections and the ORCONN event grammar.
//!
//! ```text
//! $9695DFC35FFEB861329B9F1AB04C46397020CE31~moria1 CONNECTED NCIRCS=2 ID=18
//! 128.31.0.34:9101 FAILED REASON=CONNECTREFUSED NCIRCS=0
//! ```
//!
//! Older Tor releases do not send `ID=`, so two reports describe the same
//! connection when their non-zero IDs match or, failing that, when their
//! targets match ignoring case.

use crate::codec::split_fields;
use crate::wire::{wire_enum, WireToken};

wire_enum! {
    /// Lifecycle state of an OR connection.
    pub enum OrStatus {
        /// Status absent or not recognised.
        None,
        /// Incoming connection accepted.
        New => "NEW",
        /// Outgoing connection launched.
        Launched => "LAUNCHED",
        /// Handshake finished.
        Connected => "CONNECTED",
        /// Connection attempt failed.
        Failed => "FAILED",
        /// Connection closed.
        Closed => "CLOSED",
    }
}

impl OrStatus {
    /// Returns true for Closed and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrStatus::Closed | OrStatus::Failed)
    }
}

wire_enum! {
    /// Why an OR connection closed or failed.
    pub enum OrReason {
        /// No reason given.
        None,
        /// Closed normally.
        Done => "DONE",
        /// Connection refused.
        ConnectRefused => "CONNECTREFUSED",
        /// Peer had the wrong identity.
        Identity => "IDENTITY",
        /// Connection reset.
        ConnectReset => "CONNECTRESET",
        /// Timed out.
        Timeout => "TIMEOUT",
        /// No route to host.
        NoRoute => "NOROUTE",
        /// I/O error.
        IoError => "IOERROR",
        /// Out of resources.
        ResourceLimit => "RESOURCELIMIT",
        /// Pluggable transport missing.
        PtMissing => "PT_MISSING",
        /// Anything else.
        Misc => "MISC",
    }
}

/// An OR connection as last reported by Tor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrConnection {
    /// Connection ID; 0 when Tor did not report one.
    pub id: u64,
    /// Peer (`$fingerprint~nickname` or `address:port`).
    pub target: String,
    /// Current status.
    pub status: OrStatus,
    /// Close or failure reason.
    pub reason: OrReason,
    /// Active and pending circuits on this connection.
    pub circuit_count: u32,
}

impl OrConnection {
    /// Parses the body of an ORCONN event or an `orconn-status` line.
    ///
    /// Returns `None` for an empty body.
    pub fn parse(body: &str) -> Option<Self> {
        let fields: Vec<String> = split_fields(body.trim(), ' ')
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect();

        let mut connection = Self {
            target: fields.first()?.clone(),
            ..Self::default()
        };
        connection.status = fields
            .get(1)
            .map_or(OrStatus::None, |s| OrStatus::from_token(s));

        for field in fields.iter().skip(2) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key.to_ascii_uppercase().as_str() {
                "REASON" => connection.reason = OrReason::from_token(value),
                "NCIRCS" => connection.circuit_count = value.parse().unwrap_or(0),
                "ID" => connection.id = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        Some(connection)
    }

    /// Returns true when `other` describes the same connection.
    pub fn same_connection(&self, other: &OrConnection) -> bool {
        if other.id != 0 {
            self.id == other.id
        } else {
            self.target.eq_ignore_ascii_case(&other.target)
        }
    }

    /// Returns true once the connection is Closed or Failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
