//! Application streams and the STREAM event grammar.
//!
//! ```text
//! 42 SUCCEEDED 12 example.com:443 PURPOSE=USER
//! 42 CLOSED 12 example.com:443 REASON=DONE
//! ```

use crate::codec::split_fields;
use crate::wire::{wire_enum, WireToken};

wire_enum! {
    /// Lifecycle state of a stream.
    pub enum StreamStatus {
        /// Status absent or not recognised.
        None,
        /// New request to connect.
        New => "NEW",
        /// New request to resolve an address.
        NewResolve => "NEWRESOLVE",
        /// Address re-mapped to another.
        Remap => "REMAP",
        /// Sent a connect cell along a circuit.
        SentConnect => "SENTCONNECT",
        /// Sent a resolve cell along a circuit.
        SentResolve => "SENTRESOLVE",
        /// Received a reply; the stream is established.
        Succeeded => "SUCCEEDED",
        /// Stream failed and is not retriable.
        Failed => "FAILED",
        /// Stream closed.
        Closed => "CLOSED",
        /// Detached from its circuit; may be retried.
        Detached => "DETACHED",
    }
}

impl StreamStatus {
    /// Returns true for Closed and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamStatus::Closed | StreamStatus::Failed)
    }
}

wire_enum! {
    /// Why Tor opened a stream.
    pub enum StreamPurpose {
        /// Purpose absent or not recognised.
        None,
        /// Fetching directory information.
        DirectoryFetch => "DIR_FETCH",
        /// Uploading a descriptor.
        DirectoryUpload => "DIR_UPLOAD",
        /// User-initiated DNS request.
        DnsRequest => "DNS_REQUEST",
        /// Checking the reachability of our own directory port.
        DirectoryPortTest => "DIRPORT_TEST",
        /// Any other user traffic.
        User => "USER",
    }
}

wire_enum! {
    /// Why a stream was closed or detached.
    ///
    /// `End` and `PrivateAddr` share the numeric code -1 on the wire;
    /// [`StreamReason::from_code`] decodes -1 as `End`.
    pub enum StreamReason {
        /// No reason given.
        None,
        /// Unlisted reason.
        Misc => "MISC",
        /// Could not resolve the address.
        ResolveFailed => "RESOLVEFAILED",
        /// Connection refused.
        ConnectRefused => "CONNECTREFUSED",
        /// Exit policy forbids the connection.
        ExitPolicy => "EXITPOLICY",
        /// The circuit was destroyed.
        Destroy => "DESTROY",
        /// Closed normally.
        Done => "DONE",
        /// Timed out.
        Timeout => "TIMEOUT",
        /// No route to host.
        NoRoute => "NOROUTE",
        /// Relay is hibernating.
        Hibernating => "HIBERNATING",
        /// Internal error at the relay.
        Internal => "INTERNAL",
        /// Relay out of resources.
        ResourceLimit => "RESOURCELIMIT",
        /// Connection reset.
        ConnectionReset => "CONNRESET",
        /// Tor protocol violation.
        TorProtocol => "TORPROTOCOL",
        /// Not a directory.
        NotDirectory => "NOTDIRECTORY",
        /// Received a RELAY_END cell.
        End => "END",
        /// Client tried to reach a private address.
        PrivateAddr => "PRIVATE_ADDR",
    }
}

impl StreamReason {
    const CODES: &'static [(StreamReason, i32)] = &[
        (StreamReason::Misc, 1),
        (StreamReason::ResolveFailed, 2),
        (StreamReason::ConnectRefused, 3),
        (StreamReason::ExitPolicy, 4),
        (StreamReason::Destroy, 5),
        (StreamReason::Done, 6),
        (StreamReason::Timeout, 7),
        (StreamReason::NoRoute, 8),
        (StreamReason::Hibernating, 9),
        (StreamReason::Internal, 10),
        (StreamReason::ResourceLimit, 11),
        (StreamReason::ConnectionReset, 12),
        (StreamReason::TorProtocol, 13),
        (StreamReason::NotDirectory, 14),
        (StreamReason::End, -1),
        (StreamReason::PrivateAddr, -1),
    ];

    /// Numeric reason code used by CLOSESTREAM, if any.
    pub fn code(self) -> Option<i32> {
        Self::CODES
            .iter()
            .find(|(reason, _)| *reason == self)
            .map(|(_, code)| *code)
    }

    /// Decodes a numeric reason; the first table entry wins on collisions.
    pub fn from_code(code: i32) -> Self {
        Self::CODES
            .iter()
            .find(|(_, known)| *known == code)
            .map_or(StreamReason::None, |(reason, _)| *reason)
    }

    /// Returns true when the reason can be sent with CLOSESTREAM.
    pub fn is_closeable(self) -> bool {
        self.code().is_some_and(|code| code > 0)
    }
}

/// An application stream as last reported by Tor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stream {
    /// Stream ID.
    pub id: u64,
    /// Owning circuit; 0 while detached.
    pub circuit_id: u64,
    /// Destination host.
    pub target_host: String,
    /// Destination port.
    pub target_port: u16,
    /// Current status.
    pub status: StreamStatus,
    /// Purpose.
    pub purpose: StreamPurpose,
    /// Close or detach reason.
    pub reason: StreamReason,
}

impl Stream {
    /// Creates an empty stream record.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Parses the body of a STREAM event or a `stream-status` line.
    pub fn parse(body: &str) -> Option<Self> {
        let fields: Vec<String> = split_fields(body.trim(), ' ')
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect();

        let mut stream = Self::new(fields.first()?.parse().ok()?);
        stream.status = fields
            .get(1)
            .map_or(StreamStatus::None, |s| StreamStatus::from_token(s));
        stream.circuit_id = fields.get(2).and_then(|c| c.parse().ok()).unwrap_or(0);

        if let Some(target) = fields.get(3).filter(|f| !f.contains('=')) {
            let (host, port) = split_target(target);
            stream.target_host = host;
            stream.target_port = port;
        }

        for field in fields.iter().skip(3) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key.to_ascii_uppercase().as_str() {
                "REASON" => stream.reason = StreamReason::from_token(value),
                "PURPOSE" => stream.purpose = StreamPurpose::from_token(value),
                _ => {}
            }
        }

        Some(stream)
    }

    /// Returns true once the stream is Closed or Failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_target(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (host.to_string(), port.parse().unwrap_or(0))
        }
        _ => (target.to_string(), 0),
    }
}
