//! Circuits and the CIRC event grammar.
//!
//! A circuit line, whether it arrives as a `650 CIRC` event or inside a
//! `GETINFO circuit-status` reply, looks like:
//!
//! ```text
//! 12 BUILT $FP1~nickA,$FP2~nickB BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-01-15T10:30:00.000000
//! ```
//!
//! The path is optional (a freshly LAUNCHED circuit has none) and unknown
//! `KEY=value` pairs are ignored so newer Tor releases stay parseable.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::codec::split_fields;
use crate::router::Router;
use crate::wire::{flag_tokens, parse_flags, wire_enum, FlagEntry, WireToken};

wire_enum! {
    /// Lifecycle state of a circuit.
    pub enum CircuitStatus {
        /// Status absent or not recognised.
        None,
        /// Circuit ID assigned to a new circuit.
        Launched => "LAUNCHED",
        /// All hops finished; the circuit can carry streams.
        Built => "BUILT",
        /// One more hop was added.
        Extended => "EXTENDED",
        /// Closed before it was built.
        Failed => "FAILED",
        /// Closed.
        Closed => "CLOSED",
    }
}

impl CircuitStatus {
    /// Returns true for Closed and Failed; nothing follows either.
    pub fn is_terminal(self) -> bool {
        matches!(self, CircuitStatus::Closed | CircuitStatus::Failed)
    }
}

wire_enum! {
    /// Hidden-service state of a circuit.
    pub enum CircuitHsState {
        /// Not a hidden-service circuit.
        None,
        /// Client connecting to an introduction point.
        ConnectingToIntroPoint => "HSCI_CONNECTING",
        /// Client sent INTRODUCE1.
        IntroSent => "HSCI_INTRO_SENT",
        /// Client received the introduction acknowledgement.
        IntroDone => "HSCI_DONE",
        /// Client connecting to a rendezvous point.
        ConnectingToRendezvous => "HSCR_CONNECTING",
        /// Rendezvous point established, not yet introduced.
        RendezvousEstablishedIdle => "HSCR_ESTABLISHED_IDLE",
        /// Rendezvous point established and waiting for the service.
        RendezvousEstablishedWaiting => "HSCR_ESTABLISHED_WAITING",
        /// Client joined with the service.
        ClientJoined => "HSCR_JOINED",
        /// Service connecting to its introduction point.
        ServiceConnectingToIntroPoint => "HSSI_CONNECTING",
        /// Service introduction point established.
        ServiceIntroEstablished => "HSSI_ESTABLISHED",
        /// Service connecting to a rendezvous point.
        ServiceConnectingToRendezvous => "HSSR_CONNECTING",
        /// Service joined with the client.
        ServiceJoined => "HSSR_JOINED",
    }
}

wire_enum! {
    /// What a circuit is used for.
    pub enum CircuitPurpose {
        /// Purpose absent or not recognised.
        None,
        /// Ordinary client traffic.
        General => "GENERAL",
        /// Client-side introduction circuit.
        HsClientIntro => "HS_CLIENT_INTRO",
        /// Client-side rendezvous circuit.
        HsClientRend => "HS_CLIENT_REND",
        /// Service-side introduction circuit.
        HsServiceIntro => "HS_SERVICE_INTRO",
        /// Service-side rendezvous circuit.
        HsServiceRend => "HS_SERVICE_REND",
        /// Reachability test.
        Testing => "TESTING",
        /// Built by a controller.
        Controller => "CONTROLLER",
        /// Built to measure circuit build timeouts.
        MeasureTimeout => "MEASURE_TIMEOUT",
    }
}

wire_enum! {
    /// Why a circuit was closed or failed.
    pub enum CircuitReason {
        /// No reason given.
        None,
        /// Tor protocol violation.
        TorProtocol => "TORPROTOCOL",
        /// Internal error.
        Internal => "INTERNAL",
        /// Closed on request.
        Requested => "REQUESTED",
        /// Relay is hibernating.
        Hibernating => "HIBERNATING",
        /// Out of resources.
        ResourceLimit => "RESOURCELIMIT",
        /// Could not connect to the next hop.
        ConnectFailed => "CONNECTFAILED",
        /// Next hop had the wrong identity.
        OrIdentity => "OR_IDENTITY",
        /// The underlying OR connection closed.
        OrConnectionClosed => "OR_CONN_CLOSED",
        /// Finished normally.
        Finished => "FINISHED",
        /// Build timed out.
        Timeout => "TIMEOUT",
        /// Destroyed by a relay.
        Destroyed => "DESTROYED",
        /// No usable path.
        NoPath => "NOPATH",
        /// Unknown hidden service.
        NoSuchService => "NOSUCHSERVICE",
        /// Measurement circuit expired.
        MeasurementExpired => "MEASUREMENT_EXPIRED",
    }
}

/// Build flags reported with `BUILD_FLAGS=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CircuitBuildFlags(pub u32);

impl CircuitBuildFlags {
    /// Single-hop circuit.
    pub const ONE_HOP_TUNNEL: u32 = 0x1;
    /// Internal circuit, not exiting.
    pub const IS_INTERNAL: u32 = 0x2;
    /// Built from high-capacity relays.
    pub const NEED_CAPACITY: u32 = 0x4;
    /// Built from high-uptime relays.
    pub const NEED_UPTIME: u32 = 0x8;

    /// Wire tokens.
    pub const TABLE: &'static [FlagEntry] = &[
        (Self::ONE_HOP_TUNNEL, "ONEHOP_TUNNEL"),
        (Self::IS_INTERNAL, "IS_INTERNAL"),
        (Self::NEED_CAPACITY, "NEED_CAPACITY"),
        (Self::NEED_UPTIME, "NEED_UPTIME"),
    ];

    /// Parses a comma-separated `BUILD_FLAGS` value.
    pub fn parse(value: &str) -> Self {
        Self(parse_flags(value.split(','), Self::TABLE))
    }

    /// Returns true when every bit of `flag` is set.
    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

impl fmt::Display for CircuitBuildFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&flag_tokens(self.0, Self::TABLE).join(","))
    }
}

/// A circuit as last reported by Tor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Circuit {
    /// Circuit ID, unique within a running Tor.
    pub id: u64,
    /// Current status.
    pub status: CircuitStatus,
    /// Build flags.
    pub build_flags: CircuitBuildFlags,
    /// Hidden-service state.
    pub hs_state: CircuitHsState,
    /// Purpose.
    pub purpose: CircuitPurpose,
    /// Close or failure reason.
    pub reason: CircuitReason,
    /// Raw path tokens (`$FINGERPRINT~nickname` or a bare nickname).
    pub paths: Vec<String>,
    /// Routers resolved from `paths`.
    pub routers: Vec<Router>,
    /// When Tor created the circuit.
    pub time_created: Option<DateTime<Utc>>,
}

impl Circuit {
    /// Creates an empty circuit record for `id`.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Parses the body of a CIRC event or a `circuit-status` line.
    ///
    /// Returns `None` when the circuit ID is missing or not numeric.
    ///
    /// ```rust
    /// use torctl_rs::{Circuit, CircuitPurpose, CircuitStatus};
    ///
    /// let c = Circuit::parse("12 BUILT $FP1~nickA,$FP2~nickB PURPOSE=GENERAL").unwrap();
    /// assert_eq!(c.id, 12);
    /// assert_eq!(c.status, CircuitStatus::Built);
    /// assert_eq!(c.purpose, CircuitPurpose::General);
    /// assert_eq!(c.paths, vec!["$FP1~nickA", "$FP2~nickB"]);
    /// ```
    pub fn parse(body: &str) -> Option<Self> {
        let fields: Vec<String> = split_fields(body.trim(), ' ')
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect();

        let mut circuit = Self::new(fields.first()?.parse().ok()?);
        circuit.status = fields
            .get(1)
            .map_or(CircuitStatus::None, |s| CircuitStatus::from_token(s));

        let mut rest = fields.iter().skip(2).peekable();
        if let Some(path) = rest.next_if(|f| !f.contains('=')) {
            circuit.paths = path
                .split(',')
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        for field in rest {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key.to_ascii_uppercase().as_str() {
                "BUILD_FLAGS" => circuit.build_flags = CircuitBuildFlags::parse(value),
                "PURPOSE" => circuit.purpose = CircuitPurpose::from_token(value),
                "HS_STATE" => circuit.hs_state = CircuitHsState::from_token(value),
                "REASON" => circuit.reason = CircuitReason::from_token(value),
                "TIME_CREATED" => circuit.time_created = parse_timestamp(value),
                _ => {}
            }
        }

        Some(circuit)
    }

    /// Returns true once the circuit is Closed or Failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Router identities usable with `GETINFO ns/id/<identity>`.
    ///
    /// Strips a leading `$` and any `~nickname` (or `=nickname`) suffix and
    /// drops tokens that end up empty.
    pub fn router_identities(&self) -> Vec<String> {
        self.paths
            .iter()
            .filter_map(|path| {
                let token = path.strip_prefix('$').unwrap_or(path);
                let token = token.split(['~', '=']).next().unwrap_or("");
                (!token.is_empty()).then(|| token.to_string())
            })
            .collect()
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_built_circuit() {
        let c = Circuit::parse(
            "12 BUILT $FP1~nickA,$FP2~nickB BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL",
        )
        .unwrap();
        assert_eq!(c.id, 12);
        assert_eq!(c.status, CircuitStatus::Built);
        assert_eq!(c.purpose, CircuitPurpose::General);
        assert_eq!(c.build_flags, CircuitBuildFlags(CircuitBuildFlags::NEED_CAPACITY));
        assert_eq!(c.paths, vec!["$FP1~nickA", "$FP2~nickB"]);
        assert!(c.routers.is_empty());
    }

    #[test]
    fn test_parse_launched_without_path() {
        let c = Circuit::parse(
            "7 LAUNCHED BUILD_FLAGS=IS_INTERNAL,NEED_UPTIME PURPOSE=HS_SERVICE_REND HS_STATE=HSSR_CONNECTING TIME_CREATED=2024-01-15T10:30:05.250000",
        )
        .unwrap();
        assert_eq!(c.status, CircuitStatus::Launched);
        assert!(c.paths.is_empty());
        assert!(c.build_flags.contains(CircuitBuildFlags::IS_INTERNAL));
        assert!(c.build_flags.contains(CircuitBuildFlags::NEED_UPTIME));
        assert_eq!(c.purpose, CircuitPurpose::HsServiceRend);
        assert_eq!(c.hs_state, CircuitHsState::ServiceConnectingToRendezvous);
        assert_eq!(c.time_created.unwrap().second(), 5);
    }

    #[test]
    fn test_parse_closed_with_reason_and_unknown_keys() {
        let c = Circuit::parse("3 CLOSED $AAAA~x REASON=FINISHED REMOTE_REASON=DONE SOCKS_USERNAME=\"a b\"")
            .unwrap();
        assert_eq!(c.status, CircuitStatus::Closed);
        assert_eq!(c.reason, CircuitReason::Finished);
        assert!(c.is_terminal());
    }

    #[test]
    fn test_parse_rejects_missing_id() {
        assert!(Circuit::parse("").is_none());
        assert!(Circuit::parse("abc BUILT").is_none());
    }

    #[test]
    fn test_router_identities() {
        let c = Circuit {
            paths: vec![
                "$ABCDEF~relay1".to_string(),
                "relay2".to_string(),
                "$0123=named".to_string(),
                "$".to_string(),
            ],
            ..Circuit::new(1)
        };
        assert_eq!(c.router_identities(), vec!["ABCDEF", "relay2", "0123"]);
    }

    #[test]
    fn test_build_flags_display() {
        let flags = CircuitBuildFlags::parse("NEED_UPTIME,ONEHOP_TUNNEL");
        assert_eq!(flags.to_string(), "ONEHOP_TUNNEL,NEED_UPTIME");
    }
}
