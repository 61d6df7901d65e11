//! Relay descriptors from network-status documents.
//!
//! `GETINFO ns/id/<identity>` and `GETINFO ns/all` answer with router status
//! entries, three lines per relay:
//!
//! ```text
//! r moria1 lpXfw1/+uGEym58asExGOXAgzjE IpcJtTS3... 2024-01-15 10:30:00 128.31.0.34 9101 9131
//! s Authority Fast Running Stable V2Dir Valid
//! w Bandwidth=20
//! ```
//!
//! [`parse_router_statuses`] turns any number of these triplets into
//! [`Router`] snapshots. A malformed field falls back to its default and
//! never aborts the rest of the parse.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::bytes::{ByteUnit, Bytes};
use crate::wire::{flag_tokens, parse_flags, FlagEntry};

/// Flags assigned to a relay by the directory authorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouterFlags(pub u32);

impl RouterFlags {
    /// Directory authority.
    pub const AUTHORITY: u32 = 0x1;
    /// Known to be a bad exit.
    pub const BAD_EXIT: u32 = 0x2;
    /// Exit relay.
    pub const EXIT: u32 = 0x4;
    /// Suitable for high-bandwidth circuits.
    pub const FAST: u32 = 0x8;
    /// Suitable as an entry guard.
    pub const GUARD: u32 = 0x10;
    /// Hidden service directory.
    pub const HS_DIR: u32 = 0x20;
    /// Nickname is bound to the identity key.
    pub const NAMED: u32 = 0x40;
    /// Suitable for long-lived circuits.
    pub const STABLE: u32 = 0x80;
    /// Currently usable.
    pub const RUNNING: u32 = 0x100;
    /// Nickname is bound to another identity.
    pub const UNNAMED: u32 = 0x200;
    /// Validated by the authorities.
    pub const VALID: u32 = 0x400;
    /// Implements the v2 directory protocol.
    pub const V2_DIR: u32 = 0x800;

    /// Wire tokens of the `s` line.
    pub const TABLE: &'static [FlagEntry] = &[
        (Self::AUTHORITY, "Authority"),
        (Self::BAD_EXIT, "BadExit"),
        (Self::EXIT, "Exit"),
        (Self::FAST, "Fast"),
        (Self::GUARD, "Guard"),
        (Self::HS_DIR, "HSDir"),
        (Self::NAMED, "Named"),
        (Self::STABLE, "Stable"),
        (Self::RUNNING, "Running"),
        (Self::UNNAMED, "Unnamed"),
        (Self::VALID, "Valid"),
        (Self::V2_DIR, "V2Dir"),
    ];

    /// Parses the tokens of an `s` line, ignoring unknown flags.
    pub fn parse<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Self {
        Self(parse_flags(tokens, Self::TABLE))
    }

    /// Returns true when every bit of `flag` is set.
    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Names of the set flags.
    pub fn tokens(&self) -> Vec<&'static str> {
        flag_tokens(self.0, Self::TABLE)
    }
}

impl fmt::Display for RouterFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens().join(" "))
    }
}

/// Immutable snapshot of one relay's network-status entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Router {
    /// Relay nickname.
    pub nickname: String,
    /// Base64 identity digest as reported.
    pub identity: String,
    /// Base64 descriptor digest as reported.
    pub digest: String,
    /// Publication time of the descriptor.
    pub published: Option<DateTime<Utc>>,
    /// Address of the OR port.
    pub ip_address: Option<IpAddr>,
    /// OR port; 0 when unknown.
    pub or_port: u16,
    /// Directory port; 0 when absent.
    pub dir_port: u16,
    /// Advertised bandwidth, normalised from kilobytes.
    pub bandwidth: Bytes,
    /// Authority-assigned flags.
    pub flags: RouterFlags,
}

impl Router {
    /// Returns the identity as an upper-case hex fingerprint.
    ///
    /// Returns `None` if the identity is not valid base64.
    pub fn fingerprint(&self) -> Option<String> {
        let decoded = base64_decode(&self.identity)?;
        Some(decoded.iter().map(|b| format!("{:02X}", b)).collect())
    }

    fn from_r_line(fields: &[&str]) -> Self {
        let field = |i: usize| fields.get(i).copied().unwrap_or("");

        let published = NaiveDateTime::parse_from_str(
            &format!("{} {}", field(4), field(5)),
            "%Y-%m-%d %H:%M:%S",
        )
        .ok()
        .map(|naive| naive.and_utc());

        Self {
            nickname: field(1).to_string(),
            identity: field(2).to_string(),
            digest: field(3).to_string(),
            published,
            ip_address: field(6).parse().ok(),
            or_port: field(7).parse().unwrap_or(0),
            dir_port: field(8).parse().unwrap_or(0),
            bandwidth: Bytes::default(),
            flags: RouterFlags::default(),
        }
    }

    fn apply_w_line(&mut self, fields: &[&str]) {
        for field in fields.iter().skip(1) {
            if let Some((key, value)) = field.split_once('=') {
                if key.eq_ignore_ascii_case("bandwidth") {
                    if let Ok(kb) = value.trim().parse::<u64>() {
                        self.bandwidth = Bytes::new(kb as f64, ByteUnit::KB).normalize();
                    }
                }
            }
        }
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip_address {
            Some(ip) => write!(f, "{} ({}:{})", self.nickname, ip, self.or_port),
            None => write!(f, "{}", self.nickname),
        }
    }
}

/// Parses a sequence of `r`/`s`/`w` triplets into routers.
///
/// Parsing stops at a lone `.` line. Lines other than `r`, `s` and `w`
/// (for example `m`, `p` or `a` lines) are skipped, as are `s`/`w` lines
/// that appear before the first `r` line.
pub fn parse_router_statuses<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Router> {
    let mut routers = Vec::new();
    let mut current: Option<Router> = None;

    for line in lines {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "." {
            break;
        }

        let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
        match fields.first().copied() {
            Some("r") => {
                if let Some(router) = current.take() {
                    routers.push(router);
                }
                current = Some(Router::from_r_line(&fields));
            }
            Some("s") => {
                if let Some(ref mut router) = current {
                    router.flags = RouterFlags::parse(fields[1..].iter().copied());
                }
            }
            Some("w") => {
                if let Some(ref mut router) = current {
                    router.apply_w_line(&fields);
                }
            }
            _ => {}
        }
    }

    if let Some(router) = current {
        routers.push(router);
    }

    routers
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let input = input.trim_end_matches('=');
    if input.is_empty() {
        return None;
    }

    let mut output = Vec::with_capacity(input.len() * 3 / 4);
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;

        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
