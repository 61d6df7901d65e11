//! One-shot control commands.
//!
//! Every function here follows the same template: open a fresh
//! [`ControlConnection`], authenticate, write one command line, read one
//! reply, parse it and drop the connection. Commands are never pipelined and
//! never share the event session's socket, so concurrent calls need no
//! locking.
//!
//! # Commands
//!
//! | Function | Wire line |
//! |----------|-----------|
//! | [`create_circuit`] | `EXTENDCIRCUIT 0 [r1,r2,...]` |
//! | [`extend_circuit`] | `EXTENDCIRCUIT <id> r1,r2,...` |
//! | [`close_circuit`] | `CLOSECIRCUIT <id>` |
//! | [`close_stream`] | `CLOSESTREAM <id> <reason>` |
//! | [`get_conf`] | `GETCONF n1 n2 ...` |
//! | [`set_conf`] | `SETCONF name=value` |
//! | [`save_conf`] | `SAVECONF` |
//! | [`get_info`] | `GETINFO key` |
//! | [`get_router_status`] | `GETINFO ns/id/<identity>` |
//! | [`get_all_router_status`] | `GETINFO ns/all` |
//! | [`signal_newnym`] | `SIGNAL NEWNYM` |
//! | [`signal_clear_dns_cache`] | `SIGNAL CLEARDNSCACHE` |
//! | [`signal_halt`] | `SIGNAL HALT` |
//!
//! # Example
//!
//! ```rust,no_run
//! use torctl_rs::{commands, ControlEndpoint};
//!
//! # async fn demo() -> torctl_rs::Result<()> {
//! let endpoint = ControlEndpoint::local(9051, "secret");
//! let values = commands::get_conf(&endpoint, &["SocksPort", "ExitNodes"]).await?;
//! for (name, value) in values {
//!     println!("{} = {:?}", name, value);
//! }
//! # Ok(())
//! # }
//! ```

use crate::bytes::Bytes;
use crate::circuit::{Circuit, CircuitStatus};
use crate::codec::{parse_key_value, quote_value, split_fields};
use crate::connection::{ConnectionResponse, ControlConnection, ControlEndpoint};
use crate::error::{Error, Result};
use crate::router::{parse_router_statuses, Router};
use crate::stream::{Stream, StreamReason};
use crate::version::TorVersion;

/// Opens a connection, runs one command and rejects non-2xx replies.
async fn dispatch(endpoint: &ControlEndpoint, line: &str) -> Result<ConnectionResponse> {
    let mut connection = ControlConnection::open(endpoint).await?;
    connection.execute(line).await?.into_result()
}

/// Asks Tor to build a new circuit, optionally through `routers`.
///
/// Returns the ID Tor assigned. The reply must read `EXTENDED <id>`.
pub async fn create_circuit(endpoint: &ControlEndpoint, routers: &[String]) -> Result<u64> {
    let mut line = String::from("EXTENDCIRCUIT 0");
    if !routers.is_empty() {
        line.push(' ');
        line.push_str(&routers.join(","));
    }

    let response = dispatch(endpoint, &line).await?;
    let first = response.responses.first().map(String::as_str).unwrap_or("");
    let parts = split_fields(first, ' ');

    match parts.as_slice() {
        [verb, id, ..] if verb.eq_ignore_ascii_case("EXTENDED") => id
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid circuit id in reply: {}", first))),
        _ => Err(Error::Protocol(format!(
            "unexpected EXTENDCIRCUIT reply: {}",
            first
        ))),
    }
}

/// Extends an existing circuit through `routers`.
///
/// # Errors
///
/// Returns [`Error::Validation`] for an empty router list without
/// contacting Tor.
pub async fn extend_circuit(endpoint: &ControlEndpoint, id: u64, routers: &[String]) -> Result<()> {
    if routers.is_empty() {
        return Err(Error::Validation(
            "at least one router is required to extend a circuit".to_string(),
        ));
    }
    dispatch(endpoint, &format!("EXTENDCIRCUIT {} {}", id, routers.join(","))).await?;
    Ok(())
}

/// Closes `circuit` unless it is already closed.
pub async fn close_circuit(endpoint: &ControlEndpoint, circuit: &Circuit) -> Result<()> {
    if circuit.status == CircuitStatus::Closed {
        return Err(Error::Validation(format!(
            "circuit {} is already closed",
            circuit.id
        )));
    }
    close_circuit_id(endpoint, circuit.id).await
}

/// Closes a circuit by ID without checking its status.
pub async fn close_circuit_id(endpoint: &ControlEndpoint, id: u64) -> Result<()> {
    dispatch(endpoint, &format!("CLOSECIRCUIT {}", id)).await?;
    Ok(())
}

/// Closes `stream` with `reason`.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the stream ID is 0, the stream is
/// already Failed or Closed, or the reason has no numeric wire value.
pub async fn close_stream(endpoint: &ControlEndpoint, stream: &Stream, reason: StreamReason) -> Result<()> {
    if stream.id == 0 {
        return Err(Error::Validation("stream id must be positive".to_string()));
    }
    if stream.is_terminal() {
        return Err(Error::Validation(format!(
            "stream {} is already {}",
            stream.id, stream.status
        )));
    }
    let code = reason
        .code()
        .filter(|_| reason.is_closeable())
        .ok_or_else(|| Error::Validation(format!("{} cannot be sent as a close reason", reason)))?;

    dispatch(endpoint, &format!("CLOSESTREAM {} {}", stream.id, code)).await?;
    Ok(())
}

/// Reads configuration values.
///
/// Returns `(name, value)` pairs in reply order; options without a value
/// map to `None`.
pub async fn get_conf(endpoint: &ControlEndpoint, names: &[&str]) -> Result<Vec<(String, Option<String>)>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let response = dispatch(endpoint, &format!("GETCONF {}", names.join(" "))).await?;
    Ok(response
        .responses
        .iter()
        .map(|line| parse_key_value(line))
        .collect())
}

/// Sets one configuration value. Values containing spaces are quoted.
pub async fn set_conf(endpoint: &ControlEndpoint, name: &str, value: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("configuration name is empty".to_string()));
    }
    dispatch(endpoint, &format!("SETCONF {}={}", name, quote_value(value))).await?;
    Ok(())
}

/// Asks Tor to write its configuration back to the torrc.
pub async fn save_conf(endpoint: &ControlEndpoint) -> Result<()> {
    dispatch(endpoint, "SAVECONF").await?;
    Ok(())
}

/// Requests clean circuits for new connections.
pub async fn signal_newnym(endpoint: &ControlEndpoint) -> Result<()> {
    dispatch(endpoint, "SIGNAL NEWNYM").await?;
    Ok(())
}

/// Forgets all cached DNS answers.
pub async fn signal_clear_dns_cache(endpoint: &ControlEndpoint) -> Result<()> {
    dispatch(endpoint, "SIGNAL CLEARDNSCACHE").await?;
    Ok(())
}

/// Asks Tor to exit immediately.
pub async fn signal_halt(endpoint: &ControlEndpoint) -> Result<()> {
    dispatch(endpoint, "SIGNAL HALT").await?;
    Ok(())
}

/// Queries one GETINFO key.
///
/// A single-line answer yields the text after `=`. A data block yields its
/// lines. The reply must echo `key` or it is rejected as a protocol error.
pub async fn get_info(endpoint: &ControlEndpoint, key: &str) -> Result<Vec<String>> {
    let response = dispatch(endpoint, &format!("GETINFO {}", key)).await?;
    parse_info_values(key, &response.responses)
}

fn parse_info_values(key: &str, responses: &[String]) -> Result<Vec<String>> {
    let first = responses.first().map(String::as_str).unwrap_or("");
    let echoes_key = first
        .get(..key.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(key));
    if !echoes_key {
        return Err(Error::Protocol(format!(
            "GETINFO {} answered with: {}",
            key, first
        )));
    }

    if responses.len() == 1 {
        return Ok(parse_key_value(first).1.into_iter().collect());
    }

    Ok(responses
        .iter()
        .skip(1)
        .take_while(|line| *line != ".")
        .cloned()
        .collect())
}

/// Like [`get_info`] but returns the first value only.
async fn get_info_value(endpoint: &ControlEndpoint, key: &str) -> Result<String> {
    get_info(endpoint, key)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol(format!("GETINFO {} returned no value", key)))
}

/// Looks up the network status of one router by fingerprint or nickname.
pub async fn get_router_status(endpoint: &ControlEndpoint, identity: &str) -> Result<Router> {
    let key = format!("ns/id/{}", identity);
    let response = dispatch(endpoint, &format!("GETINFO {}", key)).await?;
    parse_info_values(&key, &response.responses)?;

    parse_router_statuses(response.responses.iter().map(String::as_str))
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol(format!("no router status for {}", identity)))
}

/// Fetches the network status of every known router.
pub async fn get_all_router_status(endpoint: &ControlEndpoint) -> Result<Vec<Router>> {
    let key = "ns/all";
    let response = dispatch(endpoint, &format!("GETINFO {}", key)).await?;
    parse_info_values(key, &response.responses)?;
    Ok(parse_router_statuses(
        response.responses.iter().map(String::as_str),
    ))
}

/// Returns the two-letter country code Tor's GeoIP database assigns `ip`.
pub async fn get_country_code(endpoint: &ControlEndpoint, ip: &str) -> Result<String> {
    get_info_value(endpoint, &format!("ip-to-country/{}", ip)).await
}

/// Returns true when Tor reports that it is dormant.
pub async fn is_dormant(endpoint: &ControlEndpoint) -> Result<bool> {
    Ok(get_info_value(endpoint, "dormant").await?.trim() == "1")
}

/// Total bytes read since Tor started.
pub async fn get_traffic_read(endpoint: &ControlEndpoint) -> Result<Bytes> {
    traffic(endpoint, "traffic/read").await
}

/// Total bytes written since Tor started.
pub async fn get_traffic_written(endpoint: &ControlEndpoint) -> Result<Bytes> {
    traffic(endpoint, "traffic/written").await
}

async fn traffic(endpoint: &ControlEndpoint, key: &str) -> Result<Bytes> {
    let value = get_info_value(endpoint, key).await?;
    let total: f64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("{} is not a byte count: {}", key, value)))?;
    Ok(Bytes::from_bytes(total).normalize())
}

/// Returns the version of the connected Tor.
///
/// Yields an empty version when the reply carries no `a.b.c.d` number.
pub async fn get_version(endpoint: &ControlEndpoint) -> Result<TorVersion> {
    let value = get_info_value(endpoint, "version").await?;
    Ok(TorVersion::extract(&value).unwrap_or_default())
}
