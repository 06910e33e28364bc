//! Address classification for the transports a node can speak.
//!
//! Only TCP is wired into the core runtime; MAC-form addresses are still
//! recognized and tagged so callers get `NotImplemented` instead of a parse
//! error when dialing an RFCOMM peer.

use std::net::{IpAddr, SocketAddr};

use crate::AppError;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rfcomm,
}

/// Classifies an address string.
///
/// Recognized TCP forms: `localhost`, `localhost:<port>`, a bare IP address,
/// `<ip>:<port>` and `:<port>` (empty host means `0.0.0.0`). Six hex octets
/// separated by `:` are an IEEE MAC address and classify as RFCOMM.
pub fn transport_kind(address: &str) -> AppResult<TransportKind> {
    let address = address.trim();

    if address.is_empty() {
        return Err(AppError::AddressEmpty);
    }

    if address == "localhost" || address.starts_with("localhost:") {
        return Ok(TransportKind::Tcp);
    }

    if address.parse::<IpAddr>().is_ok() {
        return Ok(TransportKind::Tcp);
    }

    let candidate = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    if candidate.parse::<SocketAddr>().is_ok() {
        return Ok(TransportKind::Tcp);
    }

    if is_mac_address(address) {
        return Ok(TransportKind::Rfcomm);
    }

    Err(AppError::AddressFormatUnknown)
}

/// Splits a TCP address into host and port. An empty host becomes `0.0.0.0`.
pub fn host_and_port(address: &str) -> AppResult<(String, u16)> {
    let address = address.trim();
    match transport_kind(address) {
        Ok(TransportKind::Tcp) => {}
        _ => return Err(AppError::AddressFormatUnknown),
    }

    let mut parts = address.split(':');
    let (host, port) = match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => (host, port),
        _ => return Err(AppError::AddressFormatUnknown),
    };

    let port: u16 = port
        .parse()
        .map_err(|_| AppError::AddressFormatUnknown)?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    Ok((host.to_string(), port))
}

/// Resolves a parsed host/port pair into a socket address.
pub(crate) fn socket_address(host: &str, port: u16) -> AppResult<SocketAddr> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{host}:{port}")
        .parse()
        .map_err(|_| AppError::AddressFormatUnknown)
}

fn is_mac_address(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
