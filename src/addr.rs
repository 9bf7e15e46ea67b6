// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Socket address value type and address-list parsing.
//!
//! An address list is a comma-separated string of `host[:port]` entries.
//! IPv6 literals must be bracketed (`[::1]:7400`). Entries without an
//! explicit port take the configured default port; when no default is
//! configured, an explicit port on the last entry acts as the default for
//! the whole list, so `"feed1,feed2:7400"` connects to both hosts on 7400.
//!
//! The local-interface address set is computed once per process and exposed
//! only through [`is_local_address`]; the client address source uses it to
//! order same-host candidates first.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Result, TransportError};

// ============================================================================
// SocketAddress
// ============================================================================

/// A `host:port` pair, compared and hashed by value.
///
/// The host may be a name, an IP literal, or an unresolvable string kept
/// verbatim for a proxy to resolve later.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl SocketAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 literals get their brackets back
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ============================================================================
// Address-list parsing
// ============================================================================

/// Parse a comma-separated address list.
///
/// `default_port` applies to entries without an explicit port. When
/// `default_port` is 0, the explicit port of the last entry (if any) is used
/// as the list-wide default instead. An entry that ends up with port 0 is an
/// error.
pub fn parse_address_list(list: &str, default_port: u16) -> Result<Vec<SocketAddress>> {
    let entries: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if entries.is_empty() {
        return Err(TransportError::InvalidAddress(format!(
            "no addresses in \"{}\"",
            list
        )));
    }

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in &entries {
        parsed.push(split_host_port(entry)?);
    }

    let effective_default = if default_port != 0 {
        default_port
    } else {
        parsed.last().and_then(|(_, p)| *p).unwrap_or(0)
    };

    let mut addresses = Vec::with_capacity(parsed.len());
    for (host, port) in parsed {
        let port = port.unwrap_or(effective_default);
        if port == 0 {
            return Err(TransportError::InvalidAddress(format!(
                "no port for \"{}\" and no default port",
                host
            )));
        }
        addresses.push(SocketAddress::new(host, port));
    }
    Ok(addresses)
}

/// Split one `host[:port]` entry; IPv6 literals must be bracketed.
fn split_host_port(entry: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = entry.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = rest.find(']').ok_or_else(|| {
            TransportError::InvalidAddress(format!("unterminated bracket in \"{}\"", entry))
        })?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host.to_string(), None));
        }
        let port_str = tail.strip_prefix(':').ok_or_else(|| {
            TransportError::InvalidAddress(format!("garbage after bracket in \"{}\"", entry))
        })?;
        return Ok((host.to_string(), Some(parse_port(port_str, entry)?)));
    }

    match entry.rfind(':') {
        // A second colon means an unbracketed IPv6 literal
        Some(_) if entry.matches(':').count() > 1 => Err(TransportError::InvalidAddress(format!(
            "IPv6 literal must be bracketed: \"{}\"",
            entry
        ))),
        Some(pos) => {
            let host = &entry[..pos];
            if host.is_empty() {
                return Err(TransportError::InvalidAddress(format!(
                    "empty host in \"{}\"",
                    entry
                )));
            }
            Ok((host.to_string(), Some(parse_port(&entry[pos + 1..], entry)?)))
        }
        None => Ok((entry.to_string(), None)),
    }
}

fn parse_port(s: &str, entry: &str) -> Result<u16> {
    s.parse::<u16>().map_err(|_| {
        TransportError::InvalidAddress(format!("bad port \"{}\" in \"{}\"", s, entry))
    })
}

// ============================================================================
// Local-address cache
// ============================================================================

static LOCAL_ADDRESSES: OnceLock<HashSet<String>> = OnceLock::new();

/// Check whether `host` is an IP address of a local network interface.
///
/// The interface set is enumerated once per process. If enumeration fails
/// the set is empty and candidate ordering simply loses local priority.
pub fn is_local_address(host: &str) -> bool {
    local_addresses().contains(host)
}

fn local_addresses() -> &'static HashSet<String> {
    LOCAL_ADDRESSES.get_or_init(|| match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas.into_iter().map(|(_, ip)| ip.to_string()).collect(),
        Err(e) => {
            log::warn!(
                "Cannot enumerate local interfaces, proceeding without local address priority: {}",
                e
            );
            HashSet::new()
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
