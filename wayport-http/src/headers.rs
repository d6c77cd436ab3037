//! Header conversion between hyper and the wire, plus proxy header rules

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, UPGRADE};
use std::net::IpAddr;
use tracing::debug;
use wayport_protocol::HeaderList;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PORT: &str = "x-forwarded-port";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Connection-scoped headers that must not be relayed on a plain response
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Flatten a header map, repeated names staying in order
pub fn to_header_list(map: &HeaderMap) -> HeaderList {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect()
}

/// Rebuild a header map; entries that are not valid HTTP headers are dropped
pub fn to_header_map(list: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(list.len());
    for (name, value) in list {
        let parsed = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_maybe_shared(value.clone()),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Dropping invalid header {:?}", name),
        }
    }
    map
}

pub fn strip_hop_by_hop(map: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        map.remove(name);
    }
}

/// Whether a public request asks for a protocol upgrade
pub fn is_upgrade_request(map: &HeaderMap) -> bool {
    map.contains_key(UPGRADE)
}

/// Add `x-forwarded-*` headers describing the public caller.
///
/// An existing `x-forwarded-for` is extended with `,` rather than replaced.
pub fn add_forwarded_headers(map: &mut HeaderMap, peer: IpAddr, proto: &str) {
    let peer = peer.to_string();
    let forwarded_for = match map.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing},{peer}"),
        _ => peer,
    };

    let host = map
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let port = host
        .as_deref()
        .and_then(host_port)
        .unwrap_or(if proto == "https" { "443" } else { "80" })
        .to_string();

    insert(map, X_FORWARDED_FOR, &forwarded_for);
    insert(map, X_FORWARDED_PROTO, proto);
    insert(map, X_FORWARDED_PORT, &port);
    if let Some(host) = host {
        insert(map, X_FORWARDED_HOST, &host);
    }
}

fn insert(map: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        map.insert(name, value);
    }
}

/// Explicit port of a Host header value, if any
fn host_port(host: &str) -> Option<&str> {
    let after_host = match host.strip_prefix('[') {
        Some(rest) => &rest[rest.find(']')? + 1..],
        None if host.matches(':').count() == 1 => &host[host.find(':')?..],
        None => return None,
    };
    after_host
        .strip_prefix(':')
        .filter(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}
