//! Tunnel registry with longest-prefix routing
//!
//! Maps `(host, path-prefix)` keys to live tunnel connections. At most one
//! connection owns a key; lookups pick the most specific prefix that matches
//! the request path, falling back to the host's catch-all entry.

use crate::tunnel::TunnelConnection;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;
use wayport_common::{Result, TunnelError};

/// One registered route
#[derive(Debug, Clone)]
struct RouteEntry<C> {
    prefix: Option<String>,
    connection_id: Uuid,
    conn: C,
}

/// Snapshot of a registered route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub host: String,
    pub path_prefix: Option<String>,
    pub connection_id: Uuid,
}

/// Process-wide routing table.
///
/// Cloning is cheap; clones share the same table. Each host's entries live in
/// one shard of a `DashMap`, so registration for a host is atomic and a
/// lookup never observes a half-updated host.
#[derive(Debug)]
pub struct TunnelRegistry<C = TunnelConnection> {
    routes: Arc<DashMap<String, Vec<RouteEntry<C>>>>,
}

impl<C> Clone for TunnelRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            routes: Arc::clone(&self.routes),
        }
    }
}

impl<C> Default for TunnelRegistry<C> {
    fn default() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
        }
    }
}

impl<C: Clone> TunnelRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` for `(host, prefix)`.
    ///
    /// Fails with `DuplicateRegistration` when the exact key is already owned;
    /// the existing entry is left untouched.
    pub fn register(
        &self,
        host: &str,
        prefix: Option<&str>,
        connection_id: Uuid,
        conn: C,
    ) -> Result<()> {
        let host = normalize_host(host)
            .ok_or_else(|| TunnelError::Config(format!("invalid tunnel host '{host}'")))?;
        let prefix = normalize_prefix(prefix);

        let mut entries = self.routes.entry(host.clone()).or_default();
        if entries.iter().any(|e| e.prefix == prefix) {
            return Err(TunnelError::DuplicateRegistration(route_label(&host, prefix.as_deref())));
        }
        entries.push(RouteEntry {
            prefix,
            connection_id,
            conn,
        });
        Ok(())
    }

    /// Whether `(host, prefix)` is currently owned
    pub fn contains(&self, host: &str, prefix: Option<&str>) -> bool {
        let Some(host) = normalize_host(host) else {
            return false;
        };
        let prefix = normalize_prefix(prefix);
        self.routes
            .get(&host)
            .is_some_and(|entries| entries.iter().any(|e| e.prefix == prefix))
    }

    /// Remove the entry for `(host, prefix)`. No-op when absent.
    pub fn unregister(&self, host: &str, prefix: Option<&str>) -> bool {
        let prefix = normalize_prefix(prefix);
        self.remove_where(host, |e| e.prefix == prefix)
    }

    /// Remove the entry for `(host, prefix)` only if `connection_id` still owns it
    pub fn release(&self, host: &str, prefix: Option<&str>, connection_id: Uuid) -> bool {
        let prefix = normalize_prefix(prefix);
        self.remove_where(host, |e| e.prefix == prefix && e.connection_id == connection_id)
    }

    fn remove_where(&self, host: &str, matches: impl Fn(&RouteEntry<C>) -> bool) -> bool {
        let Some(host) = normalize_host(host) else {
            return false;
        };
        let removed = match self.routes.get_mut(&host) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| !matches(e));
                entries.len() != before
            }
            None => false,
        };
        self.routes.remove_if(&host, |_, entries| entries.is_empty());
        removed
    }

    /// Resolve the connection serving `path` on `host`.
    ///
    /// Prefixes match literally (not per path segment). The longest matching
    /// prefix wins; the prefix-less entry ranks as length 0 and only serves
    /// paths no prefixed entry matches. Among equal lengths the earliest
    /// registration wins.
    pub fn resolve(&self, host: &str, path: &str) -> Option<C> {
        let host = normalize_host(host)?;
        let entries = self.routes.get(&host)?;

        let mut best: Option<(usize, &RouteEntry<C>)> = None;
        for entry in entries.iter() {
            let rank = match &entry.prefix {
                None => 0,
                Some(prefix) if path.starts_with(prefix.as_str()) => prefix.len(),
                Some(_) => continue,
            };
            if best.is_none_or(|(best_rank, _)| rank > best_rank) {
                best = Some((rank, entry));
            }
        }
        best.map(|(_, entry)| entry.conn.clone())
    }

    /// Snapshot of all routes
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut out = Vec::new();
        for host in self.routes.iter() {
            for entry in host.value() {
                out.push(RouteInfo {
                    host: host.key().clone(),
                    path_prefix: entry.prefix.clone(),
                    connection_id: entry.connection_id,
                });
            }
        }
        out
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.routes.iter().map(|host| host.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn route_label(host: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => format!("{host}{prefix}"),
        None => format!("{host} (catch-all)"),
    }
}

fn normalize_prefix(prefix: Option<&str>) -> Option<String> {
    prefix.filter(|p| !p.is_empty()).map(str::to_owned)
}

/// Normalize a host for routing: trim, strip port and IPv6 brackets,
/// lowercase, drop a trailing dot. Returns `None` for malformed hosts.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = raw.trim();
    if host.is_empty() {
        return None;
    }

    let host = if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080 -> ::1
        &rest[..rest.find(']')?]
    } else if host.matches(':').count() > 1 {
        // Bare IPv6
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };

    let host = host.to_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);

    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
    {
        return None;
    }
    Some(host.to_string())
}
