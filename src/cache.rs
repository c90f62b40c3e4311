//! The unified decision cache.
//!
//! Route and MOTD decisions are memoized under a client identity when the policy layer attaches a
//! cache directive to its decision. Entries expire lazily on lookup; an explicit sweep is
//! available through the boundary API. Two concurrent misses may both dispatch to the policy
//! layer, the last decision to be cached wins.

use crate::decision::{
    CacheDirective, CacheGranularity, MotdDecision, Rejection, RouteDecision, RouteTarget,
    StatusTemplate,
};
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use tokio::time::{Duration, Instant};

/// The request type an entry answers; a route entry never satisfies a MOTD lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DecisionKind {
    Route,
    Motd,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: DecisionKind,
    ip: IpAddr,
    host: Option<String>,
}

impl CacheKey {
    fn new(kind: DecisionKind, granularity: CacheGranularity, ip: IpAddr, host: &str) -> Self {
        let host = match granularity {
            CacheGranularity::Ip => None,
            CacheGranularity::IpHost => Some(host.to_lowercase()),
        };
        Self { kind, ip, host }
    }
}

#[derive(Debug, Clone)]
enum CachedPayload {
    Route(RouteTarget),
    Motd(StatusTemplate),
    Rejected(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: CachedPayload,
    expires_at: Instant,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// The counters reported by the boundary API's cache statistics call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries currently held, including not yet collected expired ones.
    pub total_entries: usize,
    /// Entries that are expired but not yet collected.
    pub expired_entries: usize,
}

/// The concurrent map memoizing route and MOTD decisions by client identity.
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a memoized route decision, preferring the narrower ip+host key.
    pub(crate) fn lookup_route(&self, ip: IpAddr, host: &str) -> Option<RouteDecision> {
        match self.lookup(DecisionKind::Route, ip, host)? {
            CachedPayload::Route(target) => Some(RouteDecision::Forward(target)),
            CachedPayload::Rejected(reason) => Some(RouteDecision::Reject(Rejection {
                disconnect: reason,
            })),
            CachedPayload::Motd(_) => None,
        }
    }

    /// Looks up a memoized MOTD decision, preferring the narrower ip+host key.
    pub(crate) fn lookup_motd(&self, ip: IpAddr, host: &str) -> Option<MotdDecision> {
        match self.lookup(DecisionKind::Motd, ip, host)? {
            CachedPayload::Motd(template) => Some(MotdDecision::Status(template)),
            CachedPayload::Rejected(reason) => Some(MotdDecision::Reject(Rejection {
                disconnect: reason,
            })),
            CachedPayload::Route(_) => None,
        }
    }

    fn lookup(&self, kind: DecisionKind, ip: IpAddr, host: &str) -> Option<CachedPayload> {
        for granularity in [CacheGranularity::IpHost, CacheGranularity::Ip] {
            let key = CacheKey::new(kind, granularity, ip, host);
            if let Some(entry) = self.entries.get(&key) {
                if !entry.expired() {
                    return Some(entry.payload.clone());
                }
                drop(entry);
                // lazy expiry, re-checked under the shard lock
                self.entries.remove_if(&key, |_, entry| entry.expired());
            }
        }
        None
    }

    /// Memoizes a route decision according to its cache directive.
    pub(crate) fn store_route(
        &self,
        ip: IpAddr,
        host: &str,
        target: &RouteTarget,
        directive: &CacheDirective,
    ) {
        let payload = if directive.reject {
            CachedPayload::Rejected(directive.reject_reason.clone().unwrap_or_default())
        } else {
            CachedPayload::Route(target.without_cache())
        };
        self.insert(DecisionKind::Route, ip, host, payload, directive);
    }

    /// Memoizes a MOTD decision according to its cache directive.
    pub(crate) fn store_motd(
        &self,
        ip: IpAddr,
        host: &str,
        template: &StatusTemplate,
        directive: &CacheDirective,
    ) {
        let payload = if directive.reject {
            CachedPayload::Rejected(directive.reject_reason.clone().unwrap_or_default())
        } else {
            CachedPayload::Motd(template.without_cache())
        };
        self.insert(DecisionKind::Motd, ip, host, payload, directive);
    }

    fn insert(
        &self,
        kind: DecisionKind,
        ip: IpAddr,
        host: &str,
        payload: CachedPayload,
        directive: &CacheDirective,
    ) {
        let key = CacheKey::new(kind, directive.granularity, ip, host);
        let entry = CacheEntry {
            payload,
            expires_at: Instant::now() + Duration::from_millis(directive.ttl),
        };
        self.entries.insert(key, entry);
    }

    /// Removes all expired entries, returning how many were collected.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired());
        before.saturating_sub(self.entries.len())
    }

    /// A snapshot of the entry counts.
    pub fn stats(&self) -> CacheStats {
        let total_entries = self.entries.len();
        let expired_entries = self
            .entries
            .iter()
            .filter(|entry| entry.expired())
            .count();
        CacheStats {
            total_entries,
            expired_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(granularity: CacheGranularity, ttl: u64) -> CacheDirective {
        CacheDirective {
            granularity,
            ttl,
            reject: false,
            reject_reason: None,
        }
    }

    fn target(host: &str) -> RouteTarget {
        RouteTarget {
            remote_host: host.to_string(),
            remote_port: 25566,
            proxy: None,
            proxy_protocol: None,
            rewrite_host: None,
            cache: Some(directive(CacheGranularity::Ip, 1000)),
        }
    }

    fn ip(literal: &str) -> IpAddr {
        literal.parse().expect("invalid ip literal")
    }

    #[tokio::test(start_paused = true)]
    async fn ip_entry_matches_any_host() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "mc.example.com",
            &target("backend"),
            &directive(CacheGranularity::Ip, 1000),
        );

        let hit = cache.lookup_route(ip("10.0.0.1"), "other.example.com");
        let Some(RouteDecision::Forward(found)) = hit else {
            panic!("expected a cached forward decision");
        };
        assert_eq!(found.remote_host, "backend");
        // the stored copy carries no cache directive
        assert_eq!(found.cache, None);

        assert!(cache.lookup_route(ip("10.0.0.2"), "mc.example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_host_entry_is_case_insensitive_on_host() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "MC.Example.Com",
            &target("backend"),
            &directive(CacheGranularity::IpHost, 1000),
        );

        assert!(cache.lookup_route(ip("10.0.0.1"), "mc.example.com").is_some());
        assert!(cache.lookup_route(ip("10.0.0.1"), "other.example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "mc.example.com",
            &target("backend"),
            &directive(CacheGranularity::Ip, 1000),
        );

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.lookup_route(ip("10.0.0.1"), "mc.example.com").is_some());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.lookup_route(ip("10.0.0.1"), "mc.example.com").is_none());
        // the expired entry was collected by the lookup
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_directive_caches_a_rejection() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "mc.example.com",
            &target("backend"),
            &CacheDirective {
                granularity: CacheGranularity::Ip,
                ttl: 1000,
                reject: true,
                reject_reason: Some("banned".to_string()),
            },
        );

        let hit = cache.lookup_route(ip("10.0.0.1"), "mc.example.com");
        let Some(RouteDecision::Reject(rejection)) = hit else {
            panic!("expected a cached rejection");
        };
        assert_eq!(rejection.disconnect, "banned");
    }

    #[tokio::test(start_paused = true)]
    async fn route_and_motd_entries_do_not_alias() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "mc.example.com",
            &target("backend"),
            &directive(CacheGranularity::Ip, 1000),
        );

        assert!(cache.lookup_motd(ip("10.0.0.1"), "mc.example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_collects_only_expired_entries() {
        let cache = DecisionCache::new();
        cache.store_route(
            ip("10.0.0.1"),
            "a",
            &target("backend"),
            &directive(CacheGranularity::Ip, 1000),
        );
        cache.store_route(
            ip("10.0.0.2"),
            "b",
            &target("backend"),
            &directive(CacheGranularity::Ip, 5000),
        );

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(
            cache.stats(),
            CacheStats {
                total_entries: 2,
                expired_entries: 1
            }
        );

        assert_eq!(cache.sweep(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                total_entries: 1,
                expired_entries: 0
            }
        );
    }
}
