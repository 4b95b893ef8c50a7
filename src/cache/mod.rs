//! Odds cache: key design and fallback lookup.
//!
//! Key layout (under the store's own prefix):
//!   odds:{sport}:{event_id}:{markets}   → JSON EventOdds   (TTL: cache.ttl_secs)
//!
//! `{markets}` is the deduplicated market set sorted by (base market,
//! alternate last), so `[batter_hits_alternate, batter_hits]` and
//! `[batter_hits, batter_hits_alternate]` build the same key and a base
//! always sits next to its alternate.
//!
//! On a miss the resolver walks: exact key → base+alternate superset →
//! base-only key. A candidate is only used if it covers every requested
//! market; a hit on a wider entry is trimmed back to the request.

pub mod memo;
pub mod store;

use crate::error::EngineError;
use crate::feed::{base_market, is_alternate, EventOdds, ALTERNATE_SUFFIX};
use crate::matching::expand_market_keys;
use std::sync::Arc;
use std::time::Duration;
use store::CacheStore;
use tracing::{debug, warn};

const NAMESPACE: &str = "odds";

/// Placeholder for sport-wide entries with no event id.
const ALL_EVENTS: &str = "all";

/// Deduplicate and sort market keys so key construction is order independent.
pub fn normalize_markets(market_keys: &[String]) -> Vec<String> {
    let mut keys = expand_market_keys(market_keys);
    keys.sort_by(|a, b| {
        (base_market(a), is_alternate(a)).cmp(&(base_market(b), is_alternate(b)))
    });
    keys.dedup();
    keys
}

/// Key for an entry fetched with `market_keys`.
///
/// Alternates stay in the key as themselves rather than folding onto
/// their base. A base-only entry cannot answer an alternate request, so
/// folding here would hand back entries missing the asked-for lines; the
/// base/alternate relationship is applied in [`fallback_sets`] instead,
/// where [`covers`] checks every candidate.
pub fn cache_key(sport: &str, event_id: Option<&str>, market_keys: &[String]) -> String {
    format!(
        "{}:{}:{}:{}",
        NAMESPACE,
        sport,
        event_id.unwrap_or(ALL_EVENTS),
        normalize_markets(market_keys).join(",")
    )
}

/// Which fallback step produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    Exact,
    Superset,
    BaseOnly,
}

/// Candidate market sets in lookup order, deduplicated.
pub fn fallback_sets(market_keys: &[String]) -> Vec<(FallbackTier, Vec<String>)> {
    let exact = normalize_markets(market_keys);

    let superset: Vec<String> = normalize_markets(
        &exact
            .iter()
            .flat_map(|k| {
                let base = base_market(k).to_string();
                let alt = format!("{}{}", base, ALTERNATE_SUFFIX);
                [base, alt]
            })
            .collect::<Vec<_>>(),
    );

    let base_only: Vec<String> = normalize_markets(
        &exact
            .iter()
            .map(|k| base_market(k).to_string())
            .collect::<Vec<_>>(),
    );

    let mut out: Vec<(FallbackTier, Vec<String>)> = Vec::new();
    for (tier, set) in [
        (FallbackTier::Exact, exact),
        (FallbackTier::Superset, superset),
        (FallbackTier::BaseOnly, base_only),
    ] {
        if !out.iter().any(|(_, s)| *s == set) {
            out.push((tier, set));
        }
    }
    out
}

/// Whether an entry holding `entry` markets can answer a request for `requested`.
pub fn covers(entry: &[String], requested: &[String]) -> bool {
    requested.iter().all(|r| entry.contains(r))
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub key: String,
    pub tier: FallbackTier,
    pub event: EventOdds,
}

/// Cache front end used by the engine. Store failures are logged and
/// treated as misses; they never fail a request.
#[derive(Clone)]
pub struct CacheResolver {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheResolver {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Raw lookup of one key.
    pub async fn get(&self, key: &str) -> Option<EventOdds> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = key, error = %EngineError::from(e), "cache read failed, continuing without cache");
                return None;
            }
        };
        match serde_json::from_str::<EventOdds>(&raw) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(key = key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Walk the fallback order for (sport, event, markets).
    pub async fn lookup(
        &self,
        sport: &str,
        event_id: &str,
        market_keys: &[String],
    ) -> Option<CacheHit> {
        let requested = normalize_markets(market_keys);
        for (tier, set) in fallback_sets(&requested) {
            if !covers(&set, &requested) {
                continue;
            }
            let key = cache_key(sport, Some(event_id), &set);
            if let Some(mut event) = self.get(&key).await {
                if set != requested {
                    event.retain_markets(&requested);
                }
                debug!(key = %key, tier = ?tier, "cache hit");
                return Some(CacheHit { key, tier, event });
            }
        }
        debug!(sport = sport, event = event_id, "cache miss");
        None
    }

    /// Write an event under the key of the markets it was fetched with.
    pub async fn store(&self, sport: &str, market_keys: &[String], event: &EventOdds) {
        let key = cache_key(sport, Some(&event.event_id), market_keys);
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!(key = %key, error = %e, "cache encode failed");
                return;
            }
        };
        match self.store.set(&key, &json, self.ttl).await {
            Ok(()) => debug!(key = %key, ttl_secs = self.ttl.as_secs(), "cached event odds"),
            Err(e) => warn!(
                key = %key,
                error = %EngineError::from(e),
                "cache write failed, continuing without cache"
            ),
        }
    }

    /// Every cached key for a sport (bulk listing path).
    pub async fn list_keys(&self, sport: &str) -> Vec<String> {
        let pattern = format!("{}:{}:*", NAMESPACE, sport);
        match self.store.scan(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %pattern, error = %EngineError::from(e), "cache scan failed");
                Vec::new()
            }
        }
    }
}
