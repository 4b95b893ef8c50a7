//! The Odds API event-odds fetcher.
//!
//! Fetches one event's odds at a time from
//! `{base}/sports/{sport}/events/{event}/odds` with American prices,
//! selection ids and deep links. Decoding happens at the boundary via
//! [`super::decode_event_json`]; issues are logged and the rest of the
//! payload is kept.
//!
//! Rate-limit aware: reads `x-requests-remaining` and `x-requests-used`
//! headers from every API response. Counters are atomics so a single
//! fetcher can be shared across concurrent fetch tasks.

use super::{decode_event_json, EventOdds, QuoteSource};
use crate::config::OddsApiConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Summary of API quota after a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaInfo {
    /// Requests remaining this month (from `x-requests-remaining` header).
    pub remaining: Option<u32>,
    /// Requests used this month (from `x-requests-used` header).
    pub used: Option<u32>,
}

const UNKNOWN: i64 = -1;

pub struct OddsFetcher {
    api_key: String,
    base_url: String,
    regions: String,
    bookmakers: Vec<String>,
    client: reqwest::Client,
    last_remaining: AtomicI64,
    last_used: AtomicI64,
    requests_made: AtomicU32,
}

impl OddsFetcher {
    pub fn new(cfg: &OddsApiConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            regions: cfg.regions.clone(),
            bookmakers: cfg.bookmakers.clone(),
            client,
            last_remaining: AtomicI64::new(UNKNOWN),
            last_used: AtomicI64::new(UNKNOWN),
            requests_made: AtomicU32::new(0),
        })
    }

    pub fn quota(&self) -> QuotaInfo {
        QuotaInfo {
            remaining: known(self.last_remaining.load(Ordering::Relaxed)),
            used: known(self.last_used.load(Ordering::Relaxed)),
        }
    }

    /// Total requests made by this instance since startup.
    pub fn requests_made(&self) -> u32 {
        self.requests_made.load(Ordering::Relaxed)
    }

    fn event_url(&self, sport: &str, event_id: &str) -> String {
        format!(
            "{}/sports/{}/events/{}/odds",
            self.base_url, sport, event_id
        )
    }

    fn query(&self, markets: &[String]) -> Vec<(&'static str, String)> {
        let mut q = vec![
            ("apiKey", self.api_key.clone()),
            ("regions", self.regions.clone()),
            ("markets", markets.join(",")),
            ("oddsFormat", "american".to_string()),
            ("dateFormat", "iso".to_string()),
            ("includeSids", "true".to_string()),
            ("includeLinks", "true".to_string()),
        ];
        if !self.bookmakers.is_empty() {
            q.push(("bookmakers", self.bookmakers.join(",")));
        }
        q
    }

    fn record_quota(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(remaining) = header_u32(headers, "x-requests-remaining") {
            self.last_remaining
                .store(remaining as i64, Ordering::Relaxed);
        }
        if let Some(used) = header_u32(headers, "x-requests-used") {
            self.last_used.store(used as i64, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl QuoteSource for OddsFetcher {
    async fn fetch_event(
        &self,
        sport: &str,
        event_id: &str,
        markets: &[String],
    ) -> Result<EventOdds, EngineError> {
        let upstream = |reason: String| EngineError::UpstreamFetch {
            event_id: event_id.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(self.event_url(sport, event_id))
            .query(&self.query(markets))
            .send()
            .await
            // The request URL carries the API key; keep it out of errors and logs.
            .map_err(|e| upstream(format!("request failed: {}", e.without_url())))?;

        self.requests_made.fetch_add(1, Ordering::Relaxed);
        // Parse rate-limit headers before consuming the response body
        self.record_quota(resp.headers());

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream(format!("API error: {} - {}", status, body)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| upstream(format!("body read failed: {}", e.without_url())))?;

        let (event, issues) =
            decode_event_json(&body, sport).map_err(|e| EngineError::MalformedPayload {
                event_id: event_id.to_string(),
                reason: e.to_string(),
            })?;

        for issue in &issues {
            warn!(
                event = event_id,
                book = %issue.book,
                market = %issue.market,
                reason = %issue.reason,
                "dropped outcome at decode"
            );
        }

        let quota = self.quota();
        debug!(
            sport = sport,
            event = event_id,
            books = event.books.len(),
            dropped = issues.len(),
            remaining = ?quota.remaining,
            "fetched event odds"
        );

        Ok(event)
    }
}

fn known(v: i64) -> Option<u32> {
    if v < 0 {
        None
    } else {
        u32::try_from(v).ok()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn fetcher() -> OddsFetcher {
        let cfg = OddsApiConfig {
            api_key: "k".to_string(),
            base_url: "https://api.example.com/v4/".to_string(),
            bookmakers: vec!["draftkings".to_string(), "fanduel".to_string()],
            ..OddsApiConfig::default()
        };
        OddsFetcher::new(&cfg).unwrap()
    }

    #[test]
    fn test_event_url_and_query() {
        let f = fetcher();
        assert_eq!(
            f.event_url("baseball_mlb", "evt1"),
            "https://api.example.com/v4/sports/baseball_mlb/events/evt1/odds"
        );
        let q = f.query(&["h2h".to_string(), "totals".to_string()]);
        assert!(q.contains(&("markets", "h2h,totals".to_string())));
        assert!(q.contains(&("oddsFormat", "american".to_string())));
        assert!(q.contains(&("bookmakers", "draftkings,fanduel".to_string())));
        assert!(q.contains(&("includeSids", "true".to_string())));
    }

    #[test]
    fn test_quota_headers_tracked() {
        let f = fetcher();
        assert_eq!(f.quota(), QuotaInfo { remaining: None, used: None });

        let mut h = HeaderMap::new();
        h.insert("x-requests-remaining", HeaderValue::from_static("4870"));
        h.insert("x-requests-used", HeaderValue::from_static("130"));
        f.record_quota(&h);
        assert_eq!(
            f.quota(),
            QuotaInfo {
                remaining: Some(4870),
                used: Some(130)
            }
        );
    }
}
