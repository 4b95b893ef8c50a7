//! Valuation / arbitrage pass over a batch of selections.
//!
//! One pass:
//! 1. Groups selections by event and unions the markets each needs
//! 2. Fetches every event concurrently (bounded), cache first
//! 3. Aggregates each selection's line and values the best price
//! 4. Scans the fetched lines for arbitrage
//!
//! A failed or timed-out event is recorded and left out; the rest of the
//! pass continues. Only a pass where no event resolved is an error.

use crate::aggregate::{
    aggregate, canonical_subject, enumerate_lines, AggregatedLine, LineIdentity, LineQuery,
};
use crate::arb::{ArbGrouper, ArbSettings, ArbitrageOpportunity, DEFAULT_REFERENCE_STAKE};
use crate::cache::CacheResolver;
use crate::config::{Config, EngineConfig};
use crate::error::EngineError;
use crate::feed::{EventOdds, Line, QuoteSource, Side};
use crate::matching::expand_market_keys;
use crate::valuation::{EvResult, Valuator};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One bet to value, as extracted from a betslip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub id: String,
    pub sport: String,
    pub event_id: String,
    /// Market key, or a comma-joined base+alternate union.
    pub market_key: String,
    #[serde(default)]
    pub player: Option<String>,
    #[serde(default)]
    pub line: Option<Line>,
    pub side: Side,
}

impl Selection {
    fn markets(&self) -> Vec<String> {
        expand_market_keys(std::slice::from_ref(&self.market_key))
    }

    fn query(&self) -> LineQuery {
        LineQuery {
            market_keys: self.markets(),
            subject: self.player.clone(),
            line: self.line,
            side: self.side,
        }
        .canonical()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventFailure {
    pub sport: String,
    pub event_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionResult {
    pub selection: Selection,
    /// `None` when the event did not resolve.
    pub line: Option<AggregatedLine>,
    pub ev: Option<EvResult>,
    /// Why `ev` is empty.
    pub unavailable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvPlay {
    pub selection_id: String,
    #[serde(flatten)]
    pub result: EvResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub expected_events: usize,
    pub resolved_events: usize,
    pub event_failures: Vec<EventFailure>,
    pub selections: Vec<SelectionResult>,
    /// Every line scanned for arbitrage.
    pub lines: Vec<AggregatedLine>,
    pub ev_plays: Vec<EvPlay>,
    pub opportunities: Vec<ArbitrageOpportunity>,
}

impl PassReport {
    /// Share of expected events that resolved (1.0 for an empty pass).
    pub fn completeness(&self) -> f64 {
        if self.expected_events == 0 {
            1.0
        } else {
            self.resolved_events as f64 / self.expected_events as f64
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    FetchComplete {
        event_id: String,
        books: usize,
        from_cache: bool,
    },
    FetchFailed {
        event_id: String,
        error: String,
    },
    OpportunityDetected(ArbitrageOpportunity),
    PassComplete {
        expected_events: usize,
        resolved_events: usize,
        ev_plays: usize,
        opportunities: usize,
    },
}

struct Fetched {
    event: EventOdds,
    from_cache: bool,
}

pub struct OddsEngine {
    source: Arc<dyn QuoteSource>,
    cache: Option<CacheResolver>,
    grouper: ArbGrouper,
    valuator: Valuator,
    config: EngineConfig,
    max_concurrent: usize,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl OddsEngine {
    pub fn new(source: Arc<dyn QuoteSource>, cache: Option<CacheResolver>, config: &Config) -> Self {
        let settings = ArbSettings {
            suspect_arb_pct: config.engine.suspect_arb_pct,
            reference_stake: Decimal::from_f64(config.engine.reference_stake)
                .unwrap_or(DEFAULT_REFERENCE_STAKE),
            derive_stake_weights: config.engine.derive_stake_weights,
        };
        Self {
            source,
            cache,
            grouper: ArbGrouper::new(
                settings,
                config.cache.memo_ttl(),
                config.cache.memo_max_entries,
            ),
            valuator: Valuator::new(config.engine.consensus_size),
            config: config.engine.clone(),
            max_concurrent: config.fetch.max_concurrent_fetches.max(1),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Fetch one event: cache first, upstream on a miss, cache the result.
    async fn fetch_event(
        &self,
        sport: &str,
        event_id: &str,
        markets: &[String],
    ) -> Result<Fetched, EngineError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(sport, event_id, markets).await {
                return Ok(Fetched {
                    event: hit.event,
                    from_cache: true,
                });
            }
        }
        let event = self.source.fetch_event(sport, event_id, markets).await?;
        if let Some(cache) = &self.cache {
            cache.store(sport, markets, &event).await;
        }
        Ok(Fetched {
            event,
            from_cache: false,
        })
    }

    /// Run one pass. Fetches still in flight after `timeout` are abandoned
    /// and recorded as failures for their event.
    pub async fn run_pass(
        &self,
        selections: &[Selection],
        timeout: Duration,
    ) -> Result<PassReport, EngineError> {
        let started_at = Utc::now();
        let deadline = Instant::now() + timeout;

        // (sport, event) → markets needed, in first-seen order
        let mut wanted: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for s in selections {
            let markets = wanted
                .entry((s.sport.clone(), s.event_id.clone()))
                .or_default();
            markets.extend(s.markets());
            if self.config.scan_all_lines {
                markets.extend(self.config.market_keys.iter().cloned());
            }
        }
        for markets in wanted.values_mut() {
            *markets = expand_market_keys(markets);
        }
        let expected_events = wanted.len();

        let results: Vec<((String, String), Vec<String>, Result<Fetched, EngineError>)> =
            stream::iter(wanted.into_iter().map(|((sport, event_id), markets)| async move {
                let result =
                    match tokio::time::timeout_at(deadline, self.fetch_event(&sport, &event_id, &markets))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(EngineError::UpstreamFetch {
                            event_id: event_id.clone(),
                            reason: "pass deadline exceeded".to_string(),
                        }),
                    };
                ((sport, event_id), markets, result)
            }))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut events: HashMap<(String, String), (EventOdds, Vec<String>)> = HashMap::new();
        let mut event_failures = Vec::new();
        for ((sport, event_id), markets, result) in results {
            match result {
                Ok(mut fetched) => {
                    // Cached copies keep every book; the allow-list only
                    // narrows what this pass prices.
                    fetched.event.retain_books(&self.config.allowed_books);
                    debug!(
                        event = %event_id,
                        books = fetched.event.books.len(),
                        from_cache = fetched.from_cache,
                        "event resolved"
                    );
                    self.emit(EngineEvent::FetchComplete {
                        event_id: event_id.clone(),
                        books: fetched.event.books.len(),
                        from_cache: fetched.from_cache,
                    });
                    events.insert((sport, event_id), (fetched.event, markets));
                }
                Err(e) => {
                    if e.is_event_scoped() {
                        warn!(sport = %sport, event = %event_id, error = %e, "event fetch failed");
                    } else {
                        error!(sport = %sport, event = %event_id, error = %e, "event fetch failed");
                    }
                    self.emit(EngineEvent::FetchFailed {
                        event_id: event_id.clone(),
                        error: e.to_string(),
                    });
                    event_failures.push(EventFailure {
                        sport,
                        event_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        event_failures.sort_by(|a, b| (&a.sport, &a.event_id).cmp(&(&b.sport, &b.event_id)));

        let resolved_events = events.len();
        if expected_events > 0 && resolved_events == 0 {
            return Err(EngineError::NoEventsResolved {
                failed: event_failures.len(),
            });
        }

        let mut selection_results = Vec::with_capacity(selections.len());
        let mut ev_plays = Vec::new();
        let mut lines: Vec<AggregatedLine> = Vec::new();
        let mut scanned: Vec<(String, LineIdentity)> = Vec::new();

        for s in selections {
            let Some((event, _)) = events.get(&(s.sport.clone(), s.event_id.clone())) else {
                selection_results.push(SelectionResult {
                    selection: s.clone(),
                    line: None,
                    ev: None,
                    unavailable: Some("event unavailable".to_string()),
                });
                continue;
            };

            let mut query = s.query();
            query.subject = query
                .subject
                .as_deref()
                .map(|subject| canonical_subject(event, &query.market_keys, subject));
            let agg = aggregate(event, &query);
            let (ev, unavailable) = match self.valuator.evaluate_line(
                &agg,
                s.side,
                self.config.ev_average_fallback,
            ) {
                Ok(ev) => (Some(ev), None),
                Err(e) => (None, Some(e.to_string())),
            };

            if let Some(ev) = &ev {
                if ev.ev_percent >= self.config.min_ev_threshold {
                    ev_plays.push(EvPlay {
                        selection_id: s.id.clone(),
                        result: ev.clone(),
                    });
                }
            }

            let tag = (s.event_id.clone(), query.identity());
            if !scanned.contains(&tag) {
                scanned.push(tag);
                lines.push(agg.clone());
            }
            selection_results.push(SelectionResult {
                selection: s.clone(),
                line: Some(agg),
                ev,
                unavailable,
            });
        }

        if self.config.scan_all_lines {
            let mut keys: Vec<&(String, String)> = events.keys().collect();
            keys.sort();
            for key in keys {
                let (event, markets) = &events[key];
                for query in enumerate_lines(event, markets) {
                    let tag = (event.event_id.clone(), query.identity());
                    if scanned.contains(&tag) {
                        continue;
                    }
                    let agg = aggregate(event, &query);
                    scanned.push(tag);
                    if agg.contributing_book_count > 0 {
                        lines.push(agg);
                    }
                }
            }
        }

        ev_plays.sort_by(|a, b| b.result.ev_percent.total_cmp(&a.result.ev_percent));
        let opportunities = self.grouper.detect(&lines);
        for opp in &opportunities {
            self.emit(EngineEvent::OpportunityDetected(opp.clone()));
        }

        info!(
            events = expected_events,
            resolved = resolved_events,
            failed = event_failures.len(),
            selections = selections.len(),
            lines = lines.len(),
            ev_plays = ev_plays.len(),
            opportunities = opportunities.len(),
            "pass complete"
        );
        self.emit(EngineEvent::PassComplete {
            expected_events,
            resolved_events,
            ev_plays: ev_plays.len(),
            opportunities: opportunities.len(),
        });

        Ok(PassReport {
            started_at,
            finished_at: Utc::now(),
            expected_events,
            resolved_events,
            event_failures,
            selections: selection_results,
            lines,
            ev_plays,
            opportunities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::feed::{BookQuote, Market, Outcome};
    use crate::valuation::EvMethod;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        events: HashMap<String, Result<EventOdds, EngineError>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeSource {
        fn new(events: Vec<Result<EventOdds, EngineError>>, ids: &[&str]) -> Self {
            Self {
                events: ids.iter().map(|s| s.to_string()).zip(events).collect(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl QuoteSource for FakeSource {
        async fn fetch_event(
            &self,
            _sport: &str,
            event_id: &str,
            _markets: &[String],
        ) -> Result<EventOdds, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.events.get(event_id) {
                Some(r) => r.clone(),
                None => Err(EngineError::UpstreamFetch {
                    event_id: event_id.to_string(),
                    reason: "404".to_string(),
                }),
            }
        }
    }

    fn outcome(side: Side, line: f64, price: i32) -> Outcome {
        Outcome {
            side,
            price,
            line: Line::new(line),
            label: None,
            selection_id: None,
            deep_link: None,
        }
    }

    /// Totals 8.5 with the given (book, over, under) prices.
    fn totals_event(id: &str, books: &[(&str, i32, i32)]) -> EventOdds {
        EventOdds {
            event_id: id.to_string(),
            sport: "baseball_mlb".to_string(),
            home_team: "H".to_string(),
            away_team: "A".to_string(),
            commence_time: None,
            books: books
                .iter()
                .map(|(b, over, under)| BookQuote {
                    book_id: b.to_string(),
                    last_updated: None,
                    markets: vec![Market {
                        key: "totals".to_string(),
                        outcomes: vec![
                            outcome(Side::Over, 8.5, *over),
                            outcome(Side::Under, 8.5, *under),
                        ],
                    }],
                })
                .collect(),
        }
    }

    fn over(event_id: &str) -> Selection {
        Selection {
            id: format!("sel-{}", event_id),
            sport: "baseball_mlb".to_string(),
            event_id: event_id.to_string(),
            market_key: "totals".to_string(),
            player: None,
            line: Line::new(8.5),
            side: Side::Over,
        }
    }

    fn engine(source: FakeSource, cfg: &Config) -> (Arc<FakeSource>, OddsEngine) {
        let source = Arc::new(source);
        let engine = OddsEngine::new(source.clone(), None, cfg);
        (source, engine)
    }

    #[tokio::test]
    async fn test_pass_values_and_finds_arbs() {
        let ev = totals_event(
            "e1",
            &[
                ("a", 100, -130),
                ("b", 105, -125),
                ("c", 110, -120),
                ("d", 120, -150),
                ("e", -180, 105),
            ],
        );
        let (_, engine) = engine(FakeSource::new(vec![Ok(ev)], &["e1"]), &Config::default());
        let report = engine
            .run_pass(&[over("e1")], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.completeness(), 1.0);
        let sel = &report.selections[0];
        let ev = sel.ev.as_ref().unwrap();
        assert_eq!(ev.best_book, "d");
        assert_eq!(ev.method, EvMethod::NoVig);
        assert_eq!(report.ev_plays.len(), 1);

        // d +120 over, e +105 under → 1/2.2 + 1/2.05 < 1
        assert_eq!(report.opportunities.len(), 1);
        let opp = &report.opportunities[0];
        assert_eq!(opp.key.over_odds, 120);
        assert_eq!(opp.key.under_odds, 105);
    }

    #[tokio::test]
    async fn test_failed_event_is_isolated() {
        let ok = totals_event("e1", &[("a", 100, -120)]);
        let broken = Err(EngineError::MalformedPayload {
            event_id: "e2".to_string(),
            reason: "bad json".to_string(),
        });
        let (_, engine) = engine(
            FakeSource::new(vec![Ok(ok), broken], &["e1", "e2"]),
            &Config::default(),
        );
        let report = engine
            .run_pass(&[over("e1"), over("e2")], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.expected_events, 2);
        assert_eq!(report.resolved_events, 1);
        assert_eq!(report.completeness(), 0.5);
        assert_eq!(report.event_failures.len(), 1);
        assert_eq!(report.event_failures[0].event_id, "e2");

        let e2 = report
            .selections
            .iter()
            .find(|r| r.selection.event_id == "e2")
            .unwrap();
        assert!(e2.line.is_none());
        // One book per side is too thin for a no-vig price.
        let e1 = &report.selections[0];
        assert!(e1.ev.is_none());
        assert!(e1.unavailable.as_deref().unwrap().contains("insufficient consensus"));
    }

    #[tokio::test]
    async fn test_all_events_failed_is_an_error() {
        let (_, engine) = engine(FakeSource::new(vec![], &[]), &Config::default());
        let err = engine
            .run_pass(&[over("e1"), over("e2")], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::NoEventsResolved { failed: 2 });

        let empty = engine.run_pass(&[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(empty.completeness(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_slow_fetch() {
        let ev = totals_event("e1", &[("a", 100, -120)]);
        let source = FakeSource::new(vec![Ok(ev)], &["e1"]).with_delay(Duration::from_secs(30));
        let (_, engine) = engine(source, &Config::default());
        let err = engine
            .run_pass(&[over("e1")], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::NoEventsResolved { failed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_are_bounded() {
        let ids = ["e1", "e2", "e3", "e4", "e5"];
        let events = ids
            .iter()
            .map(|id| Ok(totals_event(id, &[("a", 100, -120)])))
            .collect();
        let source = FakeSource::new(events, &ids).with_delay(Duration::from_millis(50));
        let mut cfg = Config::default();
        cfg.fetch.max_concurrent_fetches = 2;
        let (source, engine) = engine(source, &cfg);

        let selections: Vec<Selection> = ids.iter().map(|id| over(id)).collect();
        let report = engine
            .run_pass(&selections, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(report.resolved_events, 5);
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_second_pass_served_from_cache() {
        let ev = totals_event("e1", &[("a", 100, -120)]);
        let source = Arc::new(FakeSource::new(vec![Ok(ev)], &["e1"]));
        let cache = CacheResolver::new(Arc::new(MemoryStore::new()), Duration::from_secs(600));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine =
            OddsEngine::new(source.clone(), Some(cache), &Config::default()).with_events(tx);

        engine.run_pass(&[over("e1")], Duration::from_secs(5)).await.unwrap();
        engine.run_pass(&[over("e1")], Duration::from_secs(5)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let mut cached = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            if let EngineEvent::FetchComplete { from_cache, .. } = evt {
                cached.push(from_cache);
            }
        }
        assert_eq!(cached, vec![false, true]);
    }

    #[tokio::test]
    async fn test_allowed_books_and_ev_threshold() {
        let ev = totals_event(
            "e1",
            &[("a", 100, -130), ("b", 105, -125), ("c", 110, -120), ("d", 120, -150)],
        );
        let mut cfg = Config::default();
        cfg.engine.allowed_books = vec!["a".into(), "b".into(), "c".into()];
        cfg.engine.min_ev_threshold = 50.0;
        let (_, engine) = engine(FakeSource::new(vec![Ok(ev)], &["e1"]), &cfg);
        let report = engine
            .run_pass(&[over("e1")], Duration::from_secs(5))
            .await
            .unwrap();
        let sel = &report.selections[0];
        assert_eq!(sel.line.as_ref().unwrap().contributing_book_count, 3);
        assert_eq!(sel.ev.as_ref().unwrap().best_book, "c");
        assert!(report.ev_plays.is_empty());
    }

    #[tokio::test]
    async fn test_cache_keeps_books_outside_allow_list() {
        let ev = totals_event("e1", &[("a", 100, -120), ("d", 120, -150)]);
        let source = Arc::new(FakeSource::new(vec![Ok(ev)], &["e1"]));
        let cache = CacheResolver::new(Arc::new(MemoryStore::new()), Duration::from_secs(600));
        let mut cfg = Config::default();
        cfg.engine.allowed_books = vec!["A".into()];
        let engine = OddsEngine::new(source, Some(cache.clone()), &cfg);

        let report = engine
            .run_pass(&[over("e1")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.selections[0].line.as_ref().unwrap().contributing_book_count, 1);
        assert!(report.lines.iter().all(|l| l.per_book.iter().all(|b| b.book_id == "a")));

        let hit = cache
            .lookup("baseball_mlb", "e1", &["totals".to_string()])
            .await
            .unwrap();
        assert_eq!(hit.event.books.len(), 2);
    }

    #[tokio::test]
    async fn test_typed_name_variant_scans_once() {
        let prop = |label: &str, side, price| Outcome {
            label: Some(label.to_string()),
            ..outcome(side, 5.5, price)
        };
        let market = |outcomes| Market {
            key: "pitcher_strikeouts".to_string(),
            outcomes,
        };
        let ev = EventOdds {
            books: vec![
                BookQuote {
                    book_id: "x".to_string(),
                    last_updated: None,
                    markets: vec![market(vec![
                        prop("Dylan Cease", Side::Over, 110),
                        prop("Dylan Cease", Side::Under, -150),
                    ])],
                },
                BookQuote {
                    book_id: "y".to_string(),
                    last_updated: None,
                    markets: vec![market(vec![
                        prop("D. Cease", Side::Over, -150),
                        prop("D. Cease", Side::Under, 105),
                    ])],
                },
            ],
            ..totals_event("e1", &[])
        };
        let mut cfg = Config::default();
        cfg.engine.market_keys = vec!["pitcher_strikeouts".to_string()];
        let (_, engine) = engine(FakeSource::new(vec![Ok(ev)], &["e1"]), &cfg);

        let selection = Selection {
            market_key: "pitcher_strikeouts".to_string(),
            player: Some("D. Cease".to_string()),
            line: Line::new(5.5),
            ..over("e1")
        };
        let report = engine
            .run_pass(&[selection], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].subject.as_deref(), Some("Dylan Cease"));
        assert_eq!(report.lines[0].contributing_book_count, 2);
        // x +110 over, y +105 under
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(report.opportunities[0].key.subject.as_deref(), Some("Dylan Cease"));
    }
}
