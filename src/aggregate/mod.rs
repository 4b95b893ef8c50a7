//! Per-line aggregation across books.
//!
//! For one (event, market, subject, line) every book is asked the same
//! question on both sides of the bet. The result carries:
//! 1. Best price per side, with the book that offers it
//! 2. Average price per side (mean taken in decimal space)
//! 3. Per-book detail, in book arrival order
//! 4. Which books contributed and why the others didn't
//!
//! An `AggregatedLine` is rebuilt from scratch on every poll.

use crate::feed::{base_market, EventOdds, Line, Side};
use crate::matching::names::{self, normalize};
use crate::matching::{expand_market_keys, match_label, match_outcome, MatchFailure, MatchRequest};
use crate::odds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Base market, normalized subject, line and side.
pub type LineIdentity = (String, Option<String>, Option<Line>, Side);

/// What to aggregate: a subject at a line, priced from `side`'s perspective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LineQuery {
    /// Market keys pooled for the search (base plus alternate, typically).
    pub market_keys: Vec<String>,
    /// Player for props; `None` for game markets.
    pub subject: Option<String>,
    /// Line on `side`. The opposite side is looked up at the counterpart line.
    pub line: Option<Line>,
    pub side: Side,
}

impl LineQuery {
    /// The same bet keyed from the Over/Home perspective, so both sides of
    /// a selection land on one aggregate.
    pub fn canonical(&self) -> LineQuery {
        if matches!(self.side, Side::Over | Side::Home) {
            return self.clone();
        }
        LineQuery {
            market_keys: self.market_keys.clone(),
            subject: self.subject.clone(),
            line: self.side.counterpart_line(self.line),
            side: self.side.opposite(),
        }
    }

    /// Base market key of the first requested market.
    pub fn base_market(&self) -> String {
        expand_market_keys(&self.market_keys)
            .first()
            .map(|k| base_market(k).to_string())
            .unwrap_or_default()
    }

    /// What makes two queries the same bet: base market, normalized
    /// subject, line and side. Pooled source keys don't count.
    pub fn identity(&self) -> LineIdentity {
        (
            self.base_market(),
            self.subject.as_deref().map(normalize),
            self.line,
            self.side,
        )
    }

    fn sides(&self) -> [(Side, Option<Line>); 2] {
        [
            (self.side, self.line),
            (self.side.opposite(), self.side.counterpart_line(self.line)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPrice {
    pub price: i32,
    pub book_id: String,
    pub deep_link: Option<String>,
    pub selection_id: Option<String>,
}

/// One book's matched price on one side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideQuote {
    pub price: i32,
    pub line: Option<Line>,
    pub market_key: String,
    pub deep_link: Option<String>,
    pub selection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookEntry {
    pub book_id: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub sides: BTreeMap<Side, SideQuote>,
}

/// A book that had nothing for one side, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookMiss {
    pub book_id: String,
    pub side: Side,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedLine {
    pub event_id: String,
    /// Base market key (alternate suffix folded away).
    pub market_key: String,
    pub source_markets: Vec<String>,
    pub subject: Option<String>,
    /// Line from the perspective of `primary_side`.
    pub line: Option<Line>,
    pub primary_side: Side,
    /// Sides with no match are absent, not zeroed.
    pub best_by_side: BTreeMap<Side, BestPrice>,
    pub average_by_side: BTreeMap<Side, i32>,
    pub per_book: Vec<BookEntry>,
    pub contributing_book_count: usize,
    pub book_misses: Vec<BookMiss>,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedLine {
    /// All matched prices on `side`, in book order.
    pub fn prices(&self, side: Side) -> Vec<i32> {
        self.per_book
            .iter()
            .filter_map(|b| b.sides.get(&side).map(|q| q.price))
            .collect()
    }

    /// Every book quoting exactly `price` on `side`.
    pub fn books_at(&self, side: Side, price: i32) -> Vec<&BookEntry> {
        self.per_book
            .iter()
            .filter(|b| b.sides.get(&side).map(|q| q.price) == Some(price))
            .collect()
    }

    /// Best price across both sides. `None` when neither side matched.
    pub fn best_overall(&self) -> Option<(Side, &BestPrice)> {
        self.best_by_side
            .iter()
            .fold(None, |acc: Option<(Side, &BestPrice)>, (side, best)| match acc {
                Some((_, cur))
                    if odds::american_to_decimal(cur.price)
                        >= odds::american_to_decimal(best.price) =>
                {
                    acc
                }
                _ => Some((*side, best)),
            })
    }

    /// Line carried by `side` (spreads flip sign on the opposite side).
    pub fn line_for(&self, side: Side) -> Option<Line> {
        if side == self.primary_side {
            self.line
        } else {
            self.primary_side.counterpart_line(self.line)
        }
    }

    /// Display form: Home/Away folded onto Over/Under.
    pub fn display_best(&self) -> BTreeMap<Side, &BestPrice> {
        self.best_by_side
            .iter()
            .map(|(s, b)| (s.as_over_under(), b))
            .collect()
    }
}

/// Aggregate every book's quote for `query` in `event`.
///
/// Once one side of a book matches a labelled outcome, the other side is
/// read off that same label, so a book never pairs two players.
pub fn aggregate(event: &EventOdds, query: &LineQuery) -> AggregatedLine {
    let market_keys = expand_market_keys(&query.market_keys);
    let market_key = query.base_market();

    let mut per_book = Vec::new();
    let mut book_misses = Vec::new();
    let mut best_by_side: BTreeMap<Side, BestPrice> = BTreeMap::new();

    for book in &event.books {
        let mut sides = BTreeMap::new();
        let mut bound: Option<String> = None;
        for (side, line) in query.sides() {
            let req = MatchRequest {
                target_player: query.subject.clone(),
                required_line: line,
                required_side: side,
                market_keys: market_keys.clone(),
            };
            let matched = match &bound {
                Some(label) => match_label(&req, book, label),
                None => match_outcome(&req, book),
            };
            match matched {
                Ok(hit) => {
                    let o = hit.outcome;
                    if bound.is_none() {
                        bound = o.label.clone();
                    }
                    let better = match best_by_side.get(&side) {
                        // Ties keep the first book.
                        Some(cur) => {
                            odds::american_to_decimal(o.price)
                                > odds::american_to_decimal(cur.price)
                        }
                        None => true,
                    };
                    if better {
                        best_by_side.insert(
                            side,
                            BestPrice {
                                price: o.price,
                                book_id: book.book_id.clone(),
                                deep_link: o.deep_link.clone(),
                                selection_id: o.selection_id.clone(),
                            },
                        );
                    }
                    sides.insert(
                        side,
                        SideQuote {
                            price: o.price,
                            line: o.line,
                            market_key: hit.market_key.to_string(),
                            deep_link: o.deep_link.clone(),
                            selection_id: o.selection_id.clone(),
                        },
                    );
                }
                Err(MatchFailure::MarketMissing) if side != query.side => {
                    // Already reported for the first side.
                }
                Err(failure) => book_misses.push(BookMiss {
                    book_id: book.book_id.clone(),
                    side,
                    reason: failure.to_string(),
                }),
            }
        }

        if !sides.is_empty() {
            per_book.push(BookEntry {
                book_id: book.book_id.clone(),
                last_updated: book.last_updated,
                sides,
            });
        }
    }

    let mut average_by_side = BTreeMap::new();
    for side in best_by_side.keys() {
        let prices: Vec<i32> = per_book
            .iter()
            .filter_map(|b| b.sides.get(side).map(|q| q.price))
            .collect();
        if let Some(avg) = odds::average_american(&prices) {
            average_by_side.insert(*side, avg);
        }
    }

    AggregatedLine {
        event_id: event.event_id.clone(),
        market_key,
        source_markets: market_keys,
        subject: query.subject.clone(),
        line: query.line,
        primary_side: query.side,
        best_by_side,
        average_by_side,
        contributing_book_count: per_book.len(),
        per_book,
        book_misses,
        generated_at: Utc::now(),
    }
}

/// Labels under `base` grouped so each group is one subject. A label
/// joins the first group holding a member it resolves against; groups
/// keep first-seen order.
fn subject_groups(event: &EventOdds, base: &str) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let labels = event
        .books
        .iter()
        .flat_map(|b| b.markets.iter())
        .filter(|m| base_market(&m.key) == base)
        .flat_map(|m| m.outcomes.iter())
        .filter_map(|o| o.label.as_deref());
    for label in labels {
        if groups.iter().flatten().any(|m| m == label) {
            continue;
        }
        match groups
            .iter_mut()
            .find(|g| g.iter().any(|m| subject_score(m, label) >= names::MIN_SCORE))
        {
            Some(g) => g.push(label.to_string()),
            None => groups.push(vec![label.to_string()]),
        }
    }
    groups
}

fn subject_score(a: &str, b: &str) -> f64 {
    names::score(a, b).max(names::score(b, a))
}

/// The group's display name: longest normalized form, then the
/// alphabetically first.
fn canonical_of(group: &[String]) -> Option<&String> {
    group.iter().max_by(|a, b| {
        let (na, nb) = (normalize(a), normalize(b));
        na.len()
            .cmp(&nb.len())
            .then_with(|| nb.cmp(&na))
            .then_with(|| b.cmp(a))
    })
}

/// The name `event` files `subject` under for the markets in
/// `market_keys`, so "D. Cease" and "Dylan Cease" key the same line.
/// Unknown subjects come back unchanged.
pub fn canonical_subject(event: &EventOdds, market_keys: &[String], subject: &str) -> String {
    let base = expand_market_keys(market_keys)
        .first()
        .map(|k| base_market(k).to_string())
        .unwrap_or_default();
    subject_groups(event, &base)
        .iter()
        .map(|g| {
            let best = g.iter().map(|m| subject_score(subject, m)).fold(0.0, f64::max);
            (best, g)
        })
        .filter(|(best, _)| *best >= names::MIN_SCORE)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .and_then(|(_, g)| canonical_of(g))
        .cloned()
        .unwrap_or_else(|| subject.to_string())
}

/// Every distinct (base market, subject, line) present in `event` for the
/// given market keys, keyed from the Over/Home side. Used to scan a whole
/// event for arbitrage rather than just the requested selections.
///
/// Label variants of one player collapse onto one canonical subject.
pub fn enumerate_lines(event: &EventOdds, market_keys: &[String]) -> Vec<LineQuery> {
    let keys = expand_market_keys(market_keys);

    // base → pooled source keys, in request order
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for k in &keys {
        groups
            .entry(base_market(k).to_string())
            .or_default()
            .push(k.clone());
    }

    let mut seen: BTreeSet<(String, Option<String>, Option<Line>, Side)> = BTreeSet::new();
    let mut out = Vec::new();
    for (base, sources) in &groups {
        let subjects = subject_groups(event, base);
        let mut canonical: HashMap<&str, String> = HashMap::new();
        for g in &subjects {
            if let Some(c) = canonical_of(g) {
                for m in g {
                    canonical.insert(m.as_str(), c.clone());
                }
            }
        }
        for book in &event.books {
            for market in book.markets.iter().filter(|m| sources.contains(&m.key)) {
                for o in &market.outcomes {
                    let (side, line) = match o.side {
                        Side::Over | Side::Home => (o.side, o.line),
                        Side::Under | Side::Away => {
                            (o.side.opposite(), o.side.counterpart_line(o.line))
                        }
                    };
                    let subject = o
                        .label
                        .as_deref()
                        .map(|l| canonical.get(l).cloned().unwrap_or_else(|| l.to_string()));
                    if seen.insert((base.clone(), subject.clone(), line, side)) {
                        out.push(LineQuery {
                            market_keys: sources.clone(),
                            subject,
                            line,
                            side,
                        });
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{BookQuote, Market, Outcome};

    fn outcome(label: Option<&str>, side: Side, line: Option<f64>, price: i32) -> Outcome {
        Outcome {
            side,
            price,
            line: line.and_then(Line::new),
            label: label.map(|s| s.to_string()),
            selection_id: Some(format!("{}-{}", side, price)),
            deep_link: None,
        }
    }

    fn book(id: &str, key: &str, outcomes: Vec<Outcome>) -> BookQuote {
        BookQuote {
            book_id: id.to_string(),
            last_updated: None,
            markets: vec![Market {
                key: key.to_string(),
                outcomes,
            }],
        }
    }

    fn event(books: Vec<BookQuote>) -> EventOdds {
        EventOdds {
            event_id: "evt1".to_string(),
            sport: "baseball_mlb".to_string(),
            home_team: "Chicago White Sox".to_string(),
            away_team: "Detroit Tigers".to_string(),
            commence_time: None,
            books,
        }
    }

    fn cease(line: f64) -> LineQuery {
        LineQuery {
            market_keys: vec![
                "pitcher_strikeouts".to_string(),
                "pitcher_strikeouts_alternate".to_string(),
            ],
            subject: Some("Dylan Cease".to_string()),
            line: Line::new(line),
            side: Side::Over,
        }
    }

    #[test]
    fn test_strict_line_excludes_near_line_book() {
        let ev = event(vec![
            book(
                "book_a",
                "pitcher_strikeouts_alternate",
                vec![
                    outcome(Some("Dylan Cease"), Side::Over, Some(3.5), -1000),
                    outcome(Some("Dylan Cease"), Side::Over, Some(4.5), -380),
                ],
            ),
            book(
                "book_b",
                "pitcher_strikeouts",
                vec![outcome(Some("Dylan Cease"), Side::Over, Some(4.5), -400)],
            ),
        ]);
        let agg = aggregate(&ev, &cease(3.5));
        assert_eq!(agg.market_key, "pitcher_strikeouts");
        assert_eq!(agg.contributing_book_count, 1);
        let best = &agg.best_by_side[&Side::Over];
        assert_eq!(best.price, -1000);
        assert_eq!(best.book_id, "book_a");
        // No unders anywhere: side omitted.
        assert!(!agg.best_by_side.contains_key(&Side::Under));
        assert!(!agg.average_by_side.contains_key(&Side::Under));
        assert!(agg
            .book_misses
            .iter()
            .any(|m| m.book_id == "book_b" && m.side == Side::Over));
    }

    #[test]
    fn test_best_average_and_ties() {
        let total = |id: &str, over: i32, under: i32| {
            book(
                id,
                "totals",
                vec![
                    outcome(None, Side::Over, Some(8.5), over),
                    outcome(None, Side::Under, Some(8.5), under),
                ],
            )
        };
        let ev = event(vec![
            total("x", 110, -130),
            total("y", 100, 105),
            total("z", 110, -200),
        ]);
        let q = LineQuery {
            market_keys: vec!["totals".to_string()],
            subject: None,
            line: Line::new(8.5),
            side: Side::Over,
        };
        let agg = aggregate(&ev, &q);
        assert_eq!(agg.contributing_book_count, 3);
        assert_eq!(agg.best_by_side[&Side::Over].book_id, "x");
        assert_eq!(agg.best_by_side[&Side::Under].price, 105);
        assert_eq!(agg.books_at(Side::Over, 110).len(), 2);
        // (2.1 + 2.0 + 2.1) / 3 = 2.0667 → +107
        assert_eq!(agg.average_by_side[&Side::Over], 107);
        assert_eq!(agg.prices(Side::Under), vec![-130, 105, -200]);

        let (side, best) = agg.best_overall().unwrap();
        assert_eq!(side, Side::Over);
        assert_eq!(best.price, 110);

        let mut ev_y = ev.clone();
        ev_y.retain_books(&["Y".to_string()]);
        let only_y = aggregate(&ev_y, &q);
        assert_eq!(only_y.contributing_book_count, 1);
        assert_eq!(only_y.per_book[0].book_id, "y");
    }

    #[test]
    fn test_spread_sides_use_counterpart_line() {
        let ev = event(vec![book(
            "x",
            "spreads",
            vec![
                outcome(None, Side::Home, Some(-1.5), 140),
                outcome(None, Side::Away, Some(1.5), -165),
            ],
        )]);
        let q = LineQuery {
            market_keys: vec!["spreads".to_string()],
            subject: None,
            line: Line::new(1.5),
            side: Side::Away,
        }
        .canonical();
        assert_eq!(q.side, Side::Home);
        assert_eq!(q.line, Line::new(-1.5));

        let agg = aggregate(&ev, &q);
        assert_eq!(agg.best_by_side[&Side::Home].price, 140);
        assert_eq!(agg.best_by_side[&Side::Away].price, -165);
        assert_eq!(agg.line_for(Side::Away), Line::new(1.5));
        assert!(agg.display_best().contains_key(&Side::Over));
    }

    #[test]
    fn test_best_overall_empty() {
        let agg = aggregate(&event(vec![]), &cease(3.5));
        assert!(agg.best_overall().is_none());
        assert_eq!(agg.contributing_book_count, 0);
    }

    #[test]
    fn test_label_variants_collapse_to_one_line() {
        let ev = event(vec![
            book(
                "x",
                "pitcher_strikeouts",
                vec![
                    outcome(Some("Dylan Cease"), Side::Over, Some(5.5), 110),
                    outcome(Some("Dylan Cease"), Side::Under, Some(5.5), -150),
                ],
            ),
            book(
                "y",
                "pitcher_strikeouts",
                vec![
                    outcome(Some("D. Cease"), Side::Over, Some(5.5), -150),
                    outcome(Some("D. Cease"), Side::Under, Some(5.5), 105),
                ],
            ),
        ]);
        let keys = vec!["pitcher_strikeouts".to_string()];
        let lines = enumerate_lines(&ev, &keys);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].subject.as_deref(), Some("Dylan Cease"));

        let agg = aggregate(&ev, &lines[0]);
        assert_eq!(agg.contributing_book_count, 2);
        assert_eq!(agg.best_by_side[&Side::Over].book_id, "x");
        assert_eq!(agg.best_by_side[&Side::Under].book_id, "y");

        assert_eq!(canonical_subject(&ev, &keys, "D. Cease"), "Dylan Cease");
        assert_eq!(canonical_subject(&ev, &keys, "Shohei Ohtani"), "Shohei Ohtani");

        let typed = LineQuery {
            subject: Some("DYLAN CEASE".to_string()),
            ..lines[0].clone()
        };
        assert_eq!(typed.identity(), lines[0].identity());
    }

    #[test]
    fn test_book_sides_bound_to_one_label() {
        let ev = event(vec![book(
            "b",
            "pitcher_strikeouts",
            vec![
                outcome(Some("Dylan Cease Jr."), Side::Over, Some(5.5), 120),
                outcome(Some("Dylan Cease"), Side::Under, Some(5.5), -140),
            ],
        )]);
        let agg = aggregate(&ev, &cease(5.5));
        assert_eq!(agg.contributing_book_count, 1);
        let sides = &agg.per_book[0].sides;
        assert_eq!(sides[&Side::Over].price, 120);
        // The -140 belongs to a different player than the matched Over.
        assert!(!sides.contains_key(&Side::Under));
        assert!(!agg.best_by_side.contains_key(&Side::Under));
        assert!(agg
            .book_misses
            .iter()
            .any(|m| m.book_id == "b" && m.side == Side::Under));
    }

    #[test]
    fn test_enumerate_lines() {
        let ev = event(vec![
            book(
                "x",
                "pitcher_strikeouts",
                vec![
                    outcome(Some("Dylan Cease"), Side::Over, Some(5.5), 100),
                    outcome(Some("Dylan Cease"), Side::Under, Some(5.5), -120),
                ],
            ),
            book(
                "y",
                "pitcher_strikeouts_alternate",
                vec![outcome(Some("Dylan Cease"), Side::Over, Some(3.5), -900)],
            ),
            book(
                "z",
                "spreads",
                vec![
                    outcome(None, Side::Home, Some(-1.5), 140),
                    outcome(None, Side::Away, Some(1.5), -165),
                ],
            ),
        ]);
        let keys = vec![
            "pitcher_strikeouts,pitcher_strikeouts_alternate".to_string(),
            "spreads".to_string(),
        ];
        let lines = enumerate_lines(&ev, &keys);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|q| matches!(q.side, Side::Over | Side::Home)));
        let spread = lines
            .iter()
            .find(|q| q.market_keys == vec!["spreads".to_string()])
            .unwrap();
        assert_eq!(spread.line, Line::new(-1.5));
        let ks: Vec<&LineQuery> = lines.iter().filter(|q| q.subject.is_some()).collect();
        assert_eq!(ks.len(), 2);
        assert_eq!(ks[0].market_keys.len(), 2);
    }
}
