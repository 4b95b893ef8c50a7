//! Two-sided arbitrage detection and grouping.
//!
//! A line is an arb when the best price on each side, possibly from
//! different books, satisfies `1/dec(over) + 1/dec(under) < 1`.
//!
//! Opportunities are identified by (event, market, subject, line,
//! over price, under price). Books are not part of the identity: every
//! book quoting the winning price on a side is folded into that side's
//! book list, so a tie shows up as one row with two books.
//!
//! For two-way game markets "over" is the Home side and "under" the Away
//! side.

use crate::aggregate::AggregatedLine;
use crate::cache::memo::TtlCache;
use crate::feed::{Line, Side};
use crate::odds;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reference stake for the anchored leg.
pub const DEFAULT_REFERENCE_STAKE: Decimal = Decimal::ONE_HUNDRED;

/// Arb percentages at or above this are flagged as suspect.
pub const DEFAULT_SUSPECT_ARB_PCT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArbKey {
    pub event_id: String,
    pub market_key: String,
    pub subject: Option<String>,
    pub line: Option<Line>,
    pub over_odds: i32,
    pub under_odds: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookRef {
    pub book_id: String,
    pub deep_link: Option<String>,
    pub selection_id: Option<String>,
}

/// Target share of total stake per side, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StakeWeights {
    pub over_pct: f64,
    pub under_pct: f64,
}

impl StakeWeights {
    /// Equal-payout weights: each side's share of the combined implied probability.
    pub fn from_odds(over: i32, under: i32) -> Self {
        let po = 1.0 / odds::american_to_decimal(over);
        let pu = 1.0 / odds::american_to_decimal(under);
        Self {
            over_pct: po / (po + pu) * 100.0,
            under_pct: pu / (po + pu) * 100.0,
        }
    }
}

/// Stakes in currency units, rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StakeSplit {
    pub over_stake: Decimal,
    pub under_stake: Decimal,
    pub total_stake: Decimal,
    pub guaranteed_profit: Decimal,
}

/// Anchor the heavier side at `reference_stake` and scale the other by
/// the weight ratio. Missing or unusable weights mean an even split.
pub fn stake_split(
    weights: Option<StakeWeights>,
    arb_percentage: f64,
    reference_stake: Decimal,
) -> StakeSplit {
    let even = Decimal::from(50);
    let (over_pct, under_pct) = match weights
        .map(|w| (Decimal::from_f64(w.over_pct), Decimal::from_f64(w.under_pct)))
    {
        Some((Some(o), Some(u))) if o > Decimal::ZERO && u > Decimal::ZERO => (o, u),
        _ => (even, even),
    };
    let (over_stake, under_stake) = if over_pct >= under_pct {
        (reference_stake, reference_stake * under_pct / over_pct)
    } else {
        (reference_stake * over_pct / under_pct, reference_stake)
    };
    let total_stake = over_stake + under_stake;
    let arb = Decimal::from_f64(arb_percentage).unwrap_or(Decimal::ZERO);
    StakeSplit {
        over_stake: over_stake.round_dp(2),
        under_stake: under_stake.round_dp(2),
        total_stake: total_stake.round_dp(2),
        guaranteed_profit: (arb / Decimal::ONE_HUNDRED * total_stake).round_dp(2),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    #[serde(flatten)]
    pub key: ArbKey,
    pub over_books: Vec<BookRef>,
    pub under_books: Vec<BookRef>,
    /// `1/dec(over) + 1/dec(under)`.
    pub implied_sum: f64,
    /// `(1 - implied_sum) * 100`.
    pub arb_percentage: f64,
    pub stake_split: StakeSplit,
    /// Implausibly large edge; usually a stale or bad quote.
    pub suspect: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArbSettings {
    pub suspect_arb_pct: f64,
    pub reference_stake: Decimal,
    /// Size legs for equal payout from the quoted prices when no
    /// upstream weights are supplied. Off means an even split.
    pub derive_stake_weights: bool,
}

impl Default for ArbSettings {
    fn default() -> Self {
        Self {
            suspect_arb_pct: DEFAULT_SUSPECT_ARB_PCT,
            reference_stake: DEFAULT_REFERENCE_STAKE,
            derive_stake_weights: true,
        }
    }
}

impl ArbSettings {
    fn weights_for(&self, over: i32, under: i32) -> Option<StakeWeights> {
        self.derive_stake_weights
            .then(|| StakeWeights::from_odds(over, under))
    }
}

fn book_refs(line: &AggregatedLine, side: Side, price: i32) -> Vec<BookRef> {
    let mut refs: Vec<BookRef> = line
        .books_at(side, price)
        .into_iter()
        .filter_map(|b| {
            b.sides.get(&side).map(|q| BookRef {
                book_id: b.book_id.clone(),
                deep_link: q.deep_link.clone(),
                selection_id: q.selection_id.clone(),
            })
        })
        .collect();
    normalize_books(&mut refs);
    refs
}

fn normalize_books(refs: &mut Vec<BookRef>) {
    refs.sort_by(|a, b| a.book_id.cmp(&b.book_id));
    refs.dedup_by(|a, b| a.book_id == b.book_id);
}

/// The arb on one aggregated line, if there is one.
///
/// `weights` are upstream stake-allocation percentages. When `None` the
/// settings decide: derived from the prices, or an even split.
pub fn detect_line(
    line: &AggregatedLine,
    settings: &ArbSettings,
    weights: Option<StakeWeights>,
) -> Option<ArbitrageOpportunity> {
    let over_side = line.primary_side;
    let under_side = over_side.opposite();
    let over = line.best_by_side.get(&over_side)?;
    let under = line.best_by_side.get(&under_side)?;

    let implied_sum =
        1.0 / odds::american_to_decimal(over.price) + 1.0 / odds::american_to_decimal(under.price);
    if implied_sum >= 1.0 {
        return None;
    }
    let arb_percentage = (1.0 - implied_sum) * 100.0;

    Some(ArbitrageOpportunity {
        key: ArbKey {
            event_id: line.event_id.clone(),
            market_key: line.market_key.clone(),
            subject: line.subject.clone(),
            line: line.line,
            over_odds: over.price,
            under_odds: under.price,
        },
        over_books: book_refs(line, over_side, over.price),
        under_books: book_refs(line, under_side, under.price),
        implied_sum,
        arb_percentage,
        stake_split: stake_split(
            weights.or_else(|| settings.weights_for(over.price, under.price)),
            arb_percentage,
            settings.reference_stake,
        ),
        suspect: arb_percentage >= settings.suspect_arb_pct,
        detected_at: line.generated_at,
    })
}

/// Fold opportunities sharing a key into one, merging book lists.
/// Output is ordered by arb percentage, best first, then by key.
pub fn group(opportunities: Vec<ArbitrageOpportunity>) -> Vec<ArbitrageOpportunity> {
    let mut by_key: BTreeMap<ArbKey, ArbitrageOpportunity> = BTreeMap::new();
    for opp in opportunities {
        match by_key.get_mut(&opp.key) {
            Some(existing) => {
                existing.over_books.extend(opp.over_books);
                existing.under_books.extend(opp.under_books);
                normalize_books(&mut existing.over_books);
                normalize_books(&mut existing.under_books);
                existing.detected_at = existing.detected_at.min(opp.detected_at);
            }
            None => {
                by_key.insert(opp.key.clone(), opp);
            }
        }
    }
    let mut out: Vec<ArbitrageOpportunity> = by_key.into_values().collect();
    out.sort_by(|a, b| {
        b.arb_percentage
            .total_cmp(&a.arb_percentage)
            .then_with(|| a.key.cmp(&b.key))
    });
    out
}

/// Detect and group across many aggregated lines.
pub fn detect(lines: &[AggregatedLine], settings: &ArbSettings) -> Vec<ArbitrageOpportunity> {
    group(lines.iter().filter_map(|l| detect_line(l, settings, None)).collect())
}

/// Detector with an injected memo keyed by the structural content of its
/// input, so a repeated poll with unchanged prices skips the work.
pub struct ArbGrouper {
    settings: ArbSettings,
    memo: TtlCache<String, Vec<ArbitrageOpportunity>>,
}

impl ArbGrouper {
    pub fn new(settings: ArbSettings, memo_ttl: Duration, memo_max_entries: usize) -> Self {
        Self {
            settings,
            memo: TtlCache::new(memo_ttl, memo_max_entries),
        }
    }

    pub fn settings(&self) -> &ArbSettings {
        &self.settings
    }

    pub fn detect(&self, lines: &[AggregatedLine]) -> Vec<ArbitrageOpportunity> {
        let hash = content_hash(lines);
        if let Some(hit) = self.memo.get(&hash) {
            debug!(lines = lines.len(), opportunities = hit.len(), "arb memo hit");
            return hit;
        }

        let opps = detect(lines, &self.settings);
        for opp in &opps {
            if opp.suspect {
                warn!(
                    event = %opp.key.event_id,
                    market = %opp.key.market_key,
                    arb_pct = format!("{:.2}%", opp.arb_percentage),
                    over = opp.key.over_odds,
                    under = opp.key.under_odds,
                    "suspect arb: check for stale quotes"
                );
            } else {
                info!(
                    event = %opp.key.event_id,
                    market = %opp.key.market_key,
                    subject = ?opp.key.subject,
                    arb_pct = format!("{:.2}%", opp.arb_percentage),
                    over_books = opp.over_books.len(),
                    under_books = opp.under_books.len(),
                    "ARB"
                );
            }
        }
        self.memo.insert(hash, opps.clone());
        opps
    }
}

/// SHA-256 over everything that affects detection. Timestamps are left
/// out so re-aggregating the same prices hashes the same.
fn content_hash(lines: &[AggregatedLine]) -> String {
    let mut h = Sha256::new();
    for l in lines {
        h.update(l.event_id.as_bytes());
        h.update([0u8]);
        h.update(l.market_key.as_bytes());
        h.update([0u8]);
        h.update(l.subject.as_deref().unwrap_or("").as_bytes());
        h.update([0u8]);
        h.update(l.line.map(|v| v.value().to_bits()).unwrap_or(u64::MAX).to_le_bytes());
        h.update(l.primary_side.to_string().as_bytes());
        for b in &l.per_book {
            h.update(b.book_id.as_bytes());
            for (side, q) in &b.sides {
                h.update(side.to_string().as_bytes());
                h.update(q.price.to_le_bytes());
                h.update(q.deep_link.as_deref().unwrap_or("").as_bytes());
                h.update(q.selection_id.as_deref().unwrap_or("").as_bytes());
            }
            h.update([1u8]);
        }
        h.update([2u8]);
    }
    h.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}
