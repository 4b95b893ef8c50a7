//! Expected value against a consensus fair price.
//!
//! Two modes, chosen by the caller and labelled on the result:
//! - `NoVig`: top-N prices per side → averaged implied probability →
//!   margin removed proportionally → fair probability for the side.
//! - `AverageBaseline`: candidate decimal odds against the mean decimal
//!   odds of the same side, for when the other side is not quoted.

use crate::aggregate::AggregatedLine;
use crate::error::EngineError;
use crate::feed::Side;
use crate::odds;
use serde::Serialize;

/// Default number of books per side in the consensus.
pub const DEFAULT_CONSENSUS_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvMethod {
    NoVig,
    AverageBaseline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvResult {
    /// Fair probability of the candidate's side (0.0-1.0).
    pub fair_probability: f64,
    pub best_price: i32,
    pub best_book: String,
    /// Rounded to one decimal place.
    pub ev_percent: f64,
    pub method: EvMethod,
}

/// The price being valued and who offers it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub price: i32,
    pub book_id: String,
}

#[derive(Debug, Clone)]
pub struct Valuator {
    consensus_size: usize,
}

impl Default for Valuator {
    fn default() -> Self {
        Self::new(DEFAULT_CONSENSUS_SIZE)
    }
}

impl Valuator {
    pub fn new(consensus_size: usize) -> Self {
        Self {
            consensus_size: consensus_size.max(1),
        }
    }

    /// Two-sided no-vig EV. Needs `consensus_size` prices on each side.
    pub fn no_vig(
        &self,
        candidate: &Candidate,
        same_side: &[i32],
        other_side: &[i32],
    ) -> Result<EvResult, EngineError> {
        let n = self.consensus_size;
        if same_side.len() < n || other_side.len() < n {
            return Err(EngineError::InsufficientConsensus {
                needed: n,
                same_side: same_side.len(),
                other_side: other_side.len(),
            });
        }

        let same = mean_implied(&top_prices(same_side, n));
        let other = mean_implied(&top_prices(other_side, n));
        let fair = same / (same + other);
        let ev = (fair * (1.0 + odds::payout_multiplier(candidate.price)) - 1.0) * 100.0;

        Ok(EvResult {
            fair_probability: fair,
            best_price: candidate.price,
            best_book: candidate.book_id.clone(),
            ev_percent: odds::round1(ev),
            method: EvMethod::NoVig,
        })
    }

    /// Single-sided EV against the mean decimal odds of `references`.
    /// The candidate's own price may be among them.
    pub fn against_average(
        &self,
        candidate: &Candidate,
        references: &[i32],
    ) -> Result<EvResult, EngineError> {
        let avg = odds::average_decimal(references).ok_or(
            EngineError::InsufficientConsensus {
                needed: 1,
                same_side: 0,
                other_side: 0,
            },
        )?;
        let ev = (odds::american_to_decimal(candidate.price) / avg - 1.0) * 100.0;

        Ok(EvResult {
            fair_probability: 1.0 / avg,
            best_price: candidate.price,
            best_book: candidate.book_id.clone(),
            ev_percent: odds::round1(ev),
            method: EvMethod::AverageBaseline,
        })
    }

    /// Value the best price on `side` of an aggregated line using no-vig,
    /// falling back to the average baseline only when `allow_average` is set
    /// and the no-vig consensus is too thin.
    pub fn evaluate_line(
        &self,
        line: &AggregatedLine,
        side: Side,
        allow_average: bool,
    ) -> Result<EvResult, EngineError> {
        let best = line.best_by_side.get(&side).ok_or(EngineError::NoMatch {
            book: "*".to_string(),
            reason: format!("no book quotes the {} side", side),
        })?;
        let candidate = Candidate {
            price: best.price,
            book_id: best.book_id.clone(),
        };
        let same = line.prices(side);
        let other = line.prices(side.opposite());

        match self.no_vig(&candidate, &same, &other) {
            Err(EngineError::InsufficientConsensus { .. }) if allow_average => {
                self.against_average(&candidate, &same)
            }
            r => r,
        }
    }
}

/// The `n` most favorable prices (highest decimal odds first).
fn top_prices(prices: &[i32], n: usize) -> Vec<i32> {
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| {
        odds::american_to_decimal(*b).total_cmp(&odds::american_to_decimal(*a))
    });
    sorted.truncate(n);
    sorted
}

fn mean_implied(prices: &[i32]) -> f64 {
    prices.iter().map(|p| odds::implied_probability(*p)).sum::<f64>() / prices.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, LineQuery};
    use crate::feed::{BookQuote, EventOdds, Line, Market, Outcome};

    fn cand(price: i32) -> Candidate {
        Candidate {
            price,
            book_id: "candidate".to_string(),
        }
    }

    #[test]
    fn test_no_vig_consensus_scenario() {
        let v = Valuator::default();
        let r = v
            .no_vig(&cand(120), &[100, 105, 110], &[-130, -125, -120])
            .unwrap();
        // over ≈ 0.4880, under ≈ 0.5555 → fair over ≈ 0.4677
        assert!((r.fair_probability - 0.4677).abs() < 1e-3);
        assert_eq!(r.ev_percent, 2.9);
        assert_eq!(r.method, EvMethod::NoVig);
        assert_eq!(r.best_book, "candidate");

        let under = v
            .no_vig(&cand(-110), &[-130, -125, -120], &[100, 105, 110])
            .unwrap();
        assert_eq!(under.ev_percent, 1.6);
    }

    #[test]
    fn test_only_top_three_count() {
        let v = Valuator::default();
        let a = v
            .no_vig(&cand(120), &[100, 105, 110, -500], &[-130, -125, -120, -1000])
            .unwrap();
        let b = v
            .no_vig(&cand(120), &[110, 100, 105], &[-120, -130, -125])
            .unwrap();
        assert_eq!(a.ev_percent, b.ev_percent);
    }

    #[test]
    fn test_insufficient_consensus_on_either_side() {
        let v = Valuator::default();
        for (same, other) in [
            (vec![100, 105], vec![-130, -125, -120]),
            (vec![100, 105, 110], vec![-130]),
            (vec![], vec![]),
        ] {
            assert!(matches!(
                v.no_vig(&cand(120), &same, &other),
                Err(EngineError::InsufficientConsensus { needed: 3, .. })
            ));
        }
    }

    #[test]
    fn test_average_baseline() {
        let v = Valuator::default();
        let r = v.against_average(&cand(120), &[100, 105, 110]).unwrap();
        // 2.2 / 2.05 - 1 = 7.3%
        assert_eq!(r.ev_percent, 7.3);
        assert_eq!(r.method, EvMethod::AverageBaseline);
        assert!(v.against_average(&cand(120), &[]).is_err());
    }

    fn two_way(books: &[(&str, i32, i32)]) -> AggregatedLine {
        let ev = EventOdds {
            event_id: "e".to_string(),
            sport: "basketball_nba".to_string(),
            home_team: "A".to_string(),
            away_team: "B".to_string(),
            commence_time: None,
            books: books
                .iter()
                .map(|(id, over, under)| BookQuote {
                    book_id: id.to_string(),
                    last_updated: None,
                    markets: vec![Market {
                        key: "totals".to_string(),
                        outcomes: [(Side::Over, *over), (Side::Under, *under)]
                            .into_iter()
                            .map(|(side, price)| Outcome {
                                side,
                                price,
                                line: Line::new(221.5),
                                label: None,
                                selection_id: None,
                                deep_link: None,
                            })
                            .collect(),
                    }],
                })
                .collect(),
        };
        aggregate(
            &ev,
            &LineQuery {
                market_keys: vec!["totals".to_string()],
                subject: None,
                line: Line::new(221.5),
                side: Side::Over,
            },
        )
    }

    #[test]
    fn test_evaluate_line_labels_method() {
        let v = Valuator::default();
        let full = two_way(&[("a", 100, -130), ("b", 105, -125), ("c", 110, -120), ("d", 120, -150)]);
        let r = v.evaluate_line(&full, Side::Over, false).unwrap();
        assert_eq!(r.best_book, "d");
        assert_eq!(r.best_price, 120);
        assert_eq!(r.method, EvMethod::NoVig);

        let thin = two_way(&[("a", 100, -130), ("d", 120, -150)]);
        assert!(v.evaluate_line(&thin, Side::Over, false).is_err());
        let r = v.evaluate_line(&thin, Side::Over, true).unwrap();
        assert_eq!(r.method, EvMethod::AverageBaseline);
    }
}
