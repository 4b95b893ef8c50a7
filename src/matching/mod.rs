//! Outcome matching: find the one outcome in a book that answers a
//! (player, line, side) request.
//!
//! Lines are matched exactly. A book that only offers 4.5 when 3.5 was
//! asked for is reported as `LineNotOffered` and left out of the
//! aggregate; its 4.5 price is never substituted.

pub mod names;

use crate::feed::{BookQuote, Line, Outcome, Side};
use std::fmt;

/// The question asked of every book for one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRequest {
    /// `None` for game-level markets (totals, spreads, moneyline).
    pub target_player: Option<String>,
    /// `None` only for moneyline markets.
    pub required_line: Option<Line>,
    pub required_side: Side,
    /// Market keys to pool, e.g. `["batter_hits", "batter_hits_alternate"]`.
    /// Comma-joined entries are split.
    pub market_keys: Vec<String>,
}

impl MatchRequest {
    /// Market keys with comma-joined unions expanded, order kept, duplicates removed.
    pub fn expanded_market_keys(&self) -> Vec<String> {
        expand_market_keys(&self.market_keys)
    }
}

pub fn expand_market_keys(keys: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for k in keys.iter().flat_map(|k| k.split(',')) {
        let k = k.trim();
        if !k.is_empty() && !out.iter().any(|o| o == k) {
            out.push(k.to_string());
        }
    }
    out
}

/// Why a book contributed nothing for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchFailure {
    /// None of the requested markets are present in the book.
    MarketMissing,
    /// No label scored at or above the name threshold.
    PlayerNotFound,
    /// The player (or game market) exists but not at the requested
    /// side and line. `available` lists the lines that side does carry.
    LineNotOffered { available: Vec<Line> },
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchFailure::MarketMissing => write!(f, "market missing"),
            MatchFailure::PlayerNotFound => write!(f, "player not found"),
            MatchFailure::LineNotOffered { available } => {
                let lines: Vec<String> = available.iter().map(|l| l.to_string()).collect();
                write!(f, "line not offered (available: [{}])", lines.join(", "))
            }
        }
    }
}

/// A matched outcome plus where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedOutcome<'a> {
    pub outcome: &'a Outcome,
    pub market_key: &'a str,
    /// Name score of the matched label; `None` for game-level markets.
    pub player_score: Option<f64>,
}

/// Outcomes from every requested market key, or `MarketMissing` when the
/// book carries none of them.
fn pooled<'a>(
    req: &MatchRequest,
    book: &'a BookQuote,
) -> Result<Vec<(&'a str, &'a Outcome)>, MatchFailure> {
    let keys = req.expanded_market_keys();
    if !keys.iter().any(|k| book.market(k).is_some()) {
        return Err(MatchFailure::MarketMissing);
    }
    Ok(keys
        .iter()
        .filter_map(|k| book.market(k))
        .flat_map(|m| m.outcomes.iter().map(move |o| (m.key.as_str(), o)))
        .collect())
}

/// Select the outcome in `book` that satisfies `req`.
///
/// Outcomes from every requested market key are pooled before matching,
/// since a book may only expose the line in its alternate market.
///
/// A request without a player only ever matches unlabelled outcomes. A
/// labelled outcome belongs to some subject and is never a stand-in for
/// the game-level line.
pub fn match_outcome<'a>(
    req: &MatchRequest,
    book: &'a BookQuote,
) -> Result<MatchedOutcome<'a>, MatchFailure> {
    let pool = pooled(req, book)?;
    let exact = |o: &Outcome| o.side == req.required_side && o.line == req.required_line;

    let target = match req.target_player.as_deref() {
        Some(t) => t,
        None => {
            let unlabelled: Vec<(&'a str, &'a Outcome)> =
                pool.iter().copied().filter(|&(_, o)| o.label.is_none()).collect();
            if unlabelled.is_empty() {
                return Err(MatchFailure::PlayerNotFound);
            }
            return unlabelled
                .iter()
                .copied()
                .find(|&(_, o)| exact(o))
                .map(|(key, o)| MatchedOutcome {
                    outcome: o,
                    market_key: key,
                    player_score: None,
                })
                .ok_or_else(|| MatchFailure::LineNotOffered {
                    available: available_lines(
                        unlabelled.iter().map(|&(_, o)| o),
                        req.required_side,
                    ),
                });
        }
    };

    let mut labels: Vec<&str> = Vec::new();
    for &(_, o) in &pool {
        if let Some(l) = o.label.as_deref() {
            if !labels.contains(&l) {
                labels.push(l);
            }
        }
    }

    let players = names::resolve(target, &labels);
    if players.is_empty() {
        return Err(MatchFailure::PlayerNotFound);
    }

    // Players in score order; first exact side+line hit wins.
    for player in &players {
        let hit = pool
            .iter()
            .copied()
            .find(|&(_, o)| o.label.as_deref() == Some(player.candidate.as_str()) && exact(o));
        if let Some((key, o)) = hit {
            return Ok(MatchedOutcome {
                outcome: o,
                market_key: key,
                player_score: Some(player.score),
            });
        }
    }

    let available = available_lines(
        pool.iter()
            .map(|&(_, o)| o)
            .filter(|o| {
                players
                    .iter()
                    .any(|p| o.label.as_deref() == Some(p.candidate.as_str()))
            }),
        req.required_side,
    );
    Err(MatchFailure::LineNotOffered { available })
}

/// Like [`match_outcome`], but bound to one exact `label` instead of
/// resolving the player name. Used once one side of a book has matched,
/// so the opposite side is read off the same player.
pub fn match_label<'a>(
    req: &MatchRequest,
    book: &'a BookQuote,
    label: &str,
) -> Result<MatchedOutcome<'a>, MatchFailure> {
    let pool = pooled(req, book)?;
    let player_score = req.target_player.as_deref().map(|t| names::score(t, label));
    pool.iter()
        .copied()
        .find(|&(_, o)| {
            o.label.as_deref() == Some(label)
                && o.side == req.required_side
                && o.line == req.required_line
        })
        .map(|(key, o)| MatchedOutcome {
            outcome: o,
            market_key: key,
            player_score,
        })
        .ok_or_else(|| MatchFailure::LineNotOffered {
            available: available_lines(
                pool.iter()
                    .map(|&(_, o)| o)
                    .filter(|o| o.label.as_deref() == Some(label)),
                req.required_side,
            ),
        })
}

fn available_lines<'a>(outcomes: impl Iterator<Item = &'a Outcome>, side: Side) -> Vec<Line> {
    let mut lines: Vec<Line> = outcomes
        .filter(|o| o.side == side)
        .filter_map(|o| o.line)
        .collect();
    lines.sort();
    lines.dedup();
    lines
}
