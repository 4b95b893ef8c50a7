//! Odds feed data model and boundary decode.
//!
//! Upstream payloads (The Odds API event odds) are loosely typed: every
//! field may be missing, sides are free text, prices arrive as JSON
//! numbers. This module decodes the raw shape once into strict
//! `EventOdds` / `BookQuote` / `Market` / `Outcome` values. Anything that
//! doesn't fit is dropped with a `DecodeIssue` so the rest of the market
//! survives; nothing downstream touches the raw types.

pub mod fetcher;

use crate::error::EngineError;
use crate::odds;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Which side of a two-way bet an outcome prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Over,
    Under,
    Home,
    Away,
}

impl Side {
    /// Parse a requested side ("over", "Under", "home" ...).
    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "over" => Some(Side::Over),
            "under" => Some(Side::Under),
            "home" => Some(Side::Home),
            "away" => Some(Side::Away),
            _ => None,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Over => Side::Under,
            Side::Under => Side::Over,
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }

    /// Display normalization: Home folds onto Over, Away onto Under.
    pub fn as_over_under(self) -> Side {
        match self {
            Side::Over | Side::Home => Side::Over,
            Side::Under | Side::Away => Side::Under,
        }
    }

    /// The line the opposite side carries for the same bet. Spreads are
    /// quoted from each team's perspective (Home -3.5 / Away +3.5); totals
    /// and props share one line.
    pub fn counterpart_line(self, line: Option<Line>) -> Option<Line> {
        match self {
            Side::Home | Side::Away => line.map(|l| l.negate()),
            Side::Over | Side::Under => line,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Over => write!(f, "over"),
            Side::Under => write!(f, "under"),
            Side::Home => write!(f, "home"),
            Side::Away => write!(f, "away"),
        }
    }
}

/// A prop or total threshold (3.5 strikeouts, 8.5 runs, -1.5 spread).
///
/// Compared exactly: 2.5 and 3.0 are different bets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Line(f64);

impl Line {
    /// `None` for non-finite input.
    pub fn new(value: f64) -> Option<Line> {
        if value.is_finite() {
            // Fold -0.0 onto 0.0 so equality and hashing agree.
            Some(Line(if value == 0.0 { 0.0 } else { value }))
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn negate(self) -> Line {
        Line(if self.0 == 0.0 { 0.0 } else { -self.0 })
    }
}

impl TryFrom<f64> for Line {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Line::new(value).ok_or_else(|| format!("line {} is not finite", value))
    }
}

impl From<Line> for f64 {
    fn from(line: Line) -> f64 {
        line.0
    }
}

impl PartialEq for Line {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Line {}

impl Hash for Line {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for Line {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Line {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Suffix books use for the market that carries extra lines.
pub const ALTERNATE_SUFFIX: &str = "_alternate";

/// `batter_hits_alternate` → `batter_hits`. Other keys pass through.
pub fn base_market(key: &str) -> &str {
    key.strip_suffix(ALTERNATE_SUFFIX)
        .filter(|b| !b.is_empty())
        .unwrap_or(key)
}

pub fn is_alternate(key: &str) -> bool {
    base_market(key) != key
}

/// One priced outcome from one book. Immutable for the poll it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub side: Side,
    /// Signed American odds.
    pub price: i32,
    pub line: Option<Line>,
    /// Player (or other subject) description; `None` for game-level markets.
    pub label: Option<String>,
    pub selection_id: Option<String>,
    pub deep_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

/// One book's full response for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookQuote {
    pub book_id: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub markets: Vec<Market>,
}

impl BookQuote {
    pub fn market(&self, key: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.key == key)
    }
}

/// All books' quotes for one event, as decoded from one fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOdds {
    pub event_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub books: Vec<BookQuote>,
}

impl EventOdds {
    /// Keep only the named markets in every book. Used when a cached
    /// superset entry answers a narrower request.
    pub fn retain_markets(&mut self, keys: &[String]) {
        for book in &mut self.books {
            book.markets.retain(|m| keys.iter().any(|k| k == &m.key));
        }
    }

    /// Keep only the allowed books; an empty allow-list keeps everything.
    pub fn retain_books(&mut self, allowed: &[String]) {
        if allowed.is_empty() {
            return;
        }
        self.books
            .retain(|b| allowed.iter().any(|a| a.eq_ignore_ascii_case(&b.book_id)));
    }
}

/// Anything that can produce decoded odds for one event.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_event(
        &self,
        sport: &str,
        event_id: &str,
        markets: &[String],
    ) -> Result<EventOdds, EngineError>;
}

/// Something at the boundary that could not be decoded. The owning unit
/// (outcome or market) is dropped; its siblings are kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeIssue {
    pub book: String,
    pub market: String,
    pub reason: String,
}

// --- Raw upstream shape ---

#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sport_key: Option<String>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub commence_time: Option<String>,
    #[serde(default)]
    pub bookmakers: Vec<RawBookmaker>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBookmaker {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub markets: Vec<RawMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMarket {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub outcomes: Vec<RawOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOutcome {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub point: Option<f64>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Why a whole payload was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid event JSON: {0}")]
    Json(String),
    #[error("payload has no event id")]
    MissingEventId,
}

/// Decode a JSON body into strict event odds plus the issues found.
pub fn decode_event_json(
    body: &str,
    sport: &str,
) -> Result<(EventOdds, Vec<DecodeIssue>), PayloadError> {
    let raw: RawEvent =
        serde_json::from_str(body).map_err(|e| PayloadError::Json(e.to_string()))?;
    decode_event(raw, sport)
}

pub fn decode_event(
    raw: RawEvent,
    sport: &str,
) -> Result<(EventOdds, Vec<DecodeIssue>), PayloadError> {
    let event_id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or(PayloadError::MissingEventId)?;
    let home_team = raw.home_team.unwrap_or_default();
    let away_team = raw.away_team.unwrap_or_default();

    let mut issues = Vec::new();
    let mut books = Vec::with_capacity(raw.bookmakers.len());

    for rb in raw.bookmakers {
        let book_id = match rb.key.filter(|k| !k.trim().is_empty()) {
            Some(k) => k.to_ascii_lowercase(),
            None => {
                issues.push(DecodeIssue {
                    book: String::new(),
                    market: String::new(),
                    reason: "bookmaker without key".to_string(),
                });
                continue;
            }
        };

        let mut markets = Vec::with_capacity(rb.markets.len());
        for rm in rb.markets {
            let key = match rm.key.filter(|k| !k.trim().is_empty()) {
                Some(k) => k.trim().to_string(),
                None => {
                    issues.push(DecodeIssue {
                        book: book_id.clone(),
                        market: String::new(),
                        reason: "market without key".to_string(),
                    });
                    continue;
                }
            };

            let mut outcomes = Vec::with_capacity(rm.outcomes.len());
            for ro in rm.outcomes {
                match decode_outcome(ro, &home_team, &away_team) {
                    Ok(o) => outcomes.push(o),
                    Err(reason) => issues.push(DecodeIssue {
                        book: book_id.clone(),
                        market: key.clone(),
                        reason,
                    }),
                }
            }
            markets.push(Market { key, outcomes });
        }

        books.push(BookQuote {
            book_id,
            last_updated: rb.last_update.as_deref().and_then(parse_timestamp),
            markets,
        });
    }

    let event = EventOdds {
        event_id,
        sport: raw.sport_key.unwrap_or_else(|| sport.to_string()),
        home_team,
        away_team,
        commence_time: raw.commence_time.as_deref().and_then(parse_timestamp),
        books,
    };
    Ok((event, issues))
}

fn decode_outcome(raw: RawOutcome, home: &str, away: &str) -> Result<Outcome, String> {
    let name = raw.name.unwrap_or_default();
    let side = match Side::parse(&name) {
        Some(s @ (Side::Over | Side::Under)) => s,
        _ if !home.is_empty() && name.eq_ignore_ascii_case(home) => Side::Home,
        _ if !away.is_empty() && name.eq_ignore_ascii_case(away) => Side::Away,
        _ => return Err(format!("unrecognized side {:?}", name)),
    };

    let price = match raw.price {
        Some(p) if odds::is_valid_american(p) => p as i32,
        Some(p) => return Err(format!("price {} is not an American price", p)),
        None => return Err("missing price".to_string()),
    };

    let line = match raw.point {
        Some(p) => Some(Line::new(p).ok_or_else(|| format!("line {} is not finite", p))?),
        None => None,
    };

    Ok(Outcome {
        side,
        price,
        line,
        label: raw.description.filter(|d| !d.trim().is_empty()),
        selection_id: raw.sid.filter(|s| !s.is_empty()),
        deep_link: raw.link.filter(|l| !l.is_empty()),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
