//! Player-name resolution against book outcome labels.
//!
//! Books disagree on how to spell a player: "Ronald Acuña Jr.",
//! "Ronald Acuna", "R. Acuna Jr", "Acuna Ronald". Names are normalized
//! (lowercase, no punctuation, single spaces), the target is expanded
//! into its common variations, and every candidate is scored by a
//! fixed tier ladder:
//!
//!   - 1.0  exact after normalization
//!   - 0.95 equal once a generational suffix is stripped from either side
//!   - 0.9  compatible first name (equal or initial) and exact last name
//!   - 0.8  exact last name and same first initial
//!   - 0.6  substring either direction
//!
//! Anything under [`MIN_SCORE`] is dropped. Near-ties are kept so the
//! outcome matcher can try the next plausible player.

/// Candidates scoring below this are not considered the same player.
pub const MIN_SCORE: f64 = 0.7;

/// Candidates within this distance of the top score are also returned.
pub const NEAR_TIE: f64 = 0.1;

const SUFFIXES: &[&str] = &["jr", "sr", "ii", "iii", "iv", "v"];

/// Suffixes tried when the target has none of its own.
const ADDED_SUFFIXES: &[&str] = &["jr", "sr", "ii", "iii"];

#[derive(Debug, Clone, PartialEq)]
pub struct NameMatch {
    pub candidate: String,
    /// Position in the caller's candidate slice.
    pub index: usize,
    pub score: f64,
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The name without a trailing generational suffix, if it had one.
/// Single-word names are never stripped ("V" is not a suffix on its own).
fn strip_suffix(normalized: &str) -> Option<String> {
    let words: Vec<&str> = normalized.split_whitespace().collect();
    match words.split_last() {
        Some((last, rest)) if !rest.is_empty() && SUFFIXES.contains(last) => {
            Some(rest.join(" "))
        }
        _ => None,
    }
}

fn first_and_last(normalized: &str) -> Option<(&str, &str)> {
    let words: Vec<&str> = normalized.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    Some((words[0], words[words.len() - 1]))
}

fn initial(word: &str) -> Option<char> {
    word.chars().next()
}

fn first_names_compatible(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let single = |w: &str| w.chars().count() == 1;
    (single(a) && initial(b) == initial(a)) || (single(b) && initial(a) == initial(b))
}

/// One normalized form of the target.
///
/// Abbreviated forms ("r acuna", "ronald a") only count on an exact hit
/// and never score above the initial tier.
struct Variation {
    text: String,
    abbreviated: bool,
}

/// Target variations, normalized. Always includes the target itself.
fn variations(target: &str) -> Vec<Variation> {
    let full = |text: String| Variation {
        text,
        abbreviated: false,
    };
    let mut out = vec![full(target.to_string())];
    let stripped = strip_suffix(target);
    let base = stripped.clone().unwrap_or_else(|| target.to_string());

    match stripped {
        Some(s) => out.push(full(s)),
        None => {
            for suffix in ADDED_SUFFIXES {
                out.push(full(format!("{} {}", base, suffix)));
            }
        }
    }

    let words: Vec<&str> = base.split_whitespace().collect();
    if let Some((last, rest)) = words.split_last() {
        if !rest.is_empty() {
            let first = rest[0];
            // "Acuna Ronald"
            out.push(full(format!("{} {}", last, rest.join(" "))));
            if let Some(f) = initial(first) {
                // "R. Acuna" → "r acuna"
                out.push(Variation {
                    text: format!("{} {}", f, last),
                    abbreviated: true,
                });
            }
            if let Some(l) = initial(last) {
                // "Ronald A." → "ronald a"
                out.push(Variation {
                    text: format!("{} {}", first, l),
                    abbreviated: true,
                });
            }
        }
    }
    out
}

fn score_variation(variation: &Variation, candidate: &str) -> f64 {
    if !variation.abbreviated {
        return score_pair(&variation.text, candidate);
    }
    let c = strip_suffix(candidate).unwrap_or_else(|| candidate.to_string());
    if variation.text == candidate || variation.text == c {
        0.9
    } else {
        0.0
    }
}

/// Score one normalized form against one normalized candidate.
fn score_pair(variation: &str, candidate: &str) -> f64 {
    if variation.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    if variation == candidate {
        return 1.0;
    }

    let v = strip_suffix(variation).unwrap_or_else(|| variation.to_string());
    let c = strip_suffix(candidate).unwrap_or_else(|| candidate.to_string());
    if v == c {
        return 0.95;
    }

    if let (Some((vf, vl)), Some((cf, cl))) = (first_and_last(&v), first_and_last(&c)) {
        if vl == cl {
            if first_names_compatible(vf, cf) {
                return 0.9;
            }
            if initial(vf) == initial(cf) {
                return 0.8;
            }
        }
    }

    if candidate.contains(variation) || variation.contains(candidate) {
        return 0.6;
    }
    0.0
}

fn best_score(vars: &[Variation], candidate: &str) -> f64 {
    vars.iter()
        .map(|v| score_variation(v, candidate))
        .fold(0.0, f64::max)
}

/// Best score of `candidate` against any variation of `target`.
pub fn score(target: &str, candidate: &str) -> f64 {
    best_score(&variations(&normalize(target)), &normalize(candidate))
}

/// Rank `candidates` against `target`, best first.
///
/// Returns every candidate at or above [`MIN_SCORE`] that is within
/// [`NEAR_TIE`] of the top score. Equal scores keep input order.
pub fn resolve<S: AsRef<str>>(target: &str, candidates: &[S]) -> Vec<NameMatch> {
    let t = normalize(target);
    if t.is_empty() {
        return Vec::new();
    }
    let vars = variations(&t);

    let mut scored: Vec<NameMatch> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| {
            let s = best_score(&vars, &normalize(raw.as_ref()));
            (s >= MIN_SCORE).then(|| NameMatch {
                candidate: raw.as_ref().to_string(),
                index,
                score: s,
            })
        })
        .collect();

    // Stable: equal scores keep input order.
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));

    if let Some(top) = scored.first().map(|m| m.score) {
        scored.retain(|m| top - m.score <= NEAR_TIE + 1e-9);
    }
    scored
}
