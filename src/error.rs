//! Engine-wide error type.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No outcome satisfied the request in the given book.
    #[error("no matching outcome in {book}: {reason}")]
    NoMatch { book: String, reason: String },

    /// Fewer than the required number of prices on one side.
    #[error("insufficient consensus: need {needed} prices per side, have {same_side}/{other_side}")]
    InsufficientConsensus {
        needed: usize,
        same_side: usize,
        other_side: usize,
    },

    #[error("upstream fetch failed for event {event_id}: {reason}")]
    UpstreamFetch { event_id: String, reason: String },

    #[error("malformed payload for event {event_id}: {reason}")]
    MalformedPayload { event_id: String, reason: String },

    /// Never surfaced from a request; the cache resolver degrades to a miss.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("no events resolved ({failed} failed)")]
    NoEventsResolved { failed: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether this failure is confined to one event and the pass can go on.
    pub fn is_event_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamFetch { .. } | EngineError::MalformedPayload { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
