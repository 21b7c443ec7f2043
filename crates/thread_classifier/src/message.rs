use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sequence reference written once a message has been moved.
/// A message carrying it is never considered for moving again.
pub const MOVED_SENTINEL: u32 = 0;

/// Which of the two watched folders a message lives in (or should live in)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Source,
    Target,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown location: {0}")]
pub struct UnknownLocation(pub String);

impl FromStr for Location {
    type Err = UnknownLocation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Self::Source),
            "target" => Ok(Self::Target),
            other => Err(UnknownLocation(other.to_string())),
        }
    }
}

/// Metadata kept for every fetched message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Normalized Message-ID, the store key
    pub id: String,
    /// Normalized In-Reply-To
    pub parent_id: Option<String>,
    /// Chat-Version header present
    pub is_protocol_message: bool,
    pub location: Location,
    pub target_location: Location,
    /// Transport position (IMAP UID), [`MOVED_SENTINEL`] once moved
    pub sequence_ref: u32,
    pub stuck: bool,
    pub retrieved_at: DateTime<Utc>,
    pub size: u32,
}

impl Message {
    /// A freshly fetched, not yet classified message in the source folder
    pub fn new_in_source(
        id: String,
        parent_id: Option<String>,
        is_protocol_message: bool,
        sequence_ref: u32,
        size: u32,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id,
            is_protocol_message,
            location: Location::Source,
            target_location: Location::Source,
            sequence_ref,
            stuck: false,
            retrieved_at,
            size,
        }
    }

    /// A message found in the target folder. It is settled on arrival.
    pub fn new_in_target(
        id: String,
        parent_id: Option<String>,
        is_protocol_message: bool,
        size: u32,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id,
            is_protocol_message,
            location: Location::Target,
            target_location: Location::Target,
            sequence_ref: MOVED_SENTINEL,
            stuck: false,
            retrieved_at,
            size,
        }
    }

    pub fn is_moved(&self) -> bool {
        self.sequence_ref == MOVED_SENTINEL
    }

    /// True when descendants may inherit a move decision from this message
    pub fn is_resolved_to_target(&self) -> bool {
        self.location == Location::Target
            || self.target_location == Location::Target
            || self.is_moved()
    }

    /// In the source folder with no move decision: stuck, or released without one
    pub fn is_undecided(&self) -> bool {
        self.location == Location::Source && self.target_location == Location::Source
    }

    /// Decided to move but not moved yet
    pub fn awaits_move(&self) -> bool {
        self.location == Location::Source
            && self.target_location == Location::Target
            && self.sequence_ref > MOVED_SENTINEL
    }
}

/// Normalize a Message-ID or In-Reply-To header value.
///
/// Takes the first `<...>` token when present (In-Reply-To may carry several
/// identifiers or trailing comments), strips the brackets and lowercases.
/// Returns `None` for empty values.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let inner = match (raw.find('<'), raw.find('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw.split_whitespace().next().unwrap_or(""),
    };
    let id = inner.trim().to_lowercase();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
