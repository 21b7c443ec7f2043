//! Reply-chain classification
//!
//! The chat marker header may be stripped by mail agents that relay a reply,
//! so a message's own header is not enough evidence. A message inherits its
//! classification from the nearest settled ancestor, or from the thread root.
//! Unresolved gaps in the chain defer the decision (`Stuck`) unless the run of
//! marked messages right below the gap is long enough to assume a chat thread.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Read access to stored messages, keyed by normalized Message-ID
pub trait MessageLookup {
    fn lookup(&self, id: &str) -> Option<&Message>;
}

impl MessageLookup for HashMap<String, Message> {
    fn lookup(&self, id: &str) -> Option<&Message> {
        self.get(id)
    }
}

/// Tunables for the chain walk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Consecutive marked messages directly below a gap that count as a chat thread
    pub gap_run_threshold: u32,
    /// Upper bound on walked ancestors
    pub max_depth: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            gap_run_threshold: 4,
            max_depth: 1000,
        }
    }
}

/// Outcome of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Stay,
    Move,
    Stuck,
}

/// Why a classification was reached, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    AlreadyMoved,
    ThreadRoot { marked: bool },
    SettledAncestor,
    GapHeuristic { run_len: u32 },
    MissingParent { run_len: u32 },
    Cycle,
    DepthLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub classification: Classification,
    pub reason: Reason,
    /// Number of messages visited, including the classified one
    pub walked: usize,
}

impl Decision {
    fn new(classification: Classification, reason: Reason, walked: usize) -> Self {
        Self {
            classification,
            reason,
            walked,
        }
    }
}

/// Classify `msg` against the messages known to `store`.
///
/// Read-only: neither `msg` nor the store is modified, callers apply the result.
pub fn classify<S: MessageLookup + ?Sized>(
    store: &S,
    msg: &Message,
    config: &ClassifierConfig,
) -> Decision {
    if msg.is_moved() {
        return Decision::new(Classification::Stay, Reason::AlreadyMoved, 0);
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = msg;
    let mut run_len: u32 = 0;

    loop {
        if !visited.insert(current.id.as_str()) {
            return Decision::new(Classification::Stay, Reason::Cycle, visited.len());
        }
        if visited.len() > config.max_depth {
            return Decision::new(Classification::Stay, Reason::DepthLimit, visited.len());
        }

        // A single unmarked message on the path erases the run
        run_len = if current.is_protocol_message {
            run_len + 1
        } else {
            0
        };

        let parent_id = match current.parent_id.as_deref() {
            Some(id) => id,
            None => {
                let marked = run_len > 0;
                let classification = if marked {
                    Classification::Move
                } else {
                    Classification::Stay
                };
                return Decision::new(
                    classification,
                    Reason::ThreadRoot { marked },
                    visited.len(),
                );
            }
        };

        let parent = match store.lookup(parent_id) {
            Some(parent) => parent,
            None => {
                return if run_len >= config.gap_run_threshold {
                    Decision::new(
                        Classification::Move,
                        Reason::GapHeuristic { run_len },
                        visited.len(),
                    )
                } else {
                    Decision::new(
                        Classification::Stuck,
                        Reason::MissingParent { run_len },
                        visited.len(),
                    )
                };
            }
        };

        if parent.is_resolved_to_target() {
            return Decision::new(
                Classification::Move,
                Reason::SettledAncestor,
                visited.len(),
            );
        }

        current = parent;
    }
}
