//! Applying classifications and propagating them to waiting messages
//!
//! A message that cannot be classified yet is marked stuck. Whenever a
//! message is stored or leaves the stuck state, every stuck descendant is
//! re-resolved in the same pass, so a child whose gap was just filled by a
//! settled parent never stays stuck. Messages released by housekeeping are
//! re-resolved the same way.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use thread_classifier::{classify, Classification, ClassifierConfig, Location};
use tracing::{debug, info};

use crate::error::{MvboxError, Result};
use crate::store::MessageStore;

/// Counters for one cascade pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Stuck descendants that were classified again
    pub reconsidered: usize,
    /// How many of them left the stuck state
    pub settled: usize,
}

pub struct CascadeResolver {
    config: ClassifierConfig,
}

impl CascadeResolver {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify a stored source message and apply the result.
    ///
    /// Returns true when the message is settled, false when it is still stuck.
    pub fn resolve(&self, store: &mut MessageStore, id: &str) -> Result<bool> {
        let decision = {
            let msg = store
                .get(id)
                .ok_or_else(|| MvboxError::MessageNotFound(id.to_string()))?;
            if msg.location == Location::Target || msg.awaits_move() {
                return Ok(true);
            }
            classify(&*store, msg, &self.config)
        };

        debug!(
            "Classified {} as {:?} ({:?}, walked {})",
            id, decision.classification, decision.reason, decision.walked
        );

        match decision.classification {
            Classification::Move => {
                store.decide_move(id)?;
                Ok(true)
            }
            Classification::Stay => {
                store.set_stuck(id, false)?;
                Ok(true)
            }
            Classification::Stuck => {
                store.set_stuck(id, true)?;
                Ok(false)
            }
        }
    }

    /// Resolve a newly stored source message, then its stuck descendants
    pub fn admit(&self, store: &mut MessageStore, id: &str) -> Result<(bool, CascadeReport)> {
        let settled = self.resolve(store, id)?;
        let report = self.cascade_from(store, id)?;
        Ok((settled, report))
    }

    /// Re-resolve every undecided message below `id`, breadth first.
    ///
    /// Undecided means stuck, or released by housekeeping without a move.
    /// Descends through children that remain stuck as well: a longer run of
    /// marked messages may now reach the gap threshold further down.
    /// Only the touched subtree is visited, through the store's index of
    /// waiting children.
    pub fn cascade_from(&self, store: &mut MessageStore, id: &str) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();
        let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
        let mut queue: VecDeque<String> = VecDeque::from([id.to_string()]);

        while let Some(parent_id) = queue.pop_front() {
            for child in store.waiting_children(&parent_id) {
                if !visited.insert(child.clone()) {
                    continue;
                }
                report.reconsidered += 1;
                if self.resolve(store, &child)? {
                    report.settled += 1;
                }
                queue.push_back(child);
            }
        }

        if report.reconsidered > 0 {
            info!(
                "Cascade from {}: {} reconsidered, {} settled",
                id, report.reconsidered, report.settled
            );
        }

        Ok(report)
    }

    /// Record that a known message showed up in the target folder.
    ///
    /// Returns true if the message was still considered to be in the source folder.
    pub fn observe_in_target(&self, store: &mut MessageStore, id: &str) -> Result<bool> {
        let in_source = match store.get(id) {
            Some(msg) => msg.location == Location::Source,
            None => return Err(MvboxError::MessageNotFound(id.to_string())),
        };
        if !in_source {
            return Ok(false);
        }

        info!("{} found in target folder, marking as moved", id);
        store.mark_moved(id)?;
        self.cascade_from(store, id)?;
        Ok(true)
    }

    /// Clear the stuck flag on messages deferred for longer than `stuck_timeout`.
    ///
    /// No decision is forced: released messages stop waiting, and are
    /// classified again if an ancestor turns up later.
    pub fn release_expired(
        &self,
        store: &mut MessageStore,
        now: DateTime<Utc>,
        stuck_timeout: Duration,
    ) -> Result<usize> {
        let expired: Vec<String> = store
            .messages()
            .filter(|m| m.stuck && now - m.retrieved_at > stuck_timeout)
            .map(|m| m.id.clone())
            .collect();

        for id in &expired {
            store.set_stuck(id, false)?;
        }

        if !expired.is_empty() {
            info!(
                "Released {} messages stuck for more than {}s",
                expired.len(),
                stuck_timeout.num_seconds()
            );
        }

        Ok(expired.len())
    }
}
