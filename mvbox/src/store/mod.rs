//! Message store
//!
//! In-memory view of every fetched message and of the per-folder watermarks,
//! backed by a pluggable [`StoreBackend`]. Mutations are recorded as dirty and
//! only reach the backend on [`MessageStore::flush`], in one transaction.
//!
//! The key set is append-only: `put` on an existing identifier is an
//! invariant violation, and messages are never deleted. Re-fetching a range
//! that was already flushed is therefore a no-op, while a range that was
//! fetched but not flushed before a crash is processed again from scratch
//! (its watermark was not persisted either).

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use thread_classifier::{Location, Message, MessageLookup, MOVED_SENTINEL};
use tracing::{debug, warn};

use crate::error::{MvboxError, Result};

#[cfg(test)]
pub mod memory;
pub mod sqlite;

/// Everything a backend holds
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub watermarks: HashMap<String, u32>,
}

/// Pending mutations handed to a backend on flush
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub messages: Vec<Message>,
    pub watermarks: Vec<(String, u32)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.watermarks.is_empty()
    }
}

/// Durable storage engine behind a [`MessageStore`]
pub trait StoreBackend: Send {
    /// Read the whole persisted state
    fn load(&mut self) -> Result<Snapshot>;

    /// Persist a change set atomically
    fn commit(&mut self, changes: &ChangeSet) -> Result<()>;
}

/// Counters for the status command
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub in_source: usize,
    pub in_target: usize,
    pub stuck: usize,
    pub pending_moves: usize,
    pub watermarks: Vec<(String, u32)>,
}

pub struct MessageStore {
    messages: HashMap<String, Message>,
    watermarks: HashMap<String, u32>,
    dirty_messages: HashSet<String>,
    dirty_watermarks: HashSet<String>,
    /// Parent id to the undecided source messages replying to it
    waiting: HashMap<String, BTreeSet<String>>,
    backend: Box<dyn StoreBackend>,
}

impl MessageStore {
    /// Open a store, loading everything the backend persisted
    pub fn open(mut backend: Box<dyn StoreBackend>) -> Result<Self> {
        let snapshot = backend.load()?;
        let messages: HashMap<String, Message> = snapshot
            .messages
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        debug!(
            "Loaded message store: {} messages, {} folders",
            messages.len(),
            snapshot.watermarks.len()
        );

        let mut store = Self {
            messages: HashMap::new(),
            watermarks: snapshot.watermarks,
            dirty_messages: HashSet::new(),
            dirty_watermarks: HashSet::new(),
            waiting: HashMap::new(),
            backend,
        };
        for msg in messages.values() {
            store.index_waiting(msg);
        }
        store.messages = messages;
        Ok(store)
    }

    fn index_waiting(&mut self, msg: &Message) {
        let Some(parent_id) = &msg.parent_id else {
            return;
        };
        if msg.is_undecided() {
            self.waiting
                .entry(parent_id.clone())
                .or_default()
                .insert(msg.id.clone());
        } else if let Some(children) = self.waiting.get_mut(parent_id) {
            children.remove(&msg.id);
            if children.is_empty() {
                self.waiting.remove(parent_id);
            }
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Insert a new message. Fails with `DuplicateKey` if the id is known.
    pub fn put(&mut self, msg: Message) -> Result<()> {
        if self.messages.contains_key(&msg.id) {
            return Err(MvboxError::DuplicateKey(msg.id));
        }
        self.dirty_messages.insert(msg.id.clone());
        self.index_waiting(&msg);
        self.messages.insert(msg.id.clone(), msg);
        Ok(())
    }

    /// Undecided source messages whose parent is `parent_id`, sorted by id
    pub fn waiting_children(&self, parent_id: &str) -> Vec<String> {
        self.waiting
            .get(parent_id)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lazy pass over all stored messages. Restartable: each call starts over.
    pub fn messages(&self) -> impl Iterator<Item = &Message> + '_ {
        self.messages.values()
    }

    /// Mutate a stored message in place and mark it dirty.
    ///
    /// Identity fields never change, and a message in the target folder
    /// stays there and is never stuck, whatever `f` does.
    fn update<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Message),
    {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| MvboxError::MessageNotFound(id.to_string()))?;
        let before = msg.clone();

        f(msg);
        msg.id = before.id.clone();
        msg.parent_id = before.parent_id.clone();
        msg.is_protocol_message = before.is_protocol_message;
        msg.retrieved_at = before.retrieved_at;
        msg.size = before.size;
        if before.location == Location::Target {
            msg.location = Location::Target;
            msg.target_location = Location::Target;
            msg.sequence_ref = MOVED_SENTINEL;
        }
        if msg.location == Location::Target {
            msg.stuck = false;
        }

        let after = msg.clone();
        if before.is_undecided() != after.is_undecided() {
            self.index_waiting(&after);
        }
        self.dirty_messages.insert(before.id);
        Ok(())
    }

    /// Set or clear the deferred flag. Messages in the target folder are never stuck.
    pub fn set_stuck(&mut self, id: &str, stuck: bool) -> Result<()> {
        self.update(id, |m| m.stuck = stuck && m.location == Location::Source)?;
        Ok(())
    }

    /// Record a move decision; the message joins the next move batch
    pub fn decide_move(&mut self, id: &str) -> Result<()> {
        self.update(id, |m| {
            m.target_location = Location::Target;
            m.stuck = false;
        })?;
        Ok(())
    }

    /// Record that a message now lives in the target folder
    pub fn mark_moved(&mut self, id: &str) -> Result<()> {
        self.update(id, |m| {
            m.location = Location::Target;
            m.target_location = Location::Target;
            m.sequence_ref = MOVED_SENTINEL;
            m.stuck = false;
        })?;
        Ok(())
    }

    pub fn watermark(&self, folder: &str) -> u32 {
        self.watermarks.get(folder).copied().unwrap_or(0)
    }

    /// Raise the folder watermark; lower values are ignored
    pub fn advance_watermark(&mut self, folder: &str, seq: u32) {
        let current = self.watermarks.entry(folder.to_string()).or_insert(0);
        if seq > *current {
            *current = seq;
            self.dirty_watermarks.insert(folder.to_string());
        }
    }

    /// Source messages decided to move and not moved yet, by ascending sequence
    pub fn move_batch(&self) -> Vec<(String, u32)> {
        let mut batch: Vec<(String, u32)> = self
            .messages
            .values()
            .filter(|m| m.awaits_move())
            .map(|m| (m.id.clone(), m.sequence_ref))
            .collect();
        batch.sort_by_key(|(_, seq)| *seq);
        batch
    }

    pub fn has_pending_moves(&self) -> bool {
        self.messages.values().any(|m| m.awaits_move())
    }

    pub fn has_unflushed_changes(&self) -> bool {
        !self.dirty_messages.is_empty() || !self.dirty_watermarks.is_empty()
    }

    /// Persist all pending mutations. Returns the number of written records.
    ///
    /// On failure the dirty set is kept, so the next flush retries.
    pub fn flush(&mut self) -> Result<usize> {
        if !self.has_unflushed_changes() {
            return Ok(0);
        }

        let changes = ChangeSet {
            messages: self
                .dirty_messages
                .iter()
                .filter_map(|id| self.messages.get(id).cloned())
                .collect(),
            watermarks: self
                .dirty_watermarks
                .iter()
                .map(|folder| (folder.clone(), self.watermark(folder)))
                .collect(),
        };

        if let Err(e) = self.backend.commit(&changes) {
            warn!(
                "Flush of {} messages failed, keeping them dirty: {}",
                changes.messages.len(),
                e
            );
            return Err(e);
        }

        let written = changes.messages.len() + changes.watermarks.len();
        self.dirty_messages.clear();
        self.dirty_watermarks.clear();
        debug!("Flushed {} records", written);
        Ok(written)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total: self.messages.len(),
            ..Default::default()
        };
        for m in self.messages.values() {
            match m.location {
                Location::Source => stats.in_source += 1,
                Location::Target => stats.in_target += 1,
            }
            if m.stuck {
                stats.stuck += 1;
            }
            if m.awaits_move() {
                stats.pending_moves += 1;
            }
        }
        stats.watermarks = self
            .watermarks
            .iter()
            .map(|(folder, seq)| (folder.clone(), *seq))
            .collect();
        stats.watermarks.sort();
        stats
    }
}

impl MessageLookup for MessageStore {
    fn lookup(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }
}
