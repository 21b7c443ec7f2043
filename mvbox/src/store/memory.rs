use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thread_classifier::Message;

use super::{ChangeSet, Snapshot, StoreBackend};
use crate::error::{MvboxError, Result};

#[derive(Default)]
struct Inner {
    messages: HashMap<String, Message>,
    watermarks: HashMap<String, u32>,
    fail_next_commit: bool,
}

/// Backend that keeps its "durable" state in shared memory.
///
/// Clones share state, so a test can drop a store and reopen another one on
/// the same backend to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn fail_next_commit(&self) {
        self.inner.lock().unwrap().fail_next_commit = true;
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&mut self) -> Result<Snapshot> {
        let inner = self.inner.lock().unwrap();
        Ok(Snapshot {
            messages: inner.messages.values().cloned().collect(),
            watermarks: inner.watermarks.clone(),
        })
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_commit {
            inner.fail_next_commit = false;
            return Err(MvboxError::Database("simulated commit failure".into()));
        }
        for msg in &changes.messages {
            inner.messages.insert(msg.id.clone(), msg.clone());
        }
        for (folder, seq) in &changes.watermarks {
            let current = inner.watermarks.entry(folder.clone()).or_insert(0);
            *current = (*current).max(*seq);
        }
        Ok(())
    }
}
