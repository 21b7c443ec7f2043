use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::MessageStore;
use crate::transport::MailTransport;

/// Relocates decided messages from the source folder in one batch per cycle
pub struct MoveScheduler {
    target_folder: String,
}

impl MoveScheduler {
    pub fn new(target_folder: impl Into<String>) -> Self {
        Self {
            target_folder: target_folder.into(),
        }
    }

    /// Move every message awaiting relocation. Returns the number moved.
    ///
    /// The store lock is released while the transport works. A transport
    /// failure leaves the batch untouched and is returned to the caller.
    pub async fn run<T: MailTransport + ?Sized>(
        &self,
        store: &Mutex<MessageStore>,
        transport: &mut T,
    ) -> Result<usize> {
        let batch = store.lock().await.move_batch();
        if batch.is_empty() {
            return Ok(0);
        }

        let seqs: Vec<u32> = batch.iter().map(|(_, seq)| *seq).collect();
        info!("Moving {} messages to {}: {:?}", seqs.len(), self.target_folder, seqs);

        if let Err(e) = transport.move_messages(&seqs, &self.target_folder).await {
            warn!("Move of {:?} failed: {}", seqs, e);
            return Err(e);
        }

        let mut store = store.lock().await;
        for (id, _) in &batch {
            store.mark_moved(id)?;
        }

        Ok(batch.len())
    }
}
