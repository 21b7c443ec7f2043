use flume::{Receiver, Sender};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::FolderRole;
use crate::error::{MvboxError, Result};
use crate::store::MessageStore;
use crate::transport::Interrupt;

/// Progress of the target worker's first fetch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPoll {
    Pending,
    Complete,
    /// The target worker halted before completing a pass
    Halted,
}

/// State shared by the two folder workers
pub struct SharedContext {
    pub store: Mutex<MessageStore>,
    initial_poll: watch::Sender<InitialPoll>,
    source_interrupt: (Sender<Interrupt>, Receiver<Interrupt>),
    target_interrupt: (Sender<Interrupt>, Receiver<Interrupt>),
}

impl SharedContext {
    pub fn new(store: MessageStore) -> Self {
        let (initial_poll, _) = watch::channel(InitialPoll::Pending);
        Self {
            store: Mutex::new(store),
            initial_poll,
            source_interrupt: flume::unbounded(),
            target_interrupt: flume::unbounded(),
        }
    }

    fn interrupt_channel(&self, role: FolderRole) -> &(Sender<Interrupt>, Receiver<Interrupt>) {
        match role {
            FolderRole::Source => &self.source_interrupt,
            FolderRole::Target => &self.target_interrupt,
        }
    }

    pub fn interrupt_receiver(&self, role: FolderRole) -> Receiver<Interrupt> {
        self.interrupt_channel(role).1.clone()
    }

    /// Wake or stop one worker. Queued if the worker is not waiting.
    pub fn interrupt(&self, role: FolderRole, signal: Interrupt) {
        debug!("Sending {:?} to {:?} worker", signal, role);
        // Both ends live in self, so the channel cannot be disconnected
        let _ = self.interrupt_channel(role).0.send(signal);
    }

    pub fn interrupt_all(&self, signal: Interrupt) {
        self.interrupt(FolderRole::Source, signal);
        self.interrupt(FolderRole::Target, signal);
    }

    pub fn initial_poll(&self) -> InitialPoll {
        *self.initial_poll.borrow()
    }

    pub fn signal_initial_poll_done(&self) {
        let changed = self.initial_poll.send_if_modified(|state| {
            if *state == InitialPoll::Complete {
                return false;
            }
            *state = InitialPoll::Complete;
            true
        });
        if changed {
            info!("Target folder scanned, source worker may classify");
        }
    }

    /// Release a waiting source worker with an error; a completed pass stays complete
    pub fn signal_initial_poll_halted(&self) {
        self.initial_poll.send_if_modified(|state| {
            if *state != InitialPoll::Pending {
                return false;
            }
            *state = InitialPoll::Halted;
            true
        });
    }

    /// Block until the target worker finished its first fetch pass
    pub async fn wait_initial_poll(&self) -> Result<()> {
        let mut rx = self.initial_poll.subscribe();
        let state = *rx
            .wait_for(|state| *state != InitialPoll::Pending)
            .await
            .map_err(|_| MvboxError::PeerStopped(FolderRole::Target.to_string()))?;

        match state {
            InitialPoll::Halted => Err(MvboxError::PeerStopped(FolderRole::Target.to_string())),
            _ => Ok(()),
        }
    }
}
