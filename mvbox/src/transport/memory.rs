use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use tokio::sync::Notify;

use super::{ChangeEvent, HeaderFetch, Interrupt, MailTransport};
use crate::error::{MvboxError, Result};

#[derive(Default)]
struct Folder {
    next_uid: u32,
    messages: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    folders: HashMap<String, Folder>,
    fail_next_move: bool,
    fail_all_moves: bool,
    moves: Vec<(String, Vec<u32>, String)>,
}

/// A fake mail server shared by several transports
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    changed: Arc<Notify>,
}

impl MemoryServer {
    pub fn new(folders: &[&str]) -> Self {
        let server = Self::default();
        {
            let mut state = server.state.lock().unwrap();
            for name in folders {
                state.folders.insert(name.to_string(), Folder::default());
            }
        }
        server
    }

    /// Append a raw message, returning its sequence reference
    pub fn deliver(&self, folder: &str, raw: &str) -> u32 {
        let uid = {
            let mut state = self.state.lock().unwrap();
            let folder = state.folders.entry(folder.to_string()).or_default();
            folder.next_uid += 1;
            let uid = folder.next_uid;
            folder.messages.insert(uid, raw.as_bytes().to_vec());
            uid
        };
        self.changed.notify_waiters();
        uid
    }

    pub fn folder_len(&self, folder: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.folders.get(folder).map(|f| f.messages.len()).unwrap_or(0)
    }

    pub fn has_folder(&self, folder: &str) -> bool {
        self.state.lock().unwrap().folders.contains_key(folder)
    }

    /// Every executed move as (source, sequence refs, destination)
    pub fn moves(&self) -> Vec<(String, Vec<u32>, String)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn fail_next_move(&self) {
        self.state.lock().unwrap().fail_next_move = true;
    }

    /// Reject every move until further notice
    pub fn fail_all_moves(&self, fail: bool) {
        self.state.lock().unwrap().fail_all_moves = fail;
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            server: self.clone(),
            selected: None,
            connected: false,
        }
    }
}

pub struct MemoryTransport {
    server: MemoryServer,
    selected: Option<String>,
    connected: bool,
}

impl MemoryTransport {
    fn selected(&self) -> Result<String> {
        if !self.connected {
            return Err(MvboxError::Transport("Not connected".into()));
        }
        self.selected
            .clone()
            .ok_or_else(|| MvboxError::Transport("No folder selected".into()))
    }
}

fn header_block(raw: &[u8]) -> Vec<u8> {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(raw.len());
    raw[..end].to_vec()
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn select_folder(&mut self, name: &str) -> Result<u32> {
        let state = self.server.state.lock().unwrap();
        let folder = state
            .folders
            .get(name)
            .ok_or_else(|| MvboxError::Transport(format!("No such folder: {}", name)))?;
        let count = folder.messages.len() as u32;
        drop(state);
        self.selected = Some(name.to_string());
        Ok(count)
    }

    async fn ensure_folder_exists(&mut self, name: &str) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        state.folders.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn fetch_headers_since(&mut self, watermark: u32) -> Result<BTreeMap<u32, HeaderFetch>> {
        let selected = self.selected()?;
        let state = self.server.state.lock().unwrap();
        let folder = &state.folders[&selected];
        Ok(folder
            .messages
            .range(watermark.saturating_add(1)..)
            .map(|(uid, raw)| {
                (
                    *uid,
                    HeaderFetch {
                        size: raw.len() as u32,
                        flags: vec![],
                        headers: header_block(raw),
                    },
                )
            })
            .collect())
    }

    async fn fetch_full_body(&mut self, seq: u32) -> Result<Vec<u8>> {
        let selected = self.selected()?;
        let state = self.server.state.lock().unwrap();
        state.folders[&selected]
            .messages
            .get(&seq)
            .cloned()
            .ok_or_else(|| MvboxError::Transport(format!("No message {}", seq)))
    }

    async fn move_messages(&mut self, seqs: &[u32], dest_folder: &str) -> Result<()> {
        let selected = self.selected()?;
        {
            let mut state = self.server.state.lock().unwrap();
            if state.fail_next_move || state.fail_all_moves {
                state.fail_next_move = false;
                return Err(MvboxError::Transport("MOVE failed: simulated".into()));
            }
            let mut moved = Vec::new();
            if let Some(source) = state.folders.get_mut(&selected) {
                for seq in seqs {
                    if let Some(raw) = source.messages.remove(seq) {
                        moved.push(raw);
                    }
                }
            }
            let dest = state.folders.entry(dest_folder.to_string()).or_default();
            for raw in moved {
                dest.next_uid += 1;
                dest.messages.insert(dest.next_uid, raw);
            }
            state
                .moves
                .push((selected, seqs.to_vec(), dest_folder.to_string()));
        }
        self.server.changed.notify_waiters();
        Ok(())
    }

    async fn long_poll_wait(
        &mut self,
        timeout: Duration,
        interrupt: &Receiver<Interrupt>,
    ) -> Result<Vec<ChangeEvent>> {
        let changed = self.server.changed.clone();
        Ok(tokio::select! {
            _ = changed.notified() => vec![ChangeEvent::NewMessages { exists: 0 }],
            _ = tokio::time::sleep(timeout) => vec![],
            signal = interrupt.recv_async() => match signal {
                Ok(signal) => vec![ChangeEvent::Interrupted(signal)],
                Err(_) => vec![],
            },
        })
    }
}
