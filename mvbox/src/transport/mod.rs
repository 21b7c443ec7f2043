//! Mail transport abstraction
//!
//! The workers only talk to the server through [`MailTransport`]. The IMAP
//! implementation lives in [`imap`]; tests use an in-memory server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};
use thread_classifier::normalize_message_id;

use crate::error::Result;

pub mod imap;
#[cfg(test)]
pub mod memory;

/// Header fields requested on every fetch
pub const FETCHED_HEADERS: &[&str] = &["MESSAGE-ID", "IN-REPLY-TO", "CHAT-VERSION"];

/// Per-message result of a header fetch
#[derive(Debug, Clone, Default)]
pub struct HeaderFetch {
    pub size: u32,
    pub flags: Vec<String>,
    /// Raw header block
    pub headers: Vec<u8>,
}

/// Signals that end a long-poll early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interrupt {
    /// Re-run the cycle now
    Wake,
    /// Stop the worker after the current wait
    Shutdown,
}

/// What the server reported during a long-poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// New message(s) may have arrived
    NewMessages { exists: u32 },
    /// A message was removed from the folder
    Expunged { seq: u32 },
    /// Any other untagged response
    Other(String),
    /// The wait was ended by the interrupt channel
    Interrupted(Interrupt),
}

/// Primitives required from the mail server
#[async_trait]
pub trait MailTransport: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Select a folder, returning its message count
    async fn select_folder(&mut self, name: &str) -> Result<u32>;

    /// Create a folder; an existing folder is not an error
    async fn ensure_folder_exists(&mut self, name: &str) -> Result<()>;

    /// Headers of all messages with a sequence reference above `watermark`
    async fn fetch_headers_since(&mut self, watermark: u32) -> Result<BTreeMap<u32, HeaderFetch>>;

    async fn fetch_full_body(&mut self, seq: u32) -> Result<Vec<u8>>;

    /// Move messages of the selected folder, atomically per call
    async fn move_messages(&mut self, seqs: &[u32], dest_folder: &str) -> Result<()>;

    /// Wait for changes until `timeout` elapses or `interrupt` fires.
    /// An empty result means the wait timed out.
    async fn long_poll_wait(
        &mut self,
        timeout: Duration,
        interrupt: &Receiver<Interrupt>,
    ) -> Result<Vec<ChangeEvent>>;
}

/// Header fields the classifier cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeaders {
    pub message_id: Option<String>,
    pub parent_id: Option<String>,
    pub is_protocol_message: bool,
}

/// Extract identifiers and the chat marker from a header block or a full message.
/// Header names match case-insensitively.
pub fn parse_headers(raw: &[u8]) -> Result<ParsedHeaders> {
    let (headers, _) = mailparse::parse_headers(raw)?;

    let message_id = headers
        .get_first_value("Message-ID")
        .as_deref()
        .and_then(normalize_message_id);
    let parent_id = headers
        .get_first_value("In-Reply-To")
        .as_deref()
        .and_then(normalize_message_id);
    let is_protocol_message = headers.get_first_header("Chat-Version").is_some();

    Ok(ParsedHeaders {
        message_id,
        parent_id,
        is_protocol_message,
    })
}
