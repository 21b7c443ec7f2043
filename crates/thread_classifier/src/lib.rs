//! Thread-aware classification of chat messages in a mailbox.
//!
//! Storage agnostic: callers provide a [`MessageLookup`] over the messages
//! they know about and apply the returned [`Classification`] themselves.

mod classify;
mod message;

pub use classify::{classify, Classification, ClassifierConfig, Decision, MessageLookup, Reason};
pub use message::{normalize_message_id, Location, Message, UnknownLocation, MOVED_SENTINEL};
