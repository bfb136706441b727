//! Ordered message queue with durable persistence
//!
//! A [`MessageQueue`] owns its [`Message`]s in insertion order, which is also
//! the order they are sent in. The pending queue is persisted as one versioned
//! record:
//!
//! ```text
//! {"version":1,"messages":[{"identifiers":{..},"event":{..}}, ...]}
//! ```
//!
//! Saving is suppressed while nothing changed since the last successful save.

mod message;

pub use message::{Message, MessageChanged};

use message::StoredMessage;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::KeyValueStore;
use crate::error::{Error, Result};
use crate::types::IdKind;

/// Storage key of the pending queue record
pub const PENDING_QUEUE_KEY: &str = "queue.pending";

/// Version written into every stored queue record
pub const QUEUE_FORMAT_VERSION: u32 = 1;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning handle naming a queue instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Deserialize)]
struct StoredQueue {
    version: u32,
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

/// Ordered collection of messages.
#[derive(Debug)]
pub struct MessageQueue {
    id: QueueId,
    storage_key: String,
    messages: VecDeque<Message>,
    dirty: bool,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Creates an empty queue persisted under [`PENDING_QUEUE_KEY`]
    pub fn new() -> Self {
        Self::with_storage_key(PENDING_QUEUE_KEY)
    }

    pub fn with_storage_key(key: impl Into<String>) -> Self {
        Self {
            id: QueueId::next(),
            storage_key: key.into(),
            messages: VecDeque::new(),
            dirty: false,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if contents changed since the last save or load
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Appends a message at the tail and makes this queue its owner.
    pub fn add(&mut self, mut message: Message) {
        message.attach(self.id);
        self.messages.push_back(message);
        self.dirty = true;
    }

    /// Moves every message of `other` in front of this queue's messages,
    /// keeping their relative order. `other` is empty afterwards.
    ///
    /// With `change_ownership` the moved messages report mutations to this queue.
    pub fn prepend(&mut self, other: &mut MessageQueue, change_ownership: bool) {
        if other.messages.is_empty() {
            return;
        }

        let mut moved = std::mem::take(&mut other.messages);
        if change_ownership {
            for message in moved.iter_mut() {
                message.attach(self.id);
            }
        }
        moved.append(&mut self.messages);
        self.messages = moved;

        self.dirty = true;
        other.dirty = true;
    }

    /// Detaches every message into a new queue which becomes their owner.
    ///
    /// Used to form an outgoing batch; this queue is left empty.
    pub fn take_all(&mut self) -> MessageQueue {
        let mut batch = MessageQueue::with_storage_key(self.storage_key.clone());
        batch.prepend(self, true);
        batch.dirty = false;
        batch
    }

    /// Releases every message. With a store, the durable copy is erased too.
    pub fn clear(&mut self, storage: Option<&dyn KeyValueStore>) -> Result<()> {
        self.messages.clear();
        match storage {
            Some(store) => {
                store.remove(&self.storage_key)?;
                self.dirty = false;
            }
            None => self.dirty = true,
        }
        Ok(())
    }

    /// Releases every message without touching durable storage.
    pub fn destroy(&mut self) {
        self.messages.clear();
        self.dirty = true;
    }

    /// Persists the queue if it changed since the last save.
    ///
    /// Returns true if a write was performed.
    pub fn save(&mut self, store: &dyn KeyValueStore) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }

        let record = self.encode_record(None)?;
        store.set_string(&self.storage_key, &record)?;
        self.dirty = false;

        tracing::debug!(
            key = %self.storage_key,
            messages = self.messages.len(),
            bytes = record.len(),
            "Saved message queue"
        );
        Ok(true)
    }

    /// Builds the storage record for this queue.
    ///
    /// `ahead` is a JSON array of messages, as produced by
    /// [`MessageQueue::to_json`], stored in front of this queue's messages.
    pub fn encode_record(&mut self, ahead: Option<&str>) -> Result<String> {
        let own = self.to_json()?;
        let messages = match ahead {
            Some(ahead) => splice_arrays(ahead, &own),
            None => own,
        };
        Ok(format!(
            "{{\"version\":{},\"messages\":{}}}",
            QUEUE_FORMAT_VERSION, messages
        ))
    }

    /// Marks the contents as written by a save done outside this queue.
    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Forces the next save to write.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Replaces the contents with the stored record.
    ///
    /// Absent, unreadable or corrupt records load as an empty queue.
    /// Returns the number of messages loaded.
    pub fn load(&mut self, store: &dyn KeyValueStore) -> usize {
        self.messages.clear();
        self.dirty = false;

        let raw = match store.get_string(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!(key = %self.storage_key, error = %e, "Failed to read stored queue");
                return 0;
            }
        };

        match decode_record(&raw) {
            Ok(stored) => {
                for message in stored {
                    self.add(Message::from_stored(message));
                }
                self.dirty = false;
                tracing::info!(
                    key = %self.storage_key,
                    messages = self.messages.len(),
                    "Loaded message queue"
                );
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.storage_key,
                    error = %e,
                    "Discarding unreadable stored queue"
                );
            }
        }

        self.messages.len()
    }

    /// Serializes all messages as a JSON array in queue order.
    pub fn to_json(&mut self) -> Result<String> {
        let mut json = String::from("[");
        for (i, message) in self.messages.iter_mut().enumerate() {
            if i > 0 {
                json.push(',');
            }
            json.push_str(message.to_json()?);
        }
        json.push(']');
        Ok(json)
    }

    /// Applies an identifier update to every resident message.
    ///
    /// Returns the number of messages that changed.
    pub fn update_identifier(&mut self, kind: IdKind, value: &str) -> usize {
        let notices: Vec<MessageChanged> = self
            .messages
            .iter_mut()
            .filter_map(|message| message.update_identifier(kind, value))
            .collect();

        for notice in &notices {
            self.on_message_changed(notice);
        }
        notices.len()
    }

    /// Checks if at least one message has the given event type.
    pub fn has_event_type(&self, event_type: &str) -> bool {
        self.messages.iter().any(|m| m.event_type() == event_type)
    }

    fn on_message_changed(&mut self, notice: &MessageChanged) {
        if notice.queue != Some(self.id) {
            tracing::trace!(queue = ?notice.queue, "Resident message owned by another queue changed");
        }
        self.dirty = true;
    }
}

/// Joins two JSON arrays, keeping the elements of `front` first.
fn splice_arrays(front: &str, back: &str) -> String {
    let inner = |array: &str| -> String {
        array
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or("")
            .trim()
            .to_string()
    };
    let (front, back) = (inner(front), inner(back));
    match (front.is_empty(), back.is_empty()) {
        (true, _) => format!("[{}]", back),
        (_, true) => format!("[{}]", front),
        _ => format!("[{},{}]", front, back),
    }
}

fn decode_record(raw: &str) -> Result<Vec<StoredMessage>> {
    let record: StoredQueue = serde_json::from_str(raw)?;
    if record.version != QUEUE_FORMAT_VERSION {
        return Err(Error::UnsupportedFormat {
            found: record.version,
            expected: QUEUE_FORMAT_VERSION,
        });
    }
    Ok(record.messages)
}
