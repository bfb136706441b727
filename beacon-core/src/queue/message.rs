//! A single event paired with the identifiers known when it was tracked

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Event, IdKind, Identifiers};

use super::QueueId;

/// One queued message: an event plus a copy of the identifiers.
///
/// The serialized form `{"identifiers":{..},"event":{..}}` is cached until the
/// next mutation. The `queue` handle names the queue to notify on mutation; it
/// never controls the message's lifetime.
#[derive(Debug, Clone)]
pub struct Message {
    ids: Identifiers,
    event: Event,
    queue: Option<QueueId>,
    json: Option<String>,
}

/// Mutation notice for the queue holding a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageChanged {
    pub queue: Option<QueueId>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    identifiers: &'a Identifiers,
    event: &'a Event,
}

#[derive(Deserialize)]
pub(crate) struct StoredMessage {
    #[serde(default)]
    identifiers: Identifiers,
    event: Event,
}

impl Message {
    /// Creates a message; `ids` is copied.
    pub fn new(ids: &Identifiers, event: Event) -> Self {
        Self {
            ids: ids.clone(),
            event,
            queue: None,
            json: None,
        }
    }

    pub(crate) fn from_stored(stored: StoredMessage) -> Self {
        Self {
            ids: stored.identifiers,
            event: stored.event,
            queue: None,
            json: None,
        }
    }

    /// The event tag, or `""` if it cannot be determined.
    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn identifiers(&self) -> &Identifiers {
        &self.ids
    }

    /// Queue this message reports mutations to
    pub fn queue(&self) -> Option<QueueId> {
        self.queue
    }

    pub(crate) fn attach(&mut self, queue: QueueId) {
        self.queue = Some(queue);
    }

    /// True if the cached serialized form is missing or stale
    pub fn is_dirty(&self) -> bool {
        self.json.is_none()
    }

    /// Updates one identifier following the kind's overwrite policy.
    ///
    /// Returns a notice for the owning queue if the message changed.
    pub fn update_identifier(&mut self, kind: IdKind, value: &str) -> Option<MessageChanged> {
        if !self.ids.apply(kind, value) {
            return None;
        }
        self.json = None;
        Some(MessageChanged { queue: self.queue })
    }

    /// Serialized form, computed on first use after a mutation.
    pub fn to_json(&mut self) -> Result<&str> {
        let json = match self.json.take() {
            Some(json) => json,
            None => serde_json::to_string(&WireMessage {
                identifiers: &self.ids,
                event: &self.event,
            })?,
        };
        Ok(self.json.insert(json).as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        let mut ids = Identifiers::new();
        ids.set(IdKind::Install, "install-1");
        Message::new(&ids, Event::milestone("level", "3").unwrap())
    }

    #[test]
    fn test_snapshot_is_copied() {
        let mut ids = Identifiers::new();
        ids.set(IdKind::Custom, "before");
        let msg = Message::new(&ids, Event::tutorial("intro").unwrap());

        ids.set(IdKind::Custom, "after");
        assert_eq!(msg.identifiers().get(IdKind::Custom), "before");
        assert_eq!(msg.event_type(), "tutorial");
    }

    #[test]
    fn test_to_json_format_and_cache() {
        let mut msg = message();
        assert!(msg.is_dirty());

        let json: serde_json::Value = serde_json::from_str(msg.to_json().unwrap()).unwrap();
        assert!(!msg.is_dirty());
        assert_eq!(json["identifiers"], serde_json::json!({"install": "install-1"}));
        assert_eq!(json["event"]["type"], "milestone");
        assert_eq!(json["event"]["name"], "level");
    }

    #[test]
    fn test_update_invalidates_cache() {
        let mut msg = message();
        msg.to_json().unwrap();

        assert!(msg.update_identifier(IdKind::Custom, "c-1").is_some());
        assert!(msg.is_dirty());
        assert!(msg.to_json().unwrap().contains("\"custom\":\"c-1\""));

        // first-write-wins kind keeps its value and leaves the cache alone
        assert!(msg.update_identifier(IdKind::Install, "install-2").is_none());
        assert!(!msg.is_dirty());
        assert_eq!(msg.identifiers().get(IdKind::Install), "install-1");
    }

    #[test]
    fn test_clearing_an_identifier_drops_it_from_json() {
        let mut msg = message();
        msg.update_identifier(IdKind::Facebook, "fb-1");
        msg.update_identifier(IdKind::Facebook, "");
        assert!(!msg.to_json().unwrap().contains("facebook"));
    }
}
