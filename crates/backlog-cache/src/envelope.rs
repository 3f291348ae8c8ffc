// Message wrappers handed to and returned from the cache.
use backlog_common::ids::MessageId;
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::time::Instant;

/// Who a published message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// Nobody is attached: buffer for every live subscriber.
    All,
    Subscriber(String),
}

impl Recipient {
    pub fn subscriber(id: impl Into<String>) -> Self {
        Recipient::Subscriber(id.into())
    }

    pub fn as_subscriber(&self) -> Option<&str> {
        match self {
            Recipient::All => None,
            Recipient::Subscriber(id) => Some(id),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::All => f.write_str("*"),
            Recipient::Subscriber(id) => f.write_str(id),
        }
    }
}

/// A published message as seen by the cache before admission.
///
/// `original` is the payload as first published; `message` is what subscribers
/// receive after any upstream filtering. Both are visible to inspectors.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    id: Option<MessageId>,
    original: Bytes,
    message: Bytes,
}

impl BroadcastMessage {
    pub fn new(message: impl Into<Bytes>) -> Self {
        let message = message.into();
        Self {
            id: None,
            original: message.clone(),
            message,
        }
    }

    pub fn with_original(original: impl Into<Bytes>, message: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            original: original.into(),
            message: message.into(),
        }
    }

    /// Pin the id used at admission, for callers re-delivering a message they
    /// already cached once.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<MessageId> {
        self.id
    }

    pub fn original(&self) -> &Bytes {
        &self.original
    }

    pub fn message(&self) -> &Bytes {
        &self.message
    }
}

/// Envelope filed in a subscriber queue.
///
/// Equality and hashing use the id only, so two envelopes carrying the same
/// payload are still distinct unless they share an id.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    id: MessageId,
    created_at: Instant,
    payload: Bytes,
    recipient: Recipient,
}

impl CachedMessage {
    pub fn new(id: MessageId, payload: Bytes, recipient: Recipient) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            payload,
            recipient,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    // Same envelope filed under a concrete subscriber.
    pub(crate) fn addressed_to(&self, subscriber: &str) -> Self {
        Self {
            id: self.id,
            created_at: self.created_at,
            payload: self.payload.clone(),
            recipient: Recipient::subscriber(subscriber),
        }
    }
}

impl PartialEq for CachedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CachedMessage {}

impl Hash for CachedMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_compare_by_id() {
        let id = MessageId::new();
        let a = CachedMessage::new(id, Bytes::from_static(b"a"), Recipient::All);
        let b = CachedMessage::new(id, Bytes::from_static(b"b"), Recipient::subscriber("x"));
        let c = CachedMessage::new(MessageId::new(), Bytes::from_static(b"a"), Recipient::All);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn broadcast_message_keeps_original_and_filtered_payloads() {
        let msg = BroadcastMessage::with_original("raw", "filtered");
        assert_eq!(msg.original(), &Bytes::from_static(b"raw"));
        assert_eq!(msg.message(), &Bytes::from_static(b"filtered"));
        assert!(msg.id().is_none());
    }

    #[test]
    fn addressed_copy_keeps_identity() {
        let envelope = CachedMessage::new(MessageId::new(), Bytes::from_static(b"m"), Recipient::All);
        let copy = envelope.addressed_to("sub-1");
        assert_eq!(copy, envelope);
        assert_eq!(copy.recipient().as_subscriber(), Some("sub-1"));
        assert_eq!(copy.created_at(), envelope.created_at());
    }

    #[test]
    fn recipient_display() {
        assert_eq!(Recipient::All.to_string(), "*");
        assert_eq!(Recipient::subscriber("abc").to_string(), "abc");
    }
}
