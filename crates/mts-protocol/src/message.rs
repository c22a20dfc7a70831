/// Message model: the application payload and the delivery-side wrappers.
///
/// `AclMessage` is what agents exchange. `SingleMessage` adds the envelope
/// metadata the engine needs (trace id, enqueue time, deadline, cached
/// encoding). `Message` is the closed sum the outbound queue carries:
/// one message, or an ordered batch for a single receiver.
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::types::{now_ms, AgentId};

/// User parameter that opts a message out of failure notifications.
pub const IGNORE_FAILURE_PARAM: &str = "X-MTS-ignore-failure";

/// Encoding name recorded when the engine encodes a payload itself.
pub const DEFAULT_ENCODING: &str = "msgpack";

/// Communicative act of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Performative {
    AcceptProposal,
    Agree,
    Cancel,
    Cfp,
    Confirm,
    Disconfirm,
    Failure,
    Inform,
    NotUnderstood,
    Propose,
    QueryIf,
    QueryRef,
    Refuse,
    RejectProposal,
    Request,
    Subscribe,
}

// ── AclMessage ─────────────────────────────────────────────────────────

/// Application-level message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclMessage {
    pub performative: Performative,
    pub sender: AgentId,
    pub receivers: Vec<AgentId>,
    /// Where replies should go instead of the sender, if non-empty.
    pub reply_to: Vec<AgentId>,
    pub content: String,
    pub language: Option<String>,
    pub ontology: Option<String>,
    pub conversation_id: Option<String>,
    pub reply_with: Option<String>,
    pub in_reply_to: Option<String>,
    pub user_params: BTreeMap<String, String>,
}

impl AclMessage {
    pub fn new(performative: Performative, sender: AgentId) -> Self {
        Self {
            performative,
            sender,
            receivers: Vec::new(),
            reply_to: Vec::new(),
            content: String::new(),
            language: None,
            ontology: None,
            conversation_id: None,
            reply_with: None,
            in_reply_to: None,
            user_params: BTreeMap::new(),
        }
    }

    pub fn with_receiver(mut self, receiver: AgentId) -> Self {
        if !self.receivers.contains(&receiver) {
            self.receivers.push(receiver);
        }
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_reply_with(mut self, reply_with: impl Into<String>) -> Self {
        self.reply_with = Some(reply_with.into());
        self
    }

    /// Whether the sender asked not to be told about delivery failures.
    pub fn ignore_failure(&self) -> bool {
        self.user_params
            .get(IGNORE_FAILURE_PARAM)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn set_ignore_failure(&mut self, ignore: bool) {
        if ignore {
            self.user_params
                .insert(IGNORE_FAILURE_PARAM.to_string(), "true".to_string());
        } else {
            self.user_params.remove(IGNORE_FAILURE_PARAM);
        }
    }

    /// Build the skeleton of a reply sent by `responder`.
    ///
    /// Receivers are the `reply_to` set when present, the sender otherwise.
    /// Conversation id is kept; `in_reply_to` echoes `reply_with`.
    pub fn create_reply(&self, performative: Performative, responder: AgentId) -> AclMessage {
        let mut reply = AclMessage::new(performative, responder);
        reply.receivers = if self.reply_to.is_empty() {
            vec![self.sender.clone()]
        } else {
            self.reply_to.clone()
        };
        reply.language = self.language.clone();
        reply.ontology = self.ontology.clone();
        reply.conversation_id = self.conversation_id.clone();
        reply.in_reply_to = self.reply_with.clone();
        reply
    }
}

// ── Capability shared by every shape of message ────────────────────────

/// What the delivery machinery needs to know about anything it queues.
pub trait Deliverable {
    /// Estimated size in bytes, used for queue accounting.
    fn payload_size(&self) -> usize;
    /// Number of application messages carried.
    fn item_count(&self) -> usize;
    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

// ── SingleMessage ──────────────────────────────────────────────────────

/// One application message plus delivery metadata.
#[derive(Debug, Clone)]
pub struct SingleMessage {
    id: String,
    acl: AclMessage,
    /// Pre-encoded payload, filled before an out-of-process hop.
    encoded: Option<Bytes>,
    encoding: Option<String>,
    trace_id: Option<String>,
    /// Unix ms at which the outbound queue accepted the message.
    enqueued_at: Option<u64>,
    deadline: Option<Instant>,
    /// Receiver lives outside this platform: route through a transport.
    foreign_receiver: bool,
}

impl SingleMessage {
    pub fn new(acl: AclMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            acl,
            encoded: None,
            encoding: None,
            trace_id: None,
            enqueued_at: None,
            deadline: None,
            foreign_receiver: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn acl(&self) -> &AclMessage {
        &self.acl
    }

    pub fn sender(&self) -> &AgentId {
        &self.acl.sender
    }

    /// Receivers the sender addressed (not necessarily the one being served).
    pub fn intended_receivers(&self) -> &[AgentId] {
        &self.acl.receivers
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn enqueued_at(&self) -> Option<u64> {
        self.enqueued_at
    }

    pub(crate) fn mark_enqueued(&mut self) {
        self.enqueued_at = Some(now_ms());
    }

    pub fn is_foreign_receiver(&self) -> bool {
        self.foreign_receiver
    }

    pub fn set_foreign_receiver(&mut self, foreign: bool) {
        self.foreign_receiver = foreign;
    }

    pub fn encoded(&self) -> Option<&Bytes> {
        self.encoded.as_ref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// Attach an externally produced encoding of the payload.
    pub fn set_encoded(&mut self, bytes: Bytes, encoding: impl Into<String>) {
        self.encoded = Some(bytes);
        self.encoding = Some(encoding.into());
    }

    /// Encoded payload, encoding it once with the default codec if needed.
    pub fn encode(&mut self) -> Result<Bytes, DeliveryError> {
        if let Some(bytes) = &self.encoded {
            return Ok(bytes.clone());
        }
        let bytes = Bytes::from(rmp_serde::to_vec_named(&self.acl)?);
        self.encoded = Some(bytes.clone());
        self.encoding = Some(DEFAULT_ENCODING.to_string());
        Ok(bytes)
    }
}

impl Deliverable for SingleMessage {
    /// Encoded length when known, content length otherwise. Never zero, so
    /// every queued message counts against the queue bound.
    fn payload_size(&self) -> usize {
        let size = match &self.encoded {
            Some(bytes) => bytes.len(),
            None => self.acl.content.len(),
        };
        size.max(1)
    }

    fn item_count(&self) -> usize {
        1
    }

    fn describe(&self) -> String {
        let mut s = format!(
            "({:?} id={} sender={} conv={})",
            self.acl.performative,
            self.id,
            self.acl.sender,
            self.acl.conversation_id.as_deref().unwrap_or("-"),
        );
        if let Some(trace) = &self.trace_id {
            s.push_str(&format!(" trace={trace}"));
        }
        s
    }
}

// ── MessageBatch ───────────────────────────────────────────────────────

/// Ordered messages for one receiver, delivered in a single pass.
#[derive(Debug, Clone, Default)]
pub struct MessageBatch {
    messages: Vec<SingleMessage>,
    size: usize,
}

impl MessageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: SingleMessage) {
        self.size += message.payload_size();
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[SingleMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<SingleMessage> {
        self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Deliverable for MessageBatch {
    fn payload_size(&self) -> usize {
        self.size
    }

    fn item_count(&self) -> usize {
        self.messages.len()
    }

    fn describe(&self) -> String {
        format!("(batch of {} messages, {} bytes)", self.messages.len(), self.size)
    }
}

// ── Message ────────────────────────────────────────────────────────────

/// What one deliverer invocation carries.
#[derive(Debug, Clone)]
pub enum Message {
    Single(SingleMessage),
    Batch(MessageBatch),
}

impl Message {
    /// Constituent messages in delivery order.
    pub fn messages(&self) -> &[SingleMessage] {
        match self {
            Message::Single(m) => std::slice::from_ref(m),
            Message::Batch(b) => b.messages(),
        }
    }

    pub fn into_messages(self) -> Vec<SingleMessage> {
        match self {
            Message::Single(m) => vec![m],
            Message::Batch(b) => b.into_messages(),
        }
    }

    /// Earliest deadline among the constituents.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.messages().iter().filter_map(|m| m.deadline()).min()
    }

    /// Build the smallest shape for `messages`: a single when there is one.
    ///
    /// Returns `None` for an empty list.
    pub fn from_messages(mut messages: Vec<SingleMessage>) -> Option<Self> {
        match messages.len() {
            0 => None,
            1 => messages.pop().map(Message::Single),
            _ => {
                let mut batch = MessageBatch::new();
                for m in messages {
                    batch.push(m);
                }
                Some(Message::Batch(batch))
            }
        }
    }
}

impl From<SingleMessage> for Message {
    fn from(message: SingleMessage) -> Self {
        Message::Single(message)
    }
}

impl Deliverable for Message {
    fn payload_size(&self) -> usize {
        match self {
            Message::Single(m) => m.payload_size(),
            Message::Batch(b) => b.payload_size(),
        }
    }

    fn item_count(&self) -> usize {
        match self {
            Message::Single(m) => m.item_count(),
            Message::Batch(b) => b.item_count(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Message::Single(m) => m.describe(),
            Message::Batch(b) => b.describe(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inform(content: &str) -> SingleMessage {
        SingleMessage::new(
            AclMessage::new(Performative::Inform, AgentId::new("s@home"))
                .with_receiver(AgentId::new("r@home"))
                .with_content(content),
        )
    }

    #[test]
    fn single_capabilities() {
        let m = inform("hello");
        assert_eq!(m.payload_size(), 5);
        assert_eq!(inform("").payload_size(), 1, "empty content still counts");
        assert_eq!(m.item_count(), 1);
        assert!(m.describe().contains("Inform"));
        assert!(m.describe().contains("s@home"));
    }

    #[test]
    fn batch_accumulates_size_and_count() {
        let mut b = MessageBatch::new();
        b.push(inform("ab"));
        b.push(inform("cde"));
        assert_eq!(b.payload_size(), 5);
        assert_eq!(b.item_count(), 2);
        assert_eq!(b.describe(), "(batch of 2 messages, 5 bytes)");
    }

    #[test]
    fn from_messages_picks_shape() {
        assert!(Message::from_messages(vec![]).is_none());
        assert!(matches!(
            Message::from_messages(vec![inform("a")]),
            Some(Message::Single(_))
        ));
        match Message::from_messages(vec![inform("a"), inform("b")]) {
            Some(Message::Batch(b)) => {
                assert_eq!(b.messages()[0].acl().content, "a");
                assert_eq!(b.messages()[1].acl().content, "b");
            }
            other => panic!("expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn encode_is_cached_and_resizes() {
        let mut m = inform("payload");
        assert!(m.encoded().is_none());
        let first = m.encode().unwrap();
        let second = m.encode().unwrap();
        assert_eq!(first, second);
        assert_eq!(m.encoding(), Some(DEFAULT_ENCODING));
        assert_eq!(m.payload_size(), first.len());

        let decoded: AclMessage = rmp_serde::from_slice(&first).unwrap();
        assert_eq!(&decoded, m.acl());
    }

    #[test]
    fn ignore_failure_flag() {
        let mut acl = AclMessage::new(Performative::Request, AgentId::new("s@home"));
        assert!(!acl.ignore_failure());
        acl.set_ignore_failure(true);
        assert!(acl.ignore_failure());
        acl.set_ignore_failure(false);
        assert!(!acl.ignore_failure());
    }

    #[test]
    fn reply_goes_to_reply_to_when_set() {
        let mut acl = AclMessage::new(Performative::Request, AgentId::new("s@home"))
            .with_conversation_id("c1")
            .with_reply_with("r1");
        let reply = acl.create_reply(Performative::Failure, AgentId::system("home"));
        assert_eq!(reply.receivers, vec![AgentId::new("s@home")]);
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
        assert_eq!(reply.in_reply_to.as_deref(), Some("r1"));

        acl.reply_to = vec![AgentId::new("other@home")];
        let reply = acl.create_reply(Performative::Failure, AgentId::system("home"));
        assert_eq!(reply.receivers, vec![AgentId::new("other@home")]);
    }

    #[test]
    fn earliest_deadline_of_batch() {
        let now = Instant::now();
        let late = inform("a").with_deadline(now + Duration::from_secs(10));
        let early = inform("b").with_deadline(now + Duration::from_secs(1));
        let none = inform("c");
        let msg = Message::from_messages(vec![late, early, none]).unwrap();
        assert_eq!(msg.earliest_deadline(), Some(now + Duration::from_secs(1)));
        assert!(!msg.messages()[1].is_expired(now));
        assert!(msg.messages()[1].is_expired(now + Duration::from_secs(2)));
    }
}
