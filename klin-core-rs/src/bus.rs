//! Shared message bus with time-to-live expiry
//!
//! One bus per fleet. Sending appends a timestamped message; there is no
//! acknowledgement and no delivery guarantee. A live message may be read
//! any number of times by any agent it addresses until it expires.
//!
//! Expiry is shared state: `receive` first drops every stored message
//! older than the caller's `ttl`, regardless of who it was for. Callers
//! must use one fleet-wide `ttl`; mixing values makes pruning depend on
//! call order.

use crate::clock::{Clock, MonotonicClock};
use crate::types::{AgentId, Destination, Message, MessageKind, Outgoing, Payload};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Decides whether a sent message is stored (`true`) or lost (`false`)
pub type SendFilter = Box<dyn FnMut(&Message) -> bool + Send>;

/// In-process best-effort message bus
pub struct MessageBus {
    clock: Arc<dyn Clock>,
    messages: Vec<Message>,
    next_seq: u64,
    sent: BTreeMap<MessageKind, u64>,
    dropped: u64,
    send_filter: Option<SendFilter>,
}

impl MessageBus {
    /// Create a bus reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            messages: Vec::new(),
            next_seq: 1,
            sent: BTreeMap::new(),
            dropped: 0,
            send_filter: None,
        }
    }

    /// Create a bus on wall-clock time starting now
    pub fn monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }

    /// Elapsed time since the bus clock started
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Install a filter consulted on every send (fault injection)
    pub fn set_send_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.send_filter = Some(Box::new(filter));
    }

    pub fn clear_send_filter(&mut self) {
        self.send_filter = None;
    }

    /// Send to every agent
    pub fn broadcast(&mut self, src: AgentId, payload: Payload) -> u64 {
        self.push(src, Destination::Broadcast, payload)
    }

    /// Send to a single agent
    pub fn unicast(&mut self, src: AgentId, dst: AgentId, payload: Payload) -> u64 {
        self.push(src, Destination::Agent(dst), payload)
    }

    /// Send a prepared message
    pub fn send(&mut self, src: AgentId, out: Outgoing) -> u64 {
        self.push(src, out.dst, out.payload)
    }

    fn push(&mut self, src: AgentId, dst: Destination, payload: Payload) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let msg = Message {
            seq,
            src,
            dst,
            payload,
            sent_at: self.now(),
        };
        *self.sent.entry(msg.kind()).or_insert(0) += 1;

        let keep = match self.send_filter.as_mut() {
            Some(filter) => filter(&msg),
            None => true,
        };

        if keep {
            trace!("Bus: {} #{} {} -> {:?}", msg.kind(), seq, src, dst);
            self.messages.push(msg);
        } else {
            trace!("Bus: dropped {} #{} from {}", msg.kind(), seq, src);
            self.dropped += 1;
        }

        seq
    }

    /// Prune everything older than `ttl`, then return the live messages
    /// addressed to `dst` or broadcast, oldest first.
    ///
    /// The bus does not filter out the caller's own messages.
    pub fn receive(&mut self, dst: AgentId, ttl: Duration) -> Vec<Message> {
        let now = self.now();
        self.messages
            .retain(|m| now.saturating_sub(m.sent_at) <= ttl);

        self.messages
            .iter()
            .filter(|m| m.dst.reaches(dst))
            .cloned()
            .collect()
    }

    /// Sequence number of the most recent send, 0 if nothing was sent yet
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Number of messages currently stored
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages sent so far, by kind (including dropped ones)
    pub fn sent_counts(&self) -> &BTreeMap<MessageKind, u64> {
        &self.sent
    }

    /// Messages lost to the send filter
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("now", &self.now())
            .field("stored", &self.messages.len())
            .field("next_seq", &self.next_seq)
            .field("dropped", &self.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bus() -> (Arc<ManualClock>, MessageBus) {
        let clock = Arc::new(ManualClock::new());
        let bus = MessageBus::new(clock.clone());
        (clock, bus)
    }

    #[test]
    fn test_broadcast_and_unicast_delivery() {
        let (_, mut bus) = bus();
        bus.broadcast(0, Payload::Heartbeat);
        bus.unicast(0, 2, Payload::Answer);

        let ttl = Duration::from_secs(1);
        assert_eq!(bus.receive(1, ttl).len(), 1);
        let inbox = bus.receive(2, ttl);
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[1].payload, Payload::Answer);
    }

    #[test]
    fn test_sender_sees_own_broadcast() {
        let (_, mut bus) = bus();
        bus.broadcast(3, Payload::Victory);
        let inbox = bus.receive(3, Duration::from_secs(1));
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].src, 3);
    }

    #[test]
    fn test_messages_expire_after_ttl() {
        let (clock, mut bus) = bus();
        let ttl = Duration::from_millis(1500);
        bus.broadcast(0, Payload::Heartbeat);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(bus.receive(1, ttl).len(), 1);

        clock.advance(Duration::from_millis(1));
        assert!(bus.receive(1, ttl).is_empty());
        assert!(bus.is_empty());
    }

    #[test]
    fn test_pruning_is_global() {
        let (clock, mut bus) = bus();
        bus.unicast(0, 1, Payload::Election);
        clock.advance(Duration::from_millis(500));

        // Agent 2 prunes with a short ttl; agent 1 loses its message too.
        assert!(bus.receive(2, Duration::from_millis(100)).is_empty());
        assert!(bus.receive(1, Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (_, mut bus) = bus();
        assert_eq!(bus.last_seq(), 0);
        let a = bus.broadcast(0, Payload::Heartbeat);
        let b = bus.unicast(1, 0, Payload::Answer);
        assert!(b > a);
        assert_eq!(bus.last_seq(), b);
    }

    #[test]
    fn test_send_filter_drops_messages() {
        let (_, mut bus) = bus();
        bus.set_send_filter(|m| m.kind() != MessageKind::Heartbeat);

        bus.broadcast(4, Payload::Heartbeat);
        bus.broadcast(4, Payload::Victory);

        let inbox = bus.receive(0, Duration::from_secs(1));
        assert_eq!(inbox.len(), 1);
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.sent_counts()[&MessageKind::Heartbeat], 1);

        bus.clear_send_filter();
        bus.broadcast(4, Payload::Heartbeat);
        assert_eq!(bus.receive(0, Duration::from_secs(1)).len(), 2);
    }
}
