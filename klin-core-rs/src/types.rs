//! Core types for the KLIN protocol

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable numeric identifier of an agent. Higher ids win elections.
pub type AgentId = u32;

/// Formation slot index, `1..N-1` for a fleet of `N`
pub type SlotId = usize;

/// A point in the plane
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Planar pose: position plus heading in radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Unit vector along the heading
    pub fn forward(&self) -> (f64, f64) {
        (self.heading.cos(), self.heading.sin())
    }

    /// Unit vector pointing to the right of the heading
    pub fn right(&self) -> (f64, f64) {
        (self.heading.sin(), -self.heading.cos())
    }
}

/// Raw velocity command for a differential-drive agent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    /// Linear velocity (m/s)
    pub linear: f64,
    /// Angular velocity (rad/s)
    pub angular: f64,
}

impl Velocity {
    pub const ZERO: Velocity = Velocity {
        linear: 0.0,
        angular: 0.0,
    };

    pub fn new(linear: f64, angular: f64) -> Self {
        Self { linear, angular }
    }
}

/// Per-agent velocity caps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityLimits {
    pub v_max: f64,
    pub w_max: f64,
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self {
            v_max: 1.0,
            w_max: 1.2,
        }
    }
}

impl VelocityLimits {
    /// Clamp a command into `[0, v_max] x [-w_max, w_max]`
    pub fn clamp(&self, cmd: Velocity) -> Velocity {
        let w_max = self.w_max.abs();
        Velocity {
            linear: cmd.linear.min(self.v_max).max(0.0),
            angular: cmd.angular.max(-w_max).min(w_max),
        }
    }
}

/// What the harness tells the core about an agent each tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub pose: Pose,
    pub limits: VelocityLimits,
}

/// Message addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Broadcast,
    Agent(AgentId),
}

impl Destination {
    /// Whether a message with this destination is visible to `agent`
    pub fn reaches(&self, agent: AgentId) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Agent(id) => *id == agent,
        }
    }
}

/// Message kind without payload, for counting and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Election,
    Answer,
    Victory,
    Heartbeat,
    Pose,
    AuctionRequest,
    Bid,
    Assign,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Election => "ELECTION",
            MessageKind::Answer => "ANSWER",
            MessageKind::Victory => "VICTORY",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Pose => "POSE",
            MessageKind::AuctionRequest => "AUCTION_REQUEST",
            MessageKind::Bid => "BID",
            MessageKind::Assign => "ASSIGN",
        };
        write!(f, "{}", name)
    }
}

/// KLIN protocol payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Challenge every higher id
    #[serde(rename = "ELECTION")]
    Election,

    /// A higher id is alive and takes over the election
    #[serde(rename = "ANSWER")]
    Answer,

    /// Sender is the new leader
    #[serde(rename = "VICTORY")]
    Victory,

    /// Leader liveness
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,

    /// Leader pose broadcast
    #[serde(rename = "POSE")]
    Pose { x: f64, y: f64, heading: f64 },

    /// Leader asks for sealed bids on pending slots of book `epoch`
    #[serde(rename = "AUCTION_REQUEST")]
    AuctionRequest {
        slots: Vec<SlotId>,
        #[serde(default)]
        epoch: u64,
    },

    /// Follower's sealed bid for one slot
    #[serde(rename = "BID")]
    Bid { slot: SlotId, price: f64 },

    /// Auction result for one slot of book `epoch`
    #[serde(rename = "ASSIGN")]
    Assign {
        slot: SlotId,
        winner: AgentId,
        price: f64,
        #[serde(default)]
        epoch: u64,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Election => MessageKind::Election,
            Payload::Answer => MessageKind::Answer,
            Payload::Victory => MessageKind::Victory,
            Payload::Heartbeat => MessageKind::Heartbeat,
            Payload::Pose { .. } => MessageKind::Pose,
            Payload::AuctionRequest { .. } => MessageKind::AuctionRequest,
            Payload::Bid { .. } => MessageKind::Bid,
            Payload::Assign { .. } => MessageKind::Assign,
        }
    }
}

impl From<Pose> for Payload {
    fn from(pose: Pose) -> Self {
        Payload::Pose {
            x: pose.x,
            y: pose.y,
            heading: pose.heading,
        }
    }
}

/// A message on the bus. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Bus-assigned sequence number, strictly increasing per bus
    pub seq: u64,
    pub src: AgentId,
    pub dst: Destination,
    #[serde(flatten)]
    pub payload: Payload,
    /// Bus time at send
    #[serde(with = "secs")]
    pub sent_at: Duration,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A message an agent wants sent, before the bus stamps it
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub dst: Destination,
    pub payload: Payload,
}

impl Outgoing {
    pub fn broadcast(payload: Payload) -> Self {
        Self {
            dst: Destination::Broadcast,
            payload,
        }
    }

    pub fn unicast(dst: AgentId, payload: Payload) -> Self {
        Self {
            dst: Destination::Agent(dst),
            payload,
        }
    }
}

/// Serde helper: `Duration` as float seconds
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message {
            seq: 7,
            src: 3,
            dst: Destination::Agent(4),
            payload: Payload::Bid {
                slot: 2,
                price: 1.25,
            },
            sent_at: Duration::from_millis(1500),
        };

        let bytes = msg.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "BID");
        assert_eq!(json["slot"], 2);
        assert_eq!(json["sent_at"], 1.5);

        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unit_payload_serialization() {
        let json = serde_json::to_string(&Payload::Victory).unwrap();
        assert_eq!(json, r#"{"type":"VICTORY"}"#);
    }

    #[test]
    fn test_assign_without_epoch_decodes() {
        let json = r#"{"type":"ASSIGN","slot":1,"winner":2,"price":0.5}"#;
        let payload: Payload = serde_json::from_str(json).unwrap();
        assert_eq!(
            payload,
            Payload::Assign {
                slot: 1,
                winner: 2,
                price: 0.5,
                epoch: 0
            }
        );
    }

    #[test]
    fn test_malformed_message_is_codec_error() {
        let err = Message::from_bytes(b"{\"type\":\"NOPE\"}").unwrap_err();
        assert!(matches!(err, crate::error::Error::Codec(_)));
    }

    #[test]
    fn test_destination_reaches() {
        assert!(Destination::Broadcast.reaches(0));
        assert!(Destination::Agent(2).reaches(2));
        assert!(!Destination::Agent(2).reaches(3));
    }

    #[test]
    fn test_limits_clamp() {
        let limits = VelocityLimits::default();
        let cmd = limits.clamp(Velocity::new(3.0, -5.0));
        assert_eq!(cmd, Velocity::new(1.0, -1.2));
        assert_eq!(limits.clamp(Velocity::new(-1.0, 0.0)).linear, 0.0);
    }
}
