//! KLIN Core Library
//!
//! Leader election and formation coordination for fleets of mobile agents.
//! Implements the Bully algorithm over a best-effort message bus with TTL
//! expiry, a first-price sealed-bid slot auction, and wedge formation geometry.

pub mod types;
pub mod error;
pub mod clock;
pub mod config;
pub mod bus;
pub mod election;
pub mod auction;
pub mod formation;
pub mod steering;
pub mod metrics;
pub mod fleet;

pub use types::*;
pub use error::{Error, Result};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ElectionTiming, FleetConfig, FormationConfig};
pub use bus::MessageBus;
pub use election::{Bully, ElectionState, Role};
pub use auction::{AgentAuctionState, AuctionBook, Award, Bid};
pub use formation::Side;
pub use steering::{LeaderMotion, SafetyFilter, Steering, TanhPursuit};
pub use metrics::{FleetMetrics, MetricsReport, PeerRegistry};
pub use fleet::{AgentOutput, CoordinationContext};
