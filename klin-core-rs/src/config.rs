//! Fleet configuration
//!
//! Every field has a default; JSON config files only need to name the
//! values they override. Durations are written as float seconds.

use crate::error::{Error, Result};
use crate::types::{secs, Velocity, VelocityLimits};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete per-run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Number of agents; ids are `0..fleet_size`
    pub fleet_size: usize,

    /// Message validity on the bus
    #[serde(with = "secs")]
    pub ttl: Duration,

    /// How long a candidate waits for a higher id before self-promoting
    #[serde(with = "secs")]
    pub election_timeout: Duration,

    /// Leader heartbeat period
    #[serde(with = "secs")]
    pub heartbeat_period: Duration,

    /// Run the slot auction once a leader is known
    pub auction_enabled: bool,

    pub formation: FormationConfig,

    /// Default velocity caps for agents
    pub velocity: VelocityLimits,

    /// Floor added to bid distances
    pub bid_epsilon: f64,

    /// Follower command while it has no target
    pub idle_command: Velocity,
}

/// Wedge geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    /// Distance between consecutive ranks along a wedge arm
    pub spacing: f64,
    /// Angle between each wedge arm and the leader's backward axis
    pub wedge_angle_deg: f64,
    /// Extra distance behind the leader before rank 1
    pub back_offset: f64,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            spacing: 0.5,
            wedge_angle_deg: 45.0,
            back_offset: 0.0,
        }
    }
}

impl FormationConfig {
    pub fn wedge_angle(&self) -> f64 {
        self.wedge_angle_deg.to_radians()
    }
}

/// Timing parameters of the election state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectionTiming {
    pub election_timeout: Duration,
    pub heartbeat_period: Duration,
}

impl ElectionTiming {
    /// Leader silence tolerated before it is forgotten:
    /// `max(2.5 * heartbeat_period, election_timeout)`
    pub fn failure_timeout(&self) -> Duration {
        (self.heartbeat_period * 5 / 2).max(self.election_timeout)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_size: 5,
            ttl: Duration::from_millis(1500),
            election_timeout: Duration::from_millis(1000),
            heartbeat_period: Duration::from_millis(700),
            auction_enabled: true,
            formation: FormationConfig::default(),
            velocity: VelocityLimits::default(),
            bid_epsilon: 1e-6,
            idle_command: Velocity::new(0.1, 0.1),
        }
    }
}

impl FleetConfig {
    /// Default config for a fleet of `fleet_size`
    pub fn new(fleet_size: usize) -> Self {
        Self {
            fleet_size,
            ..Default::default()
        }
    }

    /// Load a config from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: FleetConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn with_auction(mut self, enabled: bool) -> Self {
        self.auction_enabled = enabled;
        self
    }

    pub fn with_formation(mut self, spacing: f64, wedge_angle_deg: f64, back_offset: f64) -> Self {
        self.formation = FormationConfig {
            spacing,
            wedge_angle_deg,
            back_offset,
        };
        self
    }

    pub fn with_velocity(mut self, v_max: f64, w_max: f64) -> Self {
        self.velocity = VelocityLimits { v_max, w_max };
        self
    }

    pub fn timing(&self) -> ElectionTiming {
        ElectionTiming {
            election_timeout: self.election_timeout,
            heartbeat_period: self.heartbeat_period,
        }
    }

    /// Number of formation slots (`fleet_size - 1`)
    pub fn slot_count(&self) -> usize {
        self.fleet_size.saturating_sub(1)
    }

    /// Reject configurations the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.fleet_size == 0 {
            return Err(invalid("fleet_size must be at least 1"));
        }
        if self.fleet_size > u32::MAX as usize {
            return Err(invalid("fleet_size exceeds the agent id range"));
        }
        if self.ttl.is_zero() {
            return Err(invalid("ttl must be positive"));
        }
        if self.election_timeout.is_zero() {
            return Err(invalid("election_timeout must be positive"));
        }
        if self.heartbeat_period.is_zero() {
            return Err(invalid("heartbeat_period must be positive"));
        }

        let f = &self.formation;
        if !(f.spacing.is_finite() && f.spacing >= 0.0) {
            return Err(invalid("formation.spacing must be finite and non-negative"));
        }
        if !f.wedge_angle_deg.is_finite() || !f.back_offset.is_finite() {
            return Err(invalid("formation angles and offsets must be finite"));
        }
        if !(self.velocity.v_max >= 0.0 && self.velocity.w_max >= 0.0) {
            return Err(invalid("velocity caps must be non-negative"));
        }
        if !(self.bid_epsilon > 0.0) {
            return Err(invalid("bid_epsilon must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig(reason.to_string())
}
