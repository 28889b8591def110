//! Seams to the motion collaborators
//!
//! The core decides *where* an agent should go. Turning a target into a
//! velocity, moving the leader, and keeping the final command
//! collision-free belong to the harness; these traits are the contract.

use crate::types::{AgentDescriptor, Point, Pose, Velocity};
use std::f64::consts::{PI, TAU};

/// Turn a target point into a velocity command
pub trait Steering {
    fn steer_to(&self, pose: &Pose, target: Point, nominal_speed: f64) -> Velocity;
}

/// Produce the leader's own motion (patrol, waypoints, teleop, ...)
pub trait LeaderMotion {
    fn command(&mut self, leader: &AgentDescriptor) -> Velocity;
}

/// Adjust a raw command before it is applied (collision avoidance)
pub trait SafetyFilter {
    fn filter(&mut self, agent: &AgentDescriptor, raw: Velocity, neighbors: &[Pose]) -> Velocity;
}

/// Wrap an angle to `[-pi, pi)`
pub fn wrap_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(TAU) - PI
}

/// Bearing pursuit with `tanh` speed shaping.
///
/// Forward speed is `nominal * tanh(distance)`: saturated far away,
/// vanishing on the target. Turn rate is `turn_gain * heading_error`.
#[derive(Debug, Clone, Copy)]
pub struct TanhPursuit {
    pub turn_gain: f64,
}

impl Default for TanhPursuit {
    fn default() -> Self {
        Self { turn_gain: 2.0 }
    }
}

impl Steering for TanhPursuit {
    fn steer_to(&self, pose: &Pose, target: Point, nominal_speed: f64) -> Velocity {
        let dx = target.x - pose.x;
        let dy = target.y - pose.y;
        let distance = dx.hypot(dy);

        let bearing = dy.atan2(dx);
        let error = wrap_angle(bearing - pose.heading);

        Velocity {
            linear: nominal_speed * distance.tanh().max(0.0),
            angular: self.turn_gain * error,
        }
    }
}

/// Leader that stays put
#[derive(Debug, Clone, Copy, Default)]
pub struct Hold;

impl LeaderMotion for Hold {
    fn command(&mut self, _leader: &AgentDescriptor) -> Velocity {
        Velocity::ZERO
    }
}

/// Safety filter that applies the raw command unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl SafetyFilter for Passthrough {
    fn filter(&mut self, _agent: &AgentDescriptor, raw: Velocity, _neighbors: &[Pose]) -> Velocity {
        raw
    }
}
