//! Motion collaborators for the simulated fleet
//!
//! Unicycle integration, leader patrol generators and a time-to-collision
//! brake used as the safety filter.

use klin_core::steering::{wrap_angle, LeaderMotion, SafetyFilter};
use klin_core::{AgentDescriptor, AgentId, Point, Pose, Velocity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Advance a unicycle by `dt` seconds under `cmd`
pub fn integrate(pose: &Pose, cmd: Velocity, dt: f64) -> Pose {
    Pose {
        x: pose.x + cmd.linear * pose.heading.cos() * dt,
        y: pose.y + cmd.linear * pose.heading.sin() * dt,
        heading: wrap_angle(pose.heading + cmd.angular * dt),
    }
}

/// Turn a desired travel direction into a unicycle command
fn track_heading(pose: &Pose, yaw: f64, gain: f64, v_cap: f64, w_max: f64) -> Velocity {
    let error = wrap_angle(yaw - pose.heading);
    Velocity {
        linear: (error.cos() * gain).max(0.0).min(v_cap.max(0.0)),
        angular: error.max(-w_max).min(w_max),
    }
}

/// Which leader motion the harness runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MotionKind {
    /// Leader stands still
    Hold,
    /// Clockwise circle patrol
    Circle,
    /// Fixed waypoint route
    Waypoints,
}

impl MotionKind {
    pub fn build(self) -> Box<dyn LeaderMotion + Send> {
        match self {
            MotionKind::Hold => Box::new(klin_core::steering::Hold),
            MotionKind::Circle => Box::new(CirclePatrol::default()),
            MotionKind::Waypoints => Box::new(WaypointPatrol::default()),
        }
    }
}

/// Clockwise patrol around a circle with radial correction
#[derive(Debug, Clone)]
pub struct CirclePatrol {
    pub center: Point,
    pub radius: f64,
    /// Speed along the tangent
    pub tangential: f64,
    /// Pull back toward the circle per meter of radial error
    pub radial_gain: f64,
    /// Cruise speed cap, below follower caps so the wedge can keep up
    pub cruise_speed: f64,
}

impl Default for CirclePatrol {
    fn default() -> Self {
        Self {
            center: Point::new(10.0, 10.0),
            radius: 6.0,
            tangential: 0.8,
            radial_gain: 0.8,
            cruise_speed: 0.5,
        }
    }
}

impl LeaderMotion for CirclePatrol {
    fn command(&mut self, leader: &AgentDescriptor) -> Velocity {
        let pose = leader.pose;
        let dx = pose.x - self.center.x;
        let dy = pose.y - self.center.y;
        let r = dx.hypot(dy) + 1e-9;

        let (tx, ty) = (dy / r, -dx / r);
        let (rx, ry) = (dx / r, dy / r);
        let v_r = -self.radial_gain * (r - self.radius);

        let vx = self.tangential * tx + v_r * rx;
        let vy = self.tangential * ty + v_r * ry;

        let v_cap = leader.limits.v_max.min(self.cruise_speed);
        track_heading(&pose, vy.atan2(vx), 1.2, v_cap, leader.limits.w_max)
    }
}

/// Drive through a list of waypoints, holding at the last one
#[derive(Debug, Clone)]
pub struct WaypointPatrol {
    pub waypoints: Vec<Point>,
    /// Switch to the next waypoint inside this radius
    pub tolerance: f64,
    pub cruise_speed: f64,
    // Route progress per leader; a new leader starts from the beginning
    progress: HashMap<AgentId, usize>,
}

impl Default for WaypointPatrol {
    fn default() -> Self {
        Self::new(vec![
            Point::new(1.0, 2.0),
            Point::new(5.0, 5.0),
            Point::new(6.0, 2.0),
            Point::new(9.0, 9.0),
        ])
    }
}

impl WaypointPatrol {
    pub fn new(waypoints: Vec<Point>) -> Self {
        Self {
            waypoints,
            tolerance: 0.15,
            cruise_speed: 0.5,
            progress: HashMap::new(),
        }
    }

    pub fn progress(&self, leader: AgentId) -> usize {
        self.progress.get(&leader).copied().unwrap_or(0)
    }
}

impl LeaderMotion for WaypointPatrol {
    fn command(&mut self, leader: &AgentDescriptor) -> Velocity {
        let here = leader.pose.position();
        let idx = self.progress.entry(leader.id).or_insert(0);

        while *idx < self.waypoints.len() && here.distance(&self.waypoints[*idx]) < self.tolerance {
            *idx += 1;
        }
        let Some(goal) = self.waypoints.get(*idx) else {
            return Velocity::ZERO;
        };

        let yaw = (goal.y - here.y).atan2(goal.x - here.x);
        let v_cap = leader.limits.v_max.min(self.cruise_speed);
        track_heading(&leader.pose, yaw, 1.2, v_cap, leader.limits.w_max)
    }
}

/// Forward-speed limiter from time-to-collision against neighbors.
///
/// Each neighbor is treated as a range reading at its bearing. Below
/// `ttc_hard` the agent stops; between `ttc_hard` and `ttc_trigger` speed
/// is capped by a deceleration ramp.
#[derive(Debug, Clone, Copy)]
pub struct TtcBrake {
    pub ttc_trigger: f64,
    pub ttc_hard: f64,
    /// Body radius plus margin, subtracted from every range
    pub clearance: f64,
    pub max_decel: f64,
}

impl Default for TtcBrake {
    fn default() -> Self {
        Self {
            ttc_trigger: 1.2,
            ttc_hard: 0.6,
            clearance: 0.15,
            max_decel: 1.5,
        }
    }
}

impl TtcBrake {
    /// Smallest time-to-collision at forward speed `v`
    pub fn min_ttc(&self, pose: &Pose, v: f64, neighbors: &[Pose]) -> f64 {
        neighbors
            .iter()
            .filter_map(|other| {
                let dx = other.x - pose.x;
                let dy = other.y - pose.y;
                let bearing = wrap_angle(dy.atan2(dx) - pose.heading);
                let closing = v * bearing.cos();
                if closing <= 1e-6 {
                    return None;
                }
                let gap = (dx.hypot(dy) - self.clearance).max(0.0);
                Some(gap / closing)
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl SafetyFilter for TtcBrake {
    fn filter(&mut self, agent: &AgentDescriptor, raw: Velocity, neighbors: &[Pose]) -> Velocity {
        let ttc = self.min_ttc(&agent.pose, raw.linear, neighbors);

        let linear = if ttc < self.ttc_hard {
            0.0
        } else if ttc < self.ttc_trigger {
            raw.linear.min((self.max_decel * (ttc - 0.1)).max(0.0))
        } else {
            raw.linear
        };

        agent.limits.clamp(Velocity {
            linear,
            angular: raw.angular,
        })
    }
}

/// Safety filter that only enforces the velocity caps
#[derive(Debug, Clone, Copy, Default)]
pub struct VelocityClamp;

impl SafetyFilter for VelocityClamp {
    fn filter(&mut self, agent: &AgentDescriptor, raw: Velocity, _neighbors: &[Pose]) -> Velocity {
        agent.limits.clamp(raw)
    }
}
