//! In-process fleet of simulated bodies
//!
//! The world owns the agents' poses and drives the coordination context:
//! each tick every live agent is stepped once in ascending id order, the
//! raw commands go through the safety filter, then all bodies move and
//! simulated time advances.

use crate::kinematics::{integrate, MotionKind};
use klin_core::steering::{LeaderMotion, SafetyFilter};
use klin_core::{
    AgentDescriptor, AgentId, AgentOutput, Clock, CoordinationContext, FleetConfig, ManualClock,
    MonotonicClock, Pose, TanhPursuit, Velocity,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Initial placement of the fleet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Layout {
    /// Row along +x starting at `origin`, `gap` apart, all facing +x
    Line { origin: (f64, f64), gap: f64 },
    /// Uniform in a box, seeded
    Scatter {
        min: (f64, f64),
        max: (f64, f64),
        seed: u64,
    },
}

impl Default for Layout {
    fn default() -> Self {
        Layout::Scatter {
            min: (6.0, 2.0),
            max: (14.0, 6.0),
            seed: 7,
        }
    }
}

impl Layout {
    pub fn poses(&self, n: usize) -> Vec<Pose> {
        match *self {
            Layout::Line { origin, gap } => (0..n)
                .map(|i| Pose::new(origin.0 + gap * i as f64, origin.1, 0.0))
                .collect(),
            Layout::Scatter { min, max, seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..n)
                    .map(|_| {
                        Pose::new(
                            rng.gen_range(min.0..=max.0),
                            rng.gen_range(min.1..=max.1),
                            rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI),
                        )
                    })
                    .collect()
            }
        }
    }
}

/// Where simulated time comes from
enum TimeSource {
    /// Advanced by the world after every tick
    Manual(Arc<ManualClock>),
    /// Wall clock; the caller paces ticks
    Realtime,
}

/// Result of one world tick
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Bus time at which the tick ran
    pub time: Duration,
    pub outputs: Vec<AgentOutput>,
    /// Poses the agents were stepped with
    pub poses: BTreeMap<AgentId, Pose>,
    /// Commands after the safety filter
    pub applied: BTreeMap<AgentId, Velocity>,
}

impl TickReport {
    pub fn leaders(&self) -> BTreeMap<AgentId, Option<AgentId>> {
        self.outputs.iter().map(|o| (o.id, o.leader_id)).collect()
    }

    /// Agents that consider themselves leader
    pub fn self_leaders(&self) -> usize {
        self.outputs
            .iter()
            .filter(|o| o.leader_id == Some(o.id))
            .count()
    }

    /// Distance from each tracking follower to its anchor
    pub fn tracking_errors(&self) -> Vec<f64> {
        self.outputs
            .iter()
            .filter_map(|o| {
                let target = o.target?;
                let pose = self.poses.get(&o.id)?;
                Some(pose.position().distance(&target))
            })
            .collect()
    }

    /// Every agent reports the same, known leader
    pub fn agreed_leader(&self) -> Option<AgentId> {
        let first = self.outputs.first()?.leader_id?;
        self.outputs
            .iter()
            .all(|o| o.leader_id == Some(first))
            .then_some(first)
    }
}

/// The simulated fleet
pub struct World {
    ctx: CoordinationContext,
    time: TimeSource,
    bodies: BTreeMap<AgentId, AgentDescriptor>,
    leader_motion: Box<dyn LeaderMotion + Send>,
    safety: Box<dyn SafetyFilter + Send>,
    steering: TanhPursuit,
    ticks: u64,
}

impl World {
    /// Discrete-time world on a manual clock
    pub fn discrete(
        config: FleetConfig,
        layout: Layout,
        motion: MotionKind,
        safety: Box<dyn SafetyFilter + Send>,
    ) -> klin_core::Result<Self> {
        let clock = Arc::new(ManualClock::new());
        Self::build(config, layout, motion, safety, clock.clone(), TimeSource::Manual(clock))
    }

    /// World on wall-clock time
    pub fn realtime(
        config: FleetConfig,
        layout: Layout,
        motion: MotionKind,
        safety: Box<dyn SafetyFilter + Send>,
    ) -> klin_core::Result<Self> {
        let clock = Arc::new(MonotonicClock::new());
        Self::build(config, layout, motion, safety, clock, TimeSource::Realtime)
    }

    fn build(
        config: FleetConfig,
        layout: Layout,
        motion: MotionKind,
        safety: Box<dyn SafetyFilter + Send>,
        clock: Arc<dyn Clock>,
        time: TimeSource,
    ) -> klin_core::Result<Self> {
        let limits = config.velocity;
        let bodies = layout
            .poses(config.fleet_size)
            .into_iter()
            .enumerate()
            .map(|(i, pose)| {
                let id = i as AgentId;
                (id, AgentDescriptor { id, pose, limits })
            })
            .collect();

        let ctx = CoordinationContext::new(config, clock)?;
        Ok(Self {
            ctx,
            time,
            bodies,
            leader_motion: motion.build(),
            safety,
            steering: TanhPursuit::default(),
            ticks: 0,
        })
    }

    pub fn context(&self) -> &CoordinationContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CoordinationContext {
        &mut self.ctx
    }

    pub fn now(&self) -> Duration {
        self.ctx.now()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn live_ids(&self) -> Vec<AgentId> {
        self.bodies.keys().copied().collect()
    }

    pub fn body(&self, id: AgentId) -> Option<&AgentDescriptor> {
        self.bodies.get(&id)
    }

    /// Stop stepping agent `id` and tell the core it is gone
    pub fn crash(&mut self, id: AgentId) -> bool {
        if self.bodies.remove(&id).is_none() {
            return false;
        }
        info!("World: agent {} crashed at {:.2}s", id, self.now().as_secs_f64());
        self.ctx.depart(id);
        true
    }

    /// Step every live agent, move the bodies by `dt`, advance time
    pub fn step(&mut self, dt: Duration) -> TickReport {
        let time = self.now();
        let mut outputs = Vec::with_capacity(self.bodies.len());
        let mut applied = BTreeMap::new();
        let poses: BTreeMap<AgentId, Pose> =
            self.bodies.iter().map(|(id, b)| (*id, b.pose)).collect();

        for (id, body) in &self.bodies {
            let out = self
                .ctx
                .step_agent(body, self.leader_motion.as_mut(), &self.steering);

            let neighbors: Vec<Pose> = poses
                .iter()
                .filter(|(other, _)| *other != id)
                .map(|(_, p)| *p)
                .collect();
            let cmd = self.safety.filter(body, out.command, &neighbors);

            applied.insert(*id, cmd);
            outputs.push(out);
        }

        let secs = dt.as_secs_f64();
        for (id, body) in self.bodies.iter_mut() {
            if let Some(cmd) = applied.get(id) {
                body.pose = integrate(&body.pose, *cmd, secs);
            }
        }

        if let TimeSource::Manual(clock) = &self.time {
            clock.advance(dt);
        }
        self.ticks += 1;
        debug!("World: tick {} at {:.2}s", self.ticks, time.as_secs_f64());

        TickReport {
            time,
            outputs,
            poses,
            applied,
        }
    }

    /// Step until `duration` of simulated time has passed.
    /// Only meaningful on a manual clock.
    pub fn run_for(&mut self, duration: Duration, dt: Duration) -> Vec<TickReport> {
        let until = self.now() + duration;
        let mut reports = Vec::new();
        while self.now() < until {
            reports.push(self.step(dt));
        }
        reports
    }

    /// Step until `done` holds for a tick or `limit` simulated time passes.
    /// Returns the tick that satisfied `done`.
    pub fn run_until<F>(&mut self, limit: Duration, dt: Duration, mut done: F) -> Option<TickReport>
    where
        F: FnMut(&TickReport) -> bool,
    {
        let until = self.now() + limit;
        while self.now() <= until {
            let report = self.step(dt);
            if done(&report) {
                return Some(report);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::VelocityClamp;

    const DT: Duration = Duration::from_millis(50);

    fn world(n: usize) -> World {
        World::discrete(
            FleetConfig::new(n),
            Layout::Line {
                origin: (0.0, 0.0),
                gap: 2.0,
            },
            MotionKind::Hold,
            Box::new(VelocityClamp),
        )
        .unwrap()
    }

    #[test]
    fn test_layouts() {
        let line = Layout::Line {
            origin: (1.0, 2.0),
            gap: 0.5,
        }
        .poses(3);
        assert_eq!(line[2], Pose::new(2.0, 2.0, 0.0));

        let a = Layout::default().poses(4);
        let b = Layout::default().poses(4);
        assert_eq!(a, b);
        assert!(a.iter().all(|p| (6.0..=14.0).contains(&p.x)));
    }

    #[test]
    fn test_step_advances_time() {
        let mut world = world(3);
        let report = world.step(DT);
        assert_eq!(report.time, Duration::ZERO);
        assert_eq!(report.outputs.len(), 3);
        assert_eq!(world.now(), DT);
        assert_eq!(world.ticks(), 1);
    }

    #[test]
    fn test_idle_followers_drift() {
        let mut world = world(2);
        let before = world.body(0).unwrap().pose;
        world.step(DT);
        let after = world.body(0).unwrap().pose;
        assert!(after.x > before.x);
        assert!(after.heading > before.heading);
    }

    #[test]
    fn test_fleet_settles_on_highest_id() {
        let mut world = world(4);
        let settled = world.run_until(Duration::from_secs(3), DT, |r| r.agreed_leader() == Some(3));
        assert!(settled.is_some());
    }

    #[test]
    fn test_crash_removes_agent() {
        let mut world = world(3);
        world.run_for(Duration::from_secs(2), DT);
        assert!(world.crash(2));
        assert!(!world.crash(2));
        assert_eq!(world.live_ids(), vec![0, 1]);
        assert!(!world.context().peers().contains(2));

        let report = world.step(DT);
        assert_eq!(report.outputs.len(), 2);
    }
}
