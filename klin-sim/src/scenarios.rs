//! Scripted fleet scenarios with pass/fail checks

use crate::fault_injection::{CrashPlan, FaultConfig};
use crate::kinematics::{MotionKind, TtcBrake, VelocityClamp};
use crate::world::{Layout, TickReport, World};
use klin_core::steering::SafetyFilter;
use klin_core::{AgentId, FleetConfig, MetricsReport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from running scenarios and writing their reports
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Invalid scenario options: {0}")]
    InvalidOptions(String),

    #[error("Core error: {0}")]
    Core(#[from] klin_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{failed} scenario check(s) failed")]
    ChecksFailed { failed: usize },
}

/// The scripted scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Clean start, everyone must follow the highest id
    Settle,
    /// Settle, then crash the leader and fail over
    LeaderCrash,
    /// Settle and partition the slots among followers
    Auction,
    /// Settle under random message loss, then recover on a clean bus
    Lossy,
    /// Long run with a patrolling leader and a tracking wedge
    Formation,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 5] = [
        ScenarioKind::Settle,
        ScenarioKind::LeaderCrash,
        ScenarioKind::Auction,
        ScenarioKind::Lossy,
        ScenarioKind::Formation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::Settle => "settle",
            ScenarioKind::LeaderCrash => "leader-crash",
            ScenarioKind::Auction => "auction",
            ScenarioKind::Lossy => "lossy",
            ScenarioKind::Formation => "formation",
        }
    }

    fn default_duration(&self) -> Duration {
        match self {
            ScenarioKind::Settle => Duration::from_secs(5),
            ScenarioKind::LeaderCrash => Duration::from_secs(3),
            ScenarioKind::Auction => Duration::from_secs(3),
            ScenarioKind::Lossy => Duration::from_secs(30),
            ScenarioKind::Formation => Duration::from_secs(60),
        }
    }

    fn default_motion(&self) -> MotionKind {
        match self {
            ScenarioKind::Formation => MotionKind::Circle,
            _ => MotionKind::Hold,
        }
    }
}

impl FromStr for ScenarioKind {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScenarioKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| ScenarioError::UnknownScenario(s.to_string()))
    }
}

/// Safety filter used by the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SafetyKind {
    /// Time-to-collision brake
    #[default]
    Ttc,
    /// Velocity caps only
    Clamp,
}

impl SafetyKind {
    pub fn build(self) -> Box<dyn SafetyFilter + Send> {
        match self {
            SafetyKind::Ttc => Box::new(TtcBrake::default()),
            SafetyKind::Clamp => Box::new(VelocityClamp),
        }
    }
}

/// Knobs shared by all scenarios
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub config: FleetConfig,
    pub dt: Duration,
    /// Main phase length; each scenario has its own default
    pub duration: Option<Duration>,
    pub layout: Layout,
    /// Leader motion; each scenario has its own default
    pub motion: Option<MotionKind>,
    pub safety: SafetyKind,
    pub faults: FaultConfig,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            config: FleetConfig::default(),
            dt: Duration::from_millis(50),
            duration: None,
            layout: Layout::default(),
            motion: None,
            safety: SafetyKind::default(),
            faults: FaultConfig::default(),
        }
    }
}

/// One named pass/fail check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        let check = Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        };
        if check.passed {
            info!("Check {}: ok ({})", check.name, check.detail);
        } else {
            warn!("Check {}: FAILED ({})", check.name, check.detail);
        }
        check
    }
}

/// Everything a scenario run produced
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub kind: ScenarioKind,
    pub run_id: Uuid,
    pub agents: usize,
    pub ticks: u64,
    pub sim_time: Duration,
    pub checks: Vec<Check>,
    pub leaders: BTreeMap<AgentId, Option<AgentId>>,
    pub metrics: MetricsReport,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }
}

/// Run one scenario to completion
pub fn run(kind: ScenarioKind, opts: &ScenarioOptions) -> Result<ScenarioOutcome, ScenarioError> {
    opts.config.validate()?;
    if opts.dt.is_zero() {
        return Err(ScenarioError::InvalidOptions("dt must be positive".into()));
    }

    info!(
        "Scenario {}: {} agents, dt {}ms",
        kind.name(),
        opts.config.fleet_size,
        opts.dt.as_millis()
    );

    let motion = opts.motion.unwrap_or_else(|| kind.default_motion());
    let mut world = World::discrete(opts.config.clone(), opts.layout, motion, opts.safety.build())?;
    let duration = opts.duration.unwrap_or_else(|| kind.default_duration());

    let (checks, last) = match kind {
        ScenarioKind::Settle => settle(&mut world, opts.dt, duration),
        ScenarioKind::LeaderCrash => leader_crash(&mut world, opts.dt, duration)?,
        ScenarioKind::Auction => auction(&mut world, opts.dt, duration),
        ScenarioKind::Lossy => lossy(&mut world, opts, duration),
        ScenarioKind::Formation => formation(&mut world, opts.dt, duration),
    };

    let ctx = world.context();
    Ok(ScenarioOutcome {
        kind,
        run_id: ctx.run_id(),
        agents: opts.config.fleet_size,
        ticks: world.ticks(),
        sim_time: world.now(),
        checks,
        leaders: last.map(|r| r.leaders()).unwrap_or_default(),
        metrics: ctx.metrics_report(),
    })
}

type Phase = (Vec<Check>, Option<TickReport>);

fn highest(ids: &[AgentId]) -> Option<AgentId> {
    ids.iter().max().copied()
}

/// Wait for everyone to follow the highest live id
fn converge(world: &mut World, dt: Duration, limit: Duration, name: &str) -> (Check, Option<TickReport>) {
    let expected = highest(&world.live_ids());
    let start = world.now();
    let hit = world.run_until(limit, dt, |r| r.agreed_leader() == expected);

    let check = match &hit {
        Some(r) => Check::new(
            name,
            true,
            format!(
                "all follow {:?} after {:.2}s",
                expected,
                r.time.saturating_sub(start).as_secs_f64()
            ),
        ),
        None => Check::new(
            name,
            false,
            format!("no agreement on {:?} within {:.2}s", expected, limit.as_secs_f64()),
        ),
    };
    (check, hit)
}

/// Keep running; count instants with more than one self-declared leader
fn hold(world: &mut World, dt: Duration, duration: Duration) -> (Check, Option<TickReport>) {
    let reports = world.run_for(duration, dt);
    let split = reports.iter().filter(|r| r.self_leaders() > 1).count();
    let expected = highest(&world.live_ids());
    let stable = reports.iter().all(|r| r.agreed_leader() == expected);

    let check = Check::new(
        "stable-leadership",
        split == 0 && stable,
        format!("{} ticks, {} with split leadership", reports.len(), split),
    );
    (check, reports.into_iter().last())
}

fn settle(world: &mut World, dt: Duration, duration: Duration) -> Phase {
    let limit = world.context().config().election_timeout + dt * 2;
    let (converged, hit) = converge(world, dt, limit, "converged");
    let (stable, last) = hold(world, dt, duration);
    (vec![converged, stable], last.or(hit))
}

fn leader_crash(world: &mut World, dt: Duration, duration: Duration) -> Result<Phase, ScenarioError> {
    if world.live_ids().len() < 2 {
        return Err(ScenarioError::InvalidOptions(
            "leader-crash needs at least 2 agents".into(),
        ));
    }

    let config = world.context().config().clone();
    let (settled, _) = converge(world, dt, Duration::from_secs(3), "settled");

    let leader = world.context().leader_of(0);
    let plan = CrashPlan::leader_at(world.now());
    let victim = plan.victim(&world.live_ids(), leader);
    if let Some(id) = victim {
        world.crash(id);
    }

    let limit = config.timing().failure_timeout() + config.election_timeout + dt * 3;
    let (failover, hit) = converge(world, dt, limit, "failover");
    let (stable, last) = hold(world, dt, duration);

    let crashed = Check::new(
        "leader-crashed",
        victim.is_some() && victim == leader,
        format!("crashed {:?}, leader was {:?}", victim, leader),
    );
    Ok((vec![settled, crashed, failover, stable], last.or(hit)))
}

fn auction(world: &mut World, dt: Duration, duration: Duration) -> Phase {
    let slot_count = world.context().config().slot_count();
    let settled = world.run_until(duration, dt, |r| r.agreed_leader().is_some());

    // Let the awards reach the followers
    let last = world.run_until(duration, dt, |r| {
        r.outputs
            .iter()
            .filter(|o| o.leader_id != Some(o.id))
            .all(|o| o.slot.is_some())
    });

    let ctx = world.context();
    let book = ctx.book();
    let leader = settled.as_ref().and_then(|r| r.agreed_leader());

    let slots: BTreeSet<_> = book.assigned_slots().keys().copied().collect();
    let winners: BTreeSet<_> = book.assigned_slots().values().copied().collect();
    let followers: BTreeSet<_> = world
        .live_ids()
        .into_iter()
        .filter(|id| Some(*id) != leader)
        .collect();
    let expected_slots: BTreeSet<_> = (1..=slot_count).take(followers.len()).collect();

    let bijection = Check::new(
        "bijection",
        book.leader() == leader && slots == expected_slots && winners == followers,
        format!("book {:?} under leader {:?}", book.assigned_slots(), book.leader()),
    );

    let agree = last
        .as_ref()
        .map(|r| {
            r.outputs
                .iter()
                .filter(|o| o.leader_id != Some(o.id))
                .all(|o| o.slot.is_some() && o.slot == book.slot_of(o.id))
        })
        .unwrap_or(false);
    let followers_agree = Check::new(
        "followers-agree",
        agree,
        "every follower holds the slot recorded in the book",
    );

    (vec![bijection, followers_agree], last.or(settled))
}

fn lossy(world: &mut World, opts: &ScenarioOptions, duration: Duration) -> Phase {
    let dt = opts.dt;
    let faults = if opts.faults.is_lossless() {
        FaultConfig::lossy(0.1, opts.faults.seed)
    } else {
        opts.faults
    };
    faults.install(world.context_mut().bus_mut());

    let reports = world.run_for(duration, dt);
    let agreed = reports.iter().filter(|r| r.agreed_leader().is_some()).count();
    let dropped = world.context().bus().dropped_count();
    let lossy = Check::new(
        "messages-lost",
        dropped > 0,
        format!(
            "{} dropped, leader agreed on {}/{} ticks",
            dropped,
            agreed,
            reports.len()
        ),
    );

    // Clean bus: any leftover disagreement must heal
    world.context_mut().bus_mut().clear_send_filter();
    let config = world.context().config().clone();
    let window = (config.timing().failure_timeout() + config.election_timeout) * 2 + Duration::from_secs(1);
    let hit = world.run_until(window, dt, |r| {
        r.agreed_leader().is_some() && r.self_leaders() == 1
    });
    let recovered = Check::new(
        "recovered",
        hit.is_some(),
        match hit.as_ref().and_then(|r| r.agreed_leader()) {
            Some(id) => format!("all follow {} on a clean bus", id),
            None => "no agreement after loss stopped".to_string(),
        },
    );

    let mut checks = vec![lossy, recovered];
    let mut last = hit.or_else(|| reports.into_iter().last());
    if config.auction_enabled {
        // Awards are re-announced with every heartbeat
        let resync = world.run_for(config.heartbeat_period * 3, dt);
        checks.push(slots_consistent(world, resync.last()));
        last = resync.into_iter().last().or(last);
    }
    (checks, last)
}

/// Followers hold distinct slots, each matching the leader's book
fn slots_consistent(world: &World, report: Option<&TickReport>) -> Check {
    let book = world.context().book();
    let Some(report) = report else {
        return Check::new("slots-consistent", false, "no ticks ran");
    };

    let mut held = BTreeSet::new();
    let bad: Vec<AgentId> = report
        .outputs
        .iter()
        .filter(|o| o.leader_id != Some(o.id))
        .filter(|o| !(o.slot.is_some() && o.slot == book.slot_of(o.id) && held.insert(o.slot)))
        .map(|o| o.id)
        .collect();

    let detail = if bad.is_empty() {
        format!("followers match book {:?}", book.assigned_slots())
    } else {
        format!("agents {:?} disagree with book {:?}", bad, book.assigned_slots())
    };
    Check::new("slots-consistent", bad.is_empty(), detail)
}

fn formation(world: &mut World, dt: Duration, duration: Duration) -> Phase {
    let reports = world.run_for(duration, dt);
    let slot_count = world.context().config().slot_count();

    let tail = &reports[reports.len() * 2 / 3..];
    let errors: Vec<f64> = tail.iter().flat_map(|r| r.tracking_errors()).collect();
    let mean = errors.iter().sum::<f64>() / errors.len().max(1) as f64;

    let settled = world.context().book().is_settled(slot_count);
    let slots = Check::new(
        "slots-assigned",
        settled,
        format!("{:?}", world.context().book().assigned_slots()),
    );
    let tracking = Check::new(
        "tracking",
        !errors.is_empty() && mean < 2.0,
        format!("mean anchor error {:.3} over {} samples", mean, errors.len()),
    );

    (vec![slots, tracking], reports.into_iter().last())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(n: usize) -> ScenarioOptions {
        ScenarioOptions {
            config: FleetConfig::new(n),
            ..Default::default()
        }
    }

    #[test]
    fn test_scenario_names_round_trip() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.name().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert!(matches!(
            "nope".parse::<ScenarioKind>(),
            Err(ScenarioError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_settle_passes() {
        let outcome = run(ScenarioKind::Settle, &opts(5)).unwrap();
        assert!(outcome.passed(), "{:?}", outcome.checks);
        assert!(outcome.leaders.values().all(|l| *l == Some(4)));
    }

    #[test]
    fn test_leader_crash_passes() {
        let outcome = run(ScenarioKind::LeaderCrash, &opts(5)).unwrap();
        assert!(outcome.passed(), "{:?}", outcome.checks);
        assert!(!outcome.leaders.contains_key(&4));
        assert!(outcome.leaders.values().all(|l| *l == Some(3)));
    }

    #[test]
    fn test_leader_crash_needs_two_agents() {
        let err = run(ScenarioKind::LeaderCrash, &opts(1)).unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidOptions(_)));
    }

    #[test]
    fn test_auction_passes() {
        let outcome = run(ScenarioKind::Auction, &opts(5)).unwrap();
        assert!(outcome.passed(), "{:?}", outcome.checks);
    }

    #[test]
    fn test_lossy_recovers() {
        let mut o = opts(5);
        o.duration = Some(Duration::from_secs(10));
        let outcome = run(ScenarioKind::Lossy, &o).unwrap();
        assert!(outcome.passed(), "{:?}", outcome.checks);
        assert!(outcome.metrics.messages_dropped > 0);
        assert!(outcome.checks.iter().any(|c| c.name == "slots-consistent"));
    }

    #[test]
    fn test_heavy_loss_slots_resync() {
        for seed in [5, 19, 77] {
            let mut o = opts(5);
            o.duration = Some(Duration::from_secs(30));
            o.faults = FaultConfig::lossy(0.3, seed);
            let outcome = run(ScenarioKind::Lossy, &o).unwrap();
            assert!(outcome.passed(), "seed {}: {:?}", seed, outcome.checks);
        }
    }

    #[test]
    fn test_formation_fills_slots() {
        let mut o = opts(5);
        o.duration = Some(Duration::from_secs(15));
        let outcome = run(ScenarioKind::Formation, &o).unwrap();
        let slots = outcome
            .checks
            .iter()
            .find(|c| c.name == "slots-assigned")
            .unwrap();
        assert!(slots.passed, "{}", slots.detail);
        assert!(outcome.metrics.mean_tracking_error > 0.0);
    }

    #[test]
    fn test_zero_dt_rejected() {
        let mut o = opts(3);
        o.dt = Duration::ZERO;
        assert!(matches!(
            run(ScenarioKind::Settle, &o),
            Err(ScenarioError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            run(ScenarioKind::Settle, &opts(0)),
            Err(ScenarioError::Core(_))
        ));
    }
}
