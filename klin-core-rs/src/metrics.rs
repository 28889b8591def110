//! Fleet metrics: peer registry and running protocol statistics

use crate::error::Result;
use crate::types::{AgentId, MessageKind, Point, Pose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Last observation of a peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerEntry {
    pub pose: Pose,
    pub last_seen: Duration,
}

/// Agents currently taking part in the run, keyed by id.
///
/// The registry only mirrors what the harness reports; it never keeps a
/// departed agent around.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<AgentId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer
    pub fn observe(&mut self, id: AgentId, pose: Pose, now: Duration) {
        let entry = PeerEntry {
            pose,
            last_seen: now,
        };
        if self.peers.insert(id, entry).is_none() {
            debug!("Metrics: registered peer {}", id);
        }
    }

    /// Harness hook: agent `id` no longer exists
    pub fn depart(&mut self, id: AgentId) -> bool {
        let removed = self.peers.remove(&id).is_some();
        if removed {
            debug!("Metrics: peer {} departed", id);
        }
        removed
    }

    pub fn get(&self, id: AgentId) -> Option<&PeerEntry> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &PeerEntry)> {
        self.peers.iter()
    }

    /// Mean distance from `position` to every registered peer except `id`
    pub fn average_separation(&self, id: AgentId, position: Point) -> f64 {
        let (sum, count) = self
            .peers
            .iter()
            .filter(|(peer, _)| **peer != id)
            .fold((0.0, 0u64), |(sum, count), (_, entry)| {
                (sum + position.distance(&entry.pose.position()), count + 1)
            });
        sum / count.max(1) as f64
    }
}

/// What one agent looked like at the end of its tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub id: AgentId,
    pub pose: Pose,
    pub leader_id: Option<AgentId>,
    /// Leader pose as known to this agent
    pub leader_pose: Option<Pose>,
    /// Formation anchor the agent is steering to
    pub anchor: Option<Point>,
}

/// Running sums across all agents and ticks
#[derive(Debug, Clone, Default)]
pub struct FleetMetrics {
    steps: u64,
    follower_samples: u64,
    sum_dist_to_leader: f64,
    sum_separation: f64,
    tracking_samples: u64,
    sum_tracking_error: f64,
    election_count: u64,
    sum_election_time: Duration,
    // Shared across agents; overlapping elections are not told apart
    last_election_start: Option<Duration>,
}

impl FleetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Some agent entered Electing at `now`
    pub fn election_started(&mut self, now: Duration) {
        self.last_election_start = Some(now);
    }

    /// Account for one agent's tick
    pub fn observe(&mut self, obs: &Observation, peers: &PeerRegistry, now: Duration) {
        self.steps += 1;

        if obs.leader_id.is_some() {
            if let Some(start) = self.last_election_start.take() {
                self.sum_election_time += now.saturating_sub(start);
                self.election_count += 1;
            }
        }

        if obs.leader_id == Some(obs.id) {
            return;
        }
        let Some(leader) = obs.leader_pose else {
            return;
        };

        let here = obs.pose.position();
        self.sum_dist_to_leader += here.distance(&leader.position());
        self.sum_separation += peers.average_separation(obs.id, here);
        self.follower_samples += 1;

        if let Some(anchor) = obs.anchor {
            self.sum_tracking_error += here.distance(&anchor);
            self.tracking_samples += 1;
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn election_count(&self) -> u64 {
        self.election_count
    }

    /// Averages so far, plus the bus message counters
    pub fn report(&self, sent: &BTreeMap<MessageKind, u64>, dropped: u64) -> MetricsReport {
        let followers = self.follower_samples.max(1) as f64;
        MetricsReport {
            steps: self.steps,
            mean_dist_to_leader: self.sum_dist_to_leader / followers,
            mean_inter_member_dist: self.sum_separation / followers,
            mean_tracking_error: self.sum_tracking_error / self.tracking_samples.max(1) as f64,
            avg_election_time: self.sum_election_time.as_secs_f64()
                / self.election_count.max(1) as f64,
            elections: self.election_count,
            messages_sent: sent.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            messages_dropped: dropped,
        }
    }
}

/// Snapshot of fleet statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub steps: u64,
    pub mean_dist_to_leader: f64,
    pub mean_inter_member_dist: f64,
    pub mean_tracking_error: f64,
    /// Seconds from election start to first observed leader
    pub avg_election_time: f64,
    pub elections: u64,
    pub messages_sent: BTreeMap<String, u64>,
    pub messages_dropped: u64,
}

impl MetricsReport {
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: AgentId, x: f64, leader: Option<AgentId>, leader_pose: Option<Pose>) -> Observation {
        Observation {
            id,
            pose: Pose::new(x, 0.0, 0.0),
            leader_id: leader,
            leader_pose,
            anchor: None,
        }
    }

    #[test]
    fn test_registry_depart() {
        let mut peers = PeerRegistry::new();
        peers.observe(1, Pose::default(), Duration::ZERO);
        peers.observe(2, Pose::new(3.0, 4.0, 0.0), Duration::ZERO);
        assert_eq!(peers.len(), 2);

        assert!(peers.depart(2));
        assert!(!peers.depart(2));
        assert!(!peers.contains(2));
        assert_eq!(peers.average_separation(1, Point::new(0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_average_separation_skips_self() {
        let mut peers = PeerRegistry::new();
        peers.observe(0, Pose::new(0.0, 0.0, 0.0), Duration::ZERO);
        peers.observe(1, Pose::new(3.0, 4.0, 0.0), Duration::ZERO);
        peers.observe(2, Pose::new(0.0, 1.0, 0.0), Duration::ZERO);

        let sep = peers.average_separation(0, Point::new(0.0, 0.0));
        assert!((sep - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_report_is_finite() {
        let report = FleetMetrics::new().report(&BTreeMap::new(), 0);
        assert_eq!(report.steps, 0);
        assert_eq!(report.mean_dist_to_leader, 0.0);
        assert_eq!(report.avg_election_time, 0.0);
    }

    #[test]
    fn test_follower_distance_and_tracking() {
        let mut metrics = FleetMetrics::new();
        let mut peers = PeerRegistry::new();
        let leader = Pose::new(0.0, 0.0, 0.0);
        peers.observe(4, leader, Duration::ZERO);
        peers.observe(0, Pose::new(2.0, 0.0, 0.0), Duration::ZERO);

        // Leader ticks add nothing but a step
        metrics.observe(&obs(4, 0.0, Some(4), Some(leader)), &peers, Duration::ZERO);

        let mut follower = obs(0, 2.0, Some(4), Some(leader));
        follower.anchor = Some(Point::new(2.0, 1.0));
        metrics.observe(&follower, &peers, Duration::ZERO);

        // No leader pose: not a follower sample
        metrics.observe(&obs(1, 5.0, Some(4), None), &peers, Duration::ZERO);

        let report = metrics.report(&BTreeMap::new(), 0);
        assert_eq!(report.steps, 3);
        assert!((report.mean_dist_to_leader - 2.0).abs() < 1e-12);
        assert!((report.mean_inter_member_dist - 2.0).abs() < 1e-12);
        assert!((report.mean_tracking_error - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_election_duration_uses_shared_start() {
        let mut metrics = FleetMetrics::new();
        let peers = PeerRegistry::new();

        metrics.election_started(Duration::from_millis(100));
        metrics.election_started(Duration::from_millis(200));
        metrics.observe(&obs(0, 0.0, None, None), &peers, Duration::from_millis(500));
        assert_eq!(metrics.election_count(), 0);

        metrics.observe(&obs(0, 0.0, Some(3), None), &peers, Duration::from_millis(1200));
        metrics.observe(&obs(1, 0.0, Some(3), None), &peers, Duration::from_millis(1200));
        assert_eq!(metrics.election_count(), 1);

        let report = metrics.report(&BTreeMap::new(), 0);
        assert!((report.avg_election_time - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_json() {
        let mut sent = BTreeMap::new();
        sent.insert(MessageKind::Heartbeat, 3);
        let report = FleetMetrics::new().report(&sent, 1);

        let json = report.export_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["messages_sent"]["HEARTBEAT"], 3);
        assert_eq!(value["messages_dropped"], 1);
    }
}
