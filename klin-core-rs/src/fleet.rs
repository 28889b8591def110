//! Coordination context and per-agent behavior
//!
//! One `CoordinationContext` is built per run and owns everything the
//! agents share: the bus, every agent's election and auction state, the
//! leader's auction book, the peer registry and the metrics. The harness
//! calls [`CoordinationContext::step_agent`] once per agent per tick, in
//! a fixed order, and pipes the returned command through its own safety
//! filter.

use crate::auction::{self, AgentAuctionState, AuctionBook, Bid};
use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::config::FleetConfig;
use crate::election::{Bully, ElectionState, Role};
use crate::error::Result;
use crate::formation::slot_anchor;
use crate::metrics::{FleetMetrics, MetricsReport, Observation, PeerRegistry};
use crate::steering::{LeaderMotion, Steering};
use crate::types::{
    AgentDescriptor, AgentId, Destination, Message, Outgoing, Payload, Point, Pose, SlotId,
    Velocity,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Latest leader pose a follower has heard
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaderPose {
    pub leader: AgentId,
    pub pose: Pose,
    pub sent_at: Duration,
}

/// Everything the context keeps for one agent
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub election: ElectionState,
    pub auction: AgentAuctionState,
    /// Highest bus sequence number already processed
    pub cursor: u64,
    pub leader_pose: Option<LeaderPose>,
}

/// What the core hands back to the harness for one agent tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentOutput {
    pub id: AgentId,
    pub role: Role,
    pub leader_id: Option<AgentId>,
    pub slot: Option<SlotId>,
    /// Formation anchor being tracked, if any
    pub target: Option<Point>,
    /// Command before safety filtering
    pub command: Velocity,
}

/// Shared state of one fleet run
pub struct CoordinationContext {
    run_id: Uuid,
    config: FleetConfig,
    bus: MessageBus,
    agents: BTreeMap<AgentId, AgentState>,
    book: AuctionBook,
    peers: PeerRegistry,
    metrics: FleetMetrics,
}

impl CoordinationContext {
    /// Create a context whose bus reads time from `clock`
    pub fn new(config: FleetConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        info!(
            "Fleet: run {} with {} agents (ttl {:.2}s, election timeout {:.2}s, heartbeat {:.2}s)",
            run_id,
            config.fleet_size,
            config.ttl.as_secs_f64(),
            config.election_timeout.as_secs_f64(),
            config.heartbeat_period.as_secs_f64()
        );

        Ok(Self {
            run_id,
            config,
            bus: MessageBus::new(clock),
            agents: BTreeMap::new(),
            book: AuctionBook::new(),
            peers: PeerRegistry::new(),
            metrics: FleetMetrics::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut MessageBus {
        &mut self.bus
    }

    pub fn now(&self) -> Duration {
        self.bus.now()
    }

    pub fn book(&self) -> &AuctionBook {
        &self.book
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentState> {
        self.agents.get(&id)
    }

    /// Get the agent's state, creating it on first participation
    pub fn agent_state_mut(&mut self, id: AgentId) -> &mut AgentState {
        self.agents.entry(id).or_default()
    }

    pub fn leader_of(&self, id: AgentId) -> Option<AgentId> {
        self.agents.get(&id).and_then(|st| st.election.leader_id)
    }

    pub fn role_of(&self, id: AgentId) -> Role {
        self.agents
            .get(&id)
            .map(|st| st.election.role(id))
            .unwrap_or_default()
    }

    /// Harness hook: agent `id` stopped existing
    pub fn depart(&mut self, id: AgentId) {
        info!("Fleet: agent {} departed", id);
        self.peers.depart(id);
    }

    pub fn metrics_report(&self) -> MetricsReport {
        self.metrics
            .report(self.bus.sent_counts(), self.bus.dropped_count())
    }

    /// Run one tick of agent behavior and return its raw command
    pub fn step_agent(
        &mut self,
        agent: &AgentDescriptor,
        leader_motion: &mut dyn LeaderMotion,
        steering: &dyn Steering,
    ) -> AgentOutput {
        let id = agent.id;
        let now = self.bus.now();
        let inbox = self.fresh_inbox(id);

        // Election
        let bully = Bully::new(id, self.config.fleet_size, self.config.timing());
        let tick = {
            let state = self.agent_state_mut(id);
            bully.tick(&mut state.election, now, &inbox)
        };
        if tick.election_started {
            self.metrics.election_started(now);
        }
        let heartbeat_sent = tick
            .outgoing
            .iter()
            .any(|o| o.payload == Payload::Heartbeat);
        self.send_all(id, tick.outgoing);
        let leader_id = tick.leader_id;

        {
            let state = self.agent_state_mut(id);
            state.auction.observe_leader(leader_id);
            if state.leader_pose.is_some_and(|lp| Some(lp.leader) != leader_id) {
                state.leader_pose = None;
            }
        }

        let mut output = AgentOutput {
            id,
            role: self.role_of(id),
            leader_id,
            slot: None,
            target: None,
            command: Velocity::ZERO,
        };

        if leader_id == Some(id) {
            output.command = self.lead(agent, &inbox, leader_motion, heartbeat_sent);
        } else {
            let (slot, target, command) = self.follow(agent, leader_id, &inbox, now, steering);
            output.slot = slot;
            output.target = target;
            output.command = command;
        }

        self.observe(agent, &output, now);
        output
    }

    /// Messages for `id` it has not handled before, oldest first
    fn fresh_inbox(&mut self, id: AgentId) -> Vec<Message> {
        let cursor = self.agent_state_mut(id).cursor;
        let inbox: Vec<Message> = self
            .bus
            .receive(id, self.config.ttl)
            .into_iter()
            .filter(|m| m.seq > cursor && m.src != id)
            .collect();

        let last = self.bus.last_seq();
        self.agent_state_mut(id).cursor = last;
        inbox
    }

    fn send_all(&mut self, src: AgentId, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            self.bus.send(src, out);
        }
    }

    fn lead(
        &mut self,
        agent: &AgentDescriptor,
        inbox: &[Message],
        leader_motion: &mut dyn LeaderMotion,
        announce: bool,
    ) -> Velocity {
        let id = agent.id;
        if self.book.reset_for(id) {
            info!("Fleet: agent {} leading, auction book opened", id);
        }

        self.bus.broadcast(id, agent.pose.into());

        if self.config.auction_enabled {
            let bids: Vec<Bid> = inbox
                .iter()
                .filter(|m| m.dst == Destination::Agent(id))
                .filter_map(Bid::from_message)
                .collect();
            let out =
                auction::leader_round(&mut self.book, self.config.slot_count(), &bids, announce);
            self.send_all(id, out);
        }

        agent.limits.clamp(leader_motion.command(agent))
    }

    fn follow(
        &mut self,
        agent: &AgentDescriptor,
        leader_id: Option<AgentId>,
        inbox: &[Message],
        now: Duration,
        steering: &dyn Steering,
    ) -> (Option<SlotId>, Option<Point>, Velocity) {
        let id = agent.id;
        let ttl = self.config.ttl;
        let idle = agent.limits.clamp(self.config.idle_command);

        let Some(leader) = leader_id else {
            let slot = self.agent_state_mut(id).auction.slot();
            return (slot, None, idle);
        };

        let from_leader: Vec<&Message> = inbox.iter().filter(|m| m.src == leader).collect();

        let state = self.agents.entry(id).or_default();
        for msg in &from_leader {
            if let Payload::Pose { x, y, heading } = msg.payload {
                state.leader_pose = Some(LeaderPose {
                    leader,
                    pose: Pose::new(x, y, heading),
                    sent_at: msg.sent_at,
                });
            }
        }
        if let Some(lp) = state.leader_pose {
            if now.saturating_sub(lp.sent_at) > ttl {
                debug!("Fleet: agent {} leader pose went stale", id);
                state.leader_pose = None;
            }
        }
        let leader_pose = state.leader_pose.map(|lp| lp.pose);

        for msg in &from_leader {
            match msg.payload {
                Payload::Assign {
                    slot,
                    winner,
                    epoch,
                    ..
                } => {
                    if state.auction.apply_assign(id, leader, epoch, slot, winner) {
                        info!("Fleet: agent {} won slot {} from leader {}", id, slot, leader);
                    }
                }
                Payload::AuctionRequest { epoch, .. } => state.auction.observe_book(epoch),
                _ => {}
            }
        }

        let mut bids = Vec::new();
        if let (None, Some(lp)) = (state.auction.slot(), leader_pose) {
            for msg in &from_leader {
                if let Payload::AuctionRequest { slots, .. } = &msg.payload {
                    bids = auction::follower_bids(
                        &agent.pose,
                        &lp,
                        slots,
                        &self.config.formation,
                        self.config.bid_epsilon,
                    );
                }
            }
        }
        let slot = state.auction.slot();

        for (bid_slot, price) in bids {
            self.bus.unicast(
                id,
                leader,
                Payload::Bid {
                    slot: bid_slot,
                    price,
                },
            );
        }

        match (slot, leader_pose) {
            (Some(slot), Some(lp)) => {
                let target = slot_anchor(&lp, slot, &self.config.formation);
                let raw = steering.steer_to(&agent.pose, target, agent.limits.v_max);
                (Some(slot), Some(target), agent.limits.clamp(raw))
            }
            _ => (slot, None, idle),
        }
    }

    fn observe(&mut self, agent: &AgentDescriptor, output: &AgentOutput, now: Duration) {
        self.peers.observe(agent.id, agent.pose, now);

        let leader_pose = if output.leader_id == Some(agent.id) {
            Some(agent.pose)
        } else {
            self.agents
                .get(&agent.id)
                .and_then(|st| st.leader_pose)
                .map(|lp| lp.pose)
        };

        let obs = Observation {
            id: agent.id,
            pose: agent.pose,
            leader_id: output.leader_id,
            leader_pose,
            anchor: output.target,
        };
        self.metrics.observe(&obs, &self.peers, now);
    }
}

impl std::fmt::Debug for CoordinationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationContext")
            .field("run_id", &self.run_id)
            .field("agents", &self.agents.len())
            .field("bus", &self.bus.len())
            .field("book", &self.book)
            .finish()
    }
}
