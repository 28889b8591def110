//! Bully leader election for KLIN fleets.
//!
//! Implements leader election with:
//! - State machine: Unknown → Electing → Leader / Follower(id)
//! - Highest reachable id wins; lower ids defer to higher challengers
//! - Self-promotion when no higher id answers before the victory deadline
//! - Heartbeat-based leader failure detection
//!
//! The machine is polled once per tick. It never blocks: deadlines are
//! compared against the bus clock, and every transition is retried by the
//! next tick if a message was lost.

use crate::config::ElectionTiming;
use crate::types::{AgentId, Message, Outgoing, Payload};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Role of an agent as seen from its own election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// No leader known, no election running
    Unknown,
    /// Waiting for answers or a victory
    Electing,
    /// This agent leads the fleet
    Leader,
    /// Following the given leader
    Follower(AgentId),
}

impl Default for Role {
    fn default() -> Self {
        Role::Unknown
    }
}

/// Per-agent election state, owned by the coordination context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElectionState {
    /// Current leader (if known)
    pub leader_id: Option<AgentId>,
    /// Election in progress
    pub electing: bool,
    /// Self-promote at this time unless a higher id answers
    pub victory_deadline: Duration,
    /// Last sign of life from the leader
    pub last_heartbeat: Duration,
    /// Last heartbeat this agent broadcast while leading
    pub last_heartbeat_sent: Option<Duration>,
}

impl ElectionState {
    pub fn role(&self, me: AgentId) -> Role {
        if self.electing {
            return Role::Electing;
        }
        match self.leader_id {
            None => Role::Unknown,
            Some(id) if id == me => Role::Leader,
            Some(id) => Role::Follower(id),
        }
    }
}

/// Result of one election tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElectionTick {
    /// Leader after this tick (None while an election is unresolved)
    pub leader_id: Option<AgentId>,
    /// Messages to put on the bus
    pub outgoing: Vec<Outgoing>,
    /// This agent started an election during the tick
    pub election_started: bool,
}

/// Bully election state machine for one agent
#[derive(Debug, Clone)]
pub struct Bully {
    id: AgentId,
    fleet_size: usize,
    timing: ElectionTiming,
}

impl Bully {
    /// Create the machine for agent `id` in a fleet of ids `0..fleet_size`
    pub fn new(id: AgentId, fleet_size: usize, timing: ElectionTiming) -> Self {
        Self {
            id,
            fleet_size,
            timing,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Advance the machine by one tick.
    ///
    /// `inbox` holds the messages addressed to this agent (or broadcast)
    /// that it has not processed before, oldest first.
    pub fn tick(&self, state: &mut ElectionState, now: Duration, inbox: &[Message]) -> ElectionTick {
        let mut out = ElectionTick::default();

        self.detect_failure(state, now);

        if state.leader_id.is_none() && !state.electing {
            self.begin_election(state, now, &mut out);
        }

        for msg in inbox.iter().filter(|m| m.src != self.id) {
            self.handle_message(state, now, msg, &mut out);
        }

        if state.electing && now >= state.victory_deadline {
            self.become_leader(state, &mut out);
        }

        if state.leader_id == Some(self.id) {
            self.leadership_upkeep(state, now, &mut out);
        }

        out.leader_id = state.leader_id;
        out
    }

    /// Forget a leader that has been silent too long
    fn detect_failure(&self, state: &mut ElectionState, now: Duration) {
        let Some(leader) = state.leader_id else {
            return;
        };
        if leader == self.id {
            return;
        }

        let silence = now.saturating_sub(state.last_heartbeat);
        if silence > self.timing.failure_timeout() {
            warn!(
                "Election: agent {} lost leader {} (silent for {:.2}s)",
                self.id,
                leader,
                silence.as_secs_f64()
            );
            state.leader_id = None;
        }
    }

    /// Enter Electing and challenge every higher id
    fn begin_election(&self, state: &mut ElectionState, now: Duration, out: &mut ElectionTick) {
        state.electing = true;
        state.leader_id = None;
        state.victory_deadline = now + self.timing.election_timeout;
        out.election_started = true;

        let higher: Vec<AgentId> = self.higher_ids().collect();
        info!(
            "Election: agent {} starting election, challenging {:?}",
            self.id, higher
        );

        out.outgoing.extend(
            higher
                .into_iter()
                .map(|id| Outgoing::unicast(id, Payload::Election)),
        );
    }

    fn handle_message(
        &self,
        state: &mut ElectionState,
        now: Duration,
        msg: &Message,
        out: &mut ElectionTick,
    ) {
        match msg.payload {
            Payload::Election if msg.src < self.id => {
                debug!("Election: agent {} answering {}", self.id, msg.src);
                out.outgoing
                    .push(Outgoing::unicast(msg.src, Payload::Answer));
                if !state.electing {
                    self.begin_election(state, now, out);
                }
            }

            // A higher id challenged us: it will either win or time out.
            Payload::Election => {}

            Payload::Answer if state.electing => {
                debug!(
                    "Election: agent {} deferring to {}, waiting for victory",
                    self.id, msg.src
                );
                state.victory_deadline = now + self.timing.election_timeout;
            }

            Payload::Victory => {
                if state.leader_id != Some(msg.src) || state.electing {
                    info!("Election: agent {} recognized {} as leader", self.id, msg.src);
                }
                state.leader_id = Some(msg.src);
                state.electing = false;
                state.last_heartbeat = now;
            }

            Payload::Heartbeat if state.leader_id == Some(msg.src) => {
                state.last_heartbeat = now;
            }

            // Two leaders after lost victories: the lower one yields
            Payload::Heartbeat if state.leader_id == Some(self.id) && msg.src > self.id => {
                info!(
                    "Election: agent {} yielding leadership to {}",
                    self.id, msg.src
                );
                state.leader_id = Some(msg.src);
                state.last_heartbeat = now;
            }

            _ => {}
        }
    }

    /// No higher id answered in time
    fn become_leader(&self, state: &mut ElectionState, out: &mut ElectionTick) {
        info!("Election: agent {} won election, announcing victory", self.id);

        state.electing = false;
        state.leader_id = Some(self.id);
        state.last_heartbeat_sent = None;
        out.outgoing.push(Outgoing::broadcast(Payload::Victory));
    }

    /// Heartbeat on promotion and every `heartbeat_period` after
    fn leadership_upkeep(&self, state: &mut ElectionState, now: Duration, out: &mut ElectionTick) {
        let due = match state.last_heartbeat_sent {
            None => true,
            Some(sent) => now.saturating_sub(sent) >= self.timing.heartbeat_period,
        };

        if due {
            out.outgoing.push(Outgoing::broadcast(Payload::Heartbeat));
            state.last_heartbeat_sent = Some(now);
        }
        state.last_heartbeat = now;
    }

    fn higher_ids(&self) -> impl Iterator<Item = AgentId> {
        let start = self.id as usize + 1;
        (start..self.fleet_size).map(|id| id as AgentId)
    }
}
