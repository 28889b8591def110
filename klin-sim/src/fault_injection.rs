//! Fault injection for simulated runs
//!
//! Omission faults only: messages are lost at send time with a fixed
//! probability, and agents can crash (stop stepping for good).

use klin_core::{AgentId, MessageBus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Message loss settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Probability in `[0, 1]` that a sent message is lost
    pub message_loss_rate: f64,
    /// RNG seed, so lossy runs are reproducible
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            message_loss_rate: 0.0,
            seed: 42,
        }
    }
}

impl FaultConfig {
    pub fn lossy(rate: f64, seed: u64) -> Self {
        Self {
            message_loss_rate: rate.clamp(0.0, 1.0),
            seed,
        }
    }

    pub fn is_lossless(&self) -> bool {
        self.message_loss_rate <= 0.0
    }

    /// Install the loss filter on `bus`; a lossless config clears it
    pub fn install(&self, bus: &mut MessageBus) {
        if self.is_lossless() {
            bus.clear_send_filter();
            return;
        }

        info!(
            "Faults: dropping {:.0}% of messages (seed {})",
            self.message_loss_rate * 100.0,
            self.seed
        );
        let rate = self.message_loss_rate;
        let mut rng = StdRng::seed_from_u64(self.seed);
        bus.set_send_filter(move |_| rng.gen::<f64>() >= rate);
    }
}

/// Which agent a scheduled crash hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashTarget {
    /// Whoever leads at crash time (highest live id if nobody does)
    Leader,
    Agent(AgentId),
}

/// A crash to inject at a given simulated time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashPlan {
    pub at: Duration,
    pub target: CrashTarget,
}

impl CrashPlan {
    pub fn leader_at(at: Duration) -> Self {
        Self {
            at,
            target: CrashTarget::Leader,
        }
    }

    /// Pick the victim among `live` agents given the current `leader`
    pub fn victim(&self, live: &[AgentId], leader: Option<AgentId>) -> Option<AgentId> {
        match self.target {
            CrashTarget::Agent(id) => live.contains(&id).then_some(id),
            CrashTarget::Leader => leader
                .filter(|l| live.contains(l))
                .or_else(|| live.iter().max().copied()),
        }
    }
}
