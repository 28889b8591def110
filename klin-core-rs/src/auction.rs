//! First-price sealed-bid slot auction
//!
//! The leader offers every pending formation slot each tick. Followers
//! without a slot answer with one sealed bid per offered slot, priced by
//! proximity to the slot's anchor. The leader awards pending slots in
//! ascending order to the highest bidder, lower id first on ties, and a
//! follower never wins twice under the same book.
//!
//! Every book opening gets a fresh epoch, carried by `AUCTION_REQUEST` and
//! `ASSIGN`. A follower's slot is only valid for the epoch it was won in,
//! and the leader re-announces its awards with every heartbeat, so slots
//! won under a book that has since been reopened are given up.

use crate::config::FormationConfig;
use crate::formation::slot_anchor;
use crate::types::{AgentId, Message, Outgoing, Payload, Pose, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A sealed bid as seen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bidder: AgentId,
    pub slot: SlotId,
    pub price: f64,
}

impl Bid {
    /// Extract a bid from a bus message, if it is one
    pub fn from_message(msg: &Message) -> Option<Self> {
        match msg.payload {
            Payload::Bid { slot, price } => Some(Self {
                bidder: msg.src,
                slot,
                price,
            }),
            _ => None,
        }
    }
}

/// A slot awarded in one auction pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Award {
    pub slot: SlotId,
    pub winner: AgentId,
    pub price: f64,
}

impl Award {
    /// `ASSIGN` message for this award under book `epoch`
    pub fn to_payload(&self, epoch: u64) -> Payload {
        Payload::Assign {
            slot: self.slot,
            winner: self.winner,
            price: self.price,
            epoch,
        }
    }
}

/// The leader's record of awarded slots.
///
/// Tagged with the leader that built it; a different leader starts from
/// an empty book under the next epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuctionBook {
    leader: Option<AgentId>,
    epoch: u64,
    assigned_slots: BTreeMap<SlotId, AgentId>,
    assigned_followers: BTreeSet<AgentId>,
    prices: BTreeMap<SlotId, f64>,
}

impl AuctionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leader this book belongs to
    pub fn leader(&self) -> Option<AgentId> {
        self.leader
    }

    /// Opening counter; bumped on every reset
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Make the book belong to `leader`, clearing it if ownership changes.
    /// Returns true when the book was reset.
    pub fn reset_for(&mut self, leader: AgentId) -> bool {
        if self.leader == Some(leader) {
            return false;
        }

        if !self.assigned_slots.is_empty() {
            info!(
                "Auction: book reset for leader {} ({} awards dropped)",
                leader,
                self.assigned_slots.len()
            );
        }
        self.leader = Some(leader);
        self.epoch += 1;
        self.assigned_slots.clear();
        self.assigned_followers.clear();
        self.prices.clear();
        true
    }

    /// Slots `1..=slot_count` not yet awarded, ascending
    pub fn pending_slots(&self, slot_count: usize) -> Vec<SlotId> {
        (1..=slot_count)
            .filter(|slot| !self.assigned_slots.contains_key(slot))
            .collect()
    }

    /// Record an award. Refused if the slot is taken or the follower
    /// already holds a slot.
    pub fn assign(&mut self, slot: SlotId, winner: AgentId, price: f64) -> bool {
        if self.assigned_slots.contains_key(&slot) || self.assigned_followers.contains(&winner) {
            return false;
        }
        self.assigned_slots.insert(slot, winner);
        self.assigned_followers.insert(winner);
        self.prices.insert(slot, price);
        true
    }

    /// Every award recorded in this book, by slot
    pub fn awards(&self) -> impl Iterator<Item = Award> + '_ {
        self.assigned_slots.iter().map(|(&slot, &winner)| Award {
            slot,
            winner,
            price: self.prices.get(&slot).copied().unwrap_or(0.0),
        })
    }

    pub fn assigned_slots(&self) -> &BTreeMap<SlotId, AgentId> {
        &self.assigned_slots
    }

    pub fn holds_slot(&self, follower: AgentId) -> bool {
        self.assigned_followers.contains(&follower)
    }

    pub fn slot_of(&self, follower: AgentId) -> Option<SlotId> {
        self.assigned_slots
            .iter()
            .find(|(_, winner)| **winner == follower)
            .map(|(slot, _)| *slot)
    }

    /// Every one of `slot_count` slots has been awarded
    pub fn is_settled(&self, slot_count: usize) -> bool {
        self.pending_slots(slot_count).is_empty()
    }
}

/// Award `pending` slots from `bids`, in ascending slot order.
///
/// Bids for other slots, non-finite prices, and bidders that already hold
/// a slot are ignored. Highest price wins; equal prices go to the lowest
/// bidder id.
pub fn resolve(book: &mut AuctionBook, pending: &[SlotId], bids: &[Bid]) -> Vec<Award> {
    let mut slots = pending.to_vec();
    slots.sort_unstable();
    slots.dedup();

    let mut awards = Vec::new();
    for slot in slots {
        let best = bids
            .iter()
            .filter(|b| b.slot == slot && b.price.is_finite() && !book.holds_slot(b.bidder))
            .fold(None::<&Bid>, |best, bid| match best {
                Some(cur) if cur.price > bid.price => Some(cur),
                Some(cur) if cur.price == bid.price && cur.bidder <= bid.bidder => Some(cur),
                _ => Some(bid),
            });

        if let Some(bid) = best {
            if book.assign(slot, bid.bidder, bid.price) {
                info!(
                    "Auction: slot {} awarded to {} at {:.4}",
                    slot, bid.bidder, bid.price
                );
                awards.push(Award {
                    slot,
                    winner: bid.bidder,
                    price: bid.price,
                });
            }
        }
    }
    awards
}

/// One leader auction tick: offer pending slots, award from received bids.
///
/// With `announce` set, every earlier award is broadcast again first, so
/// followers that missed an `ASSIGN` or hold a slot from an older epoch
/// resynchronise.
pub fn leader_round(
    book: &mut AuctionBook,
    slot_count: usize,
    bids: &[Bid],
    announce: bool,
) -> Vec<Outgoing> {
    let epoch = book.epoch();
    let mut out: Vec<Outgoing> = Vec::new();
    if announce {
        out.extend(
            book.awards()
                .map(|award| Outgoing::broadcast(award.to_payload(epoch))),
        );
    }

    let pending = book.pending_slots(slot_count);
    if pending.is_empty() {
        return out;
    }

    out.push(Outgoing::broadcast(Payload::AuctionRequest {
        slots: pending.clone(),
        epoch,
    }));
    out.extend(
        resolve(book, &pending, bids)
            .into_iter()
            .map(|award| Outgoing::broadcast(award.to_payload(epoch))),
    );
    out
}

/// Bid price for a follower `distance` away from a slot's anchor
pub fn bid_price(distance: f64, epsilon: f64) -> f64 {
    1.0 / (distance + epsilon)
}

/// Sealed bids from a follower at `me` for each requested slot
pub fn follower_bids(
    me: &Pose,
    leader: &Pose,
    slots: &[SlotId],
    formation: &FormationConfig,
    epsilon: f64,
) -> Vec<(SlotId, f64)> {
    let here = me.position();
    slots
        .iter()
        .map(|&slot| {
            let target = slot_anchor(leader, slot, formation);
            (slot, bid_price(here.distance(&target), epsilon))
        })
        .collect()
}

/// A slot won by a follower, tagged with the leader and book epoch that
/// granted it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGrant {
    pub slot: SlotId,
    pub leader: AgentId,
    pub epoch: u64,
}

/// Follower-side auction state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentAuctionState {
    grant: Option<SlotGrant>,
}

impl AgentAuctionState {
    pub fn slot(&self) -> Option<SlotId> {
        self.grant.map(|g| g.slot)
    }

    pub fn grant(&self) -> Option<SlotGrant> {
        self.grant
    }

    /// Drop a slot granted by a leader other than `leader`.
    /// An unresolved view (`None`) keeps the slot.
    pub fn observe_leader(&mut self, leader: Option<AgentId>) {
        if let (Some(grant), Some(leader)) = (self.grant, leader) {
            if grant.leader != leader {
                debug!(
                    "Auction: slot {} from leader {} dropped, now following {}",
                    grant.slot, grant.leader, leader
                );
                self.grant = None;
            }
        }
    }

    /// Drop a slot won under an earlier opening of the leader's book
    pub fn observe_book(&mut self, epoch: u64) {
        if let Some(grant) = self.grant {
            if grant.epoch != epoch {
                debug!(
                    "Auction: slot {} from epoch {} dropped, book is at epoch {}",
                    grant.slot, grant.epoch, epoch
                );
                self.grant = None;
            }
        }
    }

    /// Apply an `ASSIGN` from the current leader on behalf of follower `me`.
    /// Returns true when `me` won a new slot.
    pub fn apply_assign(
        &mut self,
        me: AgentId,
        leader: AgentId,
        epoch: u64,
        slot: SlotId,
        winner: AgentId,
    ) -> bool {
        self.observe_book(epoch);
        if winner == me {
            return self.record(slot, leader, epoch);
        }

        // The leader says our slot is someone else's
        if self.slot() == Some(slot) {
            debug!("Auction: slot {} now held by {}, giving it up", slot, winner);
            self.grant = None;
        }
        false
    }

    /// Keep the first slot won; later awards are ignored
    pub fn record(&mut self, slot: SlotId, leader: AgentId, epoch: u64) -> bool {
        if self.grant.is_some() {
            return false;
        }
        self.grant = Some(SlotGrant {
            slot,
            leader,
            epoch,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(bidder: AgentId, slot: SlotId, price: f64) -> Bid {
        Bid {
            bidder,
            slot,
            price,
        }
    }

    #[test]
    fn test_pending_slots() {
        let mut book = AuctionBook::new();
        book.reset_for(4);
        assert_eq!(book.pending_slots(4), vec![1, 2, 3, 4]);

        assert!(book.assign(2, 0, 1.0));
        assert_eq!(book.pending_slots(4), vec![1, 3, 4]);
        assert!(!book.is_settled(4));
    }

    #[test]
    fn test_assign_is_exclusive() {
        let mut book = AuctionBook::new();
        assert!(book.assign(1, 0, 1.0));
        assert!(!book.assign(1, 2, 1.0));
        assert!(!book.assign(2, 0, 1.0));
        assert_eq!(book.slot_of(0), Some(1));
        assert_eq!(book.slot_of(2), None);
    }

    #[test]
    fn test_highest_bid_wins() {
        let mut book = AuctionBook::new();
        let bids = [bid(0, 1, 0.5), bid(1, 1, 2.0), bid(2, 1, 1.0)];
        let awards = resolve(&mut book, &[1], &bids);
        assert_eq!(
            awards,
            vec![Award {
                slot: 1,
                winner: 1,
                price: 2.0
            }]
        );
    }

    #[test]
    fn test_tie_goes_to_lowest_id() {
        let mut book = AuctionBook::new();
        let bids = [bid(3, 1, 1.0), bid(1, 1, 1.0), bid(2, 1, 1.0)];
        let awards = resolve(&mut book, &[1], &bids);
        assert_eq!(awards[0].winner, 1);
    }

    #[test]
    fn test_winner_excluded_from_later_slots() {
        let mut book = AuctionBook::new();
        // Agent 0 is best for both slots; slot 2 falls to the runner-up
        let bids = [
            bid(0, 1, 5.0),
            bid(0, 2, 5.0),
            bid(1, 1, 1.0),
            bid(1, 2, 1.0),
        ];
        let awards = resolve(&mut book, &[2, 1], &bids);
        let pairs: Vec<_> = awards.iter().map(|a| (a.slot, a.winner)).collect();
        assert_eq!(pairs, vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_unbid_slot_stays_pending() {
        let mut book = AuctionBook::new();
        book.reset_for(3);
        let out = leader_round(&mut book, 3, &[bid(0, 2, 1.0), bid(1, 2, f64::NAN)], false);

        assert_eq!(
            out[0],
            Outgoing::broadcast(Payload::AuctionRequest {
                slots: vec![1, 2, 3],
                epoch: 1
            })
        );
        assert_eq!(out.len(), 2);
        assert_eq!(book.pending_slots(3), vec![1, 3]);

        // Next round only offers what is left
        let out = leader_round(&mut book, 3, &[], false);
        assert_eq!(
            out,
            vec![Outgoing::broadcast(Payload::AuctionRequest {
                slots: vec![1, 3],
                epoch: 1
            })]
        );
    }

    #[test]
    fn test_announce_repeats_awards() {
        let mut book = AuctionBook::new();
        book.reset_for(3);
        leader_round(&mut book, 2, &[bid(0, 1, 2.0)], false);

        let out = leader_round(&mut book, 2, &[], true);
        assert_eq!(
            out[0],
            Outgoing::broadcast(Payload::Assign {
                slot: 1,
                winner: 0,
                price: 2.0,
                epoch: 1
            })
        );
        assert!(matches!(out[1].payload, Payload::AuctionRequest { .. }));

        // Settled books still announce
        leader_round(&mut book, 2, &[bid(1, 2, 1.0)], false);
        assert_eq!(leader_round(&mut book, 2, &[], true).len(), 2);
    }

    #[test]
    fn test_settled_book_is_quiet() {
        let mut book = AuctionBook::new();
        book.assign(1, 0, 1.0);
        assert!(leader_round(&mut book, 1, &[], false).is_empty());
    }

    #[test]
    fn test_reset_on_new_leader() {
        let mut book = AuctionBook::new();
        assert!(book.reset_for(4));
        book.assign(1, 0, 1.0);
        assert!(!book.reset_for(4));
        assert_eq!(book.assigned_slots().len(), 1);

        assert!(book.reset_for(3));
        assert!(book.assigned_slots().is_empty());
        assert_eq!(book.leader(), Some(3));
        assert_eq!(book.epoch(), 2);
    }

    #[test]
    fn test_closer_follower_bids_higher() {
        let formation = FormationConfig::default();
        let leader = Pose::new(0.0, 0.0, 0.0);
        let near = Pose::new(-0.4, -0.4, 0.0);
        let far = Pose::new(-5.0, 5.0, 0.0);

        let a = follower_bids(&near, &leader, &[1], &formation, 1e-6);
        let b = follower_bids(&far, &leader, &[1], &formation, 1e-6);
        assert!(a[0].1 > b[0].1);
        assert!(bid_price(0.0, 1e-6).is_finite());
    }

    #[test]
    fn test_follower_keeps_first_slot() {
        let mut st = AgentAuctionState::default();
        assert!(st.record(2, 4, 1));
        assert!(!st.record(3, 4, 1));
        assert_eq!(st.slot(), Some(2));

        st.observe_leader(None);
        assert_eq!(st.slot(), Some(2));
        st.observe_leader(Some(4));
        assert_eq!(st.slot(), Some(2));
        st.observe_leader(Some(3));
        assert_eq!(st.slot(), None);
    }

    #[test]
    fn test_grant_from_older_epoch_is_dropped() {
        let mut st = AgentAuctionState::default();
        assert!(st.apply_assign(0, 4, 1, 3, 0));
        st.observe_book(1);
        assert_eq!(st.slot(), Some(3));

        // The same leader reopened its book
        st.observe_book(2);
        assert_eq!(st.slot(), None);

        // A re-announced award under the new epoch is taken
        assert!(st.apply_assign(0, 4, 2, 1, 0));
        assert_eq!(
            st.grant(),
            Some(SlotGrant {
                slot: 1,
                leader: 4,
                epoch: 2
            })
        );
    }

    #[test]
    fn test_slot_given_up_when_awarded_to_another() {
        let mut st = AgentAuctionState::default();
        st.record(3, 4, 5);

        assert!(!st.apply_assign(0, 4, 5, 2, 1));
        assert_eq!(st.slot(), Some(3));

        assert!(!st.apply_assign(0, 4, 5, 3, 1));
        assert_eq!(st.slot(), None);
    }
}
