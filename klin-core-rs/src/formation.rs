//! Wedge formation geometry
//!
//! Slots alternate sides while rank grows every second slot:
//! index 0 -> right/1, 1 -> left/1, 2 -> right/2, 3 -> left/2, ...
//! Anchors trail the leader along two arms at `wedge_angle` from its
//! backward axis, one `spacing` apart per rank.

use crate::config::FormationConfig;
use crate::types::{Point, Pose, SlotId};
use serde::{Deserialize, Serialize};

/// Side of the wedge, seen from the leader looking forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Sign applied to the leader's right-hand axis
    fn sign(self) -> f64 {
        match self {
            Side::Right => 1.0,
            Side::Left => -1.0,
        }
    }
}

/// Map a formation index to its side and rank (rank >= 1)
pub fn idx_to_side_rank(idx: usize) -> (Side, usize) {
    let rank = idx / 2 + 1;
    let side = if idx % 2 == 0 { Side::Right } else { Side::Left };
    (side, rank)
}

/// Formation index used by auction slot `slot` (slots start at 1)
pub fn slot_index(slot: SlotId) -> usize {
    slot.saturating_sub(1)
}

/// Side and rank for an auction slot
pub fn slot_side_rank(slot: SlotId) -> (Side, usize) {
    idx_to_side_rank(slot_index(slot))
}

/// Target point for `(side, rank)` behind `leader`
pub fn anchor(leader: &Pose, side: Side, rank: usize, formation: &FormationConfig) -> Point {
    let phi = formation.wedge_angle();
    let (fx, fy) = leader.forward();
    let (rx, ry) = leader.right();

    let rank = rank as f64;
    let back = formation.back_offset + rank * formation.spacing * phi.cos();
    let lateral = side.sign() * rank * formation.spacing * phi.sin();

    Point::new(
        leader.x - back * fx + lateral * rx,
        leader.y - back * fy + lateral * ry,
    )
}

/// Target point for an auction slot behind `leader`
pub fn slot_anchor(leader: &Pose, slot: SlotId, formation: &FormationConfig) -> Point {
    let (side, rank) = slot_side_rank(slot);
    anchor(leader, side, rank, formation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_idx_to_side_rank() {
        assert_eq!(idx_to_side_rank(0), (Side::Right, 1));
        assert_eq!(idx_to_side_rank(1), (Side::Left, 1));
        assert_eq!(idx_to_side_rank(2), (Side::Right, 2));
        assert_eq!(idx_to_side_rank(3), (Side::Left, 2));
        assert_eq!(idx_to_side_rank(6), (Side::Right, 4));
    }

    #[test]
    fn test_slots_start_on_the_right() {
        assert_eq!(slot_side_rank(1), (Side::Right, 1));
        assert_eq!(slot_side_rank(2), (Side::Left, 1));
        assert_eq!(slot_side_rank(4), (Side::Left, 2));
    }

    #[test]
    fn test_anchor_trails_leader() {
        // Leader at origin heading +x, 45 degree wedge, spacing sqrt(2)
        let formation = FormationConfig {
            spacing: 2f64.sqrt(),
            wedge_angle_deg: 45.0,
            back_offset: 0.0,
        };
        let leader = Pose::new(0.0, 0.0, 0.0);

        let right = anchor(&leader, Side::Right, 1, &formation);
        assert!((right.x + 1.0).abs() < TOL);
        assert!((right.y + 1.0).abs() < TOL);

        let left = anchor(&leader, Side::Left, 1, &formation);
        assert!((left.x + 1.0).abs() < TOL);
        assert!((left.y - 1.0).abs() < TOL);
    }

    #[test]
    fn test_anchor_rotates_with_heading() {
        let formation = FormationConfig {
            spacing: 1.0,
            wedge_angle_deg: 0.0,
            back_offset: 0.5,
        };
        // Heading +y: anchors line up straight behind on -y
        let leader = Pose::new(2.0, 3.0, FRAC_PI_2);
        let p = anchor(&leader, Side::Left, 2, &formation);
        assert!((p.x - 2.0).abs() < TOL);
        assert!((p.y - 0.5).abs() < TOL);
    }

    #[test]
    fn test_rank_spacing_along_arm() {
        let formation = FormationConfig::default();
        let leader = Pose::new(1.0, -2.0, 0.7);
        for side in [Side::Left, Side::Right] {
            for k in 1..5 {
                let a = anchor(&leader, side, k, &formation);
                let b = anchor(&leader, side, k + 1, &formation);
                assert!((a.distance(&b) - formation.spacing).abs() < TOL);
            }
        }
    }
}
