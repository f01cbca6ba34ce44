/// Candidate ranking for propagation relays.
///
/// Picks the closest propagation node out of the announced set. Pure logic:
/// reads a candidate slice, returns a choice. No I/O.
///
/// Ordering: ascending hop count, unknown distance after every known one.
/// Ties keep input order, so the first candidate encountered wins.
use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

// ── Candidates ─────────────────────────────────────────────────────────

/// A propagation-capable node observed on the network.
///
/// Rebuilt from live announce data on every evaluation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCandidate {
    pub node_id: NodeId,
    /// Announced name, may be empty.
    pub display_name: String,
    /// Mesh hops to reach the node. `None` = unknown distance.
    pub hops: Option<u32>,
    /// Identity public key, needed to add the node as a contact.
    pub public_key: Vec<u8>,
    /// Unix ms timestamp of the last announce.
    pub last_seen: u64,
}

impl RelayCandidate {
    /// Hop count in the -1-for-unknown convention used by announce tables.
    pub fn hops_or_unknown(&self) -> i64 {
        self.hops.map_or(-1, i64::from)
    }
}

/// Compare two hop counts, closer first, unknown last.
pub fn compare_hops(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ── Selection ──────────────────────────────────────────────────────────

/// Pick the best candidate not in `exclude`.
///
/// Returns `None` iff every candidate is excluded (or the slice is empty).
pub fn select_best<'a>(
    candidates: &'a [RelayCandidate],
    exclude: &HashSet<NodeId>,
) -> Option<&'a RelayCandidate> {
    candidates
        .iter()
        .filter(|c| !exclude.contains(&c.node_id))
        .reduce(|best, c| {
            // strict comparison: an equal candidate never displaces the first one
            if compare_hops(c.hops, best.hops) == Ordering::Less {
                c
            } else {
                best
            }
        })
}

/// All candidates in ranking order (stable: ties keep input order).
pub fn rank(candidates: &[RelayCandidate]) -> Vec<RelayCandidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| compare_hops(a.hops, b.hops));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_LEN;

    fn node_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; NODE_ID_LEN])
    }

    fn candidate(seed: u8, hops: Option<u32>) -> RelayCandidate {
        RelayCandidate {
            node_id: node_id(seed),
            display_name: format!("relay-{seed}"),
            hops,
            public_key: vec![seed; 32],
            last_seen: 1_708_000_000_000,
        }
    }

    #[test]
    fn empty_set_has_no_best() {
        assert!(select_best(&[], &HashSet::new()).is_none());
    }

    #[test]
    fn picks_fewest_hops() {
        let set = vec![candidate(1, Some(4)), candidate(2, Some(1)), candidate(3, Some(2))];
        let best = select_best(&set, &HashSet::new()).unwrap();
        assert_eq!(best.node_id, node_id(2));
    }

    #[test]
    fn unknown_distance_ranks_last() {
        let set = vec![candidate(1, None), candidate(2, Some(9))];
        let best = select_best(&set, &HashSet::new()).unwrap();
        assert_eq!(best.node_id, node_id(2));
    }

    #[test]
    fn all_unknown_still_yields_first() {
        let set = vec![candidate(5, None), candidate(6, None)];
        let best = select_best(&set, &HashSet::new()).unwrap();
        assert_eq!(best.node_id, node_id(5));
    }

    #[test]
    fn tie_keeps_first_encountered() {
        let set = vec![candidate(7, Some(2)), candidate(3, Some(2)), candidate(9, Some(2))];
        let best = select_best(&set, &HashSet::new()).unwrap();
        assert_eq!(best.node_id, node_id(7));

        let reversed: Vec<_> = set.iter().rev().cloned().collect();
        let best = select_best(&reversed, &HashSet::new()).unwrap();
        assert_eq!(best.node_id, node_id(9));
    }

    #[test]
    fn excluded_ids_are_skipped() {
        let set = vec![candidate(1, Some(1)), candidate(2, Some(3))];
        let exclude = HashSet::from([node_id(1)]);
        let best = select_best(&set, &exclude).unwrap();
        assert_eq!(best.node_id, node_id(2));
    }

    #[test]
    fn everything_excluded_yields_none() {
        let set = vec![candidate(1, Some(1)), candidate(2, Some(3))];
        let exclude = HashSet::from([node_id(1), node_id(2)]);
        assert!(select_best(&set, &exclude).is_none());
    }

    #[test]
    fn rank_is_stable() {
        let set = vec![
            candidate(1, None),
            candidate(2, Some(3)),
            candidate(3, Some(1)),
            candidate(4, Some(3)),
        ];
        let ranked: Vec<_> = rank(&set).into_iter().map(|c| c.node_id).collect();
        assert_eq!(ranked, vec![node_id(3), node_id(2), node_id(4), node_id(1)]);
    }

    #[test]
    fn hops_or_unknown_uses_minus_one() {
        assert_eq!(candidate(1, None).hops_or_unknown(), -1);
        assert_eq!(candidate(1, Some(3)).hops_or_unknown(), 3);
    }
}
