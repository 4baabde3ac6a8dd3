//! Distribution scheduler: pick the sharing set and assign chunks to it round-robin.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::chunk::ChunkRecord;
use crate::node::Node;

/// Default cap on peers receiving chunks of one upload.
pub const MAX_SHARING_PEERS: usize = 4;

/// Pick up to `max` distinct peers as the sharing set. Uses all of them when fewer are known.
pub fn select_sharing_set<R: Rng + ?Sized>(peers: &[Node], max: usize, rng: &mut R) -> Vec<Node> {
    let mut distinct: Vec<Node> = peers.to_vec();
    distinct.sort();
    distinct.dedup();
    distinct.shuffle(rng);
    distinct.truncate(max);
    distinct
}

/// Assign each chunk to a receiver (chunk `i` goes to `sharing[i % n]`) and set its
/// `next_node` to the receiver of chunk `i + 1`, or the null node for the final chunk.
/// If `sharing` is empty, returns empty.
pub fn assign_chunks_to_peers(
    chunks: Vec<ChunkRecord>,
    sharing: &[Node],
) -> Vec<(Node, ChunkRecord)> {
    if sharing.is_empty() {
        return vec![];
    }
    let n = sharing.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, mut chunk)| {
            chunk.next_node = if chunk.is_last() {
                Node::NULL
            } else {
                sharing[(i + 1) % n]
            };
            (sharing[i % n], chunk)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split_into_chunks;
    use crate::identity::FileId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;

    fn peers(n: u8) -> Vec<Node> {
        (1..=n)
            .map(|i| Node::new(Ipv4Addr::new(10, 0, 0, i), 3000))
            .collect()
    }

    #[test]
    fn sharing_set_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let all = peers(9);
        let set = select_sharing_set(&all, MAX_SHARING_PEERS, &mut rng);
        assert_eq!(set.len(), 4);
        let unique: std::collections::HashSet<_> = set.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(set.iter().all(|p| all.contains(p)));
    }

    #[test]
    fn sharing_set_uses_all_when_few() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut all = peers(2);
        all.push(all[0]);
        let mut set = select_sharing_set(&all, MAX_SHARING_PEERS, &mut rng);
        set.sort();
        assert_eq!(set, peers(2));
        assert!(select_sharing_set(&[], MAX_SHARING_PEERS, &mut rng).is_empty());
    }

    #[test]
    fn assign_zero_peers_empty() {
        let chunks = split_into_chunks(FileId::generate(), "f", &[0u8; 600]).unwrap();
        assert!(assign_chunks_to_peers(chunks, &[]).is_empty());
    }

    #[test]
    fn assign_round_robin_with_next_node() {
        let sharing = peers(2);
        let chunks = split_into_chunks(FileId::generate(), "f", &[0u8; 512 * 3]).unwrap();
        let out = assign_chunks_to_peers(chunks, &sharing);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, sharing[0]);
        assert_eq!(out[1].0, sharing[1]);
        assert_eq!(out[2].0, sharing[0]);
        assert_eq!(out[0].1.next_node, sharing[1]);
        assert_eq!(out[1].1.next_node, sharing[0]);
        // Final chunk is full-size but still has no successor.
        assert_eq!(out[2].1.size(), 512);
        assert!(out[2].1.next_node.is_null());
    }

    #[test]
    fn assign_to_single_peer() {
        let sharing = peers(1);
        let chunks = split_into_chunks(FileId::generate(), "f", &[0u8; 700]).unwrap();
        let out = assign_chunks_to_peers(chunks, &sharing);
        assert!(out.iter().all(|(p, _)| *p == sharing[0]));
        assert_eq!(out[0].1.next_node, sharing[0]);
    }
}
