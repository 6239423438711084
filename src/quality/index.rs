//! Near-duplicate lookup over perceptual hashes.
//!
//! A BK-tree per hash length: lookups only descend into children whose edge
//! distance lies within `threshold` of the query distance, so a search touches
//! a small fraction of the catalog rather than every hash.

use std::collections::HashMap;

use super::hashing::{decode_hash, hamming_distance};

#[derive(Debug)]
struct Node {
    hash: Vec<u8>,
    record_id: String,
    children: HashMap<u32, usize>,
}

#[derive(Debug, Default)]
struct BkTree {
    nodes: Vec<Node>,
}

impl BkTree {
    fn insert(&mut self, hash: Vec<u8>, record_id: String) {
        if self.nodes.is_empty() {
            self.nodes.push(Node {
                hash,
                record_id,
                children: HashMap::new(),
            });
            return;
        }

        let mut current = 0;
        loop {
            let distance = hamming_distance(&self.nodes[current].hash, &hash);
            if distance == 0 && self.nodes[current].record_id == record_id {
                return;
            }
            match self.nodes[current].children.get(&distance) {
                Some(&child) => current = child,
                None => {
                    let index = self.nodes.len();
                    self.nodes.push(Node {
                        hash,
                        record_id,
                        children: HashMap::new(),
                    });
                    self.nodes[current].children.insert(distance, index);
                    return;
                }
            }
        }
    }

    /// Closest entry strictly below `threshold`, with the number of nodes visited.
    fn nearest_within(&self, hash: &[u8], threshold: u32) -> (Option<(&str, u32)>, usize) {
        if self.nodes.is_empty() || threshold == 0 {
            return (None, 0);
        }

        let radius = threshold - 1;
        let mut best: Option<(&str, u32)> = None;
        let mut visited = 0;
        let mut stack = vec![0usize];

        while let Some(index) = stack.pop() {
            visited += 1;
            let node = &self.nodes[index];
            let distance = hamming_distance(&node.hash, hash);
            if distance <= radius && best.map_or(true, |(_, d)| distance < d) {
                best = Some((node.record_id.as_str(), distance));
            }

            let low = distance.saturating_sub(radius);
            let high = distance.saturating_add(radius);
            stack.extend(
                node.children
                    .iter()
                    .filter(|(edge, _)| (low..=high).contains(*edge))
                    .map(|(_, child)| *child),
            );
        }

        (best, visited)
    }
}

/// In-memory near-duplicate index for one run, seeded from the catalog.
#[derive(Debug, Default)]
pub struct NearDuplicateIndex {
    trees: HashMap<usize, BkTree>,
    len: usize,
}

impl NearDuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(record_id, base64 hash)` pairs; undecodable hashes are skipped.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut index = Self::new();
        for (record_id, hash) in entries {
            index.insert(&record_id, &hash);
        }
        index
    }

    pub fn insert(&mut self, record_id: &str, hash: &str) -> bool {
        let Some(bytes) = decode_hash(hash) else {
            return false;
        };
        self.trees
            .entry(bytes.len())
            .or_default()
            .insert(bytes, record_id.to_string());
        self.len += 1;
        true
    }

    /// The closest indexed record at Hamming distance below `threshold`.
    pub fn find_within(&self, hash: &str, threshold: u32) -> Option<(String, u32)> {
        self.find_with_stats(hash, threshold).0
    }

    fn find_with_stats(&self, hash: &str, threshold: u32) -> (Option<(String, u32)>, usize) {
        let Some(bytes) = decode_hash(hash) else {
            return (None, 0);
        };
        match self.trees.get(&bytes.len()) {
            Some(tree) => {
                let (found, visited) = tree.nearest_within(&bytes, threshold);
                (found.map(|(id, d)| (id.to_string(), d)), visited)
            }
            None => (None, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn encode(value: u64) -> String {
        BASE64.encode(value.to_be_bytes())
    }

    #[test]
    fn test_finds_nearest_below_threshold() {
        let mut index = NearDuplicateIndex::new();
        index.insert("a", &encode(0));
        index.insert("b", &encode(0b1111)); // distance 4 from 0
        index.insert("c", &encode(u64::MAX));

        assert_eq!(index.find_within(&encode(0b1), 10), Some(("a".to_string(), 1)));
        assert_eq!(index.find_within(&encode(0b1111_1000_0000), 10), Some(("a".to_string(), 5)));
        assert_eq!(index.find_within(&encode(u64::MAX >> 2), 3), Some(("c".to_string(), 2)));
        assert!(index.find_within(&encode(0xFFFF_FFFF), 10).is_none());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut index = NearDuplicateIndex::new();
        index.insert("a", &encode(0));

        // distance exactly 10 is allowed to coexist
        assert!(index.find_within(&encode(0b11_1111_1111), 10).is_none());
        assert!(index.find_within(&encode(0b1_1111_1111), 10).is_some());
        assert!(index.find_within(&encode(0), 0).is_none());
    }

    #[test]
    fn test_hash_lengths_are_separate() {
        let mut index = NearDuplicateIndex::new();
        index.insert("short", &BASE64.encode([0u8; 4]));
        assert!(index.find_within(&encode(0), 10).is_none());
        assert!(!index.insert("junk", "not base64!"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_lookup_is_sublinear() {
        let mut state = 0x2545_F491_4F6C_DD1D_u64;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut index = NearDuplicateIndex::new();
        for i in 0..5000 {
            index.insert(&i.to_string(), &encode(next()));
        }

        let mut total_visited = 0;
        for _ in 0..50 {
            let (_, visited) = index.find_with_stats(&encode(next()), 3);
            total_visited += visited;
        }
        assert!(total_visited / 50 < 5000 / 2, "visited {} on average", total_visited / 50);
    }
}
