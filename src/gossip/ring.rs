use std::collections::{BTreeMap, HashMap};

use crate::ids::fnv1a;

/// Consistent hash ring of nodes, each placed at several virtual points, with a load weight per
/// node. Used to choose where a new group's leader goes, never to route requests.
#[derive(Debug, Clone)]
pub struct Ring {
    virtual_nodes: usize,
    points: BTreeMap<u64, String>,
    weights: HashMap<String, u64>,
}

impl Ring {
    pub fn new(virtual_nodes: usize) -> Ring {
        Ring {
            virtual_nodes: virtual_nodes.max(1),
            points: BTreeMap::new(),
            weights: HashMap::new(),
        }
    }

    fn point(node: &str, replica: usize) -> u64 {
        fnv1a(format!("{}-{}", node, replica).as_bytes())
    }

    /// Adds `node` with weight 0. Adding a present node keeps its weight.
    pub fn add(&mut self, node: &str) {
        if self.weights.contains_key(node) {
            return;
        }
        for replica in 0..self.virtual_nodes {
            self.points.insert(Self::point(node, replica), node.to_string());
        }
        self.weights.insert(node.to_string(), 0);
    }

    pub fn remove(&mut self, node: &str) {
        if self.weights.remove(node).is_none() {
            return;
        }
        self.points.retain(|_, n| n != node);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.weights.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weight(&self, node: &str) -> Option<u64> {
        self.weights.get(node).copied()
    }

    pub fn set_weight(&mut self, node: &str, weight: u64) {
        if let Some(w) = self.weights.get_mut(node) {
            *w = weight;
        }
    }

    pub fn increment(&mut self, node: &str) {
        if let Some(w) = self.weights.get_mut(node) {
            *w += 1;
        }
    }

    /// Virtual points clockwise from the hash of `key`, wrapping around.
    fn walk<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a String> + 'a {
        let hash = fnv1a(key.as_bytes());
        self.points
            .range(hash..)
            .chain(self.points.range(..hash))
            .map(|(_, node)| node)
    }

    /// The node owning `key`: the first virtual point clockwise from its hash.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.walk(key).next().map(String::as_str)
    }

    /// The node with the lowest weight. Among equally loaded nodes the first one clockwise from
    /// the hash of `key` wins.
    pub fn get_least(&self, key: &str) -> Option<&str> {
        let least = self.weights.values().min()?;
        self.walk(key)
            .find(|node| self.weights.get(node.as_str()) == Some(least))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> Ring {
        let mut ring = Ring::new(10);
        for node in ["10.0.0.1:60020", "10.0.0.2:60020", "10.0.0.3:60020"] {
            ring.add(node);
        }
        ring
    }

    #[test]
    fn get_is_stable() {
        let ring = ring();
        let owner = ring.get("1234").unwrap().to_string();
        assert_eq!(ring.get("1234"), Some(owner.as_str()));
        assert_eq!(ring.points.len(), 30);
    }

    #[test]
    fn get_least_prefers_lightest_node() {
        let mut ring = ring();
        ring.set_weight("10.0.0.1:60020", 3);
        ring.set_weight("10.0.0.2:60020", 1);
        ring.set_weight("10.0.0.3:60020", 2);
        for key in ["a", "b", "c", "d"] {
            assert_eq!(ring.get_least(key), Some("10.0.0.2:60020"));
        }
    }

    #[test]
    fn ties_follow_hash_order() {
        let ring = ring();
        for key in ["a", "b", "c", "d"] {
            assert_eq!(ring.get_least(key), ring.get(key));
        }
    }

    #[test]
    fn increments_spread_placements() {
        let mut ring = ring();
        let mut picked = Vec::new();
        for group in 0..3 {
            let node = ring.get_least(&group.to_string()).unwrap().to_string();
            ring.increment(&node);
            picked.push(node);
        }
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn remove_drops_points() {
        let mut ring = ring();
        ring.remove("10.0.0.1:60020");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.points.len(), 20);
        assert!(Ring::new(3).get_least("x").is_none());
    }
}
