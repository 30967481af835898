//! Node map
//!
//! Pure bookkeeping over known nodes, kept free of bus wiring so the health
//! timing rules are directly testable.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use loqa_core::protocol::Capability;
use serde::Serialize;

/// Everything known about one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub role: String,
    pub capabilities: Vec<Capability>,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
}

/// Map from node identifier to node state.
#[derive(Debug, Default)]
pub struct NodeMap {
    nodes: HashMap<String, NodeInfo>,
}

impl NodeMap {
    pub fn get(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Record an announce: refresh role and capabilities, mark healthy.
    pub fn apply_announce(
        &mut self,
        node_id: &str,
        role: &str,
        capabilities: Vec<Capability>,
        timestamp: DateTime<Utc>,
    ) {
        let node = self.entry(node_id);
        if !role.is_empty() {
            node.role = role.to_string();
        }
        if !capabilities.is_empty() {
            node.capabilities = capabilities;
        }
        node.last_seen = timestamp;
        node.healthy = true;
    }

    /// Record a heartbeat: refresh last-seen, mark healthy. Role and
    /// capabilities are left as previously announced.
    pub fn apply_heartbeat(&mut self, node_id: &str, timestamp: DateTime<Utc>) {
        let node = self.entry(node_id);
        node.last_seen = timestamp;
        node.healthy = true;
    }

    /// Mark every node unhealthy whose last-seen timestamp is older than the
    /// heartbeat timeout. Nodes are never removed.
    pub fn evaluate(&mut self, now: DateTime<Utc>, timeout: Duration) {
        for node in self.nodes.values_mut() {
            if now - node.last_seen > timeout {
                node.healthy = false;
            }
        }
    }

    /// (node count, total advertised capabilities)
    pub fn counts(&self) -> (usize, usize) {
        let capabilities = self.nodes.values().map(|n| n.capabilities.len()).sum();
        (self.nodes.len(), capabilities)
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeInfo {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeInfo {
                id: node_id.to_string(),
                role: String::new(),
                capabilities: Vec::new(),
                last_seen: Utc::now(),
                healthy: true,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, secs).unwrap()
    }

    fn cap(name: &str) -> Capability {
        Capability {
            name: name.to_string(),
            tier: Some("balanced".to_string()),
            attributes: Default::default(),
        }
    }

    #[test]
    fn test_announce_then_heartbeat_keeps_capabilities() {
        let mut map = NodeMap::default();
        map.apply_announce("peer", "runtime", vec![cap("stt")], at(0));
        map.apply_heartbeat("peer", at(5));

        let node = map.get("peer").unwrap();
        assert_eq!(node.capabilities.len(), 1);
        assert_eq!(node.last_seen, at(5));
        assert!(node.healthy);
    }

    #[test]
    fn test_stale_node_marked_unhealthy_not_removed() {
        let mut map = NodeMap::default();
        map.apply_announce("peer", "runtime", vec![cap("stt")], at(0));
        map.apply_heartbeat("local", at(9));

        map.evaluate(at(10), Duration::milliseconds(600));

        assert!(!map.get("peer").unwrap().healthy);
        assert!(map.get("local").unwrap().healthy);
        assert_eq!(map.counts().0, 2);
    }

    #[test]
    fn test_node_exactly_at_timeout_stays_healthy() {
        let mut map = NodeMap::default();
        map.apply_heartbeat("peer", at(0));

        // now - last_seen == timeout is not yet past the deadline
        map.evaluate(at(1), Duration::seconds(1));
        assert!(map.get("peer").unwrap().healthy);

        map.evaluate(at(2), Duration::seconds(1));
        assert!(!map.get("peer").unwrap().healthy);
    }

    #[test]
    fn test_heartbeat_revives_unhealthy_node() {
        let mut map = NodeMap::default();
        map.apply_heartbeat("peer", at(0));
        map.evaluate(at(10), Duration::seconds(1));
        assert!(!map.get("peer").unwrap().healthy);

        map.apply_heartbeat("peer", at(11));
        assert!(map.get("peer").unwrap().healthy);
    }
}
