//! Capability registry
//!
//! Tracks every node seen on the bus: announces carry role and capability
//! lists, heartbeats refresh liveness. A node is declared unhealthy once its
//! last-seen timestamp ages past the heartbeat timeout; departed peers are
//! never removed, only marked unhealthy — the map is observational.

mod nodes;

pub use nodes::{NodeInfo, NodeMap};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use loqa_bus::{BusClient, BusError};
use loqa_config::NodeConfig;
use loqa_core::protocol::{Announce, Capability, Heartbeat};
use loqa_core::subjects;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Registry service handle.
pub struct Registry {
    cfg: NodeConfig,
    bus: BusClient,
    nodes: Arc<RwLock<NodeMap>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    /// Subscribe to control subjects, start the heartbeat and health timers,
    /// and announce the local node.
    pub async fn start(cfg: NodeConfig, bus: BusClient) -> Result<Arc<Self>, BusError> {
        let (shutdown, _) = watch::channel(false);
        let registry = Arc::new(Self {
            cfg,
            bus,
            nodes: Arc::new(RwLock::new(NodeMap::default())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        registry.spawn_announce_reader().await?;
        registry.spawn_heartbeat_reader().await?;
        registry.spawn_heartbeat_publisher();
        registry.spawn_health_evaluator();

        if let Err(error) = registry.announce().await {
            tracing::warn!(%error, "failed to announce node");
        }

        Ok(registry)
    }

    /// Signal background tasks and wait for them to finish.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// True iff the local node is present and healthy.
    pub fn healthy(&self) -> bool {
        self.nodes
            .read()
            .get(&self.cfg.id)
            .map(|node| node.healthy)
            .unwrap_or(false)
    }

    /// Snapshot of nodes matching the predicate.
    pub fn query(&self, filter: impl Fn(&NodeInfo) -> bool) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .iter()
            .filter(|node| filter(node))
            .cloned()
            .collect()
    }

    /// Capabilities currently advertised by the local node.
    pub fn local_capabilities(&self) -> Vec<Capability> {
        self.nodes
            .read()
            .get(&self.cfg.id)
            .map(|node| node.capabilities.clone())
            .unwrap_or_default()
    }

    fn local_capability_list(&self) -> Vec<Capability> {
        self.cfg
            .capabilities
            .iter()
            .map(|cap| Capability {
                name: cap.name.clone(),
                tier: cap.tier.clone(),
                attributes: cap.attributes.clone(),
            })
            .collect()
    }

    async fn announce(&self) -> Result<(), BusError> {
        let msg = Announce {
            node_id: self.cfg.id.clone(),
            role: self.cfg.role.clone(),
            capabilities: self.local_capability_list(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&msg).expect("announce serializes");
        self.bus
            .publish(subjects::NODE_ANNOUNCE, Bytes::from(payload))
            .await?;
        self.nodes
            .write()
            .apply_announce(&msg.node_id, &msg.role, msg.capabilities.clone(), msg.timestamp);
        Ok(())
    }

    async fn publish_heartbeat(&self) -> Result<(), BusError> {
        let msg = Heartbeat {
            node_id: self.cfg.id.clone(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&msg).expect("heartbeat serializes");
        self.bus
            .publish(&subjects::heartbeat_subject(&self.cfg.id), Bytes::from(payload))
            .await
    }

    async fn spawn_announce_reader(self: &Arc<Self>) -> Result<(), BusError> {
        let mut sub = self.bus.subscribe(subjects::NODE_ANNOUNCE).await?;
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        registry.handle_announce(&msg.payload).await;
                    }
                    _ = shutdown.changed() => {
                        let _ = sub.unsubscribe().await;
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn spawn_heartbeat_reader(self: &Arc<Self>) -> Result<(), BusError> {
        let mut sub = self.bus.subscribe(&subjects::heartbeat_wildcard()).await?;
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        registry.handle_heartbeat(&msg.payload);
                    }
                    _ = shutdown.changed() => {
                        let _ = sub.unsubscribe().await;
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    fn spawn_heartbeat_publisher(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_millis(self.cfg.heartbeat_interval_ms);
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = registry.publish_heartbeat().await {
                            tracing::warn!(%error, "failed to publish heartbeat");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    fn spawn_health_evaluator(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let timeout = chrono::Duration::milliseconds(self.cfg.heartbeat_timeout_ms as i64);
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (nodes, capabilities) = {
                            let mut map = registry.nodes.write();
                            map.evaluate(Utc::now(), timeout);
                            map.counts()
                        };
                        metrics::gauge!("loqa_registry_nodes").set(nodes as f64);
                        metrics::gauge!("loqa_registry_capabilities").set(capabilities as f64);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    async fn handle_announce(&self, payload: &[u8]) {
        let announce: Announce = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "invalid announce message");
                return;
            }
        };
        let newcomer = {
            let mut map = self.nodes.write();
            let known = map.get(&announce.node_id).is_some();
            map.apply_announce(
                &announce.node_id,
                &announce.role,
                announce.capabilities,
                announce.timestamp,
            );
            !known
        };
        // Let a newly seen peer learn about us in turn; known peers already
        // have our announce, so this converges.
        if newcomer && announce.node_id != self.cfg.id {
            if let Err(error) = self.announce().await {
                tracing::warn!(%error, "failed to re-announce to new peer");
            }
        }
    }

    fn handle_heartbeat(&self, payload: &[u8]) {
        let heartbeat: Heartbeat = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "invalid heartbeat message");
                return;
            }
        };
        self.nodes
            .write()
            .apply_heartbeat(&heartbeat.node_id, heartbeat.timestamp);
    }
}

/// Predicate matching nodes that advertise a capability by name.
pub fn with_capability(name: &str) -> impl Fn(&NodeInfo) -> bool + '_ {
    move |node| node.capabilities.iter().any(|cap| cap.name == name)
}

/// Predicate matching nodes that advertise any capability at the given tier.
pub fn with_tier(tier: &str) -> impl Fn(&NodeInfo) -> bool + '_ {
    move |node| {
        node.capabilities
            .iter()
            .any(|cap| cap.tier.as_deref() == Some(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(capabilities: Vec<Capability>) -> NodeInfo {
        NodeInfo {
            id: "peer".to_string(),
            role: "runtime".to_string(),
            capabilities,
            last_seen: Utc::now(),
            healthy: true,
        }
    }

    #[test]
    fn test_query_predicates() {
        let stt_fast = node(vec![Capability {
            name: "stt".to_string(),
            tier: Some("fast".to_string()),
            attributes: Default::default(),
        }]);

        assert!(with_capability("stt")(&stt_fast));
        assert!(!with_capability("tts")(&stt_fast));
        assert!(with_tier("fast")(&stt_fast));
        assert!(!with_tier("balanced")(&stt_fast));
    }
}
