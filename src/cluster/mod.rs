// SPDX-License-Identifier: Apache-2.0

//! The S2S fabric: the copy-on-write node/service tables and the per-peer
//! links that carry envelopes between nodes.

use crate::{
    config::ServerConfig,
    server::Runtime,
    NodeId,
};
use arc_swap::ArcSwap;
use log::info;
use rand::Rng;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

pub mod listener;
pub mod peer;

use peer::PeerLink;

/// Read-mostly snapshot of the fleet: endpoints per node and service
/// membership. Replaced wholesale on topology changes.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeTable {
    pub endpoints: HashMap<NodeId, SocketAddr>,
    pub services: HashMap<u16, Vec<NodeId>>,
}

impl NodeTable {
    fn from_config(cfg: &ServerConfig) -> Self {
        let mut table = NodeTable::default();
        for peer in &cfg.peers {
            table.endpoints.insert(peer.node_id.clone(), peer.address);
            if let Some(service_id) = peer.service_id {
                table.services.entry(service_id).or_default().push(peer.node_id.clone());
            }
        }
        if let Some(service_id) = cfg.service_id {
            table.services.entry(service_id).or_default().push(cfg.node_id.clone());
        }
        table
    }
}

/// Per-link tunables shared by every peer writer.
#[derive(Clone, Debug)]
pub(crate) struct LinkSettings {
    pub compression_threshold: usize,
    pub sweep_period: Duration,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
}

impl LinkSettings {
    fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            compression_threshold: cfg.compression_threshold_bytes,
            sweep_period: Duration::from_millis(50),
            backoff_floor: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(8),
        }
    }
}

/// The fleet view of one node.
pub(crate) struct Cluster {
    self_node: NodeId,
    settings: LinkSettings,
    table: ArcSwap<NodeTable>,
    links: Mutex<HashMap<NodeId, Arc<PeerLink>>>,
    cursors: Mutex<HashMap<u16, usize>>,
}

impl Cluster {
    pub fn new(cfg: &ServerConfig) -> Self {
        Self {
            self_node: cfg.node_id.clone(),
            settings: LinkSettings::from_config(cfg),
            table: ArcSwap::from_pointee(NodeTable::from_config(cfg)),
            links: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Install the loopback link onto the freshly built runtime. Called
    /// once during bootstrap.
    pub fn attach(&self, runtime: &Arc<Runtime>) {
        let loopback = PeerLink::loopback(self.self_node.clone(), Arc::downgrade(runtime), &self.settings);
        self.links.lock().unwrap().insert(self.self_node.clone(), loopback);
    }

    /// Add or update one peer in the snapshot.
    pub fn add_peer(&self, node_id: NodeId, address: SocketAddr, service_id: Option<u16>) {
        let mut table = (**self.table.load()).clone();
        table.endpoints.insert(node_id.clone(), address);
        if let Some(service) = service_id {
            let members = table.services.entry(service).or_default();
            if !members.contains(&node_id) {
                members.push(node_id);
            }
        }
        self.table.store(Arc::new(table));
    }

    /// The link to a node, lazily connecting on first use. `None` for
    /// nodes absent from the endpoint table.
    pub fn link(&self, node_id: &str) -> Option<Arc<PeerLink>> {
        if let Some(link) = self.links.lock().unwrap().get(node_id) {
            return Some(link.clone());
        }
        let address = *self.table.load().endpoints.get(node_id)?;
        let mut links = self.links.lock().unwrap();
        // racing callers: first one in wins
        if let Some(link) = links.get(node_id) {
            return Some(link.clone());
        }
        info!("opening link to node {} at {}", node_id, address);
        let link = PeerLink::remote(node_id.to_string(), address, self.settings.clone());
        links.insert(node_id.to_string(), link.clone());
        Some(link)
    }

    /// Pick a live Api node serving `service_id`: round-robin from a
    /// random start, skipping nodes whose link is down.
    pub fn select_api(&self, service_id: u16) -> Option<NodeId> {
        let table = self.table.load();
        let members = table.services.get(&service_id)?;
        if members.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors
            .entry(service_id)
            .or_insert_with(|| rand::thread_rng().gen_range(0..members.len()));
        for offset in 0..members.len() {
            let idx = (*cursor + offset) % members.len();
            let node = &members[idx];
            let healthy = match self.link(node) {
                Some(link) => link.healthy(),
                None => false,
            };
            if healthy {
                *cursor = (idx + 1) % members.len();
                return Some(node.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn cfg_with_peers() -> ServerConfig {
        let mut cfg = ServerConfig::new("play-1");
        cfg.service_id = None;
        cfg.peers = vec![
            PeerConfig {
                node_id: "api-1".to_string(),
                address: "127.0.0.1:7101".parse().unwrap(),
                service_id: Some(2),
            },
            PeerConfig {
                node_id: "api-2".to_string(),
                address: "127.0.0.1:7102".parse().unwrap(),
                service_id: Some(2),
            },
        ];
        cfg
    }

    #[test]
    fn table_collects_endpoints_and_services() {
        let table = NodeTable::from_config(&cfg_with_peers());
        assert_eq!(table.endpoints.len(), 2);
        assert_eq!(table.services.get(&2).unwrap().len(), 2);
    }

    #[test]
    fn self_service_membership_is_included() {
        let mut cfg = cfg_with_peers();
        cfg.service_id = Some(2);
        let table = NodeTable::from_config(&cfg);
        assert!(table.services.get(&2).unwrap().contains(&"play-1".to_string()));
    }

    #[tokio::test]
    async fn unknown_node_has_no_link() {
        let cluster = Cluster::new(&cfg_with_peers());
        assert!(cluster.link("nope").is_none());
        assert!(cluster.link("api-1").is_some());
    }
}
