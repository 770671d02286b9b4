//! Data-node membership: `spec.md` §4.3.

mod node;

pub use node::NodeSession;

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("not enough data nodes: need {need}, have {have}")]
    NotEnoughNodes { need: usize, have: usize },
}

/// The controller's live data-node membership table.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<u16, Arc<NodeSession>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: DashMap::new() }
    }

    /// Registers a newly joined node, replacing any prior session on the
    /// same port.
    pub fn join(&self, port: u16, session: Arc<NodeSession>) {
        self.nodes.insert(port, session);
    }

    #[must_use]
    pub fn get(&self, port: u16) -> Option<Arc<NodeSession>> {
        self.nodes.get(&port).map(|e| Arc::clone(e.value()))
    }

    /// Removes a node from the registry. Does not touch the file index;
    /// callers are expected to scrub the port from replica sets themselves
    /// (see [`crate::server::Controller::evict_node`]).
    pub fn remove(&self, port: u16) -> Option<Arc<NodeSession>> {
        self.nodes.remove(&port).map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ports of every live node, ascending.
    #[must_use]
    pub fn live_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.nodes.iter().map(|e| *e.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// The `n` least-loaded nodes, ascending by `(file_count, port)` so ties
    /// break deterministically on port number.
    pub fn select_least_loaded(&self, n: usize) -> Result<Vec<u16>, RegistryError> {
        let mut loaded: Vec<(i64, u16)> =
            self.nodes.iter().map(|e| (e.value().file_count(), *e.key())).collect();
        if loaded.len() < n {
            return Err(RegistryError::NotEnoughNodes { need: n, have: loaded.len() });
        }
        loaded.sort_unstable();
        Ok(loaded.into_iter().take(n).map(|(_, port)| port).collect())
    }

    pub fn adjust_count(&self, port: u16, delta: i64) {
        if let Some(session) = self.nodes.get(&port) {
            session.adjust_count(delta);
        }
    }

    pub fn set_count(&self, port: u16, value: i64) {
        if let Some(session) = self.nodes.get(&port) {
            session.set_count(value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_session(port: u16) -> Arc<NodeSession> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (accepted, connected) = tokio::try_join!(
            async { listener.accept().await.map(|(s, _)| s) },
            tokio::net::TcpStream::connect(addr),
        )
        .expect("connect");
        drop(connected);
        let (_, write_half) = accepted.into_split();
        Arc::new(NodeSession::new(port, write_half))
    }

    #[tokio::test]
    async fn select_least_loaded_breaks_ties_by_port() {
        let registry = NodeRegistry::new();
        for port in [4003, 4001, 4002] {
            registry.join(port, fake_session(port).await);
        }
        assert_eq!(registry.select_least_loaded(2).unwrap(), vec![4001, 4002]);
    }

    #[tokio::test]
    async fn select_least_loaded_prefers_smaller_count() {
        let registry = NodeRegistry::new();
        let a = fake_session(4001).await;
        a.adjust_count(5);
        registry.join(4001, a);
        registry.join(4002, fake_session(4002).await);
        registry.join(4003, fake_session(4003).await);
        assert_eq!(registry.select_least_loaded(2).unwrap(), vec![4002, 4003]);
    }

    #[tokio::test]
    async fn select_least_loaded_fails_when_short() {
        let registry = NodeRegistry::new();
        registry.join(4001, fake_session(4001).await);
        assert_eq!(
            registry.select_least_loaded(2),
            Err(RegistryError::NotEnoughNodes { need: 2, have: 1 })
        );
    }

    #[tokio::test]
    async fn remove_evicts_from_live_ports() {
        let registry = NodeRegistry::new();
        registry.join(4001, fake_session(4001).await);
        registry.join(4002, fake_session(4002).await);
        registry.remove(4001);
        assert_eq!(registry.live_ports(), vec![4002]);
    }
}
