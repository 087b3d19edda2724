//! Live connections by peer identity
//!
//! A `PeerIdentity` outlives any number of connections. At most one
//! connection is registered per identity; a reconnect replaces the previous
//! one, which is closed so its pending requests fail instead of leaking.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::CloseReason;
use crate::types::PeerIdentity;

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerIdentity, Connection>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under its remote identity.
    ///
    /// Returns the connection it replaced, already closed.
    pub fn attach(&self, connection: Connection) -> Option<Connection> {
        let identity = connection.peer().clone();
        let new_id = connection.id();
        let previous = self.peers.write().insert(identity.clone(), connection);

        match previous {
            Some(old) if old.id() != new_id => {
                info!("{} reconnected, closing connection #{}", identity, old.id());
                old.close_with(CloseReason::Replaced);
                Some(old)
            }
            _ => None,
        }
    }

    /// Remove the entry for `identity` if it still belongs to `connection_id`
    pub fn detach(&self, identity: &PeerIdentity, connection_id: u64) -> bool {
        let mut peers = self.peers.write();
        match peers.get(identity) {
            Some(current) if current.id() == connection_id => {
                peers.remove(identity);
                debug!("{} detached (connection #{})", identity, connection_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<Connection> {
        self.peers.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.peers.read().contains_key(identity)
    }

    /// Connected identities, sorted
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers())
            .finish()
    }
}
