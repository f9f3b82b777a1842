//! Role → connection bindings.
//!
//! At most one connection holds a [`DeviceRole`]. Registering a role again simply
//! re-points it; the superseded connection stays open but is no longer addressable
//! by that role. Removal is keyed on connection identity so a closing connection can
//! never clear a binding that was already handed to someone else.

use super::{ConnId, DeviceRole};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    bindings: HashMap<DeviceRole, ConnId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `role` to `conn`, returning the connection it superseded (if any and different).
    pub fn register(&mut self, role: DeviceRole, conn: ConnId) -> Option<ConnId> {
        let previous = self.bindings.insert(role, conn);
        match previous {
            Some(prev) if prev != conn => {
                debug!(%role, new = %conn, old = %prev, "Role binding superseded");
                Some(prev)
            }
            Some(_) => None,
            None => {
                debug!(%role, %conn, "Role bound");
                None
            }
        }
    }

    /// Clear every role bound to exactly `conn`. Returns the roles that were cleared.
    pub fn unregister(&mut self, conn: ConnId) -> Vec<DeviceRole> {
        let mut cleared: Vec<DeviceRole> = self
            .bindings
            .iter()
            .filter(|(_, bound)| **bound == conn)
            .map(|(role, _)| *role)
            .collect();
        cleared.sort();
        for role in &cleared {
            self.bindings.remove(role);
            debug!(%role, %conn, "Role unbound");
        }
        cleared
    }

    pub fn lookup(&self, role: DeviceRole) -> Option<ConnId> {
        self.bindings.get(&role).copied()
    }

    pub fn is_bound(&self, role: DeviceRole) -> bool {
        self.bindings.contains_key(&role)
    }
}
