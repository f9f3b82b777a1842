//! Device-registration-and-broadcast relay.
//!
//! Every peer (chair, camera, observer app) speaks to the same [`hub::RelayHub`]
//! through a transport; today that is the WebSocket endpoint in [`web`]. The hub
//! owns all relay state and processes one [`hub::HubMessage`] at a time.

pub mod classifier;
pub mod event;
pub mod hub;
pub mod normalizer;
pub mod registry;
pub mod web;

use eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Long running relay service (hub loop, transport listener, ...)
#[async_trait::async_trait]
pub trait RelayService {
    async fn run(&mut self) -> Result<()>;
}

/// Opaque identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Logical device identity a connection can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Chair,
    Camera,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Chair, DeviceRole::Camera];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Chair => "chair",
            DeviceRole::Camera => "camera",
        }
    }

    /// Name used in human readable messages sent to observers
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceRole::Chair => "Chair",
            DeviceRole::Camera => "Camera",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the hub asks a connection's writer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-serialized JSON text frame; shared between all recipients of a broadcast
    Text(Arc<str>),
    /// Transport level heartbeat ping
    Ping,
    /// Close the transport and stop writing
    Close,
}

