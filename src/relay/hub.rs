//! Relay hub
//!
//! # Overview
//! A single asynchronous owner of all relay state. Transports never touch the
//! registry or the connection set directly; they submit [`HubMessage`]s through a
//! [`RelayHandle`] and the hub processes them strictly one at a time, together with
//! its own heartbeat ticks. Because only the hub loop mutates state, a
//! registry update and the broadcast that follows it can never interleave with
//! another peer's events.
//!
//! # Connection lifecycle
//! `Connecting → Open → Closing → Closed`
//! * `Connecting` is the HTTP upgrade, handled entirely by the transport. The hub
//!   first sees a peer on `Connected`, registers its outbound queue as `Open` and
//!   sends the two handshake events (`server_role`, then `connection_established`).
//! * While open, text frames are decoded, classified and either broadcast
//!   (device telemetry), relayed (control commands) or dropped.
//! * Every heartbeat tick, a peer that has not answered the previous ping is
//!   terminated; everyone else gets a fresh ping.
//! * A terminated peer is `Closing`: it is sent a close frame and loses its roles
//!   immediately, but stays tracked until its transport reports `Closed`. Closing
//!   peers receive nothing and their frames are ignored. One still closing at the
//!   next tick is dropped without waiting.
//! * `Closed` means the entry is gone. Evicting a peer clears its role bindings and
//!   broadcasts the derived disconnect event for each role it held, exactly once.
//!   Closing twice is a no-op.
//!
//! # Outbound delivery
//! Events are serialized once per broadcast and the same `Arc<str>` is queued to
//! every open peer. A failed enqueue only means that peer's writer is gone; it is
//! logged and the batch continues. Closure is driven by the transport or the
//! heartbeat, never by a failed send.

use super::classifier::{
    ChairPayload, ChairSubKind, Classified, ControlCommand, InboundFrame, MessageClassifier,
};
use super::event::OutboundEvent;
use super::normalizer;
use super::registry::PeerRegistry;
use super::{ConnId, DeviceRole, Outbound, RelayService};
use crate::error::{AppError, err};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Everything the hub reacts to besides its own heartbeat timer.
#[derive(Debug)]
pub enum HubMessage {
    /// Transport finished the upgrade; `outbound` feeds the peer's writer
    Connected {
        conn_id: ConnId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// A UTF-8 text frame exactly as received
    Frame { conn_id: ConnId, text: String },
    /// Answer to a heartbeat ping
    Pong { conn_id: ConnId },
    /// Transport reported close or error
    Closed { conn_id: ConnId },
    /// Chair reading posted over HTTP instead of a socket
    Ingest {
        frame: InboundFrame,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub connections: usize,
    pub roles: BTreeMap<DeviceRole, bool>,
}

/// State of a tracked peer. Untracked peers are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Close frame queued, waiting for the transport to go away
    Closing,
}

#[derive(Debug)]
struct PeerEntry {
    addr: SocketAddr,
    state: ConnectionState,
    /// Cleared when a ping is sent, set again on pong
    alive: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Cloneable submission side of the hub, handed to every transport.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<HubMessage>,
    next_conn_id: Arc<AtomicU64>,
}

impl RelayHandle {
    fn submit(&self, msg: HubMessage) {
        if let Err(e) = self.tx.send(msg) {
            warn!("Relay hub is not running, dropping {:?}", e.0);
        }
    }

    /// Allocate an id for a freshly upgraded peer and attach it to the hub.
    pub fn connect(&self, addr: SocketAddr) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = ConnId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, rx) = mpsc::unbounded_channel();
        self.submit(HubMessage::Connected {
            conn_id,
            addr,
            outbound,
        });
        (conn_id, rx)
    }

    pub fn frame(&self, conn_id: ConnId, text: String) {
        self.submit(HubMessage::Frame { conn_id, text });
    }

    pub fn pong(&self, conn_id: ConnId) {
        self.submit(HubMessage::Pong { conn_id });
    }

    pub fn closed(&self, conn_id: ConnId) {
        self.submit(HubMessage::Closed { conn_id });
    }

    pub async fn ingest(&self, frame: InboundFrame) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Ingest { frame, reply })
            .map_err(|_| err::internal("relay hub is not running"))?;
        rx.await
            .map_err(|_| err::internal("relay hub dropped the ingest request"))?
    }

    pub async fn status(&self) -> Result<RelayStatus, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Status { reply })
            .map_err(|_| err::internal("relay hub is not running"))?;
        rx.await
            .map_err(|_| err::internal("relay hub dropped the status request"))
    }

    pub fn shutdown(&self) {
        self.submit(HubMessage::Shutdown);
    }
}

pub struct RelayHub {
    server_role: String,
    ping_interval: Duration,
    classifier: MessageClassifier,
    inbox: mpsc::UnboundedReceiver<HubMessage>,
    peers: HashMap<ConnId, PeerEntry>,
    registry: PeerRegistry,
}

impl RelayHub {
    pub fn new(
        server_role: impl Into<String>,
        ping_interval: Duration,
        classifier: MessageClassifier,
    ) -> (Self, RelayHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let hub = Self {
            server_role: server_role.into(),
            ping_interval,
            classifier,
            inbox,
            peers: HashMap::new(),
            registry: PeerRegistry::new(),
        };
        let handle = RelayHandle {
            tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    pub fn from_config(config: &crate::config::AppConfig) -> (Self, RelayHandle) {
        Self::new(
            config.server.role.clone(),
            config.relay.ping_interval(),
            MessageClassifier::from_config(&config.relay),
        )
    }

    /// Process one message. Returns false once the hub should stop.
    pub fn handle_message(&mut self, msg: HubMessage) -> bool {
        match msg {
            HubMessage::Connected {
                conn_id,
                addr,
                outbound,
            } => self.handle_connected(conn_id, addr, outbound),
            HubMessage::Frame { conn_id, text } => self.handle_frame(conn_id, &text),
            HubMessage::Pong { conn_id } => {
                if let Some(peer) = self.peers.get_mut(&conn_id) {
                    trace!(%conn_id, "Pong received");
                    peer.alive = true;
                }
            }
            HubMessage::Closed { conn_id } => self.close(conn_id),
            HubMessage::Ingest { frame, reply } => {
                let result = self.handle_ingest(frame);
                let _ = reply.send(result);
            }
            HubMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            HubMessage::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn handle_connected(
        &mut self,
        conn_id: ConnId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        self.peers.insert(
            conn_id,
            PeerEntry {
                addr,
                state: ConnectionState::Open,
                alive: true,
                outbound,
            },
        );

        let now = Utc::now();
        self.send_to(conn_id, &OutboundEvent::server_role(&self.server_role, now));
        self.send_to(conn_id, &OutboundEvent::connection_established(now));
        info!(%conn_id, %addr, peers = self.peers.len(), "Peer connected");
    }

    fn handle_frame(&mut self, conn_id: ConnId, text: &str) {
        match self.peers.get(&conn_id) {
            Some(peer) if peer.state == ConnectionState::Open => {}
            _ => {
                debug!(%conn_id, "Frame from a peer that is no longer open, ignoring");
                return;
            }
        }
        trace!(target: crate::FRAMES_TARGET, %conn_id, frame = %text, "Inbound frame");

        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%conn_id, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let now = Utc::now();
        match self.classifier.classify(frame) {
            Classified::Chair { kind, payload } => {
                self.registry.register(DeviceRole::Chair, conn_id);
                debug!(%conn_id, ?kind, "Chair frame");
                let event = normalizer::normalize_chair(kind, payload, now);
                self.broadcast(&event);
            }
            Classified::Camera(payload) => {
                self.registry.register(DeviceRole::Camera, conn_id);
                debug!(%conn_id, "Camera frame");
                for event in normalizer::normalize_camera(payload, now) {
                    self.broadcast(&event);
                }
            }
            Classified::Control(command) => self.relay_control(conn_id, text, &command),
            Classified::Unrecognized => {
                debug!(%conn_id, "Unrecognized frame dropped");
            }
        }
    }

    /// Forward `text` verbatim to the camera, or tell the sender it is not there.
    fn relay_control(&mut self, origin: ConnId, text: &str, command: &ControlCommand) {
        let target = DeviceRole::Camera;
        let delivered = match self.open_peer_for(target) {
            Some((target_id, peer)) => {
                match peer.outbound.send(Outbound::Text(Arc::from(text))) {
                    Ok(()) => {
                        info!(%origin, target = %target_id, action = ?command.action, "Control command relayed");
                        true
                    }
                    Err(_) => {
                        warn!(%origin, target = %target_id, "Camera writer is gone, control command not delivered");
                        false
                    }
                }
            }
            None => false,
        };

        if !delivered {
            let e = err::not_connected(target.display_name());
            debug!(%origin, error = %e, "Control command has no target");
            self.send_to(origin, &OutboundEvent::error(e.to_string(), Utc::now()));
        }
    }

    fn handle_ingest(&mut self, frame: InboundFrame) -> Result<(), AppError> {
        if !self.classifier.is_chair(&frame) {
            return Err(err::invalid_device("Invalid device"));
        }
        // always a plain reading, whatever sub-kind the frame claims
        let event =
            normalizer::normalize_chair(ChairSubKind::Data, ChairPayload::from(frame), Utc::now());
        self.broadcast(&event);
        Ok(())
    }

    fn open_peer_for(&self, role: DeviceRole) -> Option<(ConnId, &PeerEntry)> {
        let conn_id = self.registry.lookup(role)?;
        self.peers
            .get(&conn_id)
            .filter(|peer| peer.state == ConnectionState::Open)
            .map(|peer| (conn_id, peer))
    }

    fn serialize(event: &OutboundEvent) -> Option<Arc<str>> {
        match serde_json::to_string(event) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                error!(event = event.kind(), error = %e, "Failed to serialize outbound event");
                None
            }
        }
    }

    /// Queue `event` for a single peer regardless of broadcast eligibility.
    fn send_to(&self, conn_id: ConnId, event: &OutboundEvent) {
        let Some(peer) = self.peers.get(&conn_id) else {
            return;
        };
        let Some(json) = Self::serialize(event) else {
            return;
        };
        if peer.outbound.send(Outbound::Text(json)).is_err() {
            warn!(%conn_id, event = event.kind(), "Failed to queue event for peer");
        }
    }

    /// Serialize once and queue to every open peer. Returns how many peers accepted it.
    pub fn broadcast(&self, event: &OutboundEvent) -> usize {
        let Some(json) = Self::serialize(event) else {
            return 0;
        };
        let mut delivered = 0;
        for (conn_id, peer) in &self.peers {
            if peer.state != ConnectionState::Open {
                continue;
            }
            match peer.outbound.send(Outbound::Text(json.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(%conn_id, addr = %peer.addr, event = event.kind(), "Broadcast to peer failed");
                }
            }
        }
        debug!(event = event.kind(), delivered, "Broadcast");
        delivered
    }

    /// One liveness round: terminate peers that missed the last ping, ping the rest.
    pub fn heartbeat_tick(&mut self) {
        let mut dead = Vec::new();
        let mut lingering = Vec::new();
        for (conn_id, peer) in self.peers.iter_mut() {
            if peer.state == ConnectionState::Closing {
                lingering.push(*conn_id);
                continue;
            }
            if !peer.alive {
                dead.push(*conn_id);
                continue;
            }
            peer.alive = false;
            if peer.outbound.send(Outbound::Ping).is_err() {
                debug!(%conn_id, "Could not queue ping");
            }
        }
        for conn_id in lingering {
            debug!(%conn_id, "Transport never confirmed close, dropping peer");
            self.close(conn_id);
        }
        for conn_id in dead {
            warn!(%conn_id, "Peer missed heartbeat, terminating");
            self.terminate(conn_id);
        }
    }

    /// Queue a close frame and evict the peer's roles; the entry stays `Closing`
    /// until the transport reports `Closed`.
    fn terminate(&mut self, conn_id: ConnId) {
        let Some(peer) = self.peers.get_mut(&conn_id) else {
            return;
        };
        if peer.state == ConnectionState::Closing {
            return;
        }
        peer.state = ConnectionState::Closing;
        let _ = peer.outbound.send(Outbound::Close);
        self.evict_roles(conn_id);
    }

    /// Forget a peer. Idempotent: unknown ids are ignored.
    fn close(&mut self, conn_id: ConnId) {
        let Some(peer) = self.peers.remove(&conn_id) else {
            debug!(%conn_id, "Close for unknown or already evicted peer");
            return;
        };
        info!(%conn_id, addr = %peer.addr, state = ?peer.state, peers = self.peers.len(), "Peer disconnected");
        // no-op for a peer that was terminated first
        self.evict_roles(conn_id);
    }

    fn evict_roles(&mut self, conn_id: ConnId) {
        let roles = self.registry.unregister(conn_id);
        if roles.is_empty() {
            return;
        }
        info!(%conn_id, ?roles, "Device roles evicted");

        let now = Utc::now();
        for role in roles {
            let event = match role {
                DeviceRole::Chair => normalizer::chair_disconnected(now),
                DeviceRole::Camera => normalizer::camera_inactive(now),
            };
            self.broadcast(&event);
        }
    }

    fn status(&self) -> RelayStatus {
        RelayStatus {
            connections: self
                .peers
                .values()
                .filter(|p| p.state == ConnectionState::Open)
                .count(),
            roles: DeviceRole::ALL
                .iter()
                .map(|role| (*role, self.registry.is_bound(*role)))
                .collect(),
        }
    }

    fn shutdown(&mut self) {
        info!(peers = self.peers.len(), "Relay hub shutting down, closing peers");
        for (_, peer) in self.peers.drain() {
            let _ = peer.outbound.send(Outbound::Close);
        }
        self.registry = PeerRegistry::new();
    }

    #[cfg(test)]
    fn peer_state(&self, conn_id: ConnId) -> Option<ConnectionState> {
        self.peers.get(&conn_id).map(|p| p.state)
    }
}

#[async_trait::async_trait]
impl RelayService for RelayHub {
    async fn run(&mut self) -> eyre::Result<()> {
        info!(
            role = %self.server_role,
            ping_interval = ?self.ping_interval,
            "Starting relay hub"
        );
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(msg) => {
                            if !self.handle_message(msg) {
                                break;
                            }
                        }
                        None => {
                            warn!("All relay handles dropped; relay hub stopping");
                            self.shutdown();
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat_tick(),
            }
        }

        info!("Relay hub stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::{Value, json};
    use tokio::time::timeout;

    fn test_hub() -> (RelayHub, RelayHandle) {
        RelayHub::from_config(&AppConfig::default())
    }

    /// Attach a peer directly (no hub loop) and drop its handshake frames.
    fn attach(hub: &mut RelayHub, raw_id: u64) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = ConnId::new(raw_id);
        let (outbound, mut rx) = mpsc::unbounded_channel();
        hub.handle_message(HubMessage::Connected {
            conn_id,
            addr: format!("127.0.0.1:{}", 40000 + raw_id).parse().unwrap(),
            outbound,
        });
        assert_eq!(drain(&mut rx).len(), 2, "handshake should be two events");
        (conn_id, rx)
    }

    fn frame(hub: &mut RelayHub, conn_id: ConnId, text: &str) {
        hub.handle_message(HubMessage::Frame {
            conn_id,
            text: text.to_string(),
        });
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn drain_json(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        drain(rx)
            .into_iter()
            .filter_map(|msg| match msg {
                Outbound::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_order() {
        let (mut hub, _handle) = test_hub();
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let conn_id = ConnId::new(1);
        hub.handle_message(HubMessage::Connected {
            conn_id,
            addr: "127.0.0.1:5000".parse().unwrap(),
            outbound,
        });
        let events = drain_json(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "server_role");
        assert_eq!(events[0]["role"], "relay");
        assert!(events[0]["timestamp"].is_i64());
        assert_eq!(events[1]["type"], "connection_established");
        assert!(events[1]["serverTime"].is_string());
        assert_eq!(hub.peer_state(conn_id), Some(ConnectionState::Open));
    }

    #[test]
    fn test_chair_frame_registers_and_broadcasts_to_everyone() {
        let (mut hub, _handle) = test_hub();
        let (chair, mut chair_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);

        frame(&mut hub, chair, r#"{"device_id":"chair_01"}"#);

        assert_eq!(hub.registry.lookup(DeviceRole::Chair), Some(chair));
        let expected = |v: &Value| {
            v["type"] == "chair_data"
                && v["pressures"].is_null()
                && v["posture"].is_null()
                && v["battery"].is_null()
                && v["state"] == "unknown"
        };
        let obs_events = drain_json(&mut obs_rx);
        assert_eq!(obs_events.len(), 1);
        assert!(expected(&obs_events[0]), "got {}", obs_events[0]);
        // devices are peers too and receive the broadcast
        assert_eq!(drain_json(&mut chair_rx).len(), 1);
    }

    #[test]
    fn test_garbage_frame_is_dropped_and_connection_survives() {
        let (mut hub, _handle) = test_hub();
        let (chair, _chair_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);

        frame(&mut hub, chair, "}{ definitely not json");
        assert!(drain(&mut obs_rx).is_empty());
        assert_eq!(hub.peer_state(chair), Some(ConnectionState::Open));

        frame(&mut hub, chair, r#"{"device_id":"chair_01","posture":"upright"}"#);
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "chair_data");
        assert_eq!(events[0]["posture"], "upright");
    }

    #[test]
    fn test_camera_frame_broadcasts_status_then_frame() {
        let (mut hub, _handle) = test_hub();
        let (camera, _camera_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);

        frame(
            &mut hub,
            camera,
            r#"{"device_id":"camera_01","attention_level":64,"drowsy":true}"#,
        );
        assert_eq!(hub.registry.lookup(DeviceRole::Camera), Some(camera));
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "camera_status");
        assert_eq!(events[0]["active"], true);
        assert_eq!(events[1]["type"], "camera_frame");
        assert_eq!(events[1]["attention_level"], 64);
        assert_eq!(events[1]["drowsy"], true);
        assert!(events[1]["is_present"].is_null());

        // repeated camera frames repeat the status event
        frame(&mut hub, camera, r#"{"device_id":"camera_01"}"#);
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "camera_status");
    }

    #[test]
    fn test_control_without_camera_errors_to_sender_only() {
        let (mut hub, _handle) = test_hub();
        let (sender, mut sender_rx) = attach(&mut hub, 1);
        let (_other, mut other_rx) = attach(&mut hub, 2);

        frame(&mut hub, sender, r#"{"type":"camera_control","action":"start"}"#);

        let events = drain_json(&mut sender_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["message"], "Camera not connected");
        assert!(drain(&mut other_rx).is_empty(), "no broadcast expected");
    }

    #[test]
    fn test_control_is_forwarded_verbatim_to_camera() {
        let (mut hub, _handle) = test_hub();
        let (camera, mut camera_rx) = attach(&mut hub, 1);
        let (observer, mut observer_rx) = attach(&mut hub, 2);
        frame(&mut hub, camera, r#"{"device_id":"camera_01"}"#);
        drain(&mut camera_rx);
        drain(&mut observer_rx);

        let command = r#"{"type":"camera_control","action":"stop","extra":{"k":1}}"#;
        frame(&mut hub, observer, command);

        match drain(&mut camera_rx).as_slice() {
            [Outbound::Text(text)] => assert_eq!(&**text, command),
            other => panic!("expected exactly the command, got {other:?}"),
        }
        assert!(drain(&mut observer_rx).is_empty());
    }

    #[test]
    fn test_control_after_camera_writer_died_reports_error() {
        let (mut hub, _handle) = test_hub();
        let (camera, camera_rx) = attach(&mut hub, 1);
        let (observer, mut observer_rx) = attach(&mut hub, 2);
        frame(&mut hub, camera, r#"{"device_id":"camera_01"}"#);
        drain(&mut observer_rx);
        drop(camera_rx);

        frame(&mut hub, observer, r#"{"type":"camera_control","action":"start"}"#);
        let events = drain_json(&mut observer_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"], "Camera not connected");
        // a failed send does not close the camera
        assert_eq!(hub.peer_state(camera), Some(ConnectionState::Open));
    }

    #[test]
    fn test_closing_chair_broadcasts_disconnect_once() {
        let (mut hub, _handle) = test_hub();
        let (chair, _chair_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);
        frame(&mut hub, chair, r#"{"device_id":"chair_01"}"#);
        drain(&mut obs_rx);

        hub.handle_message(HubMessage::Closed { conn_id: chair });
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "chair_presence");
        assert_eq!(events[0]["present"], false);
        assert_eq!(events[0]["state"], "chair_disconnected");
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), None);

        hub.handle_message(HubMessage::Closed { conn_id: chair });
        assert!(drain(&mut obs_rx).is_empty(), "second close must be a no-op");
    }

    #[test]
    fn test_closing_camera_broadcasts_inactive() {
        let (mut hub, _handle) = test_hub();
        let (camera, _camera_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);
        frame(&mut hub, camera, r#"{"device_id":"camera_01"}"#);
        drain(&mut obs_rx);

        hub.handle_message(HubMessage::Closed { conn_id: camera });
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], json!({"type":"camera_status","active":false,"timestamp":events[0]["timestamp"]}));
    }

    #[test]
    fn test_superseded_chair_close_keeps_new_holder() {
        let (mut hub, _handle) = test_hub();
        let (a, _a_rx) = attach(&mut hub, 1);
        let (b, _b_rx) = attach(&mut hub, 2);
        let (_obs, mut obs_rx) = attach(&mut hub, 3);

        frame(&mut hub, a, r#"{"device_id":"chair_01"}"#);
        frame(&mut hub, b, r#"{"device_id":"chair_01"}"#);
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), Some(b));
        // superseded connection is still open
        assert_eq!(hub.peer_state(a), Some(ConnectionState::Open));
        drain(&mut obs_rx);

        hub.handle_message(HubMessage::Closed { conn_id: a });
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), Some(b));
        assert!(
            drain(&mut obs_rx).is_empty(),
            "closing a superseded holder must not announce a disconnect"
        );
    }

    #[test]
    fn test_heartbeat_terminates_silent_peer_and_evicts_role_once() {
        let (mut hub, _handle) = test_hub();
        let (chair, mut chair_rx) = attach(&mut hub, 1);
        let (obs, mut obs_rx) = attach(&mut hub, 2);
        frame(&mut hub, chair, r#"{"device_id":"chair_01"}"#);
        drain(&mut chair_rx);
        drain(&mut obs_rx);

        hub.heartbeat_tick();
        assert_eq!(drain(&mut chair_rx), vec![Outbound::Ping]);
        assert_eq!(drain(&mut obs_rx), vec![Outbound::Ping]);

        // only the observer answers
        hub.handle_message(HubMessage::Pong { conn_id: obs });
        hub.heartbeat_tick();

        assert_eq!(drain(&mut chair_rx), vec![Outbound::Close]);
        assert_eq!(hub.peer_state(chair), Some(ConnectionState::Closing));
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), None);

        let obs_msgs = drain(&mut obs_rx);
        assert_eq!(obs_msgs.len(), 2, "next ping + disconnect broadcast: {obs_msgs:?}");
        assert_eq!(obs_msgs[0], Outbound::Ping);
        let Outbound::Text(text) = &obs_msgs[1] else {
            panic!("expected disconnect event, got {obs_msgs:?}");
        };
        let event: Value = serde_json::from_str(text).unwrap();
        assert_eq!(event["state"], "chair_disconnected");

        // the transport's own close arrives later and only drops the entry
        hub.handle_message(HubMessage::Closed { conn_id: chair });
        assert_eq!(hub.peer_state(chair), None);
        assert!(drain(&mut obs_rx).is_empty());
    }

    #[test]
    fn test_closing_peer_is_silenced_until_transport_confirms() {
        let (mut hub, _handle) = test_hub();
        let (chair, mut chair_rx) = attach(&mut hub, 1);
        let (obs, mut obs_rx) = attach(&mut hub, 2);
        frame(&mut hub, chair, r#"{"device_id":"chair_01"}"#);

        hub.heartbeat_tick();
        hub.handle_message(HubMessage::Pong { conn_id: obs });
        hub.heartbeat_tick();
        assert_eq!(hub.peer_state(chair), Some(ConnectionState::Closing));
        drain(&mut chair_rx);
        drain(&mut obs_rx);

        // late frames from the terminated chair neither rebind nor broadcast
        frame(&mut hub, chair, r#"{"device_id":"chair_01","battery":10}"#);
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), None);
        assert!(drain(&mut obs_rx).is_empty());

        // closing peers get no broadcasts and are not counted
        assert_eq!(hub.broadcast(&OutboundEvent::ChairIdle { timestamp: 1 }), 1);
        assert!(drain(&mut chair_rx).is_empty());
        assert_eq!(hub.status().connections, 1);
        drain(&mut obs_rx);

        // a transport that never reports back is dropped on the next tick
        hub.handle_message(HubMessage::Pong { conn_id: obs });
        hub.heartbeat_tick();
        assert_eq!(hub.peer_state(chair), None);
        assert!(drain(&mut chair_rx).is_empty(), "no ping for a closing peer");
        assert_eq!(drain(&mut obs_rx), vec![Outbound::Ping]);
    }

    #[test]
    fn test_camera_values_are_forwarded_verbatim() {
        let (mut hub, _handle) = test_hub();
        let (camera, _camera_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);

        frame(
            &mut hub,
            camera,
            r#"{"device_id":"camera_01","is_present":1,"attention_level":"72"}"#,
        );
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["type"], "camera_frame");
        assert_eq!(events[1]["is_present"], 1);
        assert_eq!(events[1]["attention_level"], "72");
        assert!(events[1]["drowsy"].is_null());
    }

    #[test]
    fn test_chair_pressures_keep_null_readings() {
        let (mut hub, _handle) = test_hub();
        let (chair, _chair_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);

        frame(&mut hub, chair, r#"{"device_id":"chair_01","pressures":[1,null,3]}"#);
        let events = drain_json(&mut obs_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["pressures"], json!([1, null, 3]));
    }

    #[test]
    fn test_frames_after_eviction_are_ignored() {
        let (mut hub, _handle) = test_hub();
        let (chair, _chair_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);
        hub.handle_message(HubMessage::Closed { conn_id: chair });
        frame(&mut hub, chair, r#"{"device_id":"chair_01"}"#);
        assert!(drain(&mut obs_rx).is_empty());
        assert_eq!(hub.registry.lookup(DeviceRole::Chair), None);
    }

    #[test]
    fn test_broadcast_continues_past_failed_peer() {
        let (mut hub, _handle) = test_hub();
        let (_a, a_rx) = attach(&mut hub, 1);
        let (b, mut b_rx) = attach(&mut hub, 2);
        let (_c, mut c_rx) = attach(&mut hub, 3);
        drop(a_rx);

        let delivered = hub.broadcast(&OutboundEvent::ChairIdle { timestamp: 1 });
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert_eq!(drain(&mut c_rx).len(), 1);
        assert_eq!(hub.peer_state(b), Some(ConnectionState::Open));
        assert_eq!(hub.peers.len(), 3, "failed send must not evict");
    }

    #[test]
    fn test_unrecognized_frame_is_silent() {
        let (mut hub, _handle) = test_hub();
        let (sender, mut sender_rx) = attach(&mut hub, 1);
        let (_obs, mut obs_rx) = attach(&mut hub, 2);
        frame(&mut hub, sender, r#"{"device_id":"toaster","crumbs":3}"#);
        assert!(drain(&mut sender_rx).is_empty());
        assert!(drain(&mut obs_rx).is_empty());
    }

    #[test]
    fn test_shutdown_closes_everyone() {
        let (mut hub, _handle) = test_hub();
        let (_a, mut a_rx) = attach(&mut hub, 1);
        let (_b, mut b_rx) = attach(&mut hub, 2);
        assert!(!hub.handle_message(HubMessage::Shutdown));
        assert_eq!(drain(&mut a_rx), vec![Outbound::Close]);
        assert_eq!(drain(&mut b_rx), vec![Outbound::Close]);
        assert!(hub.peers.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_ingest_and_status() {
        let (mut hub, handle) = test_hub();
        let hub_task = tokio::spawn(async move { hub.run().await });

        let (_conn_id, mut rx) = handle.connect("127.0.0.1:6000".parse().unwrap());
        for expected in ["server_role", "connection_established"] {
            let msg = timeout(Duration::from_millis(200), rx.recv())
                .await
                .expect("timed out waiting for handshake")
                .expect("channel closed");
            let Outbound::Text(text) = msg else {
                panic!("expected text frame");
            };
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], expected);
        }

        let rejected = handle
            .ingest(InboundFrame::decode(r#"{"device_id":"camera_01"}"#).unwrap())
            .await;
        assert!(matches!(rejected, Err(AppError::InvalidDevice(_))));

        handle
            .ingest(InboundFrame::decode(r#"{"device_id":"chair_01","battery":40,"state":"idle"}"#).unwrap())
            .await
            .expect("ingest should succeed");
        let msg = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for ingest broadcast")
            .expect("channel closed");
        let Outbound::Text(text) = msg else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "chair_data");
        assert_eq!(value["battery"], 40);

        let status = handle.status().await.unwrap();
        assert_eq!(status.connections, 1);
        // ingest never binds a role
        assert_eq!(status.roles.get(&DeviceRole::Chair), Some(&false));
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"connections":1,"roles":{"chair":false,"camera":false}})
        );

        handle.shutdown();
        timeout(Duration::from_millis(200), hub_task)
            .await
            .expect("hub did not stop")
            .unwrap()
            .unwrap();
        assert!(handle.status().await.is_err());
    }
}
