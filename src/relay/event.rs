//! Observer-facing event contract.
//!
//! Every variant serializes as a flat JSON object tagged by `type`. `Option` fields are
//! serialized as `null` rather than skipped: observers rely on a stable shape.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    ServerRole {
        role: String,
        timestamp: i64,
    },
    ConnectionEstablished {
        #[serde(rename = "serverTime")]
        server_time: String,
    },
    ChairData {
        pressures: Option<Vec<Value>>,
        posture: Option<String>,
        battery: Option<Number>,
        state: String,
        timestamp: i64,
    },
    ChairBaseline {
        state: String,
        baseline_raw: Option<Value>,
        timestamp: i64,
    },
    ChairPresence {
        present: bool,
        state: String,
        timestamp: i64,
    },
    ChairIdle {
        timestamp: i64,
    },
    CameraStatus {
        active: bool,
        timestamp: i64,
    },
    CameraFrame {
        attention_level: Option<Value>,
        is_present: Option<Value>,
        drowsy: Option<Value>,
        working_duration_seconds: Option<Value>,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
}

impl OutboundEvent {
    pub fn server_role(role: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::ServerRole {
            role: role.into(),
            timestamp: now.timestamp_millis(),
        }
    }

    pub fn connection_established(now: DateTime<Utc>) -> Self {
        Self::ConnectionEstablished {
            server_time: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn error(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now.timestamp_millis(),
        }
    }

    /// Wire discriminant, handy for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::ServerRole { .. } => "server_role",
            OutboundEvent::ConnectionEstablished { .. } => "connection_established",
            OutboundEvent::ChairData { .. } => "chair_data",
            OutboundEvent::ChairBaseline { .. } => "chair_baseline",
            OutboundEvent::ChairPresence { .. } => "chair_presence",
            OutboundEvent::ChairIdle { .. } => "chair_idle",
            OutboundEvent::CameraStatus { .. } => "camera_status",
            OutboundEvent::CameraFrame { .. } => "camera_frame",
            OutboundEvent::Error { .. } => "error",
        }
    }
}
