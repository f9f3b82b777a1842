//! Inbound frame decoding and classification.
//!
//! Devices send loosely shaped JSON objects. Decoding is best effort per field: a
//! field with an unexpected type is treated as absent rather than rejecting the
//! whole frame, so one misbehaving sensor value never hides the rest of a reading.
//! Only text that is not a JSON object at all fails [`InboundFrame::decode`].

use crate::config::RelayConfig;
use crate::error::{AppError, err};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

pub const EVENT_BASELINE_CAPTURED: &str = "baseline_captured";
pub const EVENT_PRESENCE: &str = "presence";
pub const STATE_IDLE: &str = "idle";

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// One decoded frame from any peer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(default, deserialize_with = "lenient")]
    pub device_id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub event: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub state: Option<String>,
    /// Kept raw; coerced with JS-like truthiness by [`truthy`]
    #[serde(default)]
    pub present: Option<Value>,
    /// Elements are kept verbatim so one null reading does not blank the array
    #[serde(default, deserialize_with = "lenient")]
    pub pressures: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "lenient")]
    pub posture: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub battery: Option<Number>,
    // camera readings are forwarded untouched, whatever their JSON type
    #[serde(default)]
    pub attention_level: Option<Value>,
    #[serde(default)]
    pub is_present: Option<Value>,
    #[serde(default)]
    pub drowsy: Option<Value>,
    #[serde(default)]
    pub working_duration_seconds: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub action: Option<String>,
    #[serde(default)]
    pub baseline_raw: Option<Value>,
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, AppError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| err::parse(format!("invalid JSON: {e}")))?;
        if !value.is_object() {
            return Err(err::parse("frame is not a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| err::parse(e.to_string()))
    }
}

/// Truthiness as the device firmware and observer apps understand it.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChairSubKind {
    Baseline,
    Presence,
    Idle,
    Data,
}

/// Fields a chair frame may carry, already typed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChairPayload {
    pub pressures: Option<Vec<Value>>,
    pub posture: Option<String>,
    pub battery: Option<Number>,
    pub state: Option<String>,
    pub present: bool,
    pub baseline_raw: Option<Value>,
}

impl From<InboundFrame> for ChairPayload {
    fn from(frame: InboundFrame) -> Self {
        Self {
            present: frame.present.as_ref().map(truthy).unwrap_or(false),
            pressures: frame.pressures,
            posture: frame.posture,
            battery: frame.battery,
            state: frame.state,
            baseline_raw: frame.baseline_raw,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraPayload {
    pub attention_level: Option<Value>,
    pub is_present: Option<Value>,
    pub drowsy: Option<Value>,
    pub working_duration_seconds: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlCommand {
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Chair {
        kind: ChairSubKind,
        payload: ChairPayload,
    },
    Camera(CameraPayload),
    Control(ControlCommand),
    Unrecognized,
}

/// Decides what a decoded frame is, based on the configured identifiers.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    chair_device_id: String,
    camera_device_id: String,
    control_type: String,
}

impl MessageClassifier {
    pub fn new(
        chair_device_id: impl Into<String>,
        camera_device_id: impl Into<String>,
        control_type: impl Into<String>,
    ) -> Self {
        Self {
            chair_device_id: chair_device_id.into(),
            camera_device_id: camera_device_id.into(),
            control_type: control_type.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.chair_device_id.clone(),
            config.camera_device_id.clone(),
            config.control_type.clone(),
        )
    }

    pub fn is_chair(&self, frame: &InboundFrame) -> bool {
        frame.device_id.as_deref() == Some(self.chair_device_id.as_str())
    }

    pub fn classify(&self, frame: InboundFrame) -> Classified {
        let device_id = frame.device_id.as_deref();

        if device_id == Some(self.chair_device_id.as_str()) {
            let kind = chair_sub_kind(&frame);
            return Classified::Chair {
                kind,
                payload: ChairPayload::from(frame),
            };
        }

        if device_id == Some(self.camera_device_id.as_str()) {
            return Classified::Camera(CameraPayload {
                attention_level: frame.attention_level,
                is_present: frame.is_present,
                drowsy: frame.drowsy,
                working_duration_seconds: frame.working_duration_seconds,
            });
        }

        if frame.kind.as_deref() == Some(self.control_type.as_str()) {
            return Classified::Control(ControlCommand {
                action: frame.action,
            });
        }

        Classified::Unrecognized
    }
}

fn chair_sub_kind(frame: &InboundFrame) -> ChairSubKind {
    match frame.event.as_deref() {
        Some(EVENT_BASELINE_CAPTURED) => ChairSubKind::Baseline,
        Some(EVENT_PRESENCE) => ChairSubKind::Presence,
        _ if frame.state.as_deref() == Some(STATE_IDLE) => ChairSubKind::Idle,
        _ => ChairSubKind::Data,
    }
}
