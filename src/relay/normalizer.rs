//! Maps classified device payloads onto [`OutboundEvent`]s.

use super::classifier::{CameraPayload, ChairPayload, ChairSubKind};
use super::event::OutboundEvent;
use chrono::{DateTime, Utc};

pub const STATE_UNKNOWN: &str = "unknown";
pub const STATE_BASELINE_READY: &str = "baseline_ready";
pub const STATE_USER_PRESENT: &str = "user_present";
pub const STATE_NO_USER: &str = "no_user";
pub const STATE_CHAIR_DISCONNECTED: &str = "chair_disconnected";

pub fn normalize_chair(
    kind: ChairSubKind,
    payload: ChairPayload,
    now: DateTime<Utc>,
) -> OutboundEvent {
    let timestamp = now.timestamp_millis();
    match kind {
        ChairSubKind::Data => OutboundEvent::ChairData {
            pressures: payload.pressures,
            posture: payload.posture,
            battery: payload.battery,
            state: payload.state.unwrap_or_else(|| STATE_UNKNOWN.to_string()),
            timestamp,
        },
        ChairSubKind::Baseline => OutboundEvent::ChairBaseline {
            state: payload
                .state
                .unwrap_or_else(|| STATE_BASELINE_READY.to_string()),
            baseline_raw: payload.baseline_raw,
            timestamp,
        },
        ChairSubKind::Presence => {
            let present = payload.present;
            let state = payload.state.unwrap_or_else(|| {
                if present {
                    STATE_USER_PRESENT
                } else {
                    STATE_NO_USER
                }
                .to_string()
            });
            OutboundEvent::ChairPresence {
                present,
                state,
                timestamp,
            }
        }
        ChairSubKind::Idle => OutboundEvent::ChairIdle { timestamp },
    }
}

/// A camera frame always yields `camera_status{active:true}` followed by `camera_frame`.
pub fn normalize_camera(payload: CameraPayload, now: DateTime<Utc>) -> [OutboundEvent; 2] {
    let timestamp = now.timestamp_millis();
    [
        OutboundEvent::CameraStatus {
            active: true,
            timestamp,
        },
        OutboundEvent::CameraFrame {
            attention_level: payload.attention_level,
            is_present: payload.is_present,
            drowsy: payload.drowsy,
            working_duration_seconds: payload.working_duration_seconds,
            timestamp,
        },
    ]
}

pub fn chair_disconnected(now: DateTime<Utc>) -> OutboundEvent {
    OutboundEvent::ChairPresence {
        present: false,
        state: STATE_CHAIR_DISCONNECTED.to_string(),
        timestamp: now.timestamp_millis(),
    }
}

pub fn camera_inactive(now: DateTime<Utc>) -> OutboundEvent {
    OutboundEvent::CameraStatus {
        active: false,
        timestamp: now.timestamp_millis(),
    }
}
