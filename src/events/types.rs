//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A detected face, already mapped into caller coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceInfo {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    /// Detector confidence (1-100)
    pub score: u8,
}

/// System event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Camera Events
    // ============================================================================
    /// Camera session state changed
    #[serde(rename = "camera.state_changed")]
    CameraStateChanged {
        /// Device id (facing or external id)
        device: String,
        /// State: "idle", "preparing", "opening", "running", "closing", "error"
        state: String,
        /// Failure reason when state is "error"
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A manual control was applied to the live request (or buffered)
    #[serde(rename = "camera.control_applied")]
    CameraControlApplied {
        device: String,
        /// Control name, e.g. "iso", "exposure_time", "zoom"
        control: String,
        /// Human readable value
        value: String,
        /// false when the camera was not running and the value was stored
        live: bool,
    },

    /// Faces detected in the latest capture result
    #[serde(rename = "camera.faces")]
    CameraFaces { device: String, faces: Vec<FaceInfo> },

    // ============================================================================
    // Stream Events
    // ============================================================================
    /// Streaming connection state changed
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        /// State: "disconnected", "connecting", "connected", "failed", "auth_error"
        state: String,
        /// Publish target (key is never included)
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Periodic bitrate sample
    #[serde(rename = "stream.bitrate")]
    StreamBitrate {
        /// Measured bits per second
        bps: u64,
        /// Target encoder bitrate chosen by the adapter
        target_bps: u64,
        /// Packets dropped by the send queue since connect
        dropped: u64,
    },

    // ============================================================================
    // System Events
    // ============================================================================
    /// Unrecoverable error in a module
    #[serde(rename = "system.error")]
    SystemError {
        /// Module name: "camera", "stream", "config"
        module: String,
        /// Severity: "warning", "error"
        severity: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CameraStateChanged { .. } => "camera.state_changed",
            Self::CameraControlApplied { .. } => "camera.control_applied",
            Self::CameraFaces { .. } => "camera.faces",
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::StreamBitrate { .. } => "stream.bitrate",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// `*` matches everything, `camera.*` matches a module, anything else is exact.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }

    /// Build a `system.error` event stamped with the current time
    pub fn error(module: &str, message: impl Into<String>) -> Self {
        Self::SystemError {
            module: module.to_string(),
            severity: "error".to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = SystemEvent::CameraStateChanged {
            device: "back".to_string(),
            state: "running".to_string(),
            reason: None,
        };
        assert_eq!(event.event_name(), "camera.state_changed");

        let event = SystemEvent::StreamBitrate {
            bps: 4_000_000,
            target_bps: 5_000_000,
            dropped: 0,
        };
        assert_eq!(event.event_name(), "stream.bitrate");
    }

    #[test]
    fn test_matches_topic() {
        let event = SystemEvent::StreamStateChanged {
            state: "connected".to_string(),
            url: None,
            reason: None,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("stream.*"));
        assert!(event.matches_topic("stream.state_changed"));
        assert!(!event.matches_topic("camera.*"));
        assert!(!event.matches_topic("str.*"));
    }

    #[test]
    fn test_serialization() {
        let event = SystemEvent::CameraControlApplied {
            device: "back".to_string(),
            control: "iso".to_string(),
            value: "400".to_string(),
            live: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"camera.control_applied\""));
        assert!(json.contains("\"control\":\"iso\""));

        let deserialized: SystemEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            deserialized,
            SystemEvent::CameraControlApplied { live: true, .. }
        ));
    }

    #[test]
    fn test_optional_fields_skipped() {
        let event = SystemEvent::StreamStateChanged {
            state: "disconnected".to_string(),
            url: None,
            reason: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("reason"));
        assert!(!json.contains("url"));
    }
}
