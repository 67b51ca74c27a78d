use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a fiducial marker as reported by the detector (e.g. an
/// AprilTag family index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub u32);

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MarkerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Unit quaternion in **scalar-first** order `(w, x, y, z)`.
///
/// This is the order used by the marker detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuatWxyz {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl QuatWxyz {
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Read four packed components as `[w, x, y, z]`.
    pub fn from_array(q: [f64; 4]) -> Self {
        Self::new(q[0], q[1], q[2], q[3])
    }

    /// Pack as `[w, x, y, z]`.
    pub fn to_array(self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }
}

/// Unit quaternion in **scalar-last** order `(x, y, z, w)`.
///
/// This is the order used by the localization source (transform lookups).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuatXyzw {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl QuatXyzw {
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }

    /// Read four packed components as `[x, y, z, w]`.
    pub fn from_array(q: [f64; 4]) -> Self {
        Self::new(q[0], q[1], q[2], q[3])
    }

    /// Pack as `[x, y, z, w]`.
    pub fn to_array(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

impl From<QuatXyzw> for QuatWxyz {
    fn from(q: QuatXyzw) -> Self {
        Self::new(q.w, q.x, q.y, q.z)
    }
}

impl From<QuatWxyz> for QuatXyzw {
    fn from(q: QuatWxyz) -> Self {
        Self::new(q.x, q.y, q.z, q.w)
    }
}

/// One marker observation: the marker's pose relative to the sensor frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: MarkerId,
    /// Marker origin in the sensor frame (metres).
    pub position: [f64; 3],
    pub orientation: QuatWxyz,
}

/// All detections produced for a single camera frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}

/// A directed edge of the frame graph as published by the localization
/// source: the pose of `child` expressed in `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTransform {
    pub parent: String,
    pub child: String,
    pub translation: [f64; 3],
    pub rotation: QuatXyzw,
}

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "tagmap-middleware::jsonl"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current timestamp.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Detections(DetectionBatch),
    Transform(FrameTransform),
}

/// Error type shared across the tagmap crates.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum TagMapError {
    #[error("Export to {path} failed: {details}")]
    Export { path: String, details: String },

    #[error("Parsing Error: {0}")]
    Parsing(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
