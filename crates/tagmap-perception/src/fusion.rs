//! Pose Fusion Engine.
//!
//! Turns marker detections (marker pose relative to the sensor) into a
//! per-marker running estimate of the marker pose in the world frame.
//!
//! For every detection:
//!
//! 1. read the [`ReferenceTracker`] snapshot; without one the detection is
//!    dropped (no queuing, the next detection re-checks),
//! 2. `candidate = compose(pose_in_sensor, reference)`,
//! 3. a new marker takes `candidate` as its estimate; a known marker is
//!    smoothed with
//!
//! ```text
//! estimate = α · estimate + (1 − α) · candidate      (α = 0.9)
//! ```
//!
//! The smoothing weight is fixed per observation and does not depend on the
//! time between detections.
//!
//! A fixed-period timer calls [`PoseFusion::on_tick`], which refreshes the
//! reference and then exports the whole table.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tagmap_perception::frames::TfBuffer;
//! use tagmap_perception::fusion::{FusionOutcome, PoseFusion};
//! use tagmap_perception::reference::{ReferenceQuery, ReferenceTracker};
//! use tagmap_perception::transform::{Transform, Vec3};
//! use tagmap_types::{MarkerId, QuatWxyz};
//!
//! let tf = TfBuffer::default();
//! tf.set_transform("base_scan", "map", Transform::identity());
//!
//! let reference = Arc::new(ReferenceTracker::new(ReferenceQuery::default()));
//! reference.refresh(&tf).unwrap();
//!
//! let fusion = PoseFusion::new(reference);
//! let seen = Transform::from_pose_wxyz(Vec3::new(1.0, 0.0, 0.0), QuatWxyz::identity());
//! assert_eq!(fusion.on_detection(MarkerId(7), &seen), FusionOutcome::Inserted);
//! assert!((fusion.estimate(MarkerId(7)).unwrap().translation().x - 1.0).abs() < 1e-12);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tagmap_types::{DetectionBatch, MarkerId, TagMapError};
use tracing::{error, info};

use crate::export::EstimateSink;
use crate::reference::{LookupError, ReferenceLookup, ReferenceTracker};
use crate::transform::{Transform, Vec3};

/// Weight given to the prior estimate when a marker is seen again.
pub const DEFAULT_SMOOTHING_WEIGHT: f64 = 0.9;

// ────────────────────────────────────────────────────────────────────────────
// Outcomes
// ────────────────────────────────────────────────────────────────────────────

/// What a single detection did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionOutcome {
    /// First sighting; the candidate became the estimate.
    Inserted,
    /// The estimate was blended with the candidate.
    Updated,
    /// No reference transform was available.
    Dropped,
}

/// Per-batch tally of [`FusionOutcome`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub inserted: usize,
    pub updated: usize,
    pub dropped: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: FusionOutcome) {
        match outcome {
            FusionOutcome::Inserted => self.inserted += 1,
            FusionOutcome::Updated => self.updated += 1,
            FusionOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// Result of the export half of a tick.
#[derive(Debug)]
pub enum ExportOutcome {
    /// The table was empty; nothing was written.
    Skipped,
    /// This many markers were written.
    Written(usize),
    Failed(TagMapError),
}

/// Result of one [`PoseFusion::on_tick`].
#[derive(Debug)]
pub struct TickReport {
    pub refresh: Result<(), LookupError>,
    pub export: ExportOutcome,
}

// ────────────────────────────────────────────────────────────────────────────
// Estimate table
// ────────────────────────────────────────────────────────────────────────────

/// Marker estimates, iterable in first-detection order.
#[derive(Debug, Default)]
struct EstimateTable {
    order: Vec<MarkerId>,
    estimates: HashMap<MarkerId, Transform>,
}

impl EstimateTable {
    fn get(&self, id: MarkerId) -> Option<Transform> {
        self.estimates.get(&id).copied()
    }

    fn ordered(&self) -> Vec<(MarkerId, Transform)> {
        self.order
            .iter()
            .filter_map(|id| self.estimates.get(id).map(|t| (*id, *t)))
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PoseFusion
// ────────────────────────────────────────────────────────────────────────────

/// Owner of the estimate table.
///
/// All methods take `&self`; share it between the detection task and the
/// tick task with an [`Arc`].
#[derive(Debug)]
pub struct PoseFusion {
    reference: Arc<ReferenceTracker>,
    table: Mutex<EstimateTable>,
    /// Weight of the prior estimate (0–1).
    smoothing_weight: f64,
}

impl PoseFusion {
    /// Create an engine with the default smoothing weight of 0.9.
    pub fn new(reference: Arc<ReferenceTracker>) -> Self {
        Self::with_smoothing(reference, DEFAULT_SMOOTHING_WEIGHT)
    }

    /// Create an engine with a custom prior weight (clamped to `[0, 1]`).
    pub fn with_smoothing(reference: Arc<ReferenceTracker>, smoothing_weight: f64) -> Self {
        Self {
            reference,
            table: Mutex::new(EstimateTable::default()),
            smoothing_weight: smoothing_weight.clamp(0.0, 1.0),
        }
    }

    pub fn reference(&self) -> &Arc<ReferenceTracker> {
        &self.reference
    }

    pub fn smoothing_weight(&self) -> f64 {
        self.smoothing_weight
    }

    /// Merge one observation of `marker_id` into the table.
    pub fn on_detection(&self, marker_id: MarkerId, pose_in_sensor: &Transform) -> FusionOutcome {
        let Some(reference) = self.reference.current() else {
            error!(
                marker = %marker_id,
                "reference transform not yet available; dropping detection"
            );
            return FusionOutcome::Dropped;
        };
        let candidate = pose_in_sensor.compose(&reference);

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match table.get(marker_id) {
            Some(existing) => {
                let merged = existing.blend(&candidate, self.smoothing_weight);
                table.estimates.insert(marker_id, merged);
                info!(marker = %marker_id, "updating position for marker {marker_id}");
                FusionOutcome::Updated
            }
            None => {
                table.order.push(marker_id);
                table.estimates.insert(marker_id, candidate);
                info!(marker = %marker_id, "new marker detected: {marker_id}");
                FusionOutcome::Inserted
            }
        }
    }

    /// Merge every detection of `batch`, in order.  Empty batches are
    /// ignored.
    pub fn on_batch(&self, batch: &DetectionBatch) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for detection in &batch.detections {
            let pose = Transform::from_pose_wxyz(
                Vec3::from_array(detection.position),
                detection.orientation,
            );
            summary.record(self.on_detection(detection.id, &pose));
        }
        summary
    }

    /// Refresh the reference through `lookup`, then export the table to
    /// `sink`.
    ///
    /// Both steps always run.  The export is skipped when the table is empty,
    /// and an export failure is logged and reported, never propagated.
    pub fn on_tick(&self, lookup: &dyn ReferenceLookup, sink: &dyn EstimateSink) -> TickReport {
        let refresh = self.reference.refresh(lookup).map(|_| ());

        let table = self.snapshot();
        let export = if table.is_empty() {
            ExportOutcome::Skipped
        } else {
            match sink.write_table(&table) {
                Ok(()) => ExportOutcome::Written(table.len()),
                Err(e) => {
                    error!(error = %e, markers = table.len(), "estimate export failed");
                    ExportOutcome::Failed(e)
                }
            }
        };

        TickReport { refresh, export }
    }

    /// Current estimate for `marker_id`.
    pub fn estimate(&self, marker_id: MarkerId) -> Option<Transform> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(marker_id)
    }

    /// Copy of the whole table in first-detection order.
    pub fn snapshot(&self) -> Vec<(MarkerId, Transform)> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered()
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
