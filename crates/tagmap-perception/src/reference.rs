//! Reference Tracker.
//!
//! Holds the single latest sensor-to-world transform.  A timer calls
//! [`ReferenceTracker::refresh`], which runs the (possibly slow) lookup
//! without holding any lock and then swaps the new snapshot in whole.
//! Consumers call [`ReferenceTracker::current`], which never triggers a
//! lookup.
//!
//! A failed refresh keeps the previous snapshot: consumers carry on with the
//! last-known reference instead of stalling on every transient failure.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tagmap_types::FrameTransform;
use thiserror::Error;
use tracing::{debug, error};

use crate::transform::{Transform, Vec3};

/// Default upper bound on how long a lookup may wait for the frame graph.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(4);

// ────────────────────────────────────────────────────────────────────────────
// Lookup contract
// ────────────────────────────────────────────────────────────────────────────

/// Why a transform lookup did not produce a result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    /// One of the frames has never been published.
    #[error("frame '{0}' does not exist")]
    UnknownFrame(String),

    /// Both frames exist but no chain of edges connects them.
    #[error("no transform chain from '{parent}' to '{child}'")]
    Disconnected { parent: String, child: String },

    /// A chain exists but part of it is older than the buffer keeps.
    #[error("transform chain from '{parent}' to '{child}' is older than the {cache_time:?} cache")]
    Extrapolation {
        parent: String,
        child: String,
        cache_time: Duration,
    },

    /// The bounded wait elapsed without the lookup succeeding.
    #[error("gave up after {waited:?}: {last}")]
    Timeout {
        waited: Duration,
        last: Box<LookupError>,
    },
}

/// The localization source.
///
/// Returns the pose of `child_frame` expressed in `parent_frame` at the
/// latest available time, blocking for at most `timeout`.  The rotation is
/// delivered **scalar-last** (`x, y, z, w`).
pub trait ReferenceLookup: Send + Sync {
    fn lookup(
        &self,
        parent_frame: &str,
        child_frame: &str,
        timeout: Duration,
    ) -> Result<FrameTransform, LookupError>;
}

impl<F> ReferenceLookup for F
where
    F: Fn(&str, &str, Duration) -> Result<FrameTransform, LookupError> + Send + Sync,
{
    fn lookup(
        &self,
        parent_frame: &str,
        child_frame: &str,
        timeout: Duration,
    ) -> Result<FrameTransform, LookupError> {
        self(parent_frame, child_frame, timeout)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ReferenceTracker
// ────────────────────────────────────────────────────────────────────────────

/// Which transform to ask for, and how long to wait for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceQuery {
    /// Frame attached to the camera/sensor (e.g. `"base_scan"`).
    pub sensor_frame: String,
    /// Fixed world frame (e.g. `"map"`).
    pub world_frame: String,
    pub timeout: Duration,
}

impl Default for ReferenceQuery {
    fn default() -> Self {
        Self {
            sensor_frame: "base_scan".to_string(),
            world_frame: "map".to_string(),
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// A successfully looked-up reference transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceSnapshot {
    pub transform: Transform,
    /// Informational only.
    pub refreshed_at: DateTime<Utc>,
}

/// Owner of the latest reference snapshot.
#[derive(Debug, Default)]
pub struct ReferenceTracker {
    query: ReferenceQuery,
    latest: RwLock<Option<ReferenceSnapshot>>,
}

impl ReferenceTracker {
    /// Create a tracker with no snapshot yet.
    pub fn new(query: ReferenceQuery) -> Self {
        Self {
            query,
            latest: RwLock::new(None),
        }
    }

    pub fn query(&self) -> &ReferenceQuery {
        &self.query
    }

    /// Query `lookup` and, on success, replace the snapshot.
    ///
    /// On failure the previous snapshot is kept, the error is logged and
    /// returned to the caller.
    pub fn refresh(&self, lookup: &dyn ReferenceLookup) -> Result<Transform, LookupError> {
        let q = &self.query;
        let wire = match lookup.lookup(&q.sensor_frame, &q.world_frame, q.timeout) {
            Ok(wire) => wire,
            Err(e) => {
                error!(
                    sensor_frame = %q.sensor_frame,
                    world_frame = %q.world_frame,
                    error = %e,
                    "reference lookup failed; keeping last reference"
                );
                return Err(e);
            }
        };

        let transform =
            Transform::from_pose_xyzw(Vec3::from_array(wire.translation), wire.rotation);
        let snapshot = ReferenceSnapshot {
            transform,
            refreshed_at: Utc::now(),
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        debug!(reference = %transform, "reference transform refreshed");
        Ok(transform)
    }

    /// The latest reference transform, or `None` if no lookup has succeeded
    /// yet.
    pub fn current(&self) -> Option<Transform> {
        self.snapshot().map(|s| s.transform)
    }

    pub fn snapshot(&self) -> Option<ReferenceSnapshot> {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// When the current snapshot was taken.
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|s| s.refreshed_at)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
