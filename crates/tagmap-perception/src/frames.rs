//! Transform buffer.
//!
//! Maintains a graph of named reference frames and the stamped
//! [`Transform`]s that relate them, fed by the localization source.  Given
//! two frame names the buffer composes the chain of edges between them via
//! BFS, walking each edge forwards or (through its inverse) backwards, so a
//! feed in the usual `map → odom → base_link → base_scan` layout can answer
//! `("base_scan", "map")`.
//!
//! Edges older than the buffer's cache time are considered stale and are not
//! used for lookups.  [`TfBuffer::lookup_blocking`] waits (up to a bounded
//! timeout) for the graph to catch up instead of failing immediately, which
//! is what the reference tracker needs at startup.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tagmap_perception::frames::TfBuffer;
//! use tagmap_perception::transform::{Transform, Vec3};
//! use tagmap_types::QuatXyzw;
//!
//! let tf = TfBuffer::new(Duration::from_secs(10));
//! tf.set_transform("base_scan", "odom",
//!     Transform::from_pose_xyzw(Vec3::new(1.0, 0.0, 0.0), QuatXyzw::identity()));
//! tf.set_transform("odom", "map",
//!     Transform::from_pose_xyzw(Vec3::new(0.5, 0.0, 0.0), QuatXyzw::identity()));
//!
//! let t = tf.lookup_latest("base_scan", "map").unwrap();
//! assert!((t.translation().x - 1.5).abs() < 1e-12);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tagmap_types::{FrameTransform, QuatXyzw};
use tracing::debug;

use crate::reference::{LookupError, ReferenceLookup};
use crate::transform::{Transform, Vec3};

/// Default age after which an edge is no longer used for lookups.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Frame graph
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct StampedEdge {
    transform: Transform,
    stamp: Instant,
}

/// `edges[parent][child]` holds the published pose of `child` in `parent`;
/// `inverse_edges[child][parent]` holds its inverse so chains can be walked
/// against the published direction.
#[derive(Debug, Default)]
struct FrameGraph {
    edges: HashMap<String, HashMap<String, StampedEdge>>,
    inverse_edges: HashMap<String, HashMap<String, StampedEdge>>,
    frames: HashSet<String>,
}

impl FrameGraph {
    fn resolve(
        &self,
        parent_frame: &str,
        child_frame: &str,
        cache_time: Duration,
    ) -> Result<Transform, LookupError> {
        for frame in [parent_frame, child_frame] {
            if !self.frames.contains(frame) {
                return Err(LookupError::UnknownFrame(frame.to_string()));
            }
        }
        if parent_frame == child_frame {
            return Ok(Transform::identity());
        }

        let now = Instant::now();
        let mut skipped_stale = false;

        // Each queue item carries the transform composed from parent_frame
        // to the current node.
        let mut queue: VecDeque<(&str, Transform)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        queue.push_back((parent_frame, Transform::identity()));
        visited.insert(parent_frame);

        while let Some((current, accumulated)) = queue.pop_front() {
            let forward = self.edges.get(current).into_iter().flatten();
            let backward = self.inverse_edges.get(current).into_iter().flatten();
            for (next, edge) in forward.chain(backward) {
                if visited.contains(next.as_str()) {
                    continue;
                }
                if now.saturating_duration_since(edge.stamp) > cache_time {
                    skipped_stale = true;
                    continue;
                }
                let composed = accumulated.compose(&edge.transform);
                if next == child_frame {
                    return Ok(composed);
                }
                visited.insert(next.as_str());
                queue.push_back((next.as_str(), composed));
            }
        }

        if skipped_stale {
            Err(LookupError::Extrapolation {
                parent: parent_frame.to_string(),
                child: child_frame.to_string(),
                cache_time,
            })
        } else {
            Err(LookupError::Disconnected {
                parent: parent_frame.to_string(),
                child: child_frame.to_string(),
            })
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TfBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe, time-bounded frame graph.
///
/// An edge `"A" → "B"` answers lookups in both directions: `("A", "B")`
/// composes it as published, `("B", "A")` uses its inverse.
#[derive(Debug)]
pub struct TfBuffer {
    graph: Mutex<FrameGraph>,
    updated: Condvar,
    cache_time: Duration,
}

impl Default for TfBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TIME)
    }
}

impl TfBuffer {
    /// Create an empty buffer whose edges expire after `cache_time`.
    pub fn new(cache_time: Duration) -> Self {
        Self {
            graph: Mutex::new(FrameGraph::default()),
            updated: Condvar::new(),
            cache_time,
        }
    }

    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    /// Register or refresh the pose of `child_frame` in `parent_frame`, and
    /// wake any lookup waiting for the graph to change.
    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, transform: Transform) {
        let stamp = Instant::now();
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        graph.frames.insert(parent_frame.to_string());
        graph.frames.insert(child_frame.to_string());
        graph
            .edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), StampedEdge { transform, stamp });
        graph
            .inverse_edges
            .entry(child_frame.to_string())
            .or_default()
            .insert(
                parent_frame.to_string(),
                StampedEdge {
                    transform: transform.inverse(),
                    stamp,
                },
            );
        drop(graph);
        self.updated.notify_all();
    }

    /// Ingest a wire-format edge from the localization source.
    pub fn apply(&self, msg: &FrameTransform) {
        let transform =
            Transform::from_pose_xyzw(Vec3::from_array(msg.translation), msg.rotation);
        self.set_transform(&msg.parent, &msg.child, transform);
    }

    /// `true` once `frame` has appeared in any edge.
    pub fn has_frame(&self, frame: &str) -> bool {
        self.graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
            .contains(frame)
    }

    /// Compose the latest edges into the pose of `child_frame` expressed in
    /// `parent_frame`, without waiting.
    pub fn lookup_latest(
        &self,
        parent_frame: &str,
        child_frame: &str,
    ) -> Result<Transform, LookupError> {
        self.graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(parent_frame, child_frame, self.cache_time)
    }

    /// Like [`lookup_latest`](Self::lookup_latest), but keeps retrying each
    /// time the graph changes until `timeout` has elapsed.
    ///
    /// A zero timeout performs exactly one attempt and returns its error
    /// unchanged; otherwise the last error is wrapped in
    /// [`LookupError::Timeout`].
    pub fn lookup_blocking(
        &self,
        parent_frame: &str,
        child_frame: &str,
        timeout: Duration,
    ) -> Result<Transform, LookupError> {
        // `None` when the timeout reaches past the representable range:
        // wait for graph updates without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let err = match graph.resolve(parent_frame, child_frame, self.cache_time) {
                Ok(transform) => return Ok(transform),
                Err(err) => err,
            };
            if timeout.is_zero() {
                return Err(err);
            }
            let now = Instant::now();
            let remaining = deadline.map(|d| d.saturating_duration_since(now));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(LookupError::Timeout {
                    waited: timeout,
                    last: Box::new(err),
                });
            }
            debug!(
                parent = parent_frame,
                child = child_frame,
                error = %err,
                "waiting for transform"
            );
            graph = match remaining {
                Some(remaining) => {
                    self.updated
                        .wait_timeout(graph, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .updated
                    .wait(graph)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl ReferenceLookup for TfBuffer {
    fn lookup(
        &self,
        parent_frame: &str,
        child_frame: &str,
        timeout: Duration,
    ) -> Result<FrameTransform, LookupError> {
        let transform = self.lookup_blocking(parent_frame, child_frame, timeout)?;
        let rotation: QuatXyzw = transform.rotation_xyzw();
        Ok(FrameTransform {
            parent: parent_frame.to_string(),
            child: child_frame.to_string(),
            translation: transform.translation().to_array(),
            rotation,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2;
    use std::sync::Arc;
    use std::thread;

    fn offset_x(x: f64) -> Transform {
        Transform::from_pose_xyzw(Vec3::new(x, 0.0, 0.0), QuatXyzw::identity())
    }

    #[test]
    fn lookup_same_known_frame_returns_identity() {
        let tf = TfBuffer::default();
        tf.set_transform("map", "odom", offset_x(1.0));
        assert_eq!(tf.lookup_latest("map", "map").unwrap(), Transform::identity());
    }

    #[test]
    fn lookup_unknown_frame_is_reported() {
        let tf = TfBuffer::default();
        assert_eq!(
            tf.lookup_latest("base_scan", "map"),
            Err(LookupError::UnknownFrame("base_scan".to_string()))
        );
    }

    #[test]
    fn lookup_direct_edge() {
        let tf = TfBuffer::default();
        tf.set_transform("base_scan", "map", offset_x(1.0));
        let t = tf.lookup_latest("base_scan", "map").unwrap();
        assert!((t.translation().x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn lookup_composed_chain() {
        let tf = TfBuffer::default();
        tf.set_transform("base_scan", "odom", offset_x(1.0));
        tf.set_transform("odom", "map", offset_x(0.5));
        let t = tf.lookup_latest("base_scan", "map").unwrap();
        assert!((t.translation().x - 1.5).abs() < 1e-12);
    }

    #[test]
    fn lookup_respects_rotation_in_chain() {
        let q90z = QuatXyzw::new(0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        let tf = TfBuffer::default();
        tf.set_transform("map", "base_link", Transform::from_pose_xyzw(Vec3::zero(), q90z));
        tf.set_transform("base_link", "base_scan", offset_x(1.0));

        let t = tf.lookup_latest("map", "base_scan").unwrap().translation();
        assert!(t.x.abs() < 1e-12, "x={}", t.x);
        assert!((t.y - 1.0).abs() < 1e-12, "y={}", t.y);
    }

    #[test]
    fn reverse_lookup_uses_inverse_edge() {
        let q90z = QuatXyzw::new(0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        let edge = Transform::from_pose_xyzw(Vec3::new(1.0, 2.0, 0.0), q90z);
        let tf = TfBuffer::default();
        tf.set_transform("map", "base_scan", edge);

        let back = tf.lookup_latest("base_scan", "map").unwrap();
        assert!(back.approx_eq(&edge.inverse(), 1e-12));
        assert!(edge.compose(&back).approx_eq(&Transform::identity(), 1e-12));
    }

    #[test]
    fn sensor_to_world_through_tf_style_chain() {
        // Published world-down: map → odom → base_link → base_scan.
        let q90z = QuatXyzw::new(0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        let map_odom = offset_x(3.0);
        let odom_base = Transform::from_pose_xyzw(Vec3::new(0.0, 1.0, 0.0), q90z);
        let base_scan = offset_x(0.2);
        let tf = TfBuffer::default();
        tf.set_transform("map", "odom", map_odom);
        tf.set_transform("odom", "base_link", odom_base);
        tf.set_transform("base_link", "base_scan", base_scan);

        let scan_in_map = map_odom.compose(&odom_base).compose(&base_scan);
        let got = tf.lookup_latest("base_scan", "map").unwrap();
        assert!(got.approx_eq(&scan_in_map.inverse(), 1e-12), "{got}");
        assert!(tf.lookup_latest("map", "base_scan").unwrap().approx_eq(&scan_in_map, 1e-12));
    }

    #[test]
    fn disconnected_frames_are_reported() {
        let tf = TfBuffer::default();
        tf.set_transform("base_scan", "camera", offset_x(1.0));
        tf.set_transform("map", "odom", offset_x(1.0));
        assert!(matches!(
            tf.lookup_latest("base_scan", "map"),
            Err(LookupError::Disconnected { .. })
        ));
    }

    #[test]
    fn set_transform_overrides_previous() {
        let tf = TfBuffer::default();
        tf.set_transform("base_scan", "map", offset_x(1.0));
        tf.set_transform("base_scan", "map", offset_x(5.0));
        let t = tf.lookup_latest("base_scan", "map").unwrap();
        assert!((t.translation().x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn stale_edge_is_an_extrapolation_error() {
        let tf = TfBuffer::new(Duration::from_millis(10));
        tf.set_transform("base_scan", "map", offset_x(1.0));
        thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            tf.lookup_latest("base_scan", "map"),
            Err(LookupError::Extrapolation { .. })
        ));
    }

    #[test]
    fn blocking_lookup_times_out() {
        let tf = TfBuffer::default();
        let started = Instant::now();
        let err = tf
            .lookup_blocking("base_scan", "map", Duration::from_millis(30))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, LookupError::Timeout { .. }), "got {err:?}");
    }

    #[test]
    fn blocking_lookup_wakes_when_edge_arrives() {
        let tf = Arc::new(TfBuffer::default());
        let writer = tf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.set_transform("base_scan", "map", offset_x(2.0));
        });

        let t = tf
            .lookup_blocking("base_scan", "map", Duration::from_secs(5))
            .unwrap();
        assert!((t.translation().x - 2.0).abs() < 1e-12);
        handle.join().unwrap();
    }

    #[test]
    fn blocking_lookup_with_unbounded_timeout_does_not_overflow() {
        let tf = Arc::new(TfBuffer::default());
        let writer = tf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.set_transform("base_scan", "map", offset_x(3.0));
        });

        let t = tf
            .lookup_blocking("base_scan", "map", Duration::MAX)
            .unwrap();
        assert!((t.translation().x - 3.0).abs() < 1e-12);
        handle.join().unwrap();
    }

    #[test]
    fn reference_lookup_uses_scalar_last_wire_form() {
        let q90z = QuatXyzw::new(0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        let tf = TfBuffer::default();
        tf.apply(&FrameTransform {
            parent: "base_scan".to_string(),
            child: "map".to_string(),
            translation: [1.0, 2.0, 3.0],
            rotation: q90z,
        });

        let wire = tf.lookup("base_scan", "map", Duration::ZERO).unwrap();
        assert_eq!(wire.translation, [1.0, 2.0, 3.0]);
        assert!((wire.rotation.z - FRAC_1_SQRT_2).abs() < 1e-12);
        assert!((wire.rotation.w - FRAC_1_SQRT_2).abs() < 1e-12);
    }
}
