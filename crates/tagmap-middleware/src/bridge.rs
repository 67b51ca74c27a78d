//! Newline-delimited JSON ingest bridge.
//!
//! [`JsonLineBridge`] reads one JSON message per line from any async reader
//! (stdin, a replay file, a pipe from an external detector) and publishes it
//! onto the internal [`EventBus`]:
//!
//! | `"type"` | Payload | Topic |
//! |---|---|---|
//! | `"detections"` | [`DetectionBatch`] – orientation **scalar-first** | [`Topic::Detections`] |
//! | `"transform"` | [`FrameTransform`] – rotation **scalar-last** | [`Topic::Transforms`] |
//!
//! ```text
//! {"type":"transform","parent":"base_scan","child":"map",
//!  "translation":[0,0,0],"rotation":{"x":0,"y":0,"z":0,"w":1}}
//! {"type":"detections",
//!  "detections":[{"id":7,"position":[1,0,0],"orientation":{"w":1,"x":0,"y":0,"z":0}}]}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.  Malformed lines are
//! logged and skipped; they never stop the stream.
//!
//! # Replay pacing
//!
//! A line may carry an optional `"stamp"` (seconds, any origin).  [`pump`]
//! holds each stamped line back until the same amount of wall-clock time has
//! passed since the first stamped line, so a recorded session replays at its
//! original rate and the tracker's timer gets to refresh the reference
//! between messages.  Unstamped lines are published as soon as they are read.
//!
//! ```text
//! {"stamp":0.0,"type":"transform","parent":"base_scan","child":"map",...}
//! {"stamp":1.5,"type":"detections","detections":[...]}
//! ```
//!
//! # Frame edges
//!
//! `transform` lines are edges of the frame graph: the pose of `child`
//! expressed in `parent`.  Both directions of an edge can be traversed, so a
//! producer may publish the usual `map → odom → base_link → base_scan` chain.
//!
//! [`pump`]: JsonLineBridge::pump

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tagmap_types::{DetectionBatch, Event, EventPayload, FrameTransform, TagMapError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::bus::{EventBus, Topic};

/// Maximum number of detections accepted in a single batch.
///
/// Larger batches are rejected to bound the work done per event.
pub const MAX_DETECTIONS_PER_BATCH: usize = 1024;

const SOURCE: &str = "tagmap-middleware::jsonl";

/// One inbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Detections(DetectionBatch),
    Transform(FrameTransform),
}

/// An inbound line with its optional replay stamp.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct StampedLine {
    #[serde(default)]
    stamp: Option<f64>,
    #[serde(flatten)]
    message: InboundMessage,
}

/// Maps replay stamps onto the wall clock, anchored at the first stamp.
#[derive(Debug, Default)]
struct ReplayClock {
    origin: Option<(f64, Instant)>,
}

impl ReplayClock {
    /// Sleep until `stamp` is due.  Stamps at or before the previous ones are
    /// due immediately.
    async fn wait_for(&mut self, stamp: f64) {
        let (first, started) = *self.origin.get_or_insert((stamp, Instant::now()));
        let due = Duration::try_from_secs_f64(stamp - first)
            .ok()
            .and_then(|offset| started.checked_add(offset));
        if let Some(due) = due {
            tokio::time::sleep_until(due).await;
        }
    }
}

/// Counters returned by [`JsonLineBridge::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub lines: usize,
    pub published: usize,
    pub rejected: usize,
}

/// Bridge between a JSON line stream and the internal [`EventBus`].
#[derive(Clone)]
pub struct JsonLineBridge {
    bus: Arc<EventBus>,
}

impl JsonLineBridge {
    /// Create a new bridge backed by `bus`.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Parse and validate a single line.  A replay `stamp` is accepted and
    /// ignored.
    pub fn parse_line(line: &str) -> Result<InboundMessage, TagMapError> {
        Self::parse_stamped(line).map(|(_, msg)| msg)
    }

    /// Parse and validate a single line, keeping its replay stamp.
    pub fn parse_stamped(line: &str) -> Result<(Option<f64>, InboundMessage), TagMapError> {
        let parsed: StampedLine = serde_json::from_str(line)
            .map_err(|e| TagMapError::Parsing(format!("invalid message: {e}")))?;
        if let Some(stamp) = parsed.stamp
            && !stamp.is_finite()
        {
            return Err(TagMapError::Parsing(format!("stamp {stamp} is not finite")));
        }
        validate(&parsed.message)?;
        Ok((parsed.stamp, parsed.message))
    }

    /// Parse one line and publish it.
    ///
    /// Returns the number of subscribers that received it; empty detection
    /// batches are accepted but not published (`Ok(0)`).
    pub fn ingest_line(&self, line: &str) -> Result<usize, TagMapError> {
        self.publish(Self::parse_line(line)?)
    }

    /// Publish an already-validated message on its topic.
    pub fn publish(&self, msg: InboundMessage) -> Result<usize, TagMapError> {
        match msg {
            InboundMessage::Detections(batch) if batch.is_empty() => Ok(0),
            InboundMessage::Detections(batch) => self.bus.publish_to(
                Topic::Detections,
                Event::new(SOURCE, EventPayload::Detections(batch)),
            ),
            InboundMessage::Transform(edge) => self.bus.publish_to(
                Topic::Transforms,
                Event::new(SOURCE, EventPayload::Transform(edge)),
            ),
        }
    }

    /// Read `reader` to the end, ingesting every line and honouring replay
    /// stamps.
    ///
    /// Only a read error aborts the pump.
    pub async fn pump<R>(&self, reader: R) -> Result<PumpStats, TagMapError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = PumpStats::default();
        let mut clock = ReplayClock::default();
        let mut lines = reader.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| TagMapError::Parsing(format!("read error: {e}")))?
        {
            stats.lines += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let published = match Self::parse_stamped(trimmed) {
                Ok((stamp, msg)) => {
                    if let Some(stamp) = stamp {
                        clock.wait_for(stamp).await;
                    }
                    self.publish(msg)
                }
                Err(e) => Err(e),
            };
            match published {
                Ok(receivers) => {
                    stats.published += 1;
                    debug!(line = stats.lines, receivers, "ingested message");
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!(line = stats.lines, error = %e, "skipping inbound line");
                }
            }
        }
        Ok(stats)
    }
}

fn validate(msg: &InboundMessage) -> Result<(), TagMapError> {
    match msg {
        InboundMessage::Detections(batch) => {
            if batch.len() > MAX_DETECTIONS_PER_BATCH {
                return Err(TagMapError::Parsing(format!(
                    "detection batch has {} entries, exceeding the limit of {}",
                    batch.len(),
                    MAX_DETECTIONS_PER_BATCH,
                )));
            }
            for d in &batch.detections {
                let q = d.orientation.to_array();
                if !all_finite(&d.position) || !all_finite(&q) {
                    return Err(TagMapError::Parsing(format!(
                        "detection of marker {} has non-finite pose",
                        d.id
                    )));
                }
            }
        }
        InboundMessage::Transform(edge) => {
            if edge.parent.is_empty() || edge.child.is_empty() {
                return Err(TagMapError::Parsing("transform frame name is empty".to_string()));
            }
            if !all_finite(&edge.translation) || !all_finite(&edge.rotation.to_array()) {
                return Err(TagMapError::Parsing(format!(
                    "transform {} -> {} has non-finite values",
                    edge.parent, edge.child
                )));
            }
        }
    }
    Ok(())
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagmap_types::{MarkerId, QuatWxyz, QuatXyzw};

    const DETECTION_LINE: &str = concat!(
        r#"{"type":"detections","detections":[{"id":7,"position":[1.0,0.0,0.0],"#,
        r#""orientation":{"w":1.0,"x":0.0,"y":0.0,"z":0.0}}]}"#,
    );
    const TRANSFORM_LINE: &str = concat!(
        r#"{"type":"transform","parent":"base_scan","child":"map","#,
        r#""translation":[0.0,0.0,0.0],"rotation":{"x":0.0,"y":0.0,"z":0.0,"w":1.0}}"#,
    );

    fn make_bridge() -> (Arc<EventBus>, JsonLineBridge) {
        let bus = Arc::new(EventBus::default());
        let bridge = JsonLineBridge::new(bus.clone());
        (bus, bridge)
    }

    #[test]
    fn parse_detection_line() {
        let msg = JsonLineBridge::parse_line(DETECTION_LINE).unwrap();
        match msg {
            InboundMessage::Detections(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch.detections[0].id, MarkerId(7));
                assert_eq!(batch.detections[0].orientation, QuatWxyz::identity());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parse_transform_line() {
        let msg = JsonLineBridge::parse_line(TRANSFORM_LINE).unwrap();
        match msg {
            InboundMessage::Transform(edge) => {
                assert_eq!(edge.parent, "base_scan");
                assert_eq!(edge.child, "map");
                assert_eq!(edge.rotation, QuatXyzw::identity());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = JsonLineBridge::parse_line(r#"{"type":"odometry"}"#).unwrap_err();
        assert!(matches!(err, TagMapError::Parsing(_)));
    }

    #[test]
    fn parse_rejects_empty_frame_name() {
        let line = TRANSFORM_LINE.replace(r#""parent":"base_scan""#, r#""parent":"""#);
        assert!(JsonLineBridge::parse_line(&line).is_err());
    }

    #[test]
    fn parse_rejects_oversized_batch() {
        let detection = r#"{"id":1,"position":[0,0,0],"orientation":{"w":1,"x":0,"y":0,"z":0}}"#;
        let many = vec![detection; MAX_DETECTIONS_PER_BATCH + 1].join(",");
        let line = format!(r#"{{"type":"detections","detections":[{many}]}}"#);
        let err = JsonLineBridge::parse_line(&line).unwrap_err();
        assert!(err.to_string().contains("exceeding the limit"));
    }

    #[tokio::test]
    async fn ingest_routes_by_topic() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, bridge) = make_bridge();
        let mut detections = bus.subscribe_to(Topic::Detections);
        let mut transforms = bus.subscribe_to(Topic::Transforms);

        assert_eq!(bridge.ingest_line(TRANSFORM_LINE)?, 1);
        assert_eq!(bridge.ingest_line(DETECTION_LINE)?, 1);

        assert!(matches!(transforms.recv().await?.payload, EventPayload::Transform(_)));
        assert!(matches!(detections.recv().await?.payload, EventPayload::Detections(_)));
        Ok(())
    }

    #[tokio::test]
    async fn empty_batch_is_not_published() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, bridge) = make_bridge();
        let mut detections = bus.subscribe_to(Topic::Detections);

        assert_eq!(bridge.ingest_line(r#"{"type":"detections","detections":[]}"#)?, 0);

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), detections.recv()).await;
        assert!(result.is_err(), "empty batch must not reach subscribers");
        Ok(())
    }

    #[tokio::test]
    async fn pump_skips_bad_lines_and_counts() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, bridge) = make_bridge();
        let _detections = bus.subscribe_to(Topic::Detections);
        let _transforms = bus.subscribe_to(Topic::Transforms);

        let input = format!("# replay\n{TRANSFORM_LINE}\n\nnot json\n{DETECTION_LINE}\n");
        let stats = bridge.pump(input.as_bytes()).await?;

        assert_eq!(
            stats,
            PumpStats {
                lines: 5,
                published: 2,
                rejected: 1
            }
        );
        Ok(())
    }

    #[test]
    fn parse_keeps_replay_stamp() {
        let line = format!(r#"{{"stamp":12.5,{}"#, &TRANSFORM_LINE[1..]);
        let (stamp, msg) = JsonLineBridge::parse_stamped(&line).unwrap();
        assert_eq!(stamp, Some(12.5));
        assert!(matches!(msg, InboundMessage::Transform(_)));
        assert_eq!(JsonLineBridge::parse_stamped(TRANSFORM_LINE).unwrap().0, None);
    }

    #[tokio::test]
    async fn pump_paces_stamped_lines() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, bridge) = make_bridge();
        let _detections = bus.subscribe_to(Topic::Detections);
        let _transforms = bus.subscribe_to(Topic::Transforms);

        let input = format!(
            "{{\"stamp\":100.0,{}\n{{\"stamp\":100.08,{}\n",
            &TRANSFORM_LINE[1..],
            &DETECTION_LINE[1..]
        );
        let started = Instant::now();
        let stats = bridge.pump(input.as_bytes()).await?;

        assert_eq!(stats.published, 2);
        assert!(started.elapsed() >= Duration::from_millis(80));
        Ok(())
    }

    #[tokio::test]
    async fn pump_skips_wait_for_past_stamps() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, bridge) = make_bridge();
        let _transforms = bus.subscribe_to(Topic::Transforms);

        let input = format!(
            "{{\"stamp\":5.0,{0}\n{{\"stamp\":1.0,{0}\n",
            &TRANSFORM_LINE[1..]
        );
        let started = Instant::now();
        let stats = bridge.pump(input.as_bytes()).await?;

        assert_eq!(stats.published, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }
}
