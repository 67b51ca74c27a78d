//! [`TrackerNode`] – wires the bus, the frame buffer and the fusion engine
//! into three independent Tokio tasks.
//!
//! 1. **Transform listener** – feeds every `Topic::Transforms` edge into the
//!    shared [`TfBuffer`].
//! 2. **Detection consumer** – feeds every `Topic::Detections` batch into
//!    [`PoseFusion::on_batch`].
//! 3. **Tick timer** – every `tick_period` runs [`PoseFusion::on_tick`]
//!    (reference refresh + export) on Tokio's blocking pool, because the
//!    reference lookup may wait for the frame graph and the export touches
//!    the filesystem.
//!
//! The tasks only share the [`PoseFusion`] table and the reference snapshot,
//! both of which guard themselves.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tagmap_middleware::EventBus;
//! use tagmap_perception::{FileExporter, PoseFusion, ReferenceQuery, ReferenceTracker, TfBuffer};
//! use tagmap_runtime::TrackerNode;
//!
//! # async fn run() {
//! let bus = EventBus::default();
//! let reference = Arc::new(ReferenceTracker::new(ReferenceQuery::default()));
//! let node = TrackerNode::new(
//!     Arc::new(PoseFusion::new(reference)),
//!     Arc::new(TfBuffer::default()),
//!     Arc::new(FileExporter::new("tags.txt")),
//!     Duration::from_secs(1),
//! );
//! let handle = node.spawn(&bus);
//! // ... publish on the bus ...
//! let _final_report = handle.shutdown().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tagmap_middleware::{EventBus, Topic, TopicReceiver};
use tagmap_perception::{EstimateSink, ExportOutcome, PoseFusion, TfBuffer, TickReport};
use tagmap_types::{EventPayload, TagMapError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shortest tick period the timer runs with.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

// ─────────────────────────────────────────────────────────────────────────────
// TrackerNode
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the tracker tasks need.  Cloning is cheap (all fields are
/// shared handles).
#[derive(Clone)]
pub struct TrackerNode {
    fusion: Arc<PoseFusion>,
    frames: Arc<TfBuffer>,
    sink: Arc<dyn EstimateSink>,
    tick_period: Duration,
}

impl TrackerNode {
    /// `tick_period` is raised to [`MIN_TICK_PERIOD`] if shorter.
    pub fn new(
        fusion: Arc<PoseFusion>,
        frames: Arc<TfBuffer>,
        sink: Arc<dyn EstimateSink>,
        tick_period: Duration,
    ) -> Self {
        Self {
            fusion,
            frames,
            sink,
            tick_period: tick_period.max(MIN_TICK_PERIOD),
        }
    }

    pub fn fusion(&self) -> &Arc<PoseFusion> {
        &self.fusion
    }

    pub fn frames(&self) -> &Arc<TfBuffer> {
        &self.frames
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Run one refresh + export cycle on the calling thread.
    ///
    /// Blocks for up to the reference lookup timeout.
    pub fn tick(&self) -> TickReport {
        let report = self.fusion.on_tick(self.frames.as_ref(), self.sink.as_ref());
        if let ExportOutcome::Written(markers) = report.export {
            debug!(markers, "estimate table exported");
        }
        report
    }

    /// Subscribe to the bus and start the three tracker tasks.
    ///
    /// Must be called from within a Tokio runtime.  Subscriptions are taken
    /// before this returns, so nothing published afterwards is missed.
    pub fn spawn(&self, bus: &EventBus) -> TrackerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);

        let transforms = bus.subscribe_to(Topic::Transforms);
        let detections = bus.subscribe_to(Topic::Detections);

        let tasks = vec![
            tokio::spawn(run_transform_listener(
                transforms,
                self.frames.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(run_detection_consumer(
                detections,
                self.fusion.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(run_tick_timer(self.clone(), stop_rx)),
        ];
        info!(period = ?self.tick_period, "tracker node started");

        TrackerHandle {
            node: self.clone(),
            stop: stop_tx,
            tasks,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TrackerHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the running tracker tasks.
pub struct TrackerHandle {
    node: TrackerNode,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn node(&self) -> &TrackerNode {
        &self.node
    }

    /// Stop all tasks, wait for any in-flight tick to finish, then run one
    /// final tick so the latest estimates reach the sink.
    pub async fn shutdown(self) -> Result<TickReport, TagMapError> {
        // Receivers only disappear when their task has already exited.
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "tracker task ended abnormally");
            }
        }

        let node = self.node.clone();
        let report = tokio::task::spawn_blocking(move || node.tick())
            .await
            .map_err(|e| TagMapError::Channel(format!("final tick failed: {e}")))?;
        info!(markers = self.node.fusion.len(), "tracker node stopped");
        Ok(report)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

/// What a task loop should do with one receive result.
enum Step<T> {
    Handle(T),
    Skip,
    Stop,
}

fn classify(
    result: Result<tagmap_types::Event, broadcast::error::RecvError>,
    topic: Topic,
) -> Step<EventPayload> {
    match result {
        Ok(event) => Step::Handle(event.payload),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(?topic, lagged_by = n, "subscriber lagged; events dropped");
            Step::Skip
        }
        Err(broadcast::error::RecvError::Closed) => Step::Stop,
    }
}

async fn run_transform_listener(
    mut rx: TopicReceiver,
    frames: Arc<TfBuffer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        // Queued events win over the stop signal so nothing published before
        // shutdown is lost.
        let result = tokio::select! {
            biased;
            result = rx.recv() => result,
            _ = stop.changed() => break,
        };
        match classify(result, Topic::Transforms) {
            Step::Handle(EventPayload::Transform(edge)) => {
                debug!(parent = %edge.parent, child = %edge.child, "transform received");
                frames.apply(&edge);
            }
            Step::Handle(other) => {
                warn!(payload = ?other, "unexpected payload on transforms topic")
            }
            Step::Skip => continue,
            Step::Stop => break,
        }
    }
}

async fn run_detection_consumer(
    mut rx: TopicReceiver,
    fusion: Arc<PoseFusion>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        // Queued events win over the stop signal so nothing published before
        // shutdown is lost.
        let result = tokio::select! {
            biased;
            result = rx.recv() => result,
            _ = stop.changed() => break,
        };
        match classify(result, Topic::Detections) {
            Step::Handle(EventPayload::Detections(batch)) => {
                let summary = fusion.on_batch(&batch);
                debug!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    dropped = summary.dropped,
                    "detection batch fused"
                );
            }
            Step::Handle(other) => {
                warn!(payload = ?other, "unexpected payload on detections topic")
            }
            Step::Skip => continue,
            Step::Stop => break,
        }
    }
}

async fn run_tick_timer(node: TrackerNode, mut stop: watch::Receiver<bool>) {
    // The first tick fires one period after start.
    let mut interval =
        tokio::time::interval_at(Instant::now() + node.tick_period, node.tick_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {}
        }
        let worker = node.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || worker.tick()).await {
            error!(error = %e, "tick worker panicked");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tagmap_middleware::JsonLineBridge;
    use tagmap_perception::{ReferenceQuery, ReferenceTracker, Transform};
    use tagmap_types::{
        Detection, DetectionBatch, Event, FrameTransform, MarkerId, QuatWxyz, QuatXyzw,
    };

    /// Sink that remembers every table it was handed.
    #[derive(Default)]
    struct RecordingSink {
        tables: Mutex<Vec<Vec<(MarkerId, Transform)>>>,
    }

    impl EstimateSink for RecordingSink {
        fn write_table(&self, table: &[(MarkerId, Transform)]) -> Result<(), TagMapError> {
            self.tables.lock().unwrap().push(table.to_vec());
            Ok(())
        }
    }

    fn make_node(period: Duration) -> (TrackerNode, Arc<RecordingSink>) {
        let reference = Arc::new(ReferenceTracker::new(ReferenceQuery {
            timeout: Duration::from_millis(20),
            ..ReferenceQuery::default()
        }));
        let sink = Arc::new(RecordingSink::default());
        let node = TrackerNode::new(
            Arc::new(PoseFusion::new(reference)),
            Arc::new(TfBuffer::default()),
            sink.clone(),
            period,
        );
        (node, sink)
    }

    fn identity_edge() -> Event {
        Event::new(
            "test",
            EventPayload::Transform(FrameTransform {
                parent: "base_scan".to_string(),
                child: "map".to_string(),
                translation: [0.0, 0.0, 0.0],
                rotation: QuatXyzw::identity(),
            }),
        )
    }

    fn detection_of(id: u32, x: f64) -> Event {
        Event::new(
            "test",
            EventPayload::Detections(DetectionBatch::new(vec![Detection {
                id: MarkerId(id),
                position: [x, 0.0, 0.0],
                orientation: QuatWxyz::identity(),
            }])),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transforms_reach_frame_buffer() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let (node, _sink) = make_node(Duration::from_secs(60));
        let handle = node.spawn(&bus);

        bus.publish_to(Topic::Transforms, identity_edge())?;
        let frames = node.frames().clone();
        wait_until(|| frames.has_frame("map")).await;

        handle.shutdown().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detections_before_reference_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let (node, sink) = make_node(Duration::from_secs(60));
        let handle = node.spawn(&bus);

        bus.publish_to(Topic::Detections, detection_of(7, 1.0))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.fusion().is_empty());

        let report = handle.shutdown().await?;
        assert!(matches!(report.export, ExportOutcome::Skipped));
        assert!(sink.tables.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_refreshes_reference_and_exports() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let (node, sink) = make_node(Duration::from_millis(20));
        let handle = node.spawn(&bus);

        bus.publish_to(Topic::Transforms, identity_edge())?;
        let fusion = node.fusion().clone();
        wait_until(|| fusion.reference().current().is_some()).await;

        bus.publish_to(Topic::Detections, detection_of(7, 1.0))?;
        wait_until(|| fusion.estimate(MarkerId(7)).is_some()).await;
        bus.publish_to(Topic::Detections, detection_of(7, 2.0))?;
        wait_until(|| {
            fusion
                .estimate(MarkerId(7))
                .is_some_and(|t| (t.translation().x - 1.1).abs() < 1e-9)
        })
        .await;

        let exported = sink.clone();
        wait_until(|| !exported.tables.lock().unwrap().is_empty()).await;

        let report = handle.shutdown().await?;
        assert!(matches!(report.export, ExportOutcome::Written(1)));
        let tables = sink.tables.lock().unwrap();
        let last = tables.last().unwrap();
        assert_eq!(last[0].0, MarkerId(7));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_runs_final_tick() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let (node, sink) = make_node(Duration::from_secs(60));
        node.frames().set_transform("base_scan", "map", Transform::identity());
        node.fusion().reference().refresh(node.frames().as_ref())?;
        node.fusion().on_detection(MarkerId(3), &Transform::identity());

        let handle = node.spawn(&bus);
        let report = handle.shutdown().await?;

        assert!(report.refresh.is_ok());
        assert!(matches!(report.export, ExportOutcome::Written(1)));
        assert_eq!(sink.tables.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn zero_tick_period_is_raised_to_minimum() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let (node, _sink) = make_node(Duration::ZERO);
        assert_eq!(node.tick_period(), MIN_TICK_PERIOD);

        let handle = node.spawn(&bus);
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stamped_replay_produces_estimates() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(EventBus::default());
        let (node, sink) = make_node(Duration::from_millis(20));
        let handle = node.spawn(&bus);

        let replay = concat!(
            r#"{"stamp":0.0,"type":"transform","parent":"base_scan","child":"map","#,
            r#""translation":[0,0,0],"rotation":{"x":0,"y":0,"z":0,"w":1}}"#,
            "\n",
            r#"{"stamp":0.1,"type":"detections","detections":[{"id":7,"position":[1,0,0],"#,
            r#""orientation":{"w":1,"x":0,"y":0,"z":0}}]}"#,
            "\n",
            r#"{"stamp":0.15,"type":"detections","detections":[{"id":7,"position":[2,0,0],"#,
            r#""orientation":{"w":1,"x":0,"y":0,"z":0}}]}"#,
            "\n",
        );
        let stats = JsonLineBridge::new(bus.clone()).pump(replay.as_bytes()).await?;
        assert_eq!(stats.published, 3);

        let report = handle.shutdown().await?;
        assert!(matches!(report.export, ExportOutcome::Written(1)));
        let x = node.fusion().estimate(MarkerId(7)).unwrap().translation().x;
        assert!((x - 1.1).abs() < 1e-9, "x={x}");
        let tables = sink.tables.lock().unwrap();
        assert_eq!(tables.last().unwrap()[0].0, MarkerId(7));
        Ok(())
    }
}
