//! [`PerceptionPipeline`] – the single worker that runs capture cycles.
//!
//! Each cycle runs on one path of control:
//!
//! 1. **Trigger** – a keypress, a named-object request or an accepted goal
//!    moves the [`GoalLifecycle`] to `CapturePending`.
//! 2. **Capture** – admitted sensor frames are aligned into the reference
//!    frame and handed to the [`ObservationAccumulator`].
//! 3. **Filter** – the fused cloud is cropped to the workspace and the
//!    support plane is stripped.
//! 4. **Request** – the [`RequestOrchestrator`] calls the backend; the
//!    pipeline stalls until it answers or times out.
//! 5. **Publish** – on success the first object's pose and one marker per
//!    object go out on [`Topic::Results`] and the goal (if still current) is
//!    completed; on failure the goal is aborted and nothing is published.
//!
//! A [`CycleContext`] is moved from stage to stage so only one cycle can be
//! in flight.  Triggers stamped while a request was in flight are ignored
//! once the pipeline gets to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use perch_middleware::{EventBus, GoalServer, Topic};
use perch_perception::accumulator::{Accumulation, ObservationAccumulator};
use perch_perception::aligner::FrameAligner;
use perch_perception::segmentation::SegmenterConfig;
use perch_perception::transform::{TransformSource, normalize_frame_id};
use perch_perception::workspace::WorkspaceFilter;
use perch_types::{
    Event, EventPayload, LocalizationResult, OrganizedCloud, PerchError, RigidTransform,
    SensorFrame, TableFilterPolicy, WorkspaceBounds,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lifecycle::{CycleState, FrameAdmission, GoalLifecycle, Trigger, TriggerDecision};
use crate::markers::build_markers;
use crate::orchestrator::{LocalizationBackend, LocalizationOutcome, RequestOrchestrator};

const EVENT_SOURCE: &str = "perch-runtime::pipeline";

/// How often the run loop re-checks shutdown and pending goals.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`PerceptionPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reference_frame: String,
    pub camera_frame: String,
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
    /// Support-surface height in the reference frame.
    pub table_height: f32,
    pub table_filter: TableFilterPolicy,
    /// Drop frames stamped before the latest trigger.
    pub wait_for_recent: bool,
    /// Frames fused per capture; 1 disables fusion.
    pub observations: usize,
    /// Publish the filtered cloud on [`Topic::Visualization`].
    pub visualization: bool,
    /// `None` disables support-plane removal.
    pub plane_removal: Option<SegmenterConfig>,
    /// Object identifier → mesh file path.
    pub model_bank: HashMap<String, String>,
    pub transform_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reference_frame: "/base_footprint".to_string(),
            camera_frame: "/head_mount_kinect_rgb_link".to_string(),
            x_min: 0.0,
            x_max: 0.0,
            y_min: 0.0,
            y_max: 0.0,
            table_height: 0.0,
            table_filter: TableFilterPolicy::default(),
            wait_for_recent: false,
            observations: 1,
            visualization: false,
            plane_removal: Some(SegmenterConfig::default()),
            model_bank: HashMap::new(),
            transform_timeout: Duration::from_secs(10),
            backend_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn bounds(&self) -> WorkspaceBounds {
        WorkspaceBounds::around_table(
            self.x_min,
            self.x_max,
            self.y_min,
            self.y_max,
            self.table_height,
            self.table_filter,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cycle records
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one cycle carries from capture to publication.
#[derive(Debug)]
struct CycleContext {
    object_ids: Vec<String>,
    goal: Option<Uuid>,
    cloud: OrganizedCloud,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Succeeded(LocalizationResult),
    /// Wraps [`PerchError::BackendFailed`].
    Failed(PerchError),
    /// The goal was preempted before the backend was called.
    Cancelled,
}

/// Summary of one finished cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub object_ids: Vec<String>,
    pub goal: Option<Uuid>,
    pub outcome: CycleOutcome,
}

// ─────────────────────────────────────────────────────────────────────────────
// PerceptionPipeline
// ─────────────────────────────────────────────────────────────────────────────

pub struct PerceptionPipeline {
    config: PipelineConfig,
    aligner: FrameAligner,
    accumulator: ObservationAccumulator,
    filter: WorkspaceFilter,
    orchestrator: RequestOrchestrator,
    lifecycle: GoalLifecycle,
    goals: GoalServer,
    transforms: Arc<dyn TransformSource>,
    bus: EventBus,
    // ── Snapshots for late queries ───────────────────────────────────────────
    recent_cloud: Option<OrganizedCloud>,
    latest_result: LocalizationResult,
    latest_call_success: bool,
    last_camera_pose: RigidTransform,
    /// Filtering start and publish end of the last cycle.
    busy_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl PerceptionPipeline {
    pub fn new(
        config: PipelineConfig,
        backend: Box<dyn LocalizationBackend>,
        transforms: Arc<dyn TransformSource>,
        bus: EventBus,
        goals: GoalServer,
    ) -> Self {
        let aligner = FrameAligner::new(config.reference_frame.clone(), config.transform_timeout);
        let accumulator = ObservationAccumulator::new(config.observations);
        let filter = WorkspaceFilter::new(config.bounds(), config.plane_removal);
        let orchestrator = RequestOrchestrator::new(backend, config.backend_timeout);
        let lifecycle = GoalLifecycle::new(config.wait_for_recent);
        Self {
            config,
            aligner,
            accumulator,
            filter,
            orchestrator,
            lifecycle,
            goals,
            transforms,
            bus,
            recent_cloud: None,
            latest_result: LocalizationResult::default(),
            latest_call_success: false,
            last_camera_pose: RigidTransform::identity(),
            busy_window: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> CycleState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &GoalLifecycle {
        &self.lifecycle
    }

    pub fn goals(&self) -> GoalServer {
        self.goals.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Frames buffered toward the current capture.
    pub fn buffered_frames(&self) -> usize {
        self.accumulator.len()
    }

    /// The most recent fused cloud, before filtering.
    pub fn recent_cloud(&self) -> Option<&OrganizedCloud> {
        self.recent_cloud.as_ref()
    }

    /// Result of the last backend call; empty after a failure.
    pub fn latest_result(&self) -> &LocalizationResult {
        &self.latest_result
    }

    pub fn latest_call_success(&self) -> bool {
        self.latest_call_success
    }

    pub fn busy_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.busy_window
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Feed a trigger stamped `at` to the lifecycle.
    pub fn handle_trigger(&mut self, trigger: Trigger, at: DateTime<Utc>) -> TriggerDecision {
        let goal_id = match &trigger {
            Trigger::Goal { id, .. } => Some(*id),
            _ => None,
        };
        let decision = self.lifecycle.trigger(trigger, at);
        match decision {
            TriggerDecision::Started => {
                self.accumulator.clear();
                info!(objects = ?self.lifecycle.requested_objects(), "capture requested");
            }
            TriggerDecision::Replaced => {
                self.accumulator.clear();
                info!(
                    goal = ?self.lifecycle.active_goal(),
                    objects = ?self.lifecycle.requested_objects(),
                    "goal replaced in-progress capture"
                );
            }
            TriggerDecision::Rejected => {
                if let Some(id) = goal_id {
                    warn!(goal = %id, "rejecting goal without object identifiers");
                    self.goals.set_aborted(id, Vec::new());
                }
            }
            TriggerDecision::Ignored => debug!(state = ?self.lifecycle.state(), "trigger ignored"),
        }
        decision
    }

    /// Accept a pending goal from the goal server, if the lifecycle can take
    /// one, and handle any preemption requested during capture.
    pub fn poll_goals(&mut self) -> Option<TriggerDecision> {
        self.check_preemption();
        if !self.lifecycle.accepts_goals() {
            return None;
        }
        let goal = self.goals.accept_new_goal()?;
        Some(self.handle_trigger(
            Trigger::Goal {
                id: goal.id,
                object_ids: goal.object_ids,
            },
            Utc::now(),
        ))
    }

    /// Route one bus event.  Returns a report when it completed a cycle.
    pub async fn handle_event(&mut self, event: Event) -> Option<CycleReport> {
        match event.payload {
            EventPayload::SensorFrame(frame) => return self.handle_frame(&frame).await,
            EventPayload::Keypress('c') => self.handle_external_trigger(Trigger::Manual, event.timestamp),
            EventPayload::Keypress(key) => debug!(%key, "ignoring keypress"),
            EventPayload::ObjectRequest(id) => {
                self.handle_external_trigger(Trigger::NamedObject(id), event.timestamp)
            }
            _ => {}
        }
        None
    }

    fn handle_external_trigger(&mut self, trigger: Trigger, at: DateTime<Utc>) {
        if self
            .busy_window
            .is_some_and(|(start, end)| start <= at && at <= end)
        {
            debug!(%at, "trigger arrived while a request was in flight; ignoring");
            return;
        }
        self.handle_trigger(trigger, at);
    }

    /// Process one sensor frame; runs the rest of the cycle once the capture
    /// is complete.
    pub async fn handle_frame(&mut self, frame: &SensorFrame) -> Option<CycleReport> {
        match self.lifecycle.admit_frame(frame.stamp) {
            FrameAdmission::NotCapturing => return None,
            FrameAdmission::Stale => {
                debug!(stamp = %frame.stamp, "frame predates the trigger; waiting for a fresher one");
                return None;
            }
            FrameAdmission::Admitted => {}
        }

        let aligned = match self.aligner.align(frame, self.transforms.as_ref()).await {
            Ok(aligned) => aligned,
            Err(e) => {
                warn!(error = %e, frame_id = %frame.frame_id, "dropping undecodable frame");
                self.lifecycle.discard_frame();
                return None;
            }
        };

        let fused = match self.accumulator.push(aligned.cloud) {
            Accumulation::Pending(collected) => {
                debug!(collected, target = self.accumulator.target(), "waiting for more observations");
                return None;
            }
            Accumulation::Fused(cloud) => cloud,
            Accumulation::Fallback { cloud, error } => {
                warn!(error = %error, "fusing abandoned; using the latest frame alone");
                cloud
            }
        };
        self.recent_cloud = Some(fused.clone());

        let ctx = CycleContext {
            object_ids: self.lifecycle.requested_objects().to_vec(),
            goal: self.lifecycle.active_goal(),
            cloud: fused,
        };
        Some(self.run_cycle(ctx).await)
    }

    // -------------------------------------------------------------------------
    // Cycle stages
    // -------------------------------------------------------------------------

    async fn run_cycle(&mut self, ctx: CycleContext) -> CycleReport {
        let started = Utc::now();
        self.lifecycle.begin_filtering();
        let ctx = self.filter_stage(ctx);

        self.lifecycle.begin_request();
        let (ctx, outcome) = self.request_stage(ctx).await;

        self.lifecycle.begin_publishing();
        let report = self.publish_stage(ctx, outcome);

        self.lifecycle.reset();
        self.busy_window = Some((started, Utc::now()));
        report
    }

    fn filter_stage(&mut self, mut ctx: CycleContext) -> CycleContext {
        let filtered = self.filter.filter(&ctx.cloud);
        debug!(
            valid = filtered.cloud.valid_count(),
            support_plane = filtered.support_plane.is_some(),
            "filtered cloud"
        );
        if self.config.visualization {
            let event = Event::new(EVENT_SOURCE, EventPayload::FilteredCloud(filtered.cloud.clone()));
            // Best-effort publish – no viewer attached is not an error.
            let _ = self.bus.publish_to(Topic::Visualization, event);
        }
        ctx.cloud = filtered.cloud;
        ctx
    }

    async fn request_stage(&mut self, ctx: CycleContext) -> (CycleContext, LocalizationOutcome) {
        let camera_pose = self.camera_pose().await;
        let request = self.orchestrator.build_request(
            &ctx.cloud,
            self.filter.bounds(),
            self.config.table_height,
            &ctx.object_ids,
            camera_pose,
        );
        let goals = &self.goals;
        let goal = ctx.goal;
        let outcome = self
            .orchestrator
            .localize(&request, || goal.is_some_and(|id| goals.is_preempt_requested(id)))
            .await;
        (ctx, outcome)
    }

    /// Camera pose in the reference frame, or the last known one.
    async fn camera_pose(&mut self) -> RigidTransform {
        match self
            .transforms
            .wait_for_transform(
                &self.config.reference_frame,
                &self.config.camera_frame,
                self.config.transform_timeout,
            )
            .await
        {
            Ok(pose) => {
                self.last_camera_pose = pose;
                pose
            }
            Err(e) => {
                error!(error = %e, "camera pose unavailable; sending the last known pose");
                self.last_camera_pose
            }
        }
    }

    fn publish_stage(&mut self, ctx: CycleContext, outcome: LocalizationOutcome) -> CycleReport {
        let outcome = match outcome {
            LocalizationOutcome::Localized(result) => {
                self.publish_result(&result);
                if let Some(id) = ctx.goal {
                    let poses = result.poses();
                    let reported = if self.goals.is_preempt_requested(id) {
                        self.goals.set_preempted(id, poses)
                    } else {
                        self.goals.set_succeeded(id, poses)
                    };
                    if !reported {
                        warn!(goal = %id, "goal superseded while in flight; result not reported");
                    }
                }
                self.lifecycle.finish(true);
                self.latest_call_success = true;
                self.latest_result = result.clone();
                CycleOutcome::Succeeded(result)
            }
            LocalizationOutcome::Failed(e) => {
                if let Some(id) = ctx.goal {
                    self.goals.set_aborted(id, Vec::new());
                }
                self.lifecycle.finish(false);
                self.latest_call_success = false;
                self.latest_result = LocalizationResult::default();
                CycleOutcome::Failed(PerchError::BackendFailed(e.to_string()))
            }
            LocalizationOutcome::Cancelled => {
                if let Some(id) = ctx.goal {
                    self.goals.set_preempted(id, Vec::new());
                }
                self.lifecycle.finish(false);
                CycleOutcome::Cancelled
            }
        };

        info!(
            objects = ?ctx.object_ids,
            goal = ?ctx.goal,
            succeeded = matches!(outcome, CycleOutcome::Succeeded(_)),
            "cycle finished"
        );
        CycleReport {
            object_ids: ctx.object_ids,
            goal: ctx.goal,
            outcome,
        }
    }

    fn publish_result(&self, result: &LocalizationResult) {
        if let Some(first) = result.objects.first() {
            let event = Event::new(EVENT_SOURCE, EventPayload::ObjectPose(first.transform.to_pose()));
            let _ = self.bus.publish_to(Topic::Results, event);
        }
        let frame_id = normalize_frame_id(&self.config.reference_frame);
        for marker in build_markers(result, frame_id, &self.config.model_bank) {
            let _ = self
                .bus
                .publish_to(Topic::Results, Event::new(EVENT_SOURCE, EventPayload::ObjectMarker(marker)));
        }
    }

    /// A goal preempted while still capturing ends right away.
    fn check_preemption(&mut self) {
        let Some(id) = self.lifecycle.active_goal() else {
            return;
        };
        if self.lifecycle.state().is_capturing() && self.goals.is_preempt_requested(id) {
            info!(goal = %id, "goal preempted during capture");
            self.accumulator.clear();
            self.goals.set_preempted(id, Vec::new());
            self.lifecycle.finish(false);
            self.lifecycle.reset();
        }
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    /// Drive the pipeline from the bus and the goal server until `shutdown`
    /// is set.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut frames = self.bus.subscribe_to(Topic::SensorFrames);
        let mut triggers = self.bus.subscribe_to(Topic::Triggers);
        let goals = self.goals.clone();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        info!(
            reference_frame = %self.config.reference_frame,
            observations = self.accumulator.target(),
            "perception pipeline running"
        );
        while !shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                event = frames.next() => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_some() {
                            self.poll_goals();
                        }
                    }
                    None => break,
                },
                event = triggers.next() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => break,
                },
                () = goals.notified() => {
                    self.poll_goals();
                }
                _ = ticker.tick() => {
                    self.poll_goals();
                }
            }
        }
        info!("perception pipeline stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
