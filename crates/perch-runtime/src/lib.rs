//! `perch-runtime` – the capture/request engine.
//!
//! # Modules
//!
//! - [`pipeline`] – [`PerceptionPipeline`][pipeline::PerceptionPipeline]:
//!   the single worker that drives trigger → capture → filter → request →
//!   publish cycles from the event bus and the goal server.
//! - [`lifecycle`] – [`GoalLifecycle`][lifecycle::GoalLifecycle]: the pure
//!   state machine deciding which triggers and frames are admitted.
//! - [`orchestrator`] – [`RequestOrchestrator`][orchestrator::RequestOrchestrator]:
//!   builds the backend request, calls a
//!   [`LocalizationBackend`][orchestrator::LocalizationBackend] under an
//!   explicit timeout and decodes the per-object poses.
//!   [`HttpLocalizer`][orchestrator::HttpLocalizer] is the JSON-over-HTTP
//!   backend client.
//! - [`markers`] – renderable mesh markers for localized objects.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod lifecycle;
pub mod markers;
pub mod orchestrator;
pub mod pipeline;
pub mod telemetry;

pub use lifecycle::{CycleState, GoalLifecycle, Trigger, TriggerDecision};
pub use orchestrator::{BackendError, HttpLocalizer, LocalizationBackend, RequestOrchestrator};
pub use pipeline::{CycleOutcome, CycleReport, PerceptionPipeline, PipelineConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
