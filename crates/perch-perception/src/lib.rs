//! `perch-perception` – point-cloud stages of the perch front-end.
//!
//! Turns raw depth frames into the cleaned, reference-frame cloud the
//! localization backend is queried with.
//!
//! # Modules
//!
//! - [`transform`] – [`TfEngine`][transform::TfEngine] /
//!   [`TfBuffer`][transform::TfBuffer]: named reference frames and bounded
//!   waits for the transforms between them.
//! - [`aligner`] – [`FrameAligner`][aligner::FrameAligner]: decodes sensor
//!   frames and maps them into the reference frame.
//! - [`accumulator`] – [`ObservationAccumulator`][accumulator::ObservationAccumulator]:
//!   fuses `K` aligned frames by per-pixel median depth.
//! - [`segmentation`] – [`PlaneSegmenter`][segmentation::PlaneSegmenter]:
//!   organized region growing for planar surfaces.
//! - [`workspace`] – [`WorkspaceFilter`][workspace::WorkspaceFilter]: crops
//!   to the workspace box and strips the support plane.

pub mod accumulator;
pub mod aligner;
pub mod segmentation;
pub mod transform;
pub mod workspace;
