//! `agribot-perception` – from pixels to treatable targets.
//!
//! Turns per-frame detector output into stable, deduplicated targets and
//! converts image measurements into physical lengths and actuation times.
//!
//! # Modules
//!
//! - [`detection`] – [`Detection`][detection::Detection] records and the
//!   [`TargetSelector`][detection::TargetSelector] that derives `is_target`
//!   from the configured target classes.
//! - [`transform`] – [`TransformEngine`][transform::TransformEngine]: pure
//!   pixel ↔ centimetre ↔ seconds conversions over a calibration profile.
//! - [`tracker`] – [`Tracker`][tracker::Tracker]: IoU identity tracking and
//!   the never-spray-twice bookkeeping.
//! - [`source`] – [`DetectionSource`][source::DetectionSource] plus a JSON
//!   replay source and a colour-segmentation fallback.

pub mod detection;
pub mod source;
pub mod tracker;
pub mod transform;

pub use detection::{BoundingBox, Detection, RawDetection, TargetSelector};
pub use source::{ColorBlobSource, DetectionSource, ReplaySource};
pub use tracker::{TrackPhase, TrackedObject, Tracker, TrackerConfig};
pub use transform::{AlignmentPlan, ExtensionPlan, TransformEngine};
