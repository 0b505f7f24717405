//! Transform Engine.
//!
//! Converts image-space measurements into physical lengths and actuation
//! times, and back.  Every function is pure: the free functions take their
//! constants explicitly, and [`TransformEngine`] is a thin wrapper that feeds
//! them from a shared [`CalibrationProfile`].
//!
//! Forward chain:
//!
//! ```text
//! pixels --offset_to_world--> cm --compensate_offset--> cm --length_to_duration--> s
//! ```
//!
//! and the inverses [`TransformEngine::world_to_offset`],
//! [`decompensate_offset`] and [`duration_to_length`] undo each step.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use agribot_perception::transform::TransformEngine;
//! use agribot_types::CalibrationProfile;
//!
//! let tf = TransformEngine::new(Arc::new(CalibrationProfile::default()));
//!
//! // 80 px right of centre at 0.05 cm/px.
//! let cm = tf.offset_to_world(80.0, 350.0);
//! assert!((cm - 4.0).abs() < 1e-5);
//!
//! let plan = tf.plan_extension(400.0, 350.0);
//! assert!((plan.extension_cm - 6.5).abs() < 1e-4);
//! ```

use std::sync::Arc;

use agribot_types::{CalibrationProfile, CompensationMode, MotionCommand, Zone, ZoneMode};

// ────────────────────────────────────────────────────────────────────────────
// Pure conversions
// ────────────────────────────────────────────────────────────────────────────

/// Subtract the fixed sensor-to-actuator offset from a measured length,
/// clamped to zero.  `world_cm` is treated as a magnitude.
pub fn compensate_offset(world_cm: f32, offset_cm: f32) -> f32 {
    (world_cm.abs() - offset_cm).max(0.0)
}

/// Inverse of [`compensate_offset`] for lengths that were not clamped.
pub fn decompensate_offset(treatment_cm: f32, offset_cm: f32) -> f32 {
    treatment_cm.max(0.0) + offset_cm
}

/// Time to cover `length_cm` at `speed_cm_s`, clamped to `[0, max_s]`.
pub fn length_to_duration(length_cm: f32, speed_cm_s: f32, max_s: f32) -> f32 {
    if speed_cm_s <= 0.0 {
        return 0.0;
    }
    (length_cm.max(0.0) / speed_cm_s).min(max_s)
}

/// Inverse of [`length_to_duration`] for durations that were not clamped.
pub fn duration_to_length(seconds: f32, speed_cm_s: f32) -> f32 {
    seconds.max(0.0) * speed_cm_s
}

// ────────────────────────────────────────────────────────────────────────────
// Plans
// ────────────────────────────────────────────────────────────────────────────

/// Base correction that brings a target's horizontal offset to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPlan {
    pub offset_px: f32,
    /// Signed travel, positive forward.
    pub travel_cm: f32,
    pub travel_s: f32,
    /// `true` when the target is already inside the alignment tolerance.
    pub aligned: bool,
}

impl AlignmentPlan {
    /// Drive command for this correction, `None` when already aligned.
    pub fn command(&self) -> Option<MotionCommand> {
        if self.aligned || self.travel_s <= 0.0 {
            return None;
        }
        let seconds = Some(self.travel_s);
        Some(if self.travel_cm >= 0.0 {
            MotionCommand::MoveForward { seconds }
        } else {
            MotionCommand::MoveBackward { seconds }
        })
    }
}

/// Arm extension and compensating travel for an aligned target.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionPlan {
    /// Pixels between the sensing edge (bottom row) and the target centre.
    pub edge_px: f32,
    /// `edge_px` in centimetres.
    pub world_cm: f32,
    /// Length the arm must extend.
    pub extension_cm: f32,
    /// Time-based extension duration, clamped to `max_extend_s`.
    pub extension_s: f32,
    /// Forward base travel that absorbs the sensor offset (zero in reach mode).
    pub travel_cm: f32,
    pub travel_s: f32,
    /// `false` when `extension_cm` exceeds the arm's travel limit.
    pub reachable: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// TransformEngine
// ────────────────────────────────────────────────────────────────────────────

/// Calibration-bound view over the pure conversions.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    profile: Arc<CalibrationProfile>,
}

impl TransformEngine {
    pub fn new(profile: Arc<CalibrationProfile>) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// Image band of `row_px` (top third far, bottom third near).
    pub fn zone_for_row(&self, row_px: f32) -> Zone {
        let h = self.profile.image_height as f32;
        if row_px < h / 3.0 {
            Zone::Far
        } else if row_px >= 2.0 * h / 3.0 {
            Zone::Near
        } else {
            Zone::Center
        }
    }

    /// Centimetres per pixel at image row `row_px`.
    pub fn ratio_at(&self, row_px: f32) -> f32 {
        let ratios = &self.profile.pixel_ratios;
        match self.profile.zone_mode {
            ZoneMode::Single => ratios.center,
            ZoneMode::Discrete => ratios.get(self.zone_for_row(row_px)),
            ZoneMode::Interpolated => {
                let h = self.profile.image_height as f32;
                let t = (row_px / h).clamp(0.0, 1.0);
                if t <= 0.5 {
                    ratios.far + (ratios.center - ratios.far) * (t / 0.5)
                } else {
                    ratios.center + (ratios.near - ratios.center) * ((t - 0.5) / 0.5)
                }
            }
        }
    }

    /// Signed pixel offset to a signed length, using the ratio of the zone
    /// that `row_px` falls in.
    pub fn offset_to_world(&self, pixel_offset: f32, row_px: f32) -> f32 {
        pixel_offset * self.ratio_at(row_px)
    }

    /// Inverse of [`offset_to_world`][Self::offset_to_world].
    pub fn world_to_offset(&self, world_cm: f32, row_px: f32) -> f32 {
        let ratio = self.ratio_at(row_px);
        if ratio == 0.0 {
            return 0.0;
        }
        world_cm / ratio
    }

    pub fn compensate(&self, world_cm: f32) -> f32 {
        compensate_offset(world_cm, self.profile.sensor_offset_cm)
    }

    pub fn arm_duration(&self, length_cm: f32) -> f32 {
        length_to_duration(length_cm, self.profile.arm_speed_cm_s, self.profile.max_extend_s)
    }

    pub fn travel_duration(&self, length_cm: f32) -> f32 {
        length_to_duration(
            length_cm.abs(),
            self.profile.wheel_speed_cm_s,
            self.profile.max_travel_s,
        )
    }

    /// Base travel needed to bring a target at `(x_px, y_px)` onto the arm
    /// axis.
    pub fn plan_alignment(&self, x_px: f32, y_px: f32) -> AlignmentPlan {
        let offset_px = x_px - self.profile.center_x();
        let travel_cm = self.offset_to_world(offset_px, y_px);
        AlignmentPlan {
            offset_px,
            travel_cm,
            travel_s: self.travel_duration(travel_cm),
            aligned: offset_px.abs() <= self.profile.alignment_tolerance_px,
        }
    }

    /// Arm extension for a target at `(x_px, y_px)` measured from the
    /// sensing edge at the bottom of the image.
    pub fn plan_extension(&self, _x_px: f32, y_px: f32) -> ExtensionPlan {
        let edge_px = (self.profile.image_height as f32 - y_px).max(0.0);
        let world_cm = self.offset_to_world(edge_px, y_px);
        let (extension_cm, travel_cm) = match self.profile.compensation {
            CompensationMode::Travel => (world_cm, self.profile.sensor_offset_cm),
            CompensationMode::Reach => (self.compensate(world_cm), 0.0),
        };
        ExtensionPlan {
            edge_px,
            world_cm,
            extension_cm,
            extension_s: self.arm_duration(extension_cm),
            travel_cm,
            travel_s: self.travel_duration(travel_cm),
            reachable: extension_cm <= self.profile.arm_travel_limit_cm,
        }
    }
}
