//! [`CalibrationProfile`] – the physical constants of one platform.
//!
//! A profile is loaded once (see the `[calibration]` table of the CLI
//! configuration), wrapped in an `Arc`, and shared read-only by the transform
//! engine, the tracker, the command gate and the mission state machine for
//! the lifetime of a mission.  Every field has a serde default so a partial
//! TOML table is always a valid profile.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::AgriError;

/// How the pixel-to-length ratio is chosen for a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneMode {
    /// Always use the centre ratio.
    #[default]
    Single,
    /// Pick the near/centre/far ratio by which third of the image the row
    /// falls in.
    Discrete,
    /// Blend linearly from far (top row) through centre (middle row) to near
    /// (bottom row).
    Interpolated,
}

/// Image band used by [`ZoneMode::Discrete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Near,
    Center,
    Far,
}

/// Centimetres per pixel for the three distance zones of an angled camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneRatios {
    pub near: f32,
    pub center: f32,
    pub far: f32,
}

impl ZoneRatios {
    pub fn uniform(ratio: f32) -> Self {
        Self {
            near: ratio,
            center: ratio,
            far: ratio,
        }
    }

    pub fn get(&self, zone: Zone) -> f32 {
        match zone {
            Zone::Near => self.near,
            Zone::Center => self.center,
            Zone::Far => self.far,
        }
    }
}

impl Default for ZoneRatios {
    fn default() -> Self {
        Self::uniform(0.05)
    }
}

/// Arm positioning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// `ACT:Z_OUT` / `ACT:Z_IN` sized by the calibrated arm speed.
    #[default]
    Timed,
    /// `Z_MOVE` / `Z_HOME` driven by the encoder feedback loop.
    ClosedLoop,
}

/// What the mission does when the arm cannot reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnreachablePolicy {
    /// Stop everything and report, like any other failure.
    #[default]
    Alert,
    /// Retract, drop the target from consideration and keep searching.
    Skip,
    /// Clamp the extension to the arm's travel limit and treat there.
    Nearest,
}

/// Where the fixed sensor-to-actuator offset is absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationMode {
    /// The platform travels forward by the offset before extending; the
    /// extension covers the full measured distance.
    #[default]
    Travel,
    /// The platform stays put; the offset is subtracted from the extension.
    Reach,
}

/// Set of detector class labels that count as treatment targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetClasses(BTreeSet<String>);

impl TargetClasses {
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(classes.into_iter().map(Into::into).collect())
    }

    /// Case-insensitive membership test.
    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|c| c.eq_ignore_ascii_case(label))
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    pub fn remove(&mut self, label: &str) -> bool {
        self.0.remove(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for TargetClasses {
    fn default() -> Self {
        Self::new(["weed"])
    }
}

/// Physical constants of the platform.
///
/// Lengths are centimetres, speeds centimetres per second, durations
/// seconds, image measurements pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationProfile {
    // ── Camera ──────────────────────────────────────────────────────────
    pub image_width: u32,
    pub image_height: u32,
    pub pixel_ratios: ZoneRatios,
    pub zone_mode: ZoneMode,

    // ── Geometry & speeds ───────────────────────────────────────────────
    /// Distance between the camera's sensing edge and the arm's mount point.
    pub sensor_offset_cm: f32,
    pub arm_speed_cm_s: f32,
    pub wheel_speed_cm_s: f32,
    pub compensation: CompensationMode,

    // ── Limits ──────────────────────────────────────────────────────────
    pub arm_travel_limit_cm: f32,
    pub arm_home_cm: f32,
    pub max_extend_s: f32,
    pub max_travel_s: f32,
    /// Extra retraction time so the arm always bottoms out at home.
    pub retract_buffer_s: f32,

    // ── Arm control ─────────────────────────────────────────────────────
    pub arm_control: ControlMode,
    pub closed_loop_tolerance_mm: f32,
    pub closed_loop_timeout_s: f32,
    pub pulses_per_cm: f32,
    pub on_unreachable: UnreachablePolicy,

    // ── Alignment & treatment ───────────────────────────────────────────
    pub alignment_tolerance_px: f32,
    pub alignment_retries: u32,
    pub spray_s: f32,

    // ── Tracking ────────────────────────────────────────────────────────
    pub target_classes: TargetClasses,
    pub min_confidence: f32,
    /// Targets whose horizontal offset is below this are considered passed.
    pub min_forward_px: f32,
    pub max_frames_missing: u32,

    // ── Obstacle arbiter ────────────────────────────────────────────────
    pub obstacle_threshold_cm: f32,
    pub arbiter_period_ms: u64,
    pub backup_s: f32,
    pub turn_s: f32,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            image_width: 640,
            image_height: 480,
            pixel_ratios: ZoneRatios::default(),
            zone_mode: ZoneMode::default(),
            sensor_offset_cm: 8.5,
            arm_speed_cm_s: 2.17,
            wheel_speed_cm_s: 10.0,
            compensation: CompensationMode::default(),
            arm_travel_limit_cm: 15.5,
            arm_home_cm: 0.0,
            max_extend_s: 7.5,
            max_travel_s: 5.0,
            retract_buffer_s: 0.5,
            arm_control: ControlMode::default(),
            closed_loop_tolerance_mm: 2.0,
            closed_loop_timeout_s: 10.0,
            pulses_per_cm: 20.0,
            on_unreachable: UnreachablePolicy::default(),
            alignment_tolerance_px: 30.0,
            alignment_retries: 2,
            spray_s: 2.0,
            target_classes: TargetClasses::default(),
            min_confidence: 0.5,
            min_forward_px: -30.0,
            max_frames_missing: 15,
            obstacle_threshold_cm: 30.0,
            arbiter_period_ms: 100,
            backup_s: 0.3,
            turn_s: 0.5,
        }
    }
}

impl CalibrationProfile {
    /// Horizontal image centre in pixels.
    pub fn center_x(&self) -> f32 {
        self.image_width as f32 / 2.0
    }

    /// Vertical image centre in pixels.
    pub fn center_y(&self) -> f32 {
        self.image_height as f32 / 2.0
    }

    /// Reject profiles that would make the transform engine divide by zero
    /// or produce negative lengths.
    pub fn validate(&self) -> Result<(), AgriError> {
        let positive = [
            ("pixel_ratios.near", self.pixel_ratios.near),
            ("pixel_ratios.center", self.pixel_ratios.center),
            ("pixel_ratios.far", self.pixel_ratios.far),
            ("arm_speed_cm_s", self.arm_speed_cm_s),
            ("wheel_speed_cm_s", self.wheel_speed_cm_s),
            ("arm_travel_limit_cm", self.arm_travel_limit_cm),
            ("max_extend_s", self.max_extend_s),
            ("max_travel_s", self.max_travel_s),
            ("closed_loop_timeout_s", self.closed_loop_timeout_s),
            ("pulses_per_cm", self.pulses_per_cm),
            ("obstacle_threshold_cm", self.obstacle_threshold_cm),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(AgriError::Config(format!("{name} must be > 0 (got {value})")));
            }
        }
        let non_negative = [
            ("sensor_offset_cm", self.sensor_offset_cm),
            ("retract_buffer_s", self.retract_buffer_s),
            ("closed_loop_tolerance_mm", self.closed_loop_tolerance_mm),
            ("alignment_tolerance_px", self.alignment_tolerance_px),
            ("spray_s", self.spray_s),
            ("backup_s", self.backup_s),
            ("turn_s", self.turn_s),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(AgriError::Config(format!("{name} must be >= 0 (got {value})")));
            }
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(AgriError::Config("image dimensions must be non-zero".into()));
        }
        if !(0.0..=self.arm_travel_limit_cm).contains(&self.arm_home_cm) {
            return Err(AgriError::Config(format!(
                "arm_home_cm {} outside [0, {}]",
                self.arm_home_cm, self.arm_travel_limit_cm
            )));
        }
        if self.arbiter_period_ms == 0 {
            return Err(AgriError::Config("arbiter_period_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let profile = CalibrationProfile::default();
        profile.validate().unwrap();
        assert!((profile.center_x() - 320.0).abs() < f32::EPSILON);
        assert!((profile.center_y() - 240.0).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let profile: CalibrationProfile = toml::from_str(
            r#"
            arm_speed_cm_s = 3.0
            zone_mode = "interpolated"
            arm_control = "closed_loop"
            on_unreachable = "skip"
            target_classes = ["weed", "thistle"]

            [pixel_ratios]
            near = 0.06
            center = 0.05
            far = 0.04
            "#,
        )
        .unwrap();
        assert!((profile.arm_speed_cm_s - 3.0).abs() < f32::EPSILON);
        assert_eq!(profile.zone_mode, ZoneMode::Interpolated);
        assert_eq!(profile.arm_control, ControlMode::ClosedLoop);
        assert_eq!(profile.on_unreachable, UnreachablePolicy::Skip);
        assert!(profile.target_classes.contains("Thistle"));
        assert!((profile.pixel_ratios.get(Zone::Far) - 0.04).abs() < f32::EPSILON);
        assert!((profile.sensor_offset_cm - 8.5).abs() < f32::EPSILON);
    }

    #[test]
    fn validate_rejects_zero_speed() {
        let profile = CalibrationProfile {
            arm_speed_cm_s: 0.0,
            ..Default::default()
        };
        let err = profile.validate().unwrap_err();
        assert!(matches!(err, AgriError::Config(ref m) if m.contains("arm_speed_cm_s")));
    }

    #[test]
    fn validate_rejects_home_outside_travel() {
        let profile = CalibrationProfile {
            arm_home_cm: 20.0,
            ..Default::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn target_classes_are_mutable_at_runtime() {
        let mut classes = TargetClasses::default();
        assert!(classes.contains("WEED"));
        assert!(!classes.contains("crop"));
        classes.insert("crop");
        assert!(classes.contains("crop"));
        classes.remove("weed");
        assert!(!classes.contains("weed"));
        assert_eq!(classes.iter().collect::<Vec<_>>(), vec!["crop"]);
    }
}
