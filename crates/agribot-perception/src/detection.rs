//! Detection records and the target-class classification step.
//!
//! The external detector reports [`RawDetection`]s (corner coordinates, a
//! label and a confidence).  A [`TargetSelector`] turns them into
//! [`Detection`]s by filtering on confidence, deriving the `is_target` flag
//! from the configured [`TargetClasses`], and computing signed offsets from
//! the image centre.

use agribot_types::{CalibrationProfile, TargetClasses};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixels, stored as centre and size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (left, right) = (x1.min(x2), x1.max(x2));
        let (top, bottom) = (y1.min(y2), y1.max(y2));
        Self {
            center_x: (left + right) / 2.0,
            center_y: (top + bottom) / 2.0,
            width: right - left,
            height: bottom - top,
        }
    }

    pub fn left(&self) -> f32 {
        self.center_x - self.width / 2.0
    }

    pub fn right(&self) -> f32 {
        self.center_x + self.width / 2.0
    }

    pub fn top(&self) -> f32 {
        self.center_y - self.height / 2.0
    }

    pub fn bottom(&self) -> f32 {
        self.center_y + self.height / 2.0
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with `other`, in `[0, 1]`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.right().min(other.right()) - self.left().max(other.left())).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.top().max(other.top())).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

/// What the external detector produces for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One classified visual observation.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
    pub is_target: bool,
    /// `center_x - image_center_x`; positive means ahead of the arm axis.
    pub offset_x: f32,
    /// `center_y - image_center_y`; positive means below the centre line.
    pub offset_y: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (self.bbox.center_x, self.bbox.center_y)
    }
}

/// Classifies raw detections against the configured target classes.
#[derive(Debug, Clone)]
pub struct TargetSelector {
    classes: TargetClasses,
    min_confidence: f32,
    center: (f32, f32),
}

impl TargetSelector {
    pub fn new(classes: TargetClasses, min_confidence: f32, center: (f32, f32)) -> Self {
        Self {
            classes,
            min_confidence,
            center,
        }
    }

    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        Self::new(
            profile.target_classes.clone(),
            profile.min_confidence,
            (profile.center_x(), profile.center_y()),
        )
    }

    pub fn classes_mut(&mut self) -> &mut TargetClasses {
        &mut self.classes
    }

    /// Build a [`Detection`], or `None` when the confidence is below the
    /// configured floor.
    pub fn classify(&self, raw: &RawDetection) -> Option<Detection> {
        if raw.confidence < self.min_confidence {
            return None;
        }
        let bbox = BoundingBox::from_corners(raw.x1, raw.y1, raw.x2, raw.y2);
        Some(Detection {
            bbox,
            label: raw.label.clone(),
            confidence: raw.confidence,
            is_target: self.classes.contains(&raw.label),
            offset_x: bbox.center_x - self.center.0,
            offset_y: bbox.center_y - self.center.1,
        })
    }

    pub fn classify_frame(&self, raw: &[RawDetection]) -> Vec<Detection> {
        raw.iter().filter_map(|r| self.classify(r)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn raw(label: &str, cx: f32, cy: f32, w: f32, h: f32) -> RawDetection {
        RawDetection {
            label: label.to_string(),
            confidence: 0.9,
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_corners(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_shift() {
        // 10x10 boxes shifted by 5 px: intersection 50, union 150.
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_corners(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn corners_are_normalised() {
        let b = BoundingBox::from_corners(10.0, 8.0, 0.0, 2.0);
        assert_eq!(b.width, 10.0);
        assert_eq!(b.height, 6.0);
        assert_eq!(b.center_x, 5.0);
    }

    #[test]
    fn classify_derives_target_flag_and_offsets() {
        let selector = TargetSelector::from_profile(&CalibrationProfile::default());
        let d = selector.classify(&raw("Weed", 400.0, 350.0, 40.0, 40.0)).unwrap();
        assert!(d.is_target);
        assert!((d.offset_x - 80.0).abs() < f32::EPSILON);
        assert!((d.offset_y - 110.0).abs() < f32::EPSILON);

        let crop = selector.classify(&raw("crop", 100.0, 100.0, 40.0, 40.0)).unwrap();
        assert!(!crop.is_target);
    }

    #[test]
    fn classify_drops_low_confidence() {
        let selector = TargetSelector::from_profile(&CalibrationProfile::default());
        let mut r = raw("weed", 100.0, 100.0, 20.0, 20.0);
        r.confidence = 0.2;
        assert!(selector.classify(&r).is_none());
    }

    #[test]
    fn class_set_changes_take_effect() {
        let mut selector = TargetSelector::from_profile(&CalibrationProfile::default());
        selector.classes_mut().insert("dandelion");
        let frame = selector.classify_frame(&[
            raw("dandelion", 50.0, 50.0, 10.0, 10.0),
            raw("grass", 80.0, 50.0, 10.0, 10.0),
        ]);
        assert_eq!(frame.len(), 2);
        assert!(frame[0].is_target);
        assert!(!frame[1].is_target);
    }
}
