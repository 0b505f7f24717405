//! Detection Tracker – persistent identities and duplicate-treatment guard.
//!
//! Each call to [`Tracker::update`] matches the new frame's detections to the
//! existing tracks greedily, in ascending identity order, by best
//! Intersection-over-Union.  A detection that matches nothing starts a new
//! track with a fresh identity from a counter that is never rewound, so an
//! identity is never reused.
//!
//! Per identity the phase only moves forward: `New → Tracked → Sprayed`.
//! Sprayed identities are additionally remembered in a set that outlives the
//! track itself, which is what makes [`Tracker::mark_sprayed`] idempotent.
//!
//! # Example
//!
//! ```rust
//! use agribot_perception::detection::{BoundingBox, Detection};
//! use agribot_perception::tracker::{Tracker, TrackerConfig};
//!
//! let weed = |x: f32| Detection {
//!     bbox: BoundingBox { center_x: x, center_y: 300.0, width: 40.0, height: 40.0 },
//!     label: "weed".into(),
//!     confidence: 0.9,
//!     is_target: true,
//!     offset_x: x - 320.0,
//!     offset_y: 60.0,
//! };
//!
//! let mut tracker = Tracker::new(TrackerConfig::default());
//! let first = tracker.update(&[weed(400.0)]);
//! let second = tracker.update(&[weed(390.0)]);
//! assert_eq!(first[0].id, second[0].id);
//!
//! tracker.mark_sprayed(first[0].id);
//! assert!(tracker.unsprayed_targets(-30.0).is_empty());
//! ```

use std::collections::{BTreeMap, HashSet};

use agribot_types::CalibrationProfile;
use tracing::debug;

use crate::detection::Detection;

/// Minimum IoU for a detection to continue an existing track.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;

/// Lifecycle phase of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPhase {
    /// Seen in exactly one frame.
    New,
    /// Matched across at least two frames.
    Tracked,
    Sprayed,
}

/// A [`Detection`] with a persistent identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: u64,
    pub detection: Detection,
    pub sprayed: bool,
    /// Frame index of the most recent match.
    pub last_seen: u64,
    /// Number of frames this identity was matched in.
    pub hits: u32,
}

impl TrackedObject {
    pub fn phase(&self) -> TrackPhase {
        if self.sprayed {
            TrackPhase::Sprayed
        } else if self.hits > 1 {
            TrackPhase::Tracked
        } else {
            TrackPhase::New
        }
    }

    pub fn offset_x(&self) -> f32 {
        self.detection.offset_x
    }
}

/// Tuning knobs for [`Tracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    /// Unsprayed tracks unseen for more than this many frames are aged out.
    pub max_frames_missing: u32,
    /// Tracks whose last offset falls below this have been driven past.
    /// Sprayed ones are forgotten at once, unsprayed ones as soon as they
    /// miss a frame.
    pub passed_px: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_frames_missing: 15,
            passed_px: -30.0,
        }
    }
}

impl TrackerConfig {
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_frames_missing: profile.max_frames_missing,
            passed_px: profile.min_forward_px,
        }
    }
}

/// Frame-to-frame identity tracker.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, TrackedObject>,
    next_id: u64,
    frame: u64,
    sprayed: HashSet<u64>,
    skipped: HashSet<u64>,
    pinned: Option<u64>,
    non_targets_seen: u32,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            frame: 0,
            sprayed: HashSet::new(),
            skipped: HashSet::new(),
            pinned: None,
            non_targets_seen: 0,
        }
    }

    /// Ingest one frame and return every live track, in identity order.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedObject> {
        self.frame += 1;
        let mut taken = vec![false; detections.len()];

        for track in self.tracks.values_mut() {
            let Some(j) = best_match(track, detections, &taken, self.config.iou_threshold)
            else {
                continue;
            };
            taken[j] = true;
            track.detection = detections[j].clone();
            track.last_seen = self.frame;
            track.hits += 1;
        }

        for (j, detection) in detections.iter().enumerate() {
            if taken[j] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            if !detection.is_target {
                self.non_targets_seen += 1;
            }
            debug!(id, label = %detection.label, x = detection.bbox.center_x, "new track");
            self.tracks.insert(
                id,
                TrackedObject {
                    id,
                    detection: detection.clone(),
                    sprayed: false,
                    last_seen: self.frame,
                    hits: 1,
                },
            );
        }

        self.prune();
        self.tracks.values().cloned().collect()
    }

    /// Flip the identity to sprayed.  Returns `true` the first time only.
    pub fn mark_sprayed(&mut self, id: u64) -> bool {
        if let Some(track) = self.tracks.get_mut(&id) {
            track.sprayed = true;
        }
        if self.pinned == Some(id) {
            self.pinned = None;
        }
        self.sprayed.insert(id)
    }

    pub fn is_sprayed(&self, id: u64) -> bool {
        self.sprayed.contains(&id)
    }

    /// Exclude `id` from future candidates without recording a treatment.
    pub fn skip(&mut self, id: u64) {
        if self.pinned == Some(id) {
            self.pinned = None;
        }
        self.skipped.insert(id);
    }

    /// Protect `id` from aging while it is being serviced.
    pub fn pin(&mut self, id: Option<u64>) {
        self.pinned = id;
    }

    /// Targets still awaiting treatment and at-or-ahead of
    /// `min_forward_px`, nearest to the arm axis first.
    ///
    /// Anything whose horizontal offset has scrolled below `min_forward_px`
    /// counts as passed and is never offered again, even if it was never
    /// sprayed.
    pub fn unsprayed_targets(&self, min_forward_px: f32) -> Vec<TrackedObject> {
        let mut out: Vec<TrackedObject> = self
            .tracks
            .values()
            .filter(|t| {
                t.detection.is_target
                    && !t.sprayed
                    && !self.sprayed.contains(&t.id)
                    && !self.skipped.contains(&t.id)
                    && t.offset_x() >= min_forward_px
                    && self.frames_missing(t) <= u64::from(self.config.max_frames_missing)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.offset_x()
                .abs()
                .total_cmp(&b.offset_x().abs())
                .then(a.id.cmp(&b.id))
        });
        out
    }

    /// The single best candidate, if any.
    pub fn next_target(&self, min_forward_px: f32) -> Option<TrackedObject> {
        self.unsprayed_targets(min_forward_px).into_iter().next()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.tracks.get(&id)
    }

    /// Frames since `id` was last matched.
    pub fn missing_for(&self, id: u64) -> Option<u64> {
        self.tracks.get(&id).map(|t| self.frames_missing(t))
    }

    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Distinct non-target identities created so far.
    pub fn non_targets_seen(&self) -> u32 {
        self.non_targets_seen
    }

    /// Forget every track for a new mission.  The identity counter keeps
    /// counting.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.sprayed.clear();
        self.skipped.clear();
        self.pinned = None;
        self.non_targets_seen = 0;
    }

    fn frames_missing(&self, track: &TrackedObject) -> u64 {
        self.frame - track.last_seen
    }

    fn prune(&mut self) {
        let frame = self.frame;
        let max_missing = u64::from(self.config.max_frames_missing);
        let passed_px = self.config.passed_px;
        let pinned = self.pinned;
        self.tracks.retain(|id, t| {
            if pinned == Some(*id) {
                return true;
            }
            let passed = t.offset_x() < passed_px;
            if t.sprayed {
                return !passed;
            }
            let missing = frame - t.last_seen;
            if passed && missing > 0 {
                return false;
            }
            missing <= max_missing
        });
    }
}

/// Best unclaimed detection for `track`: highest IoU above `threshold`, else
/// the nearest one of the same kind whose centre moved by less than the
/// track's own size.
fn best_match(
    track: &TrackedObject,
    detections: &[Detection],
    taken: &[bool],
    threshold: f32,
) -> Option<usize> {
    let bbox = &track.detection.bbox;
    let by_iou = detections
        .iter()
        .enumerate()
        .filter(|(j, _)| !taken[*j])
        .map(|(j, d)| (j, bbox.iou(&d.bbox)))
        .filter(|(_, iou)| *iou >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(j, _)| j);
    if by_iou.is_some() {
        return by_iou;
    }

    detections
        .iter()
        .enumerate()
        .filter(|(j, d)| {
            !taken[*j]
                && d.is_target == track.detection.is_target
                && (d.bbox.center_x - bbox.center_x).abs() < bbox.width
                && (d.bbox.center_y - bbox.center_y).abs() < bbox.height
        })
        .map(|(j, d)| {
            let dx = d.bbox.center_x - bbox.center_x;
            let dy = d.bbox.center_y - bbox.center_y;
            (j, dx * dx + dy * dy)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(j, _)| j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn det(label: &str, x: f32, y: f32, size: f32) -> Detection {
        Detection {
            bbox: BoundingBox {
                center_x: x,
                center_y: y,
                width: size,
                height: size,
            },
            label: label.into(),
            confidence: 0.9,
            is_target: label == "weed",
            offset_x: x - 320.0,
            offset_y: y - 240.0,
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig::default())
    }

    #[test]
    fn shifted_object_keeps_identity() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        // Shift by 10 px: IoU = 30/50 = 0.6.
        let b = t.update(&[det("weed", 390.0, 300.0, 40.0)]);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].id, b[0].id);
        assert_eq!(b[0].phase(), TrackPhase::Tracked);
    }

    #[test]
    fn shift_just_under_width_keeps_identity() {
        // 35 px shift on a 40 px box: IoU ~0.07, matched by the centre gate.
        let mut t = tracker();
        let a = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        let b = t.update(&[det("weed", 365.0, 300.0, 40.0)]);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn shift_beyond_width_is_new_identity() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        let b = t.update(&[det("weed", 340.0, 300.0, 40.0)]);
        let ids: Vec<u64> = b.iter().map(|o| o.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a[0].id));
        assert!(ids.contains(&(a[0].id + 1)));
    }

    #[test]
    fn missed_frame_does_not_lose_identity() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        t.update(&[]);
        t.update(&[]);
        let c = t.update(&[det("weed", 395.0, 300.0, 40.0)]);
        assert_eq!(c.len(), 1);
        assert_eq!(a[0].id, c[0].id);
    }

    #[test]
    fn identities_are_never_reused() {
        let mut t = Tracker::new(TrackerConfig {
            max_frames_missing: 0,
            ..Default::default()
        });
        let a = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        t.update(&[]);
        assert!(t.is_empty());
        let b = t.update(&[det("weed", 400.0, 300.0, 40.0)]);
        assert!(b[0].id > a[0].id);
    }

    #[test]
    fn mark_sprayed_is_idempotent() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 330.0, 300.0, 40.0)]);
        let id = a[0].id;
        assert!(t.mark_sprayed(id));
        let once = t.unsprayed_targets(-30.0);
        assert!(!t.mark_sprayed(id));
        let twice = t.unsprayed_targets(-30.0);
        assert_eq!(once, twice);
        assert!(twice.is_empty());
        assert_eq!(t.get(id).map(|o| o.phase()), Some(TrackPhase::Sprayed));
    }

    #[test]
    fn sprayed_identity_never_returns_after_rematch() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 330.0, 300.0, 40.0)]);
        t.mark_sprayed(a[0].id);
        for x in [328.0, 325.0, 320.0] {
            t.update(&[det("weed", x, 300.0, 40.0)]);
            assert!(t.unsprayed_targets(-30.0).is_empty());
        }
    }

    #[test]
    fn candidates_sorted_by_distance_to_axis() {
        let mut t = tracker();
        t.update(&[
            det("weed", 500.0, 300.0, 30.0),
            det("weed", 340.0, 100.0, 30.0),
            det("weed", 300.0, 400.0, 30.0),
        ]);
        let xs: Vec<f32> = t
            .unsprayed_targets(-30.0)
            .iter()
            .map(|o| o.detection.bbox.center_x)
            .collect();
        assert_eq!(xs, vec![340.0, 300.0, 500.0]);
    }

    #[test]
    fn passed_and_non_targets_are_excluded() {
        let mut t = tracker();
        t.update(&[
            det("weed", 250.0, 300.0, 30.0),
            det("crop", 330.0, 300.0, 30.0),
            det("weed", 400.0, 300.0, 30.0),
        ]);
        let c = t.unsprayed_targets(-30.0);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].detection.bbox.center_x, 400.0);
        assert_eq!(t.non_targets_seen(), 1);
    }

    #[test]
    fn skipped_target_is_excluded() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 330.0, 300.0, 30.0)]);
        t.skip(a[0].id);
        assert!(t.next_target(-30.0).is_none());
        assert!(!t.is_sprayed(a[0].id));
    }

    #[test]
    fn stale_tracks_age_out_unless_pinned() {
        let mut t = Tracker::new(TrackerConfig {
            max_frames_missing: 2,
            ..Default::default()
        });
        let a = t.update(&[
            det("weed", 330.0, 300.0, 30.0),
            det("weed", 450.0, 300.0, 30.0),
        ]);
        t.pin(Some(a[0].id));
        for _ in 0..3 {
            t.update(&[]);
        }
        assert!(t.get(a[0].id).is_some());
        assert!(t.get(a[1].id).is_none());
        // A pinned but stale track is still not a candidate.
        assert!(t.unsprayed_targets(-30.0).is_empty());
    }

    #[test]
    fn sprayed_track_forgotten_once_passed() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 330.0, 300.0, 40.0)]);
        t.mark_sprayed(a[0].id);
        let mut x = 330.0;
        while x > 250.0 {
            x -= 20.0;
            t.update(&[det("weed", x, 300.0, 40.0)]);
        }
        assert!(t.get(a[0].id).is_none());
        assert!(t.is_sprayed(a[0].id));
    }

    #[test]
    fn unsprayed_track_dropped_once_passed_and_gone() {
        let mut t = tracker();
        let a = t.update(&[
            det("weed", 300.0, 300.0, 40.0),
            det("weed", 450.0, 300.0, 40.0),
        ]);
        let (behind, ahead) = (a[0].id, a[1].id);
        t.update(&[
            det("weed", 270.0, 300.0, 40.0),
            det("weed", 440.0, 300.0, 40.0),
        ]);
        // Past the line but still in view: identity is kept.
        assert!(t.get(behind).is_some());

        t.update(&[]);
        assert!(t.get(behind).is_none(), "passed track outlived its last frame");
        assert!(t.get(ahead).is_some(), "a track ahead ages out by frame count");
        assert!(!t.is_sprayed(behind));
    }

    #[test]
    fn reset_keeps_counter() {
        let mut t = tracker();
        let a = t.update(&[det("weed", 330.0, 300.0, 30.0)]);
        t.mark_sprayed(a[0].id);
        t.reset();
        assert!(t.is_empty());
        assert!(!t.is_sprayed(a[0].id));
        let b = t.update(&[det("weed", 330.0, 300.0, 30.0)]);
        assert!(b[0].id > a[0].id);
    }
}
