//! Detection sources: where per-frame detection lists come from.
//!
//! The learned detector is an external collaborator; the core only needs
//! something that yields a list of [`RawDetection`]s per frame.  Two sources
//! ship with the crate:
//!
//! - [`ReplaySource`] – frames recorded as JSON lines (one JSON array of
//!   detections per line), or built in memory for tests.
//! - [`ColorBlobSource`] – a degraded detector that segments green pixels in
//!   raw camera frames, for when no model is available.  It satisfies the same
//!   contract, so the tracker and mission never know the difference.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;

use agribot_hal::camera::{Camera, CameraFrame};
use agribot_types::AgriError;
use tracing::{debug, warn};

use crate::detection::RawDetection;

/// Anything that can produce one frame of detections at a time.
pub trait DetectionSource: Send {
    /// Stable identifier used in logs.
    fn id(&self) -> &str;

    /// Return the next frame, or `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`AgriError::Perception`] when a frame cannot be produced.
    fn next_frame(&mut self) -> Result<Option<Vec<RawDetection>>, AgriError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ReplaySource
// ────────────────────────────────────────────────────────────────────────────

/// Replays a fixed sequence of frames.
pub struct ReplaySource {
    id: String,
    frames: VecDeque<Vec<RawDetection>>,
}

impl ReplaySource {
    pub fn new(id: impl Into<String>, frames: impl IntoIterator<Item = Vec<RawDetection>>) -> Self {
        Self {
            id: id.into(),
            frames: frames.into_iter().collect(),
        }
    }

    /// Parse JSON lines: every non-blank line is an array of detections.
    pub fn from_json_lines<R: BufRead>(id: impl Into<String>, reader: R) -> Result<Self, AgriError> {
        let mut frames = VecDeque::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| AgriError::Perception(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: Vec<RawDetection> = serde_json::from_str(&line)
                .map_err(|e| AgriError::Perception(format!("line {}: {e}", n + 1)))?;
            frames.push_back(frame);
        }
        Ok(Self {
            id: id.into(),
            frames,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, AgriError> {
        let file = std::fs::File::open(path)
            .map_err(|e| AgriError::Perception(format!("{}: {e}", path.display())))?;
        Self::from_json_lines(path.display().to_string(), std::io::BufReader::new(file))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl DetectionSource for ReplaySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_frame(&mut self) -> Result<Option<Vec<RawDetection>>, AgriError> {
        Ok(self.frames.pop_front())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ColorBlobSource
// ────────────────────────────────────────────────────────────────────────────

/// Inclusive HSV band on the 0–180 hue / 0–255 saturation and value scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HsvBand {
    pub hue: (u8, u8),
    pub saturation: (u8, u8),
    pub value: (u8, u8),
}

impl HsvBand {
    /// Foliage green.
    pub fn green() -> Self {
        Self {
            hue: (35, 85),
            saturation: (50, 255),
            value: (50, 255),
        }
    }

    pub fn contains(&self, (h, s, v): (u8, u8, u8)) -> bool {
        (self.hue.0..=self.hue.1).contains(&h)
            && (self.saturation.0..=self.saturation.1).contains(&s)
            && (self.value.0..=self.value.1).contains(&v)
    }
}

/// Convert one RGB pixel to HSV with hue halved into `0..180`.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let hue_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * ((gf - bf) / delta).rem_euclid(6.0)
    } else if max == gf {
        60.0 * ((bf - rf) / delta + 2.0)
    } else {
        60.0 * ((rf - gf) / delta + 4.0)
    };
    let sat = if max == 0.0 { 0.0 } else { delta / max };

    (
        (hue_deg / 2.0).round().min(179.0) as u8,
        (sat * 255.0).round() as u8,
        (max * 255.0).round() as u8,
    )
}

/// Fallback detector: green-band threshold plus 4-connected components.
pub struct ColorBlobSource {
    camera: Box<dyn Camera>,
    band: HsvBand,
    min_area: usize,
    label: String,
}

impl ColorBlobSource {
    pub fn new(camera: Box<dyn Camera>) -> Self {
        Self {
            camera,
            band: HsvBand::green(),
            min_area: 500,
            label: "weed".to_string(),
        }
    }

    pub fn with_band(mut self, band: HsvBand) -> Self {
        self.band = band;
        self
    }

    pub fn with_min_area(mut self, min_area: usize) -> Self {
        self.min_area = min_area;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Segment one frame.
    pub fn detect(&self, frame: &CameraFrame) -> Result<Vec<RawDetection>, AgriError> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        if frame.data.len() < w * h * 3 {
            return Err(AgriError::Perception(format!(
                "frame {}x{} needs {} bytes of RGB24, got {}",
                w,
                h,
                w * h * 3,
                frame.data.len()
            )));
        }

        let mask: Vec<bool> = frame
            .data
            .chunks_exact(3)
            .take(w * h)
            .map(|px| self.band.contains(rgb_to_hsv(px[0], px[1], px[2])))
            .collect();

        let mut seen = vec![false; w * h];
        let mut out = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..w * h {
            if !mask[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            queue.push_back(start);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0, 0);
            let mut count = 0usize;

            while let Some(i) = queue.pop_front() {
                let (x, y) = (i % w, i / w);
                count += 1;
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);

                let mut visit = |j: usize| {
                    if mask[j] && !seen[j] {
                        seen[j] = true;
                        queue.push_back(j);
                    }
                };
                if x > 0 {
                    visit(i - 1);
                }
                if x + 1 < w {
                    visit(i + 1);
                }
                if y > 0 {
                    visit(i - w);
                }
                if y + 1 < h {
                    visit(i + w);
                }
            }

            if count < self.min_area {
                continue;
            }
            let box_area = ((max_x - min_x + 1) * (max_y - min_y + 1)) as f32;
            out.push(RawDetection {
                label: self.label.clone(),
                confidence: (count as f32 / box_area).clamp(0.0, 1.0),
                x1: min_x as f32,
                y1: min_y as f32,
                x2: (max_x + 1) as f32,
                y2: (max_y + 1) as f32,
            });
        }
        debug!(blobs = out.len(), "colour segmentation");
        Ok(out)
    }
}

impl DetectionSource for ColorBlobSource {
    fn id(&self) -> &str {
        self.camera.id()
    }

    fn next_frame(&mut self) -> Result<Option<Vec<RawDetection>>, AgriError> {
        if self.camera.exhausted() {
            return Ok(None);
        }
        let frame = self.camera.capture().map_err(|e| {
            warn!(camera = self.camera.id(), error = %e, "capture failed");
            AgriError::Perception(e.to_string())
        })?;
        self.detect(&frame).map(Some)
    }
}
