//! Generic `Camera` trait, the raw frame it produces, and a camera that
//! plays back still images from a directory.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use agribot_types::AgriError;
use tracing::debug;

/// A raw RGB24 image frame, row-major.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes of RGB data.
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// A uniformly coloured frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    /// RGB triple at `(x, y)`, `None` outside the frame or past the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 3) as usize;
        self.data.get(i..i + 3).map(|p| [p[0], p[1], p[2]])
    }
}

/// A camera or image-capture device.
pub trait Camera: Send + Sync {
    /// Stable identifier for this camera, e.g. `"front_rgb"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`AgriError::Hardware`] if the frame cannot be captured.
    fn capture(&mut self) -> Result<CameraFrame, AgriError>;

    /// `true` once no further frame will ever be produced.  Live cameras
    /// never run out.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Replays the JPEG and PNG files of one directory, in file-name order, one
/// per capture.
pub struct ImageDirCamera {
    id: String,
    frames: VecDeque<PathBuf>,
}

impl ImageDirCamera {
    /// List the images under `dir`.  Other files are ignored.
    ///
    /// # Errors
    ///
    /// [`AgriError::Hardware`] when the directory cannot be read.
    pub fn open(dir: &Path) -> Result<Self, AgriError> {
        let id = dir.display().to_string();
        let entries = fs::read_dir(dir).map_err(|e| AgriError::Hardware {
            component: id.clone(),
            details: format!("cannot list frames: {e}"),
        })?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        frames.sort();
        debug!(camera = %id, frames = frames.len(), "image directory opened");
        Ok(Self {
            id,
            frames: frames.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    fn fault(&self, details: String) -> AgriError {
        AgriError::Hardware {
            component: self.id.clone(),
            details,
        }
    }
}

impl Camera for ImageDirCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, AgriError> {
        let Some(path) = self.frames.pop_front() else {
            return Err(self.fault("no frames left".into()));
        };
        let rgb = image::open(&path)
            .map_err(|e| self.fault(format!("cannot decode {}: {e}", path.display())))?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(CameraFrame {
            width,
            height,
            data: rgb.into_raw(),
        })
    }

    fn exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_frame_has_rgb_layout() {
        let frame = CameraFrame::filled(3, 2, [10, 20, 30]);
        assert_eq!(frame.data.len(), 18);
        assert_eq!(frame.pixel(2, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn pixel_on_short_buffer_is_none() {
        let frame = CameraFrame {
            width: 2,
            height: 2,
            data: vec![0; 6],
        };
        assert!(frame.pixel(0, 0).is_some());
        assert!(frame.pixel(1, 1).is_none());
    }

    #[test]
    fn image_dir_plays_frames_in_name_order() {
        let dir = tempfile::tempdir().expect("tmp dir");
        image::RgbImage::from_pixel(3, 2, image::Rgb([0, 200, 0]))
            .save(dir.path().join("b.png"))
            .expect("save b");
        image::RgbImage::from_pixel(5, 4, image::Rgb([90, 60, 30]))
            .save(dir.path().join("a.png"))
            .expect("save a");
        std::fs::write(dir.path().join("notes.txt"), "not a frame").expect("write notes");

        let mut cam = ImageDirCamera::open(dir.path()).expect("open");
        assert_eq!(cam.remaining(), 2);

        let first = cam.capture().expect("first");
        assert_eq!((first.width, first.height), (5, 4));
        assert_eq!(first.pixel(4, 3), Some([90, 60, 30]));
        let second = cam.capture().expect("second");
        assert_eq!(second.pixel(0, 0), Some([0, 200, 0]));

        assert!(cam.exhausted());
        assert!(matches!(cam.capture(), Err(AgriError::Hardware { .. })));
    }

    #[test]
    fn missing_image_dir_is_a_hardware_fault() {
        let err = ImageDirCamera::open(Path::new("/nonexistent/agribot-frames")).err();
        assert!(matches!(err, Some(AgriError::Hardware { .. })));
    }
}
