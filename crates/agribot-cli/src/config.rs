//! Operator configuration – reads/writes `~/.agribot/config.toml`.
//!
//! ```toml
//! detections_path = "/var/lib/agribot/run-042.jsonl"
//!
//! [link]
//! endpoint = "tcp://192.168.4.1:2323"
//! command_timeout_ms = 5000
//!
//! [detection]
//! source = "color"              # or "replay" (default) for detections_path
//! frames_dir = "/var/lib/agribot/frames"
//! min_area = 500
//!
//! [calibration]
//! spray_s = 2.5
//! on_unreachable = "skip"
//! ```
//!
//! Every field is optional; missing calibration keys keep their defaults.

use agribot_hal::ImageDirCamera;
use agribot_perception::{ColorBlobSource, DetectionSource, ReplaySource};
use agribot_types::{AgriError, CalibrationProfile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Endpoint value that selects the in-process simulated unit.
pub const SIM_ENDPOINT: &str = "sim";

/// Where the actuator unit is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// `"sim"`, `tcp://host:port`, or a device path such as `/dev/ttyUSB0`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Base time allowed for the unit to answer a command.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl LinkConfig {
    pub fn is_sim(&self) -> bool {
        self.endpoint == SIM_ENDPOINT
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    SIM_ENDPOINT.to_string()
}
fn default_command_timeout_ms() -> u64 {
    5_000
}

/// Which detector feeds the mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Recorded detections from `detections_path`.
    #[default]
    Replay,
    /// Green-blob segmentation of the images under `frames_dir`.
    Color,
}

impl std::str::FromStr for SourceKind {
    type Err = AgriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replay" => Ok(Self::Replay),
            "color" => Ok(Self::Color),
            other => Err(AgriError::Config(format!("unknown detection source {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub source: SourceKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_dir: Option<PathBuf>,

    /// Smallest blob, in pixels, the colour source reports.
    #[serde(default = "default_min_area")]
    pub min_area: usize,

    /// Label given to colour blobs; must be one of the target classes for
    /// them to be treated.
    #[serde(default = "default_blob_label")]
    pub label: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            frames_dir: None,
            min_area: default_min_area(),
            label: default_blob_label(),
        }
    }
}

fn default_min_area() -> usize {
    500
}
fn default_blob_label() -> String {
    "weed".to_string()
}

/// Persisted operator configuration stored in `~/.agribot/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// JSON-lines detection recording to replay during a mission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections_path: Option<PathBuf>,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub calibration: CalibrationProfile,
}

impl Config {
    /// The configured detector, or `None` when replay is selected without a
    /// recording.
    ///
    /// # Errors
    ///
    /// [`AgriError::Config`] when the colour source has no `frames_dir`, or
    /// whatever opening the recording or the frame directory reports.
    pub fn detection_source(&self) -> Result<Option<Box<dyn DetectionSource>>, AgriError> {
        match self.detection.source {
            SourceKind::Replay => match &self.detections_path {
                Some(path) => Ok(Some(Box::new(ReplaySource::from_path(path)?))),
                None => Ok(None),
            },
            SourceKind::Color => {
                let dir = self.detection.frames_dir.as_deref().ok_or_else(|| {
                    AgriError::Config("[detection] source = \"color\" needs frames_dir".into())
                })?;
                let camera = ImageDirCamera::open(dir)?;
                let source = ColorBlobSource::new(Box::new(camera))
                    .with_min_area(self.detection.min_area)
                    .with_label(self.detection.label.as_str());
                Ok(Some(Box::new(source)))
            }
        }
    }
}

/// `~/.agribot/config.toml`, falling back to the working directory when no
/// home is set.
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    config_path_for_home(&home)
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    [home, ".agribot", "config.toml"].iter().collect()
}

/// `Ok(None)` on first run, before any config has been written.
pub fn load() -> Result<Option<Config>, AgriError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, AgriError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("read", path, e)),
    };
    let mut cfg = parse(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

pub(crate) fn parse(raw: &str) -> Result<Config, AgriError> {
    let cfg: Config =
        toml::from_str(raw).map_err(|e| AgriError::Config(format!("unparsable config: {e}")))?;
    cfg.calibration
        .validate()
        .map_err(|e| AgriError::Config(format!("[calibration] {e}")))?;
    if cfg.detection.source == SourceKind::Color && cfg.detection.frames_dir.is_none() {
        return Err(AgriError::Config(
            "[detection] source = \"color\" needs frames_dir".into(),
        ));
    }
    Ok(cfg)
}

/// `AGRIBOT_*` variables win over the file.
///
/// | Variable | Field |
/// |---|---|
/// | `AGRIBOT_LINK` | `link.endpoint` |
/// | `AGRIBOT_COMMAND_TIMEOUT_MS` | `link.command_timeout_ms` (ignored unless numeric) |
/// | `AGRIBOT_DETECTIONS` | `detections_path` (empty clears it) |
/// | `AGRIBOT_DETECTION_SOURCE` | `detection.source` (ignored unless `replay` or `color`) |
/// | `AGRIBOT_FRAMES` | `detection.frames_dir` (empty clears it) |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(endpoint) = std::env::var("AGRIBOT_LINK") {
        cfg.link.endpoint = endpoint;
    }
    if let Some(ms) = std::env::var("AGRIBOT_COMMAND_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        cfg.link.command_timeout_ms = ms;
    }
    if let Ok(path) = std::env::var("AGRIBOT_DETECTIONS") {
        cfg.detections_path = (!path.is_empty()).then(|| PathBuf::from(path));
    }
    if let Some(source) = std::env::var("AGRIBOT_DETECTION_SOURCE")
        .ok()
        .and_then(|v| v.parse::<SourceKind>().ok())
    {
        cfg.detection.source = source;
    }
    if let Ok(dir) = std::env::var("AGRIBOT_FRAMES") {
        cfg.detection.frames_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
    }
}

pub fn save(cfg: &Config) -> Result<(), AgriError> {
    save_to(cfg, &config_path())
}

/// The directory is created owner-only and the file is written `0o600`
/// on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), AgriError> {
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| AgriError::Config(format!("unserialisable config: {e}")))?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_error("create", dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_error("restrict", dir, e))?;
        }
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .and_then(|mut file| file.write_all(raw.as_bytes()))
        .map_err(|e| io_error("write", path, e))
}

fn io_error(action: &str, path: &Path, e: io::Error) -> AgriError {
    AgriError::Config(format!("cannot {action} {}: {e}", path.display()))
}
