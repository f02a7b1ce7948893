use proxyzero_core::PipelineConfig;
use proxyzero_hw::Resolution;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{key} must be at most {max}")]
    TooLarge { key: &'static str, max: u64 },
}

/// Fastest supported scan rate: one frame per millisecond.
const MAX_SCAN_FPS: u32 = 1000;

/// Daemon configuration.
///
/// Loaded from an optional TOML file, then overridden by `PROXYZERO_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the attendance backend (location check, commit).
    pub api_url: String,
    /// Base URL of the face-match backend.
    pub face_api_url: String,
    /// V4L2 node for the rear (code scanning) camera.
    pub rear_device: String,
    /// V4L2 node for the front (face) camera.
    pub front_device: String,
    pub width: u32,
    pub height: u32,
    /// Frames scanned per second while looking for the class code.
    pub scan_fps: u32,
    pub location_timeout_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// How long to wait for the user to take the face photo.
    pub action_timeout_secs: u64,
    /// How long a retry offer stays open before the session fails. The
    /// session keeps its stage, with `last_error` set, while the offer is open.
    pub retry_timeout_secs: u64,
    pub max_face_attempts: u32,
    /// Frames grabbed per face capture while looking for a lit one.
    pub capture_frames: usize,
    pub auto_capture: bool,
    /// Desktop id presented to GeoClue for location authorization.
    pub geoclue_desktop_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:4000".to_string(),
            face_api_url: "http://localhost:5000".to_string(),
            rear_device: "/dev/video0".to_string(),
            front_device: "/dev/video2".to_string(),
            width: 640,
            height: 480,
            scan_fps: 10,
            location_timeout_secs: 10,
            request_timeout_secs: 30,
            action_timeout_secs: 120,
            retry_timeout_secs: 30,
            max_face_attempts: 3,
            capture_frames: 5,
            auto_capture: false,
            geoclue_desktop_id: "proxyzero".to_string(),
        }
    }
}

impl Config {
    /// Load from `PROXYZERO_CONFIG` (or the XDG default path) plus the
    /// process environment.
    ///
    /// A missing file at the default path is not an error; a missing file
    /// named by `PROXYZERO_CONFIG` is.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PROXYZERO_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Override fields from `PROXYZERO_*` variables looked up through `var`.
    pub fn apply_env(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        env_string(&var, "PROXYZERO_API_URL", &mut self.api_url);
        env_string(&var, "PROXYZERO_FACE_API_URL", &mut self.face_api_url);
        env_string(&var, "PROXYZERO_REAR_DEVICE", &mut self.rear_device);
        env_string(&var, "PROXYZERO_FRONT_DEVICE", &mut self.front_device);
        env_parse(&var, "PROXYZERO_WIDTH", &mut self.width)?;
        env_parse(&var, "PROXYZERO_HEIGHT", &mut self.height)?;
        env_parse(&var, "PROXYZERO_SCAN_FPS", &mut self.scan_fps)?;
        env_parse(
            &var,
            "PROXYZERO_LOCATION_TIMEOUT_SECS",
            &mut self.location_timeout_secs,
        )?;
        env_parse(
            &var,
            "PROXYZERO_REQUEST_TIMEOUT_SECS",
            &mut self.request_timeout_secs,
        )?;
        env_parse(
            &var,
            "PROXYZERO_ACTION_TIMEOUT_SECS",
            &mut self.action_timeout_secs,
        )?;
        env_parse(
            &var,
            "PROXYZERO_RETRY_TIMEOUT_SECS",
            &mut self.retry_timeout_secs,
        )?;
        env_parse(&var, "PROXYZERO_MAX_FACE_ATTEMPTS", &mut self.max_face_attempts)?;
        env_parse(&var, "PROXYZERO_CAPTURE_FRAMES", &mut self.capture_frames)?;
        if let Some(v) = var("PROXYZERO_AUTO_CAPTURE") {
            self.auto_capture = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env_string(
            &var,
            "PROXYZERO_GEOCLUE_DESKTOP_ID",
            &mut self.geoclue_desktop_id,
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("api_url", &self.api_url),
            ("face_api_url", &self.face_api_url),
            ("rear_device", &self.rear_device),
            ("front_device", &self.front_device),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }
        let counts = [
            ("width", u64::from(self.width)),
            ("height", u64::from(self.height)),
            ("scan_fps", u64::from(self.scan_fps)),
            ("location_timeout_secs", self.location_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("action_timeout_secs", self.action_timeout_secs),
            ("retry_timeout_secs", self.retry_timeout_secs),
            ("max_face_attempts", u64::from(self.max_face_attempts)),
            ("capture_frames", self.capture_frames as u64),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.scan_fps > MAX_SCAN_FPS {
            return Err(ConfigError::TooLarge {
                key: "scan_fps",
                max: u64::from(MAX_SCAN_FPS),
            });
        }
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            scan_interval: Duration::from_millis(1000 / u64::from(self.scan_fps.max(1))),
            location_timeout: Duration::from_secs(self.location_timeout_secs),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            retry_timeout: Duration::from_secs(self.retry_timeout_secs),
            max_face_attempts: self.max_face_attempts,
            auto_capture: self.auto_capture,
            capture_frames: self.capture_frames,
        }
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("proxyzero")
        .join("config.toml")
}

fn env_string(var: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
    if let Some(v) = var(key) {
        *field = v;
    }
}

fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    field: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = var(key) {
        *field = v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value: v })?;
    }
    Ok(())
}
