//! Runtime configuration.
//!
//! Precedence, highest first: environment overrides, the optional TOML
//! file, built-in defaults. Every section is `#[serde(default)]` so a file
//! only needs the keys it changes.
//!
//! ```toml
//! [server]
//! port = 9090
//!
//! [pursuit]
//! target = "cup"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::behavior::{PursuitConfig, WanderConfig};
use crate::commander::CommanderConfig;
use crate::perception::DetectorConfig;
use crate::safety::SafetyConfig;
use crate::transport::{ActuatorConfig, DEFAULT_MAX_FRAME_LEN};

pub const ENV_HOST: &str = "ROVER_HOST";
pub const ENV_PORT: &str = "ROVER_PORT";
pub const ENV_WORKER_THREADS: &str = "ROVER_WORKER_THREADS";
pub const ENV_IMG_WIDTH: &str = "ROVER_IMG_WIDTH";
pub const ENV_IMG_HEIGHT: &str = "ROVER_IMG_HEIGHT";
pub const ENV_DETECTOR_URL: &str = "ROVER_DETECTOR_URL";
pub const ENV_ACTUATOR_ADDR: &str = "ROVER_ACTUATOR_ADDR";
pub const ENV_TARGET: &str = "ROVER_TARGET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

// ── Sections ─────────────────────────────────────────────────────────────────

/// Image ingress listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

/// Frame geometry used for steering math.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

// ── Root ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub actuator: ActuatorConfig,
    pub commander: CommanderConfig,
    pub pursuit: PursuitConfig,
    pub wander: WanderConfig,
    pub safety: SafetyConfig,
}

impl RoverConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the process
    /// environment, then validated.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.server.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = parse_env(ENV_PORT, port)?;
        }
        if let Some(threads) = lookup(ENV_WORKER_THREADS) {
            self.runtime.worker_threads = parse_env(ENV_WORKER_THREADS, threads)?;
        }
        if let Some(width) = lookup(ENV_IMG_WIDTH) {
            self.camera.width = parse_env(ENV_IMG_WIDTH, width)?;
        }
        if let Some(height) = lookup(ENV_IMG_HEIGHT) {
            self.camera.height = parse_env(ENV_IMG_HEIGHT, height)?;
        }
        if let Some(url) = lookup(ENV_DETECTOR_URL) {
            self.detector.endpoint = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(addr) = lookup(ENV_ACTUATOR_ADDR) {
            self.actuator.address = addr;
        }
        if let Some(target) = lookup(ENV_TARGET) {
            self.pursuit.target = Some(target.trim().to_string()).filter(|t| !t.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("camera width and height must be non-zero");
        }
        if self.runtime.worker_threads == 0 {
            return invalid("runtime.worker_threads must be at least 1");
        }
        if self.server.max_frame_bytes == 0 || self.server.max_frame_bytes > i32::MAX as usize {
            return invalid("server.max_frame_bytes must be in 1..=i32::MAX");
        }
        if self.commander.tick_ms == 0 {
            return invalid("commander.tick_ms must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return invalid("detector.confidence_threshold must be within [0, 1]");
        }

        let tiers = &self.pursuit.speed_tiers;
        if tiers.iter().any(|t| !t.below.is_finite()) {
            return invalid("pursuit.speed_tiers bounds must be finite");
        }
        if tiers.windows(2).any(|w| w[0].below >= w[1].below) {
            return invalid("pursuit.speed_tiers must be strictly ascending by `below`");
        }
        if tiers.iter().any(|t| !(0.0..=1.0).contains(&t.speed)) {
            return invalid("pursuit.speed_tiers speeds must be within [0, 1]");
        }
        let deadzone = self.pursuit.deadzone_px;
        if !(0.0..=1.0).contains(&self.pursuit.turn_speed)
            || !deadzone.is_finite()
            || deadzone < 0.0
        {
            return invalid("pursuit.turn_speed must be within [0, 1] and deadzone_px non-negative");
        }

        let wander = &self.wander;
        if wander.drive_min_ms > wander.drive_max_ms {
            return invalid("wander drive range is empty");
        }
        if !(0.0..=MAX_TURN_DEG).contains(&wander.turn_min_deg)
            || !(0.0..=MAX_TURN_DEG).contains(&wander.turn_max_deg)
        {
            return invalid("wander turn angles must be within [0, 360]");
        }
        if wander.turn_min_deg > wander.turn_max_deg {
            return invalid("wander turn range is empty");
        }
        if wander
            .scan_headings_deg
            .iter()
            .any(|h| !(-MAX_TURN_DEG..=MAX_TURN_DEG).contains(h))
        {
            return invalid("wander.scan_headings_deg must be within [-360, 360]");
        }
        if !(0.0..=1.0).contains(&wander.alternate_bias) {
            return invalid("wander.alternate_bias must be within [0, 1]");
        }
        if !wander.turn_rate_dps.is_finite() || wander.turn_rate_dps <= 0.0 {
            return invalid("wander.turn_rate_dps must be positive");
        }
        if !(0.0..=1.0).contains(&wander.turn_speed) || !(0.0..=1.0).contains(&wander.forward_speed)
        {
            return invalid("wander speeds must be within [0, 1]");
        }

        let proximity = self.safety.stop_proximity;
        if !proximity.is_finite() || proximity <= 0.0 {
            return invalid("safety.stop_proximity must be positive");
        }
        Ok(())
    }
}

/// Largest single rotation, in degrees, a wander turn may request.
const MAX_TURN_DEG: f32 = 360.0;

fn parse_env<T: FromStr>(var: &'static str, value: String) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn invalid<T>(reason: &str) -> ConfigResult<T> {
    Err(ConfigError::Invalid(reason.to_string()))
}
