//! Configuration – reads `~/.tagmap/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tagmap_perception::ReferenceQuery;
use tagmap_types::TagMapError;

/// Tracker configuration.  Every field has a default, so an empty or partial
/// file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Reference refresh + export rate (Hz).
    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: f64,

    /// Frame attached to the camera.
    #[serde(default = "default_sensor_frame")]
    pub sensor_frame: String,

    /// Fixed world frame the marker poses are expressed in.
    #[serde(default = "default_world_frame")]
    pub world_frame: String,

    /// Upper bound on a single reference lookup (seconds).
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: f64,

    /// Age after which a frame-graph edge is ignored (seconds).
    #[serde(default = "default_cache_time_secs")]
    pub cache_time_secs: f64,

    /// Weight of the prior estimate when a marker is seen again.
    #[serde(default = "default_smoothing_weight")]
    pub smoothing_weight: f64,

    /// Directory the export file is written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Export file name; `tags_<session>.txt` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,

    /// Per-topic event bus capacity.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Newline-delimited JSON input; stdin when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
}

fn default_frequency_hz() -> f64 {
    1.0
}
fn default_sensor_frame() -> String {
    "base_scan".to_string()
}
fn default_world_frame() -> String {
    "map".to_string()
}
fn default_lookup_timeout_secs() -> f64 {
    4.0
}
fn default_cache_time_secs() -> f64 {
    10.0
}
fn default_smoothing_weight() -> f64 {
    0.9
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frequency_hz: default_frequency_hz(),
            sensor_frame: default_sensor_frame(),
            world_frame: default_world_frame(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            cache_time_secs: default_cache_time_secs(),
            smoothing_weight: default_smoothing_weight(),
            output_dir: default_output_dir(),
            output_file: None,
            bus_capacity: default_bus_capacity(),
            input: None,
        }
    }
}

/// Shortest accepted tick period, lookup timeout or cache time.
const MIN_DURATION: Duration = Duration::from_millis(1);
/// Longest accepted tick period, lookup timeout or cache time.
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

impl Config {
    /// Reject values the tracker cannot run with.
    ///
    /// Every derived duration must lie within 1 ms ..= 24 h.
    pub fn validate(&self) -> Result<(), TagMapError> {
        let durations = [
            ("frequency_hz", self.frequency_hz, 1.0 / self.frequency_hz),
            ("lookup_timeout_secs", self.lookup_timeout_secs, self.lookup_timeout_secs),
            ("cache_time_secs", self.cache_time_secs, self.cache_time_secs),
        ];
        for (name, value, secs) in durations {
            let in_range = Duration::try_from_secs_f64(secs)
                .is_ok_and(|d| (MIN_DURATION..=MAX_DURATION).contains(&d));
            if !(value > 0.0 && in_range) {
                return Err(TagMapError::Config(format!(
                    "{name} = {value} is outside the supported range \
                     (durations between {MIN_DURATION:?} and {MAX_DURATION:?})"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.smoothing_weight) {
            return Err(TagMapError::Config(format!(
                "smoothing_weight must be within [0, 1], got {}",
                self.smoothing_weight
            )));
        }
        if self.bus_capacity == 0 {
            return Err(TagMapError::Config("bus_capacity must be non-zero".to_string()));
        }
        if self.sensor_frame.is_empty() || self.world_frame.is_empty() {
            return Err(TagMapError::Config("frame names must not be empty".to_string()));
        }
        Ok(())
    }

    /// Timer period.  Out-of-range values are clamped; [`validate`](Self::validate)
    /// rejects them up front.
    pub fn tick_period(&self) -> Duration {
        clamped_duration(1.0 / self.frequency_hz)
    }

    pub fn lookup_timeout(&self) -> Duration {
        clamped_duration(self.lookup_timeout_secs)
    }

    pub fn cache_time(&self) -> Duration {
        clamped_duration(self.cache_time_secs)
    }

    pub fn reference_query(&self) -> ReferenceQuery {
        ReferenceQuery {
            sensor_frame: self.sensor_frame.clone(),
            world_frame: self.world_frame.clone(),
            timeout: self.lookup_timeout(),
        }
    }

    /// Full path of the export file for this process instance.
    pub fn output_path(&self, session: &str) -> PathBuf {
        let name = self
            .output_file
            .clone()
            .unwrap_or_else(|| format!("tags_{session}.txt"));
        self.output_dir.join(name)
    }
}

fn clamped_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .map_or(MAX_DURATION, |d| d.clamp(MIN_DURATION, MAX_DURATION))
}

/// Return the path to `~/.tagmap/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tagmap").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, TagMapError> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TagMapError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TagMapError::Config(format!("Failed to read config at {}: {}", path.display(), e))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| TagMapError::Config(format!("Failed to parse config: {}", e)))?;
    Ok(Some(cfg))
}

/// Apply `TAGMAP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TAGMAP_FREQUENCY_HZ` | `frequency_hz` |
/// | `TAGMAP_SENSOR_FRAME` | `sensor_frame` |
/// | `TAGMAP_WORLD_FRAME` | `world_frame` |
/// | `TAGMAP_OUTPUT_DIR` | `output_dir` |
/// | `TAGMAP_INPUT` | `input` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TAGMAP_FREQUENCY_HZ")
        && let Ok(hz) = v.parse::<f64>()
    {
        cfg.frequency_hz = hz;
    }
    if let Ok(v) = std::env::var("TAGMAP_SENSOR_FRAME") {
        cfg.sensor_frame = v;
    }
    if let Ok(v) = std::env::var("TAGMAP_WORLD_FRAME") {
        cfg.world_frame = v;
    }
    if let Ok(v) = std::env::var("TAGMAP_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TAGMAP_INPUT") {
        cfg.input = Some(PathBuf::from(v));
    }
}
