//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Upper bound for concurrent rotation jobs
pub const MAX_CONCURRENCY: u32 = 16;

/// Encoder program used when none is configured, looked up beside the
/// binary and then on `PATH`
pub const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// One or more values failed validation
    Invalid(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(problems) => {
                write!(f, "Invalid configuration: {}", problems.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Error returned when a textual option does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

fn unknown(kind: &'static str, value: &str) -> UnknownVariant {
    UnknownVariant {
        kind,
        value: value.to_string(),
    }
}

/// Rotation applied to every file of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// 90 degrees clockwise
    #[default]
    Clockwise90,
    /// 90 degrees counter-clockwise
    CounterClockwise90,
    /// Half turn
    Rotate180,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rotation::Clockwise90 => write!(f, "clockwise90"),
            Rotation::CounterClockwise90 => write!(f, "counter_clockwise90"),
            Rotation::Rotate180 => write!(f, "rotate180"),
        }
    }
}

impl FromStr for Rotation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clockwise90" | "clockwise" | "cw" | "cw90" | "90" => Ok(Rotation::Clockwise90),
            "counter_clockwise90" | "counterclockwise" | "ccw" | "ccw90" | "-90" | "270" => {
                Ok(Rotation::CounterClockwise90)
            }
            "rotate180" | "180" => Ok(Rotation::Rotate180),
            other => Err(unknown("rotation", other)),
        }
    }
}

/// Hardware acceleration requested for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    /// Software encoding
    #[default]
    None,
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
    /// AMD AMF
    Amf,
}

impl Acceleration {
    /// Whether this mode asks for a hardware encoder
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Acceleration::None)
    }
}

impl fmt::Display for Acceleration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acceleration::None => write!(f, "none"),
            Acceleration::Nvenc => write!(f, "nvenc"),
            Acceleration::Qsv => write!(f, "qsv"),
            Acceleration::Amf => write!(f, "amf"),
        }
    }
}

impl FromStr for Acceleration {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "software" | "cpu" => Ok(Acceleration::None),
            "nvenc" | "nvidia" | "cuda" => Ok(Acceleration::Nvenc),
            "qsv" | "intel" => Ok(Acceleration::Qsv),
            "amf" | "amd" => Ok(Acceleration::Amf),
            other => Err(unknown("acceleration", other)),
        }
    }
}

/// Where rotated files are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Next to the source file
    #[default]
    SameAsSource,
    /// The user's desktop directory
    FixedLocation,
    /// `processing.output_dir`
    Custom,
}

impl fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPolicy::SameAsSource => write!(f, "same_as_source"),
            OutputPolicy::FixedLocation => write!(f, "fixed_location"),
            OutputPolicy::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for OutputPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "same_as_source" | "source" | "same" => Ok(OutputPolicy::SameAsSource),
            "fixed_location" | "fixed" | "desktop" => Ok(OutputPolicy::FixedLocation),
            "custom" | "dir" => Ok(OutputPolicy::Custom),
            other => Err(unknown("output policy", other)),
        }
    }
}

/// What to do when the resolved output file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExistingOutput {
    /// Replace it
    #[default]
    Overwrite,
    /// Fail the job without running the encoder
    Fail,
}

impl fmt::Display for ExistingOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExistingOutput::Overwrite => write!(f, "overwrite"),
            ExistingOutput::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for ExistingOutput {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" | "replace" => Ok(ExistingOutput::Overwrite),
            "fail" | "keep" => Ok(ExistingOutput::Fail),
            other => Err(unknown("existing output policy", other)),
        }
    }
}

/// Per-batch processing options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub rotation: Rotation,
    /// Appended to the file stem of every output
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub output_policy: OutputPolicy,
    /// Target directory for the custom output policy
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Group outputs under a `rotated_videos_YYYYMMDD` directory
    #[serde(default)]
    pub create_dated_subdir: bool,
    #[serde(default)]
    pub acceleration: Acceleration,
    /// Concurrent jobs (0 = derive from CPU count)
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub existing_output: ExistingOutput,
}

fn default_suffix() -> String {
    "_rotated".to_string()
}

fn default_concurrency() -> u32 {
    1
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            rotation: Rotation::default(),
            suffix: default_suffix(),
            output_policy: OutputPolicy::default(),
            output_dir: None,
            create_dated_subdir: false,
            acceleration: Acceleration::default(),
            concurrency: default_concurrency(),
            existing_output: ExistingOutput::default(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable name or path; the default is also looked up beside the binary
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Probe the encoder with `-version` before processing
    #[serde(default = "default_check_on_startup")]
    pub check_on_startup: bool,
    /// Per-attempt timeout in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
    /// Exit codes treated as abnormal termination
    #[serde(default = "default_abnormal_exit_codes")]
    pub abnormal_exit_codes: Vec<i64>,
    /// Case-insensitive stderr fragments that mean the accelerator could not run
    #[serde(default = "default_accelerator_error_patterns")]
    pub accelerator_error_patterns: Vec<String>,
}

fn default_program() -> PathBuf {
    PathBuf::from(DEFAULT_ENCODER_PROGRAM)
}

fn default_check_on_startup() -> bool {
    true
}

/// 0xFFFFFFEA is -22 (EINVAL) wrapped to u32, 0xC0000006 is an in-page
/// error on Windows, 234 is -22 truncated to a Unix exit status.
fn default_abnormal_exit_codes() -> Vec<i64> {
    vec![4294967274, -1073741818, 3221225478, 234]
}

fn default_accelerator_error_patterns() -> Vec<String> {
    [
        "no nvenc capable devices found",
        "cannot load nvcuda",
        "cannot load libnvidia-encode",
        "openencodesessionex failed",
        "error creating a mfx session",
        "device creation failed",
        "failed to initialise vaapi",
        "dll amfrt64.dll failed to open",
        "no device available for decoder",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            check_on_startup: default_check_on_startup(),
            timeout_secs: 0,
            abnormal_exit_codes: default_abnormal_exit_codes(),
            accelerator_error_patterns: default_accelerator_error_patterns(),
        }
    }
}

/// Stop behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownConfig {
    /// Seconds between the graceful terminate and the forced kill
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    5
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDEO_ROTATOR_FFMPEG -> encoder.program
    /// - VIDEO_ROTATOR_CONCURRENCY -> processing.concurrency
    /// - VIDEO_ROTATOR_ACCELERATION -> processing.acceleration
    /// - VIDEO_ROTATOR_OUTPUT_DIR -> processing.output_dir
    /// - VIDEO_ROTATOR_GRACE_SECS -> shutdown.grace_period_secs
    /// - VIDEO_ROTATOR_LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDEO_ROTATOR_FFMPEG") {
            if !val.trim().is_empty() {
                self.encoder.program = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("VIDEO_ROTATOR_CONCURRENCY") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.processing.concurrency = jobs;
            }
        }

        if let Ok(val) = env::var("VIDEO_ROTATOR_ACCELERATION") {
            if let Ok(accel) = val.parse::<Acceleration>() {
                self.processing.acceleration = accel;
            }
        }

        if let Ok(val) = env::var("VIDEO_ROTATOR_OUTPUT_DIR") {
            if !val.trim().is_empty() {
                self.processing.output_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VIDEO_ROTATOR_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.shutdown.grace_period_secs = secs;
            }
        }

        if let Ok(val) = env::var("VIDEO_ROTATOR_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val;
            }
        }
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.processing.output_policy == OutputPolicy::Custom
            && self.processing.output_dir.is_none()
        {
            problems.push("output_policy = custom requires processing.output_dir".to_string());
        }

        if self
            .processing
            .suffix
            .chars()
            .any(|c| c == '/' || c == '\\')
        {
            problems.push(format!(
                "suffix '{}' must not contain path separators",
                self.processing.suffix
            ));
        }

        if self.encoder.program.as_os_str().is_empty() {
            problems.push("encoder.program must not be empty".to_string());
        }

        if self.shutdown.grace_period_secs == 0 {
            problems.push("shutdown.grace_period_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
