//! Output path resolution.
//!
//! Maps an input video to the path its rotated copy is written to, following
//! the configured output policy, and creates the destination directory.

use crate::config::OutputPolicy;
use chrono::{Local, NaiveDate};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of the per-day directory created when dated subdirectories are enabled.
pub const DATED_SUBDIR_PREFIX: &str = "rotated_videos_";

/// Error type for output path resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The destination directory could not be created.
    #[error("Failed to create output directory {}: {source}", .path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No desktop directory could be determined for the fixed output location.
    #[error("No desktop directory available for the fixed output location")]
    NoFixedLocation,

    /// The custom policy was selected without an output directory.
    #[error("Custom output policy requires an output directory")]
    MissingOutputDir,

    /// The input path does not name a file.
    #[error("Input path has no file name: {}", .0.display())]
    InvalidInput(PathBuf),
}

/// Builds the output file name: the input stem with `suffix` appended, extension kept.
///
/// `/media/clip.final.mp4` with suffix `_rotated` -> `clip.final_rotated.mp4`
pub fn output_file_name(input: &Path, suffix: &str) -> Result<OsString, ResolveError> {
    let stem = input
        .file_stem()
        .ok_or_else(|| ResolveError::InvalidInput(input.to_path_buf()))?;

    let mut name = stem.to_os_string();
    name.push(suffix);
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    Ok(name)
}

/// Name of the dated subdirectory for `date`, e.g. `rotated_videos_20240131`.
pub fn dated_subdir_name(date: NaiveDate) -> String {
    format!("{}{}", DATED_SUBDIR_PREFIX, date.format("%Y%m%d"))
}

/// The platform's well-known output location (the user's desktop).
pub fn fixed_location() -> Option<PathBuf> {
    dirs::desktop_dir().or_else(|| dirs::home_dir().map(|home| home.join("Desktop")))
}

/// Output layout for one batch.
///
/// The date is captured once so every job of a batch lands in the same dated
/// directory even when the batch runs past midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    suffix: String,
    policy: OutputPolicy,
    custom_dir: Option<PathBuf>,
    fixed_dir: Option<PathBuf>,
    dated_subdir: bool,
    date: NaiveDate,
}

impl OutputLayout {
    /// Create a layout using today's local date and the desktop as fixed location.
    pub fn new(
        suffix: impl Into<String>,
        policy: OutputPolicy,
        custom_dir: Option<PathBuf>,
        dated_subdir: bool,
    ) -> Self {
        Self {
            suffix: suffix.into(),
            policy,
            custom_dir,
            fixed_dir: fixed_location(),
            dated_subdir,
            date: Local::now().date_naive(),
        }
    }

    /// Override the fixed output location.
    pub fn with_fixed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixed_dir = Some(dir.into());
        self
    }

    /// Override the date used for dated subdirectories.
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Directory that outputs for `input` are written to. Pure path computation.
    pub fn output_dir_for(&self, input: &Path) -> Result<PathBuf, ResolveError> {
        let base = match self.policy {
            OutputPolicy::SameAsSource => {
                return Ok(match input.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                });
            }
            OutputPolicy::FixedLocation => self
                .fixed_dir
                .clone()
                .ok_or(ResolveError::NoFixedLocation)?,
            OutputPolicy::Custom => self
                .custom_dir
                .clone()
                .ok_or(ResolveError::MissingOutputDir)?,
        };

        if self.dated_subdir {
            Ok(base.join(dated_subdir_name(self.date)))
        } else {
            Ok(base)
        }
    }

    /// Output path for `input`. Pure path computation, nothing is created.
    pub fn output_path_for(&self, input: &Path) -> Result<PathBuf, ResolveError> {
        let name = output_file_name(input, &self.suffix)?;
        Ok(self.output_dir_for(input)?.join(name))
    }

    /// Output path for `input`, creating the destination directory if missing.
    pub fn resolve(&self, input: &Path) -> Result<PathBuf, ResolveError> {
        let output = self.output_path_for(input)?;
        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir).map_err(|source| ResolveError::DirectoryCreation {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(output)
    }
}

/// Resolve a single output path with today's date.
pub fn resolve(
    input: &Path,
    suffix: &str,
    policy: OutputPolicy,
    base_output_dir: Option<&Path>,
    create_dated_subdir: bool,
) -> Result<PathBuf, ResolveError> {
    OutputLayout::new(
        suffix,
        policy,
        base_output_dir.map(Path::to_path_buf),
        create_dated_subdir,
    )
    .resolve(input)
}
