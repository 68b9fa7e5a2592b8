//! Batch parameters

use crate::concurrency::{clamp_concurrency, derive_concurrency};
use crate::config::{Acceleration, Config, ExistingOutput, OutputPolicy, Rotation};
use crate::resolve::OutputLayout;
use std::path::PathBuf;

/// Options for one `process_batch` call.
///
/// `concurrency` is always within [1, 16]; the constructors clamp it.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchParams {
    pub rotation: Rotation,
    pub suffix: String,
    pub output_policy: OutputPolicy,
    /// Only used with [`OutputPolicy::Custom`]
    pub output_dir: Option<PathBuf>,
    pub create_dated_subdir: bool,
    pub acceleration: Acceleration,
    concurrency: usize,
    pub existing_output: ExistingOutput,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BatchParams {
    pub fn new(rotation: Rotation, suffix: impl Into<String>, concurrency: u32) -> Self {
        Self {
            rotation,
            suffix: suffix.into(),
            output_policy: OutputPolicy::SameAsSource,
            output_dir: None,
            create_dated_subdir: false,
            acceleration: Acceleration::None,
            concurrency: clamp_concurrency(concurrency),
            existing_output: ExistingOutput::Overwrite,
        }
    }

    /// Build parameters from the processing section; `concurrency = 0` means auto.
    pub fn from_config(config: &Config) -> Self {
        let p = &config.processing;
        Self {
            rotation: p.rotation,
            suffix: p.suffix.clone(),
            output_policy: p.output_policy,
            output_dir: p.output_dir.clone(),
            create_dated_subdir: p.create_dated_subdir,
            acceleration: p.acceleration,
            concurrency: derive_concurrency(p.concurrency),
            existing_output: p.existing_output,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = clamp_concurrency(concurrency);
        self
    }

    pub fn with_output_policy(mut self, policy: OutputPolicy, output_dir: Option<PathBuf>) -> Self {
        self.output_policy = policy;
        self.output_dir = output_dir;
        self
    }

    pub fn with_acceleration(mut self, acceleration: Acceleration) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_existing_output(mut self, existing_output: ExistingOutput) -> Self {
        self.existing_output = existing_output;
        self
    }

    pub fn with_dated_subdir(mut self, enabled: bool) -> Self {
        self.create_dated_subdir = enabled;
        self
    }

    /// Output layout for a batch started now.
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(
            self.suffix.clone(),
            self.output_policy,
            self.output_dir.clone(),
            self.create_dated_subdir,
        )
    }
}
