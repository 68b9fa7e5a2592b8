//! Video Rotator
//!
//! Batch engine that rotates video files by driving ffmpeg as a child
//! process: output path resolution, bounded concurrent scheduling, hardware
//! acceleration with software fallback, and prompt cancellation of running
//! encoders.

pub mod batch;
pub mod concurrency;
pub mod encode;
pub mod job;
pub mod params;
pub mod registry;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod scheduler;
pub mod startup;

#[cfg(test)]
pub(crate) mod testing;

pub use video_rotator_config as config;
pub use video_rotator_config::{
    Acceleration, Config, ExistingOutput, LogFormat, OutputPolicy, Rotation,
};

pub use batch::{BatchOutcome, BatchReport, BatchRun, JobFailure};
pub use concurrency::{clamp_concurrency, derive_concurrency};
pub use encode::{
    build_ffmpeg_command, rotation_filter, EncodeError, EncodeRequest, Encoder, RuntimeFailure,
};
pub use job::{Job, JobError, JobState};
pub use params::BatchParams;
pub use registry::{ProcessHandle, ProcessRegistry, Registration, TerminationSummary};
pub use report::{
    ChannelReporter, FnReporter, NullReporter, ProgressEvent, ProgressReporter, TimeRemaining,
};
pub use resolve::{resolve, OutputLayout, ResolveError};
pub use scan::{collect_inputs, is_video_file};
pub use scheduler::{gather_inputs, BatchScheduler, SchedulerError};
pub use startup::{
    available_encoders, check_encoder_available, locate_encoder, parse_encoder_list,
    parse_ffmpeg_version, StartupError,
};
