//! Encoding modules for the video rotator

pub mod command;
pub mod failure;
pub mod ffmpeg;
pub mod progress;

pub use command::{
    build_ffmpeg_command, rotation_filter, AccelerationParams, EncodeRequest, SOFTWARE_CODEC,
};
pub use failure::{FailureClass, FailureClassifier, RuntimeFailure, Termination};
pub use ffmpeg::{EncodeError, EncodeObserver, EncodeSummary, Encoder};
pub use progress::ProgressParser;
