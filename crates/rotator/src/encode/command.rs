//! ffmpeg command construction
//!
//! Builds the ffmpeg invocation for one rotation: decoder acceleration flags,
//! input, video codec, rotation filter, audio passthrough and output.

use crate::config::{Acceleration, Rotation};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Command;

/// ffmpeg filter token for a 90 degree clockwise turn
pub const TRANSPOSE_CLOCKWISE: &str = "transpose=1";

/// ffmpeg filter token for a 90 degree counter-clockwise turn
pub const TRANSPOSE_COUNTER_CLOCKWISE: &str = "transpose=2";

/// Software codec used when no accelerator is requested or after fallback
pub const SOFTWARE_CODEC: &str = "libx264";

/// Windows process creation flag that suppresses the console window
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Video filter expression for a rotation
///
/// A half turn is two chained clockwise transposes; ffmpeg has no single
/// 180 degree transpose and the chained form keeps output identical to
/// rotating twice.
pub fn rotation_filter(rotation: Rotation) -> String {
    match rotation {
        Rotation::Clockwise90 => TRANSPOSE_CLOCKWISE.to_string(),
        Rotation::CounterClockwise90 => TRANSPOSE_COUNTER_CLOCKWISE.to_string(),
        Rotation::Rotate180 => format!("{},{}", TRANSPOSE_CLOCKWISE, TRANSPOSE_CLOCKWISE),
    }
}

/// Fixed ffmpeg parameter set for an acceleration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationParams {
    /// Decoder flags, placed before `-i`
    pub input_args: &'static [&'static str],
    /// Value for `-c:v`
    pub codec: &'static str,
}

impl AccelerationParams {
    pub fn for_mode(mode: Acceleration) -> Self {
        match mode {
            Acceleration::Nvenc => Self {
                input_args: &["-hwaccel", "cuda"],
                codec: "h264_nvenc",
            },
            Acceleration::Qsv => Self {
                input_args: &["-hwaccel", "qsv"],
                codec: "h264_qsv",
            },
            Acceleration::Amf => Self {
                input_args: &["-hwaccel", "d3d11va"],
                codec: "h264_amf",
            },
            Acceleration::None => Self {
                input_args: &[],
                codec: SOFTWARE_CODEC,
            },
        }
    }
}

/// Human-readable name of an acceleration mode for log lines
pub fn acceleration_label(mode: Acceleration) -> &'static str {
    match mode {
        Acceleration::None => "software encoding",
        Acceleration::Nvenc => "NVENC hardware acceleration",
        Acceleration::Qsv => "QSV hardware acceleration",
        Acceleration::Amf => "AMF hardware acceleration",
    }
}

/// One ffmpeg invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    /// Path to the input video file
    pub input_path: PathBuf,
    /// Path for the rotated output file
    pub output_path: PathBuf,
    pub rotation: Rotation,
    pub acceleration: Acceleration,
    /// Replace an existing output (`-y`) or refuse to (`-n`)
    pub overwrite: bool,
}

impl EncodeRequest {
    pub fn new(
        input_path: PathBuf,
        output_path: PathBuf,
        rotation: Rotation,
        acceleration: Acceleration,
    ) -> Self {
        Self {
            input_path,
            output_path,
            rotation,
            acceleration,
            overwrite: true,
        }
    }

    /// Same request with a different acceleration mode
    pub fn with_acceleration(&self, acceleration: Acceleration) -> Self {
        Self {
            acceleration,
            ..self.clone()
        }
    }
}

/// Build an ffmpeg command for a request
///
/// Creates a Command configured with:
/// - `-hide_banner` and `-y`/`-n` depending on the overwrite flag
/// - Decoder acceleration flags (vendor modes only)
/// - Input path
/// - Video codec for the acceleration mode
/// - Rotation filter
/// - Audio stream copy
/// - Output path
///
/// Paths are passed as separate arguments, never quoted or joined, so spaces
/// and non-ASCII characters need no escaping.
pub fn build_ffmpeg_command(program: impl AsRef<OsStr>, request: &EncodeRequest) -> Command {
    let params = AccelerationParams::for_mode(request.acceleration);
    let mut cmd = Command::new(program);

    cmd.arg("-hide_banner");
    cmd.arg(if request.overwrite { "-y" } else { "-n" });

    cmd.args(params.input_args);
    cmd.arg("-i").arg(&request.input_path);

    cmd.arg("-c:v").arg(params.codec);
    cmd.arg("-vf").arg(rotation_filter(request.rotation));

    cmd.arg("-c:a").arg("copy");

    cmd.arg(&request.output_path);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// Render a command as a single line for logging
pub fn describe_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| {
            let arg = arg.to_string_lossy();
            if arg.contains(' ') {
                format!("\"{}\"", arg)
            } else {
                arg.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
