//! Startup checks
//!
//! Preflight probes run once per session, outside the per-batch flow:
//! - Encoder availability (`ffmpeg -version`), fatal when it fails
//! - Vendor encoder presence (`ffmpeg -encoders`), advisory only
//!
//! Also resolves which encoder binary to run: an unconfigured `ffmpeg` is
//! first looked for beside the running executable, then left to `PATH`.

use crate::config::{Acceleration, DEFAULT_ENCODER_PROGRAM};
use crate::encode::AccelerationParams;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File names of an encoder shipped next to the binary.
const BUNDLED_ENCODER_NAMES: &[&str] = &["ffmpeg", "ffmpeg.exe"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn probe(program: &Path, args: &[&str]) -> std::io::Result<std::process::Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x0800_0000);
    }

    cmd.output()
}

/// Pick the encoder binary for a configured program.
///
/// Explicitly configured programs are used as given. The default is
/// replaced by a bundled copy in the executable's directory when present.
pub fn locate_encoder(program: &Path) -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    locate_encoder_in(program, exe_dir.as_deref())
}

/// [`locate_encoder`] with the executable directory given explicitly.
pub fn locate_encoder_in(program: &Path, exe_dir: Option<&Path>) -> PathBuf {
    if program != Path::new(DEFAULT_ENCODER_PROGRAM) {
        return program.to_path_buf();
    }
    let bundled = exe_dir.and_then(|dir| {
        BUNDLED_ENCODER_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    });
    match bundled {
        Some(path) => {
            debug!(path = %path.display(), "using encoder bundled with the executable");
            path
        }
        None => program.to_path_buf(),
    }
}

/// Parse the version from `ffmpeg -version` output
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
/// - Git builds: "ffmpeg version N-113412-g0b8e51b584 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_ascii_lowercase();
    let start = lower.find("ffmpeg version")? + "ffmpeg version".len();
    let version = version_line[start..].split_whitespace().next()?;

    // Plain release tags carry an `n` prefix; git snapshot names start with `N-`
    let version = match version.strip_prefix('n') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => version,
    };
    Some(version.to_string())
}

/// Check that the encoder runs by invoking `<program> -version`
///
/// Returns the parsed version, or `"unknown"` when the banner is unfamiliar.
pub fn check_encoder_available(program: &Path) -> Result<String, StartupError> {
    let output = probe(program, &["-version"]).map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
            program.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program.display(),
            output.status
        )));
    }

    let banner = String::from_utf8_lossy(&output.stdout);
    let version = parse_ffmpeg_version(&banner).unwrap_or_else(|| "unknown".to_string());
    info!(program = %program.display(), version = %version, "encoder available");
    Ok(version)
}

/// Extract encoder names from `ffmpeg -encoders` output.
///
/// Entries look like ` V....D h264_nvenc           NVIDIA NVENC H.264 encoder`;
/// everything up to the `------` separator is legend.
pub fn parse_encoder_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

/// Encoders compiled into the encoder binary
pub fn available_encoders(program: &Path) -> Result<Vec<String>, StartupError> {
    let output = probe(program, &["-hide_banner", "-encoders"])?;
    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Warn when the requested vendor codec is not built into the encoder.
///
/// Never fatal: the software fallback still lets jobs succeed. Returns whether
/// the codec was found (always true for software encoding).
pub fn warn_if_codec_missing(program: &Path, acceleration: Acceleration) -> bool {
    if !acceleration.is_hardware() {
        return true;
    }
    let codec = AccelerationParams::for_mode(acceleration).codec;
    match available_encoders(program) {
        Ok(encoders) if encoders.iter().any(|e| e == codec) => true,
        Ok(_) => {
            warn!(
                codec,
                "encoder {} was not built with {}; expect software fallback",
                program.display(),
                codec
            );
            false
        }
        Err(e) => {
            warn!(error = %e, "could not list encoders");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENCODERS_OUTPUT: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_encoder_list() {
        assert_eq!(
            parse_encoder_list(ENCODERS_OUTPUT),
            vec!["libx264", "h264_nvenc", "aac"]
        );
    }

    #[test]
    fn test_parse_encoder_list_without_separator() {
        assert!(parse_encoder_list("garbage\nmore garbage").is_empty());
    }

    #[test]
    fn test_parse_git_snapshot_version() {
        let banner = "ffmpeg version N-113412-g0b8e51b584 Copyright (c) 2000-2024";
        assert_eq!(
            parse_ffmpeg_version(banner).as_deref(),
            Some("N-113412-g0b8e51b584")
        );
    }

    #[test]
    fn test_parse_version_missing() {
        assert_eq!(parse_ffmpeg_version("avconv version 12"), None);
    }

    #[test]
    fn test_bundled_encoder_preferred_over_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let bundled = temp.path().join("ffmpeg.exe");
        std::fs::write(&bundled, b"").unwrap();

        assert_eq!(
            locate_encoder_in(Path::new("ffmpeg"), Some(temp.path())),
            bundled
        );
    }

    #[test]
    fn test_path_fallback_without_bundled_encoder() {
        let temp = tempfile::TempDir::new().unwrap();
        assert_eq!(
            locate_encoder_in(Path::new("ffmpeg"), Some(temp.path())),
            PathBuf::from("ffmpeg")
        );
        assert_eq!(locate_encoder_in(Path::new("ffmpeg"), None), PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_configured_program_is_kept() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("ffmpeg"), b"").unwrap();
        let configured = Path::new("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(
            locate_encoder_in(configured, Some(temp.path())),
            configured.to_path_buf()
        );
    }

    #[test]
    fn test_missing_encoder_is_unavailable() {
        let result = check_encoder_available(Path::new("/definitely/not/ffmpeg"));
        assert!(matches!(result, Err(StartupError::EncoderUnavailable(_))));
    }

    #[test]
    fn test_software_needs_no_codec_check() {
        assert!(warn_if_codec_missing(
            Path::new("/definitely/not/ffmpeg"),
            Acceleration::None
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_version_check_with_fake_encoder() {
        use crate::testing::fake_encoder;

        let temp = tempfile::TempDir::new().unwrap();
        let body = format!(
            "case \"$1\" in\n-version) echo 'ffmpeg version 7.1.1 Copyright (c) 2000-2025';;\n*) printf '%s' '{}';;\nesac",
            ENCODERS_OUTPUT
        );
        let program = fake_encoder(temp.path(), "ffmpeg", &body);
        let located = locate_encoder_in(Path::new("ffmpeg"), Some(temp.path()));
        assert_eq!(located, program);

        assert_eq!(check_encoder_available(&located).unwrap(), "7.1.1");
        assert!(warn_if_codec_missing(&program, Acceleration::Nvenc));
        assert!(!warn_if_codec_missing(&program, Acceleration::Qsv));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_version_check_is_unavailable() {
        use crate::testing::fake_encoder;

        let temp = tempfile::TempDir::new().unwrap();
        let program = fake_encoder(temp.path(), "ffmpeg", "exit 1");
        assert!(matches!(
            check_encoder_available(&program),
            Err(StartupError::EncoderUnavailable(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(parsed, Some(format!("{}.{}.{}", major, minor, patch)));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(parsed, Some(format!("{}.{}-123-g{}", major, minor, git_hash)));
        }
    }
}
