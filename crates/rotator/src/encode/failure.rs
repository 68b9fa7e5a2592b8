//! Classification of failed encoder runs
//!
//! A non-zero exit is either an ordinary failure (bad input, bad arguments)
//! or an abnormal termination: the process was killed, crashed, or the
//! hardware accelerator could not be opened. Only the latter is worth a
//! software retry.

use crate::config::EncoderConfig;
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;

/// Lines of stderr and of stdout carried in a diagnostic
pub const DIAGNOSTIC_TAIL_LINES: usize = 12;

const INVALID_ARGUMENTS_HINT: &str = "invalid encoder arguments or unsupported input format";
const ABNORMAL_EXIT_HINT: &str =
    "the encoder terminated abnormally; the hardware accelerator may be unavailable or the process was killed";
const ACCELERATOR_HINT: &str = "the hardware accelerator could not be used";

/// How the encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal (number, where the platform reports one)
    Signal(Option<i32>),
}

impl Termination {
    pub fn from_status(status: &ExitStatus) -> Self {
        match status.code() {
            Some(code) => Termination::Code(code),
            None => Termination::Signal(signal_of(status)),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Code(code) => write!(f, "encoder exited with code {}", code),
            Termination::Signal(Some(sig)) => write!(f, "encoder was terminated by signal {}", sig),
            Termination::Signal(None) => write!(f, "encoder was terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Abnormal termination or an accelerator error on stderr
    AcceleratorUnavailable,
    Ordinary,
}

/// Matches failed runs against the configured abnormal-exit table.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureClassifier {
    abnormal_exit_codes: Vec<i64>,
    patterns: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::from_config(&EncoderConfig::default())
    }
}

impl FailureClassifier {
    pub fn new(abnormal_exit_codes: Vec<i64>, patterns: Vec<String>) -> Self {
        Self {
            abnormal_exit_codes,
            patterns: patterns
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .filter(|p| !p.trim().is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &EncoderConfig) -> Self {
        Self::new(
            config.abnormal_exit_codes.clone(),
            config.accelerator_error_patterns.clone(),
        )
    }

    /// Whether `code` is in the table, as reported or as its unsigned 32-bit wraparound.
    ///
    /// Windows reports ffmpeg's `-22` as `4294967274` and NTSTATUS crashes as
    /// large negatives; listing either spelling matches both.
    pub fn is_abnormal_code(&self, code: i32) -> bool {
        let signed = code as i64;
        let unsigned = code as u32 as i64;
        self.abnormal_exit_codes
            .iter()
            .any(|&listed| listed == signed || listed == unsigned)
    }

    pub fn matches_stderr(&self, stderr_lines: &[String]) -> bool {
        stderr_lines.iter().any(|line| {
            let line = line.to_ascii_lowercase();
            self.patterns.iter().any(|p| line.contains(p.as_str()))
        })
    }

    pub fn classify(&self, termination: Termination, stderr_lines: &[String]) -> FailureClass {
        let abnormal = match termination {
            Termination::Signal(_) => true,
            Termination::Code(code) => self.is_abnormal_code(code),
        };
        if abnormal || self.matches_stderr(stderr_lines) {
            FailureClass::AcceleratorUnavailable
        } else {
            FailureClass::Ordinary
        }
    }

    /// Build the failure record for a run that ended with `termination`.
    pub fn failure(
        &self,
        termination: Termination,
        stderr_tail: Vec<String>,
        stdout_tail: Vec<String>,
    ) -> RuntimeFailure {
        let class = self.classify(termination, &stderr_tail);
        let hint = match (termination, class) {
            (Termination::Code(code), _) if self.is_abnormal_code(code) => Some(ABNORMAL_EXIT_HINT),
            (Termination::Signal(_), _) => Some(ABNORMAL_EXIT_HINT),
            (_, FailureClass::AcceleratorUnavailable) => Some(ACCELERATOR_HINT),
            (Termination::Code(1), FailureClass::Ordinary) => Some(INVALID_ARGUMENTS_HINT),
            _ => None,
        };
        RuntimeFailure {
            termination,
            class,
            stderr_tail,
            stdout_tail,
            hint: hint.map(str::to_string),
        }
    }
}

/// An encoder run that started but did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeFailure {
    pub termination: Termination,
    pub class: FailureClass,
    pub stderr_tail: Vec<String>,
    pub stdout_tail: Vec<String>,
    pub hint: Option<String>,
}

impl RuntimeFailure {
    pub fn accelerator_unavailable(&self) -> bool {
        self.class == FailureClass::AcceleratorUnavailable
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Code(code) => Some(code),
            Termination::Signal(_) => None,
        }
    }

    /// Human-readable multi-line description.
    pub fn diagnostic(&self) -> String {
        let mut out = self.termination.to_string();
        for (name, lines) in [("stderr", &self.stderr_tail), ("stdout", &self.stdout_tail)] {
            if lines.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{}:", name));
            for line in lines {
                out.push_str("\n  ");
                out.push_str(line);
            }
        }
        if let Some(hint) = &self.hint {
            out.push_str("\nhint: ");
            out.push_str(hint);
        }
        out
    }
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostic())
    }
}
