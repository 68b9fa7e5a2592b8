//! Encoder output handling
//!
//! ffmpeg rewrites its status line in place with `\r`, so output is split on
//! both carriage returns and newlines. Every line is offered to a bounded
//! tail (for diagnostics) and, for stderr, to the progress parser.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-job progress is held below this until the encoder exits successfully.
pub const MAX_RUNNING_PERCENT: f32 = 99.0;

const READ_CHUNK: usize = 8 * 1024;

/// Longest line handed out in one piece; longer runs are split.
const MAX_LINE_BYTES: usize = 64 * 1024;

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration regex")
    })
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex")
    })
}

fn captured_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Turns ffmpeg's `Duration:` and `time=` markers into a percentage.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total_secs: Option<f64>,
    percent: f32,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input duration, once the header has been seen.
    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    pub fn percent(&self) -> f32 {
        self.percent
    }

    /// Feed one line; returns the new percentage when it moved forward.
    ///
    /// Only the first `Duration:` counts (later ones belong to outputs or
    /// extra inputs), and progress never goes backwards.
    pub fn feed_line(&mut self, line: &str) -> Option<f32> {
        if self.total_secs.is_none() {
            if let Some(total) = duration_re()
                .captures(line)
                .and_then(|caps| captured_seconds(&caps))
                .filter(|secs| *secs > 0.0)
            {
                self.total_secs = Some(total);
            }
        }

        let total = self.total_secs?;
        let elapsed = time_re()
            .captures(line)
            .and_then(|caps| captured_seconds(&caps))?;

        let percent = ((elapsed / total) * 100.0).clamp(0.0, MAX_RUNNING_PERCENT as f64) as f32;
        if percent > self.percent {
            self.percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

/// The last `capacity` non-empty lines of an output stream.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() || self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Read a stream to the end, calling `on_line` for every `\r`- or `\n`-terminated line.
///
/// Invalid UTF-8 is replaced rather than rejected; encoder output may echo
/// file names in any encoding. Runs without a terminator are cut every
/// `MAX_LINE_BYTES`.
pub async fn read_lines<R, F>(mut reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    on_line(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
                if pending.len() == MAX_LINE_BYTES {
                    on_line(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        on_line(&String::from_utf8_lossy(&pending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parser_needs_duration_first() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed_line("frame=  10 time=00:00:05.00 bitrate=1k"), None);

        parser.feed_line("  Duration: 00:00:10.00, start: 0.000000, bitrate: 2000 kb/s");
        assert_eq!(parser.total_secs(), Some(10.0));
        assert_eq!(parser.feed_line("frame=  10 time=00:00:05.00 bitrate=1k"), Some(50.0));
    }

    #[test]
    fn test_parser_ignores_later_durations() {
        let mut parser = ProgressParser::new();
        parser.feed_line("  Duration: 01:00:00.00, start: 0.0");
        parser.feed_line("  Duration: 00:00:01.00, start: 0.0");
        assert_eq!(parser.total_secs(), Some(3600.0));
    }

    #[test]
    fn test_parser_caps_below_completion() {
        let mut parser = ProgressParser::new();
        parser.feed_line("Duration: 00:00:10.00");
        assert_eq!(parser.feed_line("time=00:00:12.50"), Some(MAX_RUNNING_PERCENT));
    }

    #[test]
    fn test_parser_handles_unknown_duration() {
        let mut parser = ProgressParser::new();
        parser.feed_line("  Duration: N/A, bitrate: N/A");
        assert_eq!(parser.total_secs(), None);
        assert_eq!(parser.feed_line("time=00:00:01.00"), None);
    }

    proptest! {
        #[test]
        fn prop_progress_is_monotonic_and_bounded(times in prop::collection::vec(0u32..7200, 1..40)) {
            let mut parser = ProgressParser::new();
            parser.feed_line("Duration: 01:00:00.00");
            let mut last = 0.0f32;
            for t in times {
                let line = format!("time={:02}:{:02}:{:02}.00", t / 3600, (t % 3600) / 60, t % 60);
                if let Some(p) = parser.feed_line(&line) {
                    prop_assert!(p > last);
                    last = p;
                }
                prop_assert!(parser.percent() <= MAX_RUNNING_PERCENT);
            }
        }
    }

    #[test]
    fn test_tail_keeps_last_non_empty_lines() {
        let mut tail = OutputTail::new(2);
        for line in ["one", "", "two", "   ", "three"] {
            tail.push(line);
        }
        assert_eq!(tail.into_lines(), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_read_lines_splits_unterminated_runs() {
        let data = vec![b'x'; MAX_LINE_BYTES + 10];
        let mut lengths = Vec::new();
        read_lines(data.as_slice(), |line| lengths.push(line.len()))
            .await
            .unwrap();
        assert_eq!(lengths, vec![MAX_LINE_BYTES, 10]);
    }

    #[tokio::test]
    async fn test_read_lines_splits_on_cr_and_lf() {
        let data: &[u8] = b"header\nframe=1\rframe=2\r\nlast";
        let mut seen = Vec::new();
        read_lines(data, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["header", "frame=1", "frame=2", "last"]);
    }

    #[tokio::test]
    async fn test_read_lines_replaces_invalid_utf8() {
        let data: &[u8] = b"clip \xff.mp4\n";
        let mut seen = Vec::new();
        read_lines(data, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["clip \u{fffd}.mp4"]);
    }
}
