use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame pattern is valid"));

/// Frame counter of an ffmpeg stats line such as `frame=  120 fps= 60 ...`.
pub fn get_frame(line: &str) -> Option<u64> {
    FRAME_RE.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Percentage of `total` done, rounded to two decimals and capped at 100.
pub fn percent(frame: u64, total: Option<u64>) -> Option<f64> {
    let total = total.filter(|t| *t > 0)?;
    let pct = (frame as f64 / total as f64 * 100.0 * 100.0).round() / 100.0;
    Some(pct.min(100.0))
}

/// One line of the status display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub frame: Option<u64>,
    pub percent: Option<f64>,
    pub line: String,
}

impl Status {
    pub fn from_line(line: &str, total: Option<u64>) -> Self {
        let frame = get_frame(line);
        Self {
            frame,
            percent: frame.and_then(|f| percent(f, total)),
            line: line.to_owned(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent {
            // whole percentages keep one decimal, as in `50.0%`
            Some(pct) if pct.fract() == 0.0 => write!(f, "progress = {:.1}% {}", pct, self.line),
            Some(pct) => write!(f, "progress = {}% {}", pct, self.line),
            None => f.write_str(&self.line),
        }
    }
}

/// Turns ffmpeg's stderr, in whatever chunks it arrives, into status lines.
///
/// ffmpeg ends its stats lines with `\r` and everything else with `\n`, so
/// both count as line breaks. Only the unfinished tail is buffered.
#[derive(Debug, Default)]
pub struct ProgressScraper {
    total_frames: Option<u64>,
    pending: Vec<u8>,
    last: Option<Status>,
}

impl ProgressScraper {
    pub fn new(total_frames: Option<u64>) -> Self {
        Self {
            total_frames,
            ..Default::default()
        }
    }

    /// Feed a chunk, returning the newest status if a line was completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Status> {
        let mut latest = None;
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if let Some(status) = self.take_line() {
                    latest = Some(status);
                }
            } else {
                self.pending.push(byte);
            }
        }
        latest
    }

    /// Flush an unterminated last line once the stream has closed.
    pub fn finish(&mut self) -> Option<Status> {
        self.take_line()
    }

    pub fn last(&self) -> Option<&Status> {
        self.last.as_ref()
    }

    fn take_line(&mut self) -> Option<Status> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let status = Status::from_line(line, self.total_frames);
        self.last = Some(status.clone());
        Some(status)
    }
}
