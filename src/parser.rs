use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::bytes::Captures;
use regex::bytes::Regex;

static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"time=\s*(?P<h>\d+):(?P<m>\d{2}):(?P<s>\d{2}(?:\.\d+)?)")
        .expect("BUG: Failed to compile time regex")
});

static BITRATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"bitrate=\s*(?P<br>[^\s]+)").expect("BUG: Failed to compile bitrate regex")
});

/// Messages ffmpeg prints when it is about to give up on a file.
static FATAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)(permission denied|no such file or directory|read-only file system",
        r"|no space left on device|invalid data found when processing input",
        r"|unknown encoder|unrecognized option|invalid argument|error opening",
        r"|could not write header|does not contain any stream|conversion failed!)"
    ))
    .expect("BUG: Failed to compile fatal error regex")
});

/// Upper bound for a line that never terminates.
const MAX_PENDING: usize = 64 * 1024;

/// What could be recovered from one chunk of encoder output.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedOutput {
    /// Encoder-reported position into the current file, in seconds.
    /// Taken from the last complete progress line of the chunk.
    pub time_read: Option<f64>,
    /// Current output bitrate as printed by the encoder (e.g. `"1523.4kbits/s"`).
    pub bitrate: Option<String>,
    /// The first fatal error line seen before any progress of the current operation.
    pub error: Option<String>,
}

impl ParsedOutput {
    pub fn is_empty(&self) -> bool {
        self.time_read.is_none() && self.bitrate.is_none() && self.error.is_none()
    }
}

fn parse_caps<T>(caps: &Captures, name: &str) -> Option<T>
where
    T: FromStr,
{
    caps.name(name)
        .and_then(|v| String::from_utf8_lossy(v.as_bytes()).parse::<T>().ok())
}

/// Converts the `HH:MM:SS(.ms)` groups of a `time=` token into seconds.
fn parse_timestamp(caps: &Captures) -> Option<f64> {
    let h: u64 = parse_caps(caps, "h")?;
    let m: u64 = parse_caps(caps, "m")?;
    let s: f64 = parse_caps(caps, "s")?;
    let whole = h.checked_mul(3600)?.checked_add(m.checked_mul(60)?)?;
    Some(whole as f64 + s).filter(|t| t.is_finite())
}

/// Incremental parser for the merged stdout/stderr stream of ffmpeg.
///
/// Chunks may split lines anywhere; incomplete trailing text is kept until the
/// next call. Both `\r` (progress refresh) and `\n` terminate a line.
#[derive(Debug, Default)]
pub struct OutputParser {
    pending: Vec<u8>,
    has_time_read: bool,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a progress line has been seen since the last [`reset`](Self::reset).
    pub fn has_time_read(&self) -> bool {
        self.has_time_read
    }

    /// Forgets buffered text and progress state. Called at the start of each operation.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.has_time_read = false;
    }

    /// Feeds a chunk of raw output and returns whatever the completed lines carried.
    pub fn parse(&mut self, chunk: &[u8]) -> ParsedOutput {
        self.pending.extend_from_slice(chunk);

        let end = match self.pending.iter().rposition(|b| *b == b'\r' || *b == b'\n') {
            Some(idx) => idx + 1,
            None if self.pending.len() > MAX_PENDING => self.pending.len(),
            None => return ParsedOutput::default(),
        };

        let complete: Vec<u8> = self.pending.drain(..end).collect();
        self.parse_lines(&complete)
    }

    /// Parses any text still buffered once the stream has ended.
    pub fn finish(&mut self) -> ParsedOutput {
        let rest = std::mem::take(&mut self.pending);
        self.parse_lines(&rest)
    }

    fn parse_lines(&mut self, text: &[u8]) -> ParsedOutput {
        let mut parsed = ParsedOutput::default();
        for line in text
            .split(|b| *b == b'\r' || *b == b'\n')
            .filter(|line| !line.is_empty())
        {
            self.parse_line(line, &mut parsed);
        }
        parsed
    }

    fn parse_line(&mut self, line: &[u8], parsed: &mut ParsedOutput) {
        // errors after progress has started are treated as noise
        if !self.has_time_read && parsed.error.is_none() && FATAL_RE.is_match(line) {
            parsed.error = Some(String::from_utf8_lossy(line).trim().to_string());
        }

        if let Some(secs) = TIME_RE.captures(line).as_ref().and_then(parse_timestamp) {
            parsed.time_read = Some(secs);
            self.has_time_read = true;
        }

        if let Some(caps) = BITRATE_RE.captures(line) {
            let bitrate: String = parse_caps(&caps, "br").unwrap_or_default();
            if bitrate != "N/A" && !bitrate.is_empty() {
                parsed.bitrate = Some(bitrate);
            }
        }
    }
}
