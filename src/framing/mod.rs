//! Frame detection over an append-only byte stream
//!
//! [`extract_frames`] is the pure splitter: it takes a buffer and a
//! [`FrameDetection`] mode and returns the complete frames plus the
//! unconsumed tail. Feeding that tail back without new bytes yields no
//! frames, so callers can keep appending to it.
//!
//! [`FrameReader`] wraps the splitter with the state a worker needs: the
//! accumulation buffer and its capacity, checksum trailer handling, and
//! per-frame sequence numbers.
//!
//! # Detection Modes
//!
//! - **EndDelimiterOnly**: a frame is every run of bytes before a finish sequence
//! - **StartAndEndDelimiter**: a frame is the bytes between a start and the next
//!   finish; bytes outside a span are discarded
//! - **StartDelimiterOnly**: a frame runs from one start to the next start
//! - **NoDelimiters**: every buffer is one frame
//!
//! When a second start sequence shows up before the pending frame is
//! terminated, the pending partial frame is discarded and detection
//! resynchronizes on the newer start.
//!
//! Checksum bytes follow the finish sequence for end-delimited modes and
//! are the last bytes of the frame otherwise. Frames are emitted with the
//! checksum bytes appended so [`checksum::validate`] can split them off.

pub mod checksum;

use crate::config::{FrameDetection, OperationMode, WorkerConfig};
use crate::error::{DetectionError, ProcessorError, Result};
use crate::types::Frame;
use checksum::ChecksumAlgorithm;

/// Output of a single extraction pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    /// Complete frames in stream order
    pub frames: Vec<Vec<u8>>,
    /// Bytes not yet part of a complete frame
    pub remainder: Vec<u8>,
}

/// Split `buffer` into complete frames and the remaining tail
pub fn extract_frames(
    buffer: &[u8],
    mode: FrameDetection,
    start: &[u8],
    finish: &[u8],
) -> std::result::Result<Extraction, DetectionError> {
    let boundary = Boundary::new(mode, start, finish)?;
    let (frames, consumed) = boundary.split(buffer, 0);
    Ok(Extraction {
        frames,
        remainder: buffer[consumed..].to_vec(),
    })
}

/// Resolved delimiter strategy
#[derive(Debug, Clone, PartialEq, Eq)]
enum Boundary {
    End(Vec<u8>),
    StartEnd { start: Vec<u8>, finish: Vec<u8> },
    Start(Vec<u8>),
    Whole,
    /// `\n`, `\r` or `\r\n`, whichever comes first
    LineEndings,
}

impl Boundary {
    fn new(
        mode: FrameDetection,
        start: &[u8],
        finish: &[u8],
    ) -> std::result::Result<Self, DetectionError> {
        if mode.needs_start() && start.is_empty() {
            return Err(DetectionError::EmptyDelimiter("start"));
        }
        if mode.needs_finish() && finish.is_empty() {
            return Err(DetectionError::EmptyDelimiter("finish"));
        }

        Ok(match mode {
            FrameDetection::EndDelimiterOnly => Boundary::End(finish.to_vec()),
            FrameDetection::StartAndEndDelimiter => Boundary::StartEnd {
                start: start.to_vec(),
                finish: finish.to_vec(),
            },
            FrameDetection::StartDelimiterOnly => Boundary::Start(start.to_vec()),
            FrameDetection::NoDelimiters => Boundary::Whole,
        })
    }

    fn for_config(config: &WorkerConfig) -> std::result::Result<Self, DetectionError> {
        match config.operation_mode {
            OperationMode::QuickPlot => Ok(Boundary::LineEndings),
            _ => Boundary::new(
                config.effective_detection(),
                &config.start_sequence,
                &config.finish_sequence,
            ),
        }
    }

    /// Whether checksum bytes sit after the finish sequence
    fn checksum_follows_delimiter(&self) -> bool {
        matches!(self, Boundary::End(_) | Boundary::StartEnd { .. })
    }

    /// Returns the frames and how many leading bytes were consumed
    fn split(&self, buffer: &[u8], trailer: usize) -> (Vec<Vec<u8>>, usize) {
        let mut frames = Vec::new();
        let consumed = match self {
            Boundary::End(finish) => split_end(buffer, finish, trailer, &mut frames),
            Boundary::StartEnd { start, finish } => {
                split_start_end(buffer, start, finish, trailer, &mut frames)
            }
            Boundary::Start(start) => split_start(buffer, start, &mut frames),
            Boundary::LineEndings => split_lines(buffer, &mut frames),
            Boundary::Whole => {
                if !buffer.is_empty() {
                    frames.push(buffer.to_vec());
                }
                buffer.len()
            }
        };
        (frames, consumed)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Length of the longest proper prefix of `needle` that ends `haystack`
fn partial_prefix_len(haystack: &[u8], needle: &[u8]) -> usize {
    (1..needle.len())
        .rev()
        .find(|&k| k <= haystack.len() && haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}

fn push_frame(frames: &mut Vec<Vec<u8>>, body: &[u8], trailer: &[u8]) {
    if body.is_empty() {
        return;
    }
    let mut frame = Vec::with_capacity(body.len() + trailer.len());
    frame.extend_from_slice(body);
    frame.extend_from_slice(trailer);
    frames.push(frame);
}

fn split_end(buffer: &[u8], finish: &[u8], trailer: usize, frames: &mut Vec<Vec<u8>>) -> usize {
    let mut pos = 0;
    while let Some(i) = find(&buffer[pos..], finish) {
        let end = pos + i;
        let after = end + finish.len();
        if buffer.len() < after + trailer {
            // Checksum bytes not here yet
            break;
        }
        push_frame(frames, &buffer[pos..end], &buffer[after..after + trailer]);
        pos = after + trailer;
    }
    pos
}

fn split_lines(buffer: &[u8], frames: &mut Vec<Vec<u8>>) -> usize {
    let mut pos = 0;
    while let Some(i) = buffer[pos..].iter().position(|&b| b == b'\n' || b == b'\r') {
        let end = pos + i;
        let mut after = end + 1;
        if buffer[end] == b'\r' && buffer.get(after) == Some(&b'\n') {
            after += 1;
        }
        push_frame(frames, &buffer[pos..end], &[]);
        pos = after;
    }
    pos
}

fn split_start_end(
    buffer: &[u8],
    start: &[u8],
    finish: &[u8],
    trailer: usize,
    frames: &mut Vec<Vec<u8>>,
) -> usize {
    let mut pos = 0;
    loop {
        let Some(s) = find(&buffer[pos..], start) else {
            // Keep a possible partial start at the very end
            return buffer.len() - partial_prefix_len(&buffer[pos..], start);
        };
        let open = pos + s;
        let body_start = open + start.len();

        let Some(f) = find(&buffer[body_start..], finish) else {
            // Unterminated: wait for more data from the most recent start
            return match rfind(&buffer[body_start..], start) {
                Some(k) => body_start + k,
                None => open,
            };
        };
        let close = body_start + f;

        // A newer start before the finish replaces the pending frame
        let open = match rfind(&buffer[body_start..close], start) {
            Some(k) => body_start + k,
            None => open,
        };
        let body_begin = open + start.len();

        let after = close + finish.len();
        if buffer.len() < after + trailer {
            return open;
        }
        push_frame(frames, &buffer[body_begin..close], &buffer[after..after + trailer]);
        pos = after + trailer;
    }
}

fn split_start(buffer: &[u8], start: &[u8], frames: &mut Vec<Vec<u8>>) -> usize {
    let Some(mut open) = find(buffer, start) else {
        return buffer.len() - partial_prefix_len(buffer, start);
    };
    loop {
        let body = open + start.len();
        match find(&buffer[body..], start) {
            Some(k) => {
                let next = body + k;
                push_frame(frames, &buffer[body..next], &[]);
                open = next;
            }
            // The trailing frame may still be growing
            None => return open,
        }
    }
}

/// Buffer occupancy for diagnostics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
}

/// Frames completed by one [`FrameReader::push`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PushOutcome {
    pub frames: Vec<Frame>,
    /// Set when unconsumed bytes had to be dropped
    pub overflow: Option<DetectionError>,
}

/// Stateful frame detector owned by one worker
#[derive(Debug, Clone)]
pub struct FrameReader {
    buffer: Vec<u8>,
    capacity: usize,
    boundary: Boundary,
    checksum: ChecksumAlgorithm,
    next_sequence: u64,
}

impl FrameReader {
    /// Build a reader for a validated configuration
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            buffer: Vec::new(),
            capacity: config.buffer_capacity(),
            boundary: Boundary::for_config(config)
                .map_err(|e| ProcessorError::Configuration(e.to_string()))?,
            checksum: config.effective_checksum()?,
            next_sequence: 0,
        })
    }

    /// Checksum algorithm applied to this reader's frames
    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Append bytes and extract every frame they complete
    ///
    /// Frames are split out first. If the unconsumed remainder still
    /// exceeds the capacity, its oldest bytes are dropped down to capacity
    /// and [`PushOutcome::overflow`] reports how many were lost. Detection
    /// carries on with the surviving bytes on the next push.
    pub fn push(&mut self, data: &[u8]) -> PushOutcome {
        self.buffer.extend_from_slice(data);

        let trailer = if self.boundary.checksum_follows_delimiter() {
            self.checksum.output_bytes()
        } else {
            0
        };
        let (payloads, consumed) = self.boundary.split(&self.buffer, trailer);
        self.buffer.drain(..consumed);

        let overflow = (self.buffer.len() > self.capacity).then(|| {
            let dropped = self.buffer.len() - self.capacity;
            self.buffer.drain(..dropped);
            tracing::warn!(
                "Frame buffer overflow: dropped {} bytes (capacity {})",
                dropped,
                self.capacity
            );
            DetectionError::BufferOverflow {
                capacity: self.capacity,
                dropped,
            }
        });

        let frames = payloads
            .into_iter()
            .map(|payload| {
                let frame = Frame::new(self.next_sequence, payload);
                self.next_sequence += 1;
                frame
            })
            .collect();

        PushOutcome { frames, overflow }
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop buffered bytes and restart sequence numbering
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_sequence = 0;
    }

    pub fn buffer_stats(&self) -> BufferStats {
        BufferStats {
            size: self.buffer.len(),
            capacity: self.capacity,
            utilization_percent: (self.buffer.len() as f64 / self.capacity as f64) * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn extract(buffer: &[u8], mode: FrameDetection, start: &str, finish: &str) -> Extraction {
        extract_frames(buffer, mode, start.as_bytes(), finish.as_bytes()).unwrap()
    }

    fn texts(frames: &[Vec<u8>]) -> Vec<String> {
        frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    #[test]
    fn test_end_delimiter_only() {
        let out = extract(b"a\nb\nc", FrameDetection::EndDelimiterOnly, "", "\n");
        assert_eq!(texts(&out.frames), vec!["a", "b"]);
        assert_eq!(out.remainder, b"c");
    }

    #[test]
    fn test_end_delimiter_skips_empty_frames() {
        let out = extract(b"\n\na\n", FrameDetection::EndDelimiterOnly, "", "\n");
        assert_eq!(texts(&out.frames), vec!["a"]);
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn test_start_and_end_delimiter() {
        let out = extract(b"x<abc>y<def>", FrameDetection::StartAndEndDelimiter, "<", ">");
        assert_eq!(texts(&out.frames), vec!["abc", "def"]);
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn test_start_end_keeps_unterminated_start() {
        let out = extract(b"<abc>noise<de", FrameDetection::StartAndEndDelimiter, "<", ">");
        assert_eq!(texts(&out.frames), vec!["abc"]);
        assert_eq!(out.remainder, b"<de");
    }

    #[test]
    fn test_start_end_keeps_partial_start_sequence() {
        let out = extract(b"noise$", FrameDetection::StartAndEndDelimiter, "$$", "#");
        assert!(out.frames.is_empty());
        assert_eq!(out.remainder, b"$");
    }

    #[test]
    fn test_start_end_restarts_on_repeated_start() {
        let out = extract(b"<ab<cd>", FrameDetection::StartAndEndDelimiter, "<", ">");
        assert_eq!(texts(&out.frames), vec!["cd"]);

        // Same when the finish has not arrived yet
        let out = extract(b"<ab<cd", FrameDetection::StartAndEndDelimiter, "<", ">");
        assert!(out.frames.is_empty());
        assert_eq!(out.remainder, b"<cd");
    }

    #[test]
    fn test_start_delimiter_only() {
        let out = extract(b"junk$1,2$3,4$5", FrameDetection::StartDelimiterOnly, "$", "");
        assert_eq!(texts(&out.frames), vec!["1,2", "3,4"]);
        assert_eq!(out.remainder, b"$5");
    }

    #[test]
    fn test_no_delimiters() {
        let out = extract(b"\x01\x02\x03", FrameDetection::NoDelimiters, "", "");
        assert_eq!(out.frames, vec![vec![1, 2, 3]]);
        assert!(out.remainder.is_empty());

        let out = extract(b"", FrameDetection::NoDelimiters, "", "");
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_empty_delimiter_is_error() {
        let err = extract_frames(b"abc", FrameDetection::EndDelimiterOnly, b"", b"").unwrap_err();
        assert_eq!(err, DetectionError::EmptyDelimiter("finish"));

        let err =
            extract_frames(b"abc", FrameDetection::StartDelimiterOnly, b"", b"\n").unwrap_err();
        assert_eq!(err, DetectionError::EmptyDelimiter("start"));
    }

    #[test]
    fn test_multi_byte_delimiters() {
        let out = extract(
            b"/*A,1*/ /*B,2*/ /*C",
            FrameDetection::StartAndEndDelimiter,
            "/*",
            "*/",
        );
        assert_eq!(texts(&out.frames), vec!["A,1", "B,2"]);
        assert_eq!(out.remainder, b"/*C");
    }

    #[test]
    fn test_reader_appends_checksum_after_finish() {
        let config = WorkerConfig {
            checksum_algorithm: "xor".to_string(),
            ..Default::default()
        };
        let mut reader = FrameReader::new(&config).unwrap();

        let xor = checksum::xor_checksum(b"abc");
        // Checksum byte has not arrived yet
        assert!(reader.push(b"abc\n").frames.is_empty());
        let frames = reader.push(&[xor]).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![b'a', b'b', b'c', xor]);
        assert!(reader.pending().is_empty());
    }

    #[test]
    fn test_reader_quick_plot_line_endings() {
        let mut reader = FrameReader::new(&WorkerConfig::quick_plot()).unwrap();
        let frames = reader.push(b"1,2\r\n3,4\r5,6\n7").frames;
        let payloads: Vec<_> = frames.iter().map(|f| f.text()).collect();
        assert_eq!(payloads, vec!["1,2", "3,4", "5,6"]);
        assert_eq!(reader.pending(), b"7");
    }

    #[test]
    fn test_reader_sequence_numbers_continue_across_pushes() {
        let mut reader = FrameReader::new(&WorkerConfig::default()).unwrap();
        let first = reader.push(b"a\nb\n").frames;
        let second = reader.push(b"c\n").frames;
        assert_eq!(first[0].sequence, 0);
        assert_eq!(first[1].sequence, 1);
        assert_eq!(second[0].sequence, 2);

        reader.reset();
        assert_eq!(reader.push(b"d\n").frames[0].sequence, 0);
    }

    #[test]
    fn test_reader_overflow_drops_oldest() {
        let config = WorkerConfig {
            buffer_capacity: Some(8),
            ..Default::default()
        };
        let mut reader = FrameReader::new(&config).unwrap();

        let outcome = reader.push(b"0123456789AB");
        assert!(outcome.frames.is_empty());
        assert_eq!(
            outcome.overflow,
            Some(DetectionError::BufferOverflow {
                capacity: 8,
                dropped: 4
            })
        );
        assert_eq!(reader.pending(), b"456789AB");
    }

    #[test]
    fn test_reader_keeps_detecting_after_overflow() {
        let config = WorkerConfig {
            buffer_capacity: Some(8),
            ..Default::default()
        };
        let mut reader = FrameReader::new(&config).unwrap();
        assert!(reader.push(b"0123456789AB").overflow.is_some());

        // The surviving tail is closed by the next delimiter
        let outcome = reader.push(b"ok\n");
        assert_eq!(outcome.overflow, None);
        assert_eq!(outcome.frames[0].payload, b"456789ABok");

        let mut payloads = Vec::new();
        for _ in 0..20 {
            let outcome = reader.push(b"ok\n");
            assert_eq!(outcome.overflow, None);
            payloads.extend(outcome.frames.into_iter().map(|f| f.payload));
        }
        assert_eq!(payloads, vec![b"ok".to_vec(); 20]);
        assert!(reader.pending().is_empty());
    }

    #[test]
    fn test_reader_push_larger_than_capacity_keeps_complete_frames() {
        let config = WorkerConfig {
            buffer_capacity: Some(8),
            ..Default::default()
        };
        let mut reader = FrameReader::new(&config).unwrap();

        let outcome = reader.push(b"ab\ncd\nef\n");
        assert_eq!(outcome.overflow, None);
        let payloads: Vec<_> = outcome.frames.into_iter().map(|f| f.payload).collect();
        assert_eq!(payloads, vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()]);

        // Frames completed in an overflowing push are still returned
        let outcome = reader.push(b"gh\n0123456789");
        assert_eq!(outcome.frames[0].payload, b"gh");
        assert!(matches!(
            outcome.overflow,
            Some(DetectionError::BufferOverflow { dropped: 2, .. })
        ));
        assert_eq!(reader.pending(), b"23456789");
    }

    #[test]
    fn test_buffer_stats() {
        let config = WorkerConfig {
            buffer_capacity: Some(100),
            ..Default::default()
        };
        let mut reader = FrameReader::new(&config).unwrap();
        let _ = reader.push(b"0123456789");
        let stats = reader.buffer_stats();
        assert_eq!(stats.size, 10);
        assert_eq!(stats.capacity, 100);
        assert!((stats.utilization_percent - 10.0).abs() < f64::EPSILON);
    }

    fn mode_strategy() -> impl Strategy<Value = FrameDetection> {
        prop::sample::select(FrameDetection::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_remainder_is_idempotent(
            buffer in prop::collection::vec(prop::sample::select(b"ab<>\n$".to_vec()), 0..64),
            mode in mode_strategy(),
        ) {
            let first = extract(&buffer, mode, "<", ">");
            let again = extract(&first.remainder, mode, "<", ">");
            if mode == FrameDetection::NoDelimiters {
                prop_assert!(first.remainder.is_empty());
            }
            prop_assert!(again.frames.is_empty());
            prop_assert_eq!(again.remainder, first.remainder);
        }

        #[test]
        fn prop_end_delimited_frames_never_contain_delimiter(
            buffer in prop::collection::vec(prop::sample::select(b"xy\n".to_vec()), 0..64),
        ) {
            let out = extract(&buffer, FrameDetection::EndDelimiterOnly, "", "\n");
            for frame in &out.frames {
                prop_assert!(!frame.is_empty());
                prop_assert!(!frame.contains(&b'\n'));
            }
            prop_assert!(!out.remainder.contains(&b'\n'));
        }

        #[test]
        fn prop_chunked_feed_matches_single_feed(
            buffer in prop::collection::vec(prop::sample::select(b"ab\n".to_vec()), 0..64),
            split in 0usize..64,
        ) {
            let split = split.min(buffer.len());
            let whole = extract(&buffer, FrameDetection::EndDelimiterOnly, "", "\n");

            let mut reader = FrameReader::new(&WorkerConfig::default()).unwrap();
            let mut frames = reader.push(&buffer[..split]).frames;
            frames.extend(reader.push(&buffer[split..]).frames);

            let payloads: Vec<Vec<u8>> = frames.into_iter().map(|f| f.payload).collect();
            prop_assert_eq!(payloads, whole.frames);
            prop_assert_eq!(reader.pending(), whole.remainder.as_slice());
        }
    }
}
