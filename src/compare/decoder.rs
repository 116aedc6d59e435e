//! Turns the raw bytes of a `text/event-stream` response into text
//! increments for a single model.
//!
//! Each event is a line `data: <json>` where the JSON object carries
//! the next piece of text under `data` or, failing that, `chunk`.
//! Transport reads can split lines anywhere (including inside a UTF-8
//! sequence) so incomplete trailing bytes are buffered until the next
//! newline or the end of the stream.
use std::collections::VecDeque;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde_json::Value;

const DATA_PREFIX: &str = "data:";

/// Payload fields checked for text, in priority order.
const TEXT_FIELDS: [&str; 2] = ["data", "chunk"];

/// Why a frame did not produce an increment. The default policy is to
/// skip these silently, they are only counted and traced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameSkip {
    #[error("frame carried no text")]
    Empty,
    #[error("increment {0:?} repeats the accumulated suffix")]
    Duplicate(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// How repeated increments are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Drop an increment when the accumulated text already ends with it.
    #[default]
    Suffix,
    /// Keep every increment.
    Off,
}

impl FromStr for DedupPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "suffix" => Ok(Self::Suffix),
            "off" | "none" => Ok(Self::Off),
            other => Err(anyhow::anyhow!("Unknown dedup policy: {}", other)),
        }
    }
}

/// Counters for one decoded stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    /// `data:` lines seen
    pub frames: usize,
    pub increments: usize,
    pub empty_frames: usize,
    pub dropped_duplicates: usize,
    pub skipped_malformed: usize,
    /// Non-blank lines without the `data:` prefix
    pub ignored_lines: usize,
}

/// Pull the text increment out of one frame's JSON payload. A payload
/// with neither field populated is an empty increment.
pub fn extract_increment(payload: &str) -> Result<String, FrameSkip> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| FrameSkip::Malformed(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(FrameSkip::Malformed(format!(
            "expected a JSON object, got {}",
            payload
        )));
    };

    let text = TEXT_FIELDS
        .iter()
        .filter_map(|name| fields.get(*name).and_then(Value::as_str))
        .find(|text| !text.is_empty())
        .unwrap_or_default();

    Ok(text.to_string())
}

/// Incremental line framing plus payload extraction and de-duplication.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    text: String,
    policy: DedupPolicy,
    stats: DecodeStats,
}

impl FrameDecoder {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Everything accepted so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Feed one transport read, returning the outcome of every frame it
    /// completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<String, FrameSkip>> {
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = self.buffer[start..end].to_vec();
            start = end + 1;
            if let Some(frame) = self.decode_line(&line) {
                out.push(frame);
            }
        }
        self.buffer.drain(..start);
        out
    }

    /// Flush a final line that was never newline terminated.
    pub fn finish(&mut self) -> Vec<Result<String, FrameSkip>> {
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<Result<String, FrameSkip>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let Some(payload) = line.strip_prefix(DATA_PREFIX.as_bytes()) else {
            self.stats.ignored_lines += 1;
            return None;
        };
        self.stats.frames += 1;

        let payload = payload.strip_prefix(b" ").unwrap_or(payload);
        let frame = std::str::from_utf8(payload)
            .map_err(|e| FrameSkip::Malformed(e.to_string()))
            .and_then(extract_increment)
            .and_then(|increment| self.accept(increment));

        match &frame {
            Ok(_) => self.stats.increments += 1,
            Err(FrameSkip::Empty) => self.stats.empty_frames += 1,
            Err(FrameSkip::Duplicate(_)) => self.stats.dropped_duplicates += 1,
            Err(FrameSkip::Malformed(_)) => self.stats.skipped_malformed += 1,
        }
        Some(frame)
    }

    fn accept(&mut self, increment: String) -> Result<String, FrameSkip> {
        if increment.is_empty() {
            return Err(FrameSkip::Empty);
        }
        if self.policy == DedupPolicy::Suffix && self.text.ends_with(&increment) {
            return Err(FrameSkip::Duplicate(increment));
        }
        self.text.push_str(&increment);
        Ok(increment)
    }
}

/// Lazy sequence of text increments decoded from a byte stream.
///
/// Skipped frames never surface as items. Transport errors are passed
/// through as they are. The stream ends when the underlying stream
/// does and is never restarted.
pub struct Increments<S> {
    inner: S,
    decoder: FrameDecoder,
    pending: VecDeque<String>,
    done: bool,
    label: String,
}

impl<S> Increments<S> {
    pub fn new(inner: S, policy: DedupPolicy) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(policy),
            pending: VecDeque::new(),
            done: false,
            label: String::new(),
        }
    }

    /// Name used in trace output, usually the session id.
    pub fn labelled(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn stats(&self) -> DecodeStats {
        self.decoder.stats()
    }

    pub fn text(&self) -> &str {
        self.decoder.text()
    }

    fn enqueue(&mut self, frames: Vec<Result<String, FrameSkip>>) {
        for frame in frames {
            match frame {
                Ok(increment) => self.pending.push_back(increment),
                Err(FrameSkip::Empty) => {}
                Err(skip) => {
                    tracing::debug!("Skipping frame for {}: {}", self.label, skip);
                }
            }
        }
    }
}

impl<S, B, E> Stream for Increments<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(increment) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(increment)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let frames = self.decoder.feed(bytes.as_ref());
                    self.enqueue(frames);
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    self.done = true;
                    let frames = self.decoder.finish();
                    self.enqueue(frames);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
