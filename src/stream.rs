//! Bounded output capture
//!
//! Adapters feed raw output chunks through an [`OutputCollector`], which
//! enforces a byte cap, splits complete lines for live consumers, and
//! never silently truncates: overflow either errors or is counted as
//! dropped, by configuration.

use std::sync::Arc;

use thiserror::Error;

/// Default capture cap per stream.
pub const DEFAULT_MAX_CAPTURE: usize = 10 * 1024 * 1024;

/// What to do when a stream exceeds its cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowBehavior {
    /// Fail the capture with [`StreamError::Overflow`].
    #[default]
    Error,
    /// Keep the prefix, count dropped bytes, keep running. For callers
    /// that stream via callback and only need the head in the result.
    Drop,
}

/// Capture failure.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream exceeded the configured cap.
    #[error("output exceeded capture limit of {limit} bytes")]
    Overflow {
        /// The configured cap.
        limit: usize,
    },
}

/// Callback invoked once per complete output line (without the newline).
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Accumulates one output stream with a byte cap and line splitting.
pub struct OutputCollector {
    buf: Vec<u8>,
    max_bytes: usize,
    overflow: OverflowBehavior,
    dropped: u64,
    line_buf: Vec<u8>,
    delimiter: u8,
    on_line: Option<LineCallback>,
}

impl OutputCollector {
    /// Collector with the default cap and erroring overflow behavior.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_CAPTURE, OverflowBehavior::Error)
    }

    /// Collector with an explicit cap and overflow behavior.
    pub fn with_limit(max_bytes: usize, overflow: OverflowBehavior) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
            overflow,
            dropped: 0,
            line_buf: Vec::new(),
            delimiter: b'\n',
            on_line: None,
        }
    }

    /// Invoke `callback` for every complete line as it arrives. Lines are
    /// delivered even after the buffer cap is reached in `Drop` mode.
    pub fn on_line(mut self, callback: LineCallback) -> Self {
        self.on_line = Some(callback);
        self
    }

    /// Use a different line delimiter (default `\n`).
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Feed one chunk.
    pub fn push(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.on_line.is_some() {
            self.split_lines(data);
        }

        let remaining = self.max_bytes.saturating_sub(self.buf.len());
        if data.len() <= remaining {
            self.buf.extend_from_slice(data);
            return Ok(());
        }

        match self.overflow {
            OverflowBehavior::Error => Err(StreamError::Overflow {
                limit: self.max_bytes,
            }),
            OverflowBehavior::Drop => {
                self.buf.extend_from_slice(&data[..remaining]);
                self.dropped += (data.len() - remaining) as u64;
                Ok(())
            }
        }
    }

    fn split_lines(&mut self, data: &[u8]) {
        let callback = match &self.on_line {
            Some(cb) => Arc::clone(cb),
            None => return,
        };
        for &b in data {
            if b == self.delimiter {
                let line = String::from_utf8_lossy(&self.line_buf);
                callback(&line);
                self.line_buf.clear();
            } else {
                self.line_buf.push(b);
            }
        }
    }

    /// Bytes dropped past the cap (`Drop` mode only).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes captured so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the capture: flushes a trailing partial line to the line
    /// callback and returns the captured bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.line_buf.is_empty() {
            if let Some(cb) = &self.on_line {
                let line = String::from_utf8_lossy(&self.line_buf);
                cb(&line);
            }
            self.line_buf.clear();
        }
        self.buf
    }
}

impl Default for OutputCollector {
    fn default() -> Self {
        Self::new()
    }
}
