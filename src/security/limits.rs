//! Request and message size limits.
//!
//! # Responsibilities
//! - Enforce maximum head size (request line + headers, status line + headers)
//! - Enforce maximum chunk-size / trailer line length
//!
//! # Design Decisions
//! - Limits checked while reading, before a line is buffered in full
//! - Exceeding the request head limit returns 431 Request Header Fields Too Large

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::LimitsConfig;

/// Resolved size limits shared by all handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub max_chunk_line_bytes: usize,
}

impl Limits {
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes,
            max_chunk_line_bytes: config.max_chunk_line_bytes,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&LimitsConfig::default())
    }
}

/// Outcome of reading one `\n`-terminated line under a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line (including its `\n`) was appended.
    Complete,
    /// EOF before any byte of the line.
    Eof,
    /// EOF in the middle of the line.
    Truncated,
    /// The budget ran out before a `\n` was seen.
    TooLong,
}

/// Append one line to `buf`, reading at most `max` bytes.
pub async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    let mut limited = (&mut *reader).take(max as u64);
    let n = limited.read_until(b'\n', buf).await?;

    if n == 0 {
        return Ok(if max == 0 { LineRead::TooLong } else { LineRead::Eof });
    }
    if buf[start..].ends_with(b"\n") {
        Ok(LineRead::Complete)
    } else if n >= max {
        Ok(LineRead::TooLong)
    } else {
        Ok(LineRead::Truncated)
    }
}

/// Strip a trailing `\r\n` or `\n`.
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
