//! Message body relay.
//!
//! Streams a body from one socket to another without buffering it whole.
//! Chunked bodies are copied with their framing intact: chunk-size lines,
//! chunk data and trailers reach the writer byte for byte, while the
//! reader is parsed only far enough to know where the body ends.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::security::limits::{read_bounded_line, trim_line_ending, LineRead};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the sender closes.
    Close,
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("reading body: {0}")]
    Read(#[source] io::Error),
    #[error("writing body: {0}")]
    Write(#[source] io::Error),
    #[error("no body bytes for {0:?}")]
    Idle(Duration),
    #[error("peer accepted no body bytes for {0:?}")]
    WriteIdle(Duration),
    #[error("malformed chunked body: {0}")]
    Malformed(String),
}

/// Copy one body from `reader` to `writer`.
///
/// Every read must complete within `idle`. Returns the number of bytes
/// written, framing included.
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    idle: Duration,
    max_line: usize,
) -> Result<u64, BodyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let written = match framing {
        BodyFraming::Empty => 0,
        BodyFraming::Length(n) => copy_exact(reader, writer, n, idle).await?,
        BodyFraming::Close => copy_to_eof(reader, writer, idle).await?,
        BodyFraming::Chunked => copy_chunked(reader, writer, idle, max_line).await?,
    };
    writer.flush().await.map_err(BodyError::Write)?;
    Ok(written)
}

async fn read_some<R>(reader: &mut R, buf: &mut [u8], idle: Duration) -> Result<usize, BodyError>
where
    R: AsyncBufRead + Unpin,
{
    match tokio::time::timeout(idle, reader.read(buf)).await {
        Ok(result) => result.map_err(BodyError::Read),
        Err(_) => Err(BodyError::Idle(idle)),
    }
}

async fn write_bounded<W>(writer: &mut W, bytes: &[u8], idle: Duration) -> Result<(), BodyError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle, writer.write_all(bytes)).await {
        Ok(result) => result.map_err(BodyError::Write),
        Err(_) => Err(BodyError::WriteIdle(idle)),
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64, idle: Duration) -> Result<u64, BodyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = read_some(reader, &mut buf[..want], idle).await?;
        if n == 0 {
            return Err(BodyError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended {remaining} bytes early"),
            )));
        }
        write_bounded(writer, &buf[..n], idle).await?;
        remaining -= n as u64;
    }
    Ok(len)
}

async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> Result<u64, BodyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_some(reader, &mut buf, idle).await?;
        if n == 0 {
            return Ok(total);
        }
        write_bounded(writer, &buf[..n], idle).await?;
        total += n as u64;
    }
}

async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    max_line: usize,
) -> Result<u64, BodyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::new();

    loop {
        read_framing_line(reader, &mut line, idle, max_line).await?;
        let size = parse_chunk_size(trim_line_ending(&line))?;
        write_bounded(writer, &line, idle).await?;
        total += line.len() as u64;

        if size == 0 {
            break;
        }

        total += copy_exact(reader, writer, size, idle).await?;

        read_framing_line(reader, &mut line, idle, max_line).await?;
        if !trim_line_ending(&line).is_empty() {
            return Err(BodyError::Malformed("chunk data not followed by CRLF".into()));
        }
        write_bounded(writer, &line, idle).await?;
        total += line.len() as u64;
    }

    // Trailer section, terminated by an empty line.
    loop {
        read_framing_line(reader, &mut line, idle, max_line).await?;
        write_bounded(writer, &line, idle).await?;
        total += line.len() as u64;
        if trim_line_ending(&line).is_empty() {
            return Ok(total);
        }
    }
}

async fn read_framing_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    idle: Duration,
    max_line: usize,
) -> Result<(), BodyError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let outcome = tokio::time::timeout(idle, read_bounded_line(reader, line, max_line))
        .await
        .map_err(|_| BodyError::Idle(idle))?
        .map_err(BodyError::Read)?;
    match outcome {
        LineRead::Complete => Ok(()),
        LineRead::TooLong => Err(BodyError::Malformed(format!("framing line exceeds {max_line} bytes"))),
        LineRead::Eof | LineRead::Truncated => Err(BodyError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunked body ended early",
        ))),
    }
}

/// Parse `1a;ext=val` into 26.
fn parse_chunk_size(line: &[u8]) -> Result<u64, BodyError> {
    let text = std::str::from_utf8(line).map_err(|_| BodyError::Malformed("non UTF-8 chunk size".into()))?;
    let digits = text.split(';').next().unwrap_or_default().trim_matches([' ', '\t']);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BodyError::Malformed(format!("bad chunk size {text:?}")));
    }
    u64::from_str_radix(digits, 16).map_err(|_| BodyError::Malformed(format!("chunk size overflow {text:?}")))
}
