//! Line framing over a TCP connection, with deadline-bounded reads.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Errors from reading or writing a line on a wire connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No full line arrived before the deadline elapsed.
    #[error("timed out waiting for a line")]
    Timeout,

    /// The connection was closed (EOF) or failed with an I/O error.
    #[error("connection closed")]
    Closed,
}

/// Reads one line (without its trailing newline) within `deadline`.
///
/// Returns [`CodecError::Timeout`] if `deadline` elapses first, or
/// [`CodecError::Closed`] on EOF or any I/O error.
pub async fn read_line_deadline<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<String, CodecError>
where
    R: AsyncBufReadExt + Unpin,
{
    match tokio::time::timeout(deadline, read_line(reader)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(CodecError::Timeout),
    }
}

/// Reads one line with no deadline; blocks until a line arrives or the
/// connection closes. Used for the first line of a new connection and for
/// a node's persistent demultiplexer loop, neither of which has a fixed
/// upper bound on idle time.
pub async fn read_line<R>(reader: &mut R) -> Result<String, CodecError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => Err(CodecError::Closed),
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(line)
        }
        Err(_) => Err(CodecError::Closed),
    }
}

/// Writes one line, appending the trailing newline and flushing.
///
/// Best-effort: a failure here means the connection is broken and the
/// caller should treat the session as ended.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|_| CodecError::Closed)?;
    writer.write_all(b"\n").await.map_err(|_| CodecError::Closed)?;
    writer.flush().await.map_err(|_| CodecError::Closed)
}
