//! Receive loop for a streaming session
//!
//! Copies the peer's bytes into the staging writer, one deadline per read.
//! The loop ends on peer close or when the byte cap is reached; both hand
//! the staged data to the scanner. A timeout, a read error and a write
//! error are terminal failures with distinct errors.

use crate::error::{StreamError, StreamResult};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer size
pub const RECEIVE_BUFFER: usize = 8192;

/// How a successful receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The peer closed its side
    PeerClosed,

    /// The byte cap was reached; the rest of the stream is ignored
    CapReached,
}

/// Bytes staged and why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub bytes: u64,
    pub end: ReceiveEnd,
}

/// Await `fut`, giving up after `timeout` (None waits forever)
///
/// Returns None on timeout.
pub async fn with_deadline<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Copy `reader` into `writer` until peer close or `cap` bytes
///
/// The final read is sized so the total lands exactly on the cap.
pub async fn receive<R, W>(
    reader: &mut R,
    writer: &mut W,
    cap: Option<u64>,
    timeout: Option<Duration>,
) -> StreamResult<Received>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RECEIVE_BUFFER];
    let mut received = 0u64;

    let end = loop {
        let want = match cap {
            Some(cap) => {
                let left = cap.saturating_sub(received);
                if left == 0 {
                    break ReceiveEnd::CapReached;
                }
                buf.len().min(usize::try_from(left).unwrap_or(usize::MAX))
            }
            None => buf.len(),
        };

        let n = match with_deadline(timeout, reader.read(&mut buf[..want])).await {
            None => return Err(StreamError::ReadTimeout),
            Some(Err(e)) => return Err(StreamError::ReadPoll(e)),
            Some(Ok(n)) => n,
        };
        if n == 0 {
            break ReceiveEnd::PeerClosed;
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(StreamError::TempWrite)?;
        received += n as u64;
    };

    writer.flush().await.map_err(StreamError::TempWrite)?;

    Ok(Received {
        bytes: received,
        end,
    })
}
