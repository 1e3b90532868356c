//! Bidirectional byte pipe between two streams
//!
//! Copies bytes in both directions concurrently until each direction reaches
//! end-of-stream or an I/O error. When one direction finishes, the opposite
//! endpoint's write side is shut down so the peer observes a clean
//! half-close; both streams are closed once both directions are done.
//!
//! The pipe never surfaces transport errors: a broken pipe or reset
//! terminates only the affected direction and is visible solely through the
//! returned byte counts.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Per-direction copy buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Byte counts produced by a completed pipe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeSummary {
    /// Bytes copied from the client to the remote endpoint
    pub client_to_remote: u64,
    /// Bytes copied from the remote endpoint to the client
    pub remote_to_client: u64,
}

impl PipeSummary {
    /// Total bytes moved in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_remote + self.remote_to_client
    }
}

/// Copy one direction until EOF or error, then half-close the writer
async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    buf_size: usize,
    label: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; buf_size];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction = label, error = %e, "pipe read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(direction = label, error = %e, "pipe write ended");
            break;
        }
        total += n as u64;
    }

    // Propagate the close to the other endpoint's read side
    let _ = writer.shutdown().await;
    trace!(direction = label, bytes = total, "pipe direction finished");
    total
}

/// Bridge two connected streams until both directions have finished
///
/// Returns the byte count transferred in each direction. Both streams are
/// dropped (closed) on return; cancellation drops them as well.
pub async fn pipe<A, B>(client: A, remote: B) -> PipeSummary
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    pipe_with_buffer(client, remote, DEFAULT_BUFFER_SIZE).await
}

/// [`pipe`] with a caller-chosen buffer size
pub async fn pipe_with_buffer<A, B>(client: A, remote: B, buf_size: usize) -> PipeSummary
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (remote_rd, remote_wr) = tokio::io::split(remote);

    let (client_to_remote, remote_to_client) = tokio::join!(
        copy_half(client_rd, remote_wr, buf_size, "client->remote"),
        copy_half(remote_rd, client_wr, buf_size, "remote->client"),
    );

    PipeSummary {
        client_to_remote,
        remote_to_client,
    }
}
