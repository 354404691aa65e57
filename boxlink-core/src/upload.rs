//! Chunked file upload over the socket
//!
//! Protocol, one exchange at a time on a dedicated connection:
//! 1. `upload_start` with size, base64 directory and file name
//! 2. one binary frame per chunk, each acknowledged by `upload_data`
//!    carrying the cumulative length received so far
//! 3. `upload_finalize` once every byte is in, `upload_cancel` otherwise
//! 4. close handshake

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ResultExt};
use crate::protocol::{Action, ForcePolicy, SocketRequest, UploadProgressReply};
use crate::realtime::{Channel, Correlation, next_request_id};

/// Default chunk size for [`UploadWriter::copy_from`]
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Target and size of one upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub dirname: String,
    pub filename: String,
    pub size: u64,
    pub force: Option<ForcePolicy>,
}

impl UploadRequest {
    pub fn new(dirname: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            dirname: dirname.into(),
            filename: filename.into(),
            size,
            force: None,
        }
    }

    pub fn with_force(mut self, force: ForcePolicy) -> Self {
        self.force = Some(force);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub expected_bytes: u64,
    pub written_bytes: u64,
}

impl UploadProgress {
    pub fn is_complete(&self) -> bool {
        self.written_bytes == self.expected_bytes
    }
}

struct WriterState {
    channel: Option<Channel>,
    progress: UploadProgress,
}

/// Streaming writer bound to one started upload
///
/// `close` must run exactly once on every path, complete or not. Use
/// [`UploadWriter::copy_from`] through the client's `upload_from` to get
/// that for free.
pub struct UploadWriter {
    request_id: i64,
    state: Mutex<WriterState>,
    cancel: CancellationToken,
    closed: bool,
}

impl UploadWriter {
    /// Send `upload_start` and return a writer once the device accepts it
    pub async fn start(
        mut channel: Channel,
        request: &UploadRequest,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let request_id = next_request_id();
        let start = SocketRequest::UploadStart {
            request_id,
            size: request.size,
            dirname: request.dirname.clone(),
            filename: request.filename.clone(),
            force: request.force,
        };

        let accepted = channel
            .send_and_wait_for::<_, serde_json::Value>(&start, request_id, Action::UploadStart, &cancel)
            .await;

        if let Err(e) = accepted {
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "Failed to close channel after rejected upload");
            }
            return Err(e).context("start upload");
        }

        info!(
            request_id,
            dirname = %request.dirname,
            filename = %request.filename,
            size = request.size,
            "Upload started"
        );

        Ok(Self {
            request_id,
            state: Mutex::new(WriterState {
                channel: Some(channel),
                progress: UploadProgress {
                    expected_bytes: request.size,
                    written_bytes: 0,
                },
            }),
            cancel,
            closed: false,
        })
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub async fn progress(&self) -> UploadProgress {
        self.state.lock().await.progress
    }

    /// Send one chunk and return how many bytes the device confirmed
    ///
    /// The confirmed count is the growth of the device's cumulative length.
    /// Anything other than the full chunk is a short write.
    pub async fn write(&self, chunk: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let previous = state.progress.written_bytes;
        let channel = state.channel.as_mut().ok_or(Error::ConnectionClosed)?;

        channel.send_binary(chunk.to_vec()).await.context("send upload chunk")?;
        let reply: UploadProgressReply = channel
            .wait_for(Correlation::reply(self.request_id, Action::UploadData), &self.cancel)
            .await
            .context("await upload acknowledgement")?;

        let written = reply.total_len.saturating_sub(previous) as usize;
        state.progress.written_bytes = reply.total_len;
        debug!(
            request_id = self.request_id,
            written,
            total = reply.total_len,
            complete = reply.complete,
            "Chunk acknowledged"
        );

        if reply.cancelled {
            return Err(Error::UploadCancelled { written });
        }
        if written != chunk.len() {
            return Err(Error::ShortWrite {
                expected: chunk.len(),
                written,
            });
        }
        Ok(written)
    }

    /// Stream `reader` to the device in `chunk_size` pieces
    pub async fn copy_from<R>(&self, reader: &mut R, chunk_size: usize) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            total += self.write(&buf[..n]).await? as u64;
        }
    }

    /// Finalize a complete upload or cancel an incomplete one, then close
    ///
    /// Finalize is sent without waiting for a confirmation; cancel waits
    /// for the device to confirm. The first failure is returned.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;

        let mut state = self.state.lock().await;
        let progress = state.progress;
        let Some(mut channel) = state.channel.take() else {
            return Ok(());
        };

        let exchange = if progress.is_complete() {
            info!(request_id = self.request_id, bytes = progress.written_bytes, "Finalizing upload");
            // TODO: wait for an upload_finalize confirmation once the device is known to send one
            channel
                .send_json(&SocketRequest::UploadFinalize {
                    request_id: self.request_id,
                })
                .await
                .context("finalize upload")
        } else {
            info!(
                request_id = self.request_id,
                written = progress.written_bytes,
                expected = progress.expected_bytes,
                "Cancelling incomplete upload"
            );
            channel
                .send_and_wait_for::<_, serde_json::Value>(
                    &SocketRequest::UploadCancel {
                        request_id: self.request_id,
                    },
                    self.request_id,
                    Action::UploadCancel,
                    &self.cancel,
                )
                .await
                .map(|_| ())
                .context("cancel upload")
        };

        let closed = channel.close().await.context("close upload channel");
        if let (Err(_), Err(close_err)) = (&exchange, &closed) {
            warn!(error = %close_err, "Failed to close upload channel");
        }
        exchange.and(closed)
    }
}

impl Drop for UploadWriter {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                request_id = self.request_id,
                "Upload writer dropped without close, the device keeps a partial upload"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_completion() {
        let mut progress = UploadProgress {
            expected_bytes: 10,
            written_bytes: 4,
        };
        assert!(!progress.is_complete());
        progress.written_bytes = 10;
        assert!(progress.is_complete());
    }

    #[test]
    fn test_request_builder() {
        let request = UploadRequest::new("/Disque dur/", "a.bin", 3).with_force(ForcePolicy::Resume);
        assert_eq!(request.force, Some(ForcePolicy::Resume));
        assert_eq!(request.size, 3);
    }
}
