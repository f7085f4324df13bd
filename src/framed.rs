use crate::error::{ClientError, IoErrorContext};
use crate::protocol::messages::DaemonError;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const FRAME_BUFFER_SIZE: usize = 32 * 1024;

/// A sink that wraps an outbound stream in length-prefixed frames,
/// terminated by a zero-length frame.
///
/// While a framed payload is being produced, a sibling task drains the
/// stderr stream of the same connection.  When that task observes a
/// remote error it records it in the shared `failure` slot; the sink
/// checks the slot before every frame and aborts without writing the
/// terminator, leaving the remote in no doubt the upload died.
pub struct FramedSink<'a, W> {
    writer: &'a mut W,
    buffer: Vec<u8>,
    failure: &'a Mutex<Option<DaemonError>>,
}

impl<'a, W: AsyncWrite + Unpin> FramedSink<'a, W> {
    pub fn new(writer: &'a mut W, failure: &'a Mutex<Option<DaemonError>>) -> Self {
        Self {
            writer,
            buffer: Vec::with_capacity(FRAME_BUFFER_SIZE),
            failure,
        }
    }

    /// Buffer data, emitting full frames as the buffer fills.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let available = FRAME_BUFFER_SIZE - self.buffer.len();
            let take = remaining.len().min(available);
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.buffer.len() == FRAME_BUFFER_SIZE {
                self.flush_frame().await?;
            }
        }
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<(), ClientError> {
        if self.failure.lock().unwrap().is_some() {
            return Err(ClientError::Aborted);
        }
        if self.buffer.is_empty() {
            return Ok(());
        }

        let len = self.buffer.len() as u64;
        self.writer
            .write_all(&len.to_le_bytes())
            .await
            .io_context("Failed to write frame length")?;
        self.writer
            .write_all(&self.buffer)
            .await
            .io_context("Failed to write frame data")?;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the remaining data and write the terminating zero frame.
    pub async fn finish(mut self) -> Result<(), ClientError> {
        self.flush_frame().await?;

        if self.failure.lock().unwrap().is_some() {
            return Err(ClientError::Aborted);
        }

        self.writer
            .write_all(&0u64.to_le_bytes())
            .await
            .io_context("Failed to write terminating frame")?;
        self.writer
            .flush()
            .await
            .io_context("Failed to flush framed stream")?;
        Ok(())
    }
}
