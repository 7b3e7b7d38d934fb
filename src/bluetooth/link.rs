// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framed read and write halves of a single peer link.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::codec::{encode_frame, FrameDecoder};
use super::protocol::Frame;
use crate::error::{LinkError, TransportError};

/// Default size of a single stream read.
pub const DEFAULT_READ_CHUNK: usize = 1024;

/// Split a stream into framed halves.
pub fn split<S>(stream: S, read_chunk: usize) -> (LinkReader<ReadHalf<S>>, LinkWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (LinkReader::new(reader, read_chunk), LinkWriter::new(writer))
}

/// Receiving half of a link.
pub struct LinkReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    pub fn new(inner: R, read_chunk: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0; read_chunk.max(1)],
        }
    }

    /// Block until the next complete frame arrives.
    ///
    /// End of stream maps to [`TransportError::LinkClosed`]; a malformed
    /// frame maps to a codec error and the reader must not be used again.
    pub async fn read_frame(&mut self) -> Result<Frame, LinkError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            // Frames ahead of a corrupt one are drained; report it now.
            if let Some(err) = self.decoder.failure() {
                return Err(err.clone().into());
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                debug!(
                    "Link reached end of stream with {} bytes pending",
                    self.decoder.buffered()
                );
                return Err(TransportError::LinkClosed.into());
            }
            if let Err(e) = self.decoder.push_bytes(&self.chunk[..n]) {
                // Hand out frames completed before the bad one first.
                if let Some(frame) = self.decoder.next_frame() {
                    return Ok(frame);
                }
                return Err(e.into());
            }
        }
    }
}

/// Sending half of a link.
pub struct LinkWriter<W> {
    inner: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Encode and write a whole frame, then flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), LinkError> {
        if self.closed {
            return Err(TransportError::LinkClosed.into());
        }
        let bytes = encode_frame(frame)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        debug!("Sent {} frame ({} bytes)", frame.frame_type().as_str(), bytes.len());
        Ok(())
    }

    /// Shut down the write direction. Further writes fail with `LinkClosed`.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_stream() {
        let (a, b) = tokio::io::duplex(64);
        let (_ra, mut wa) = split(a, 7);
        let (mut rb, _wb) = split(b, 7);

        let text = Frame::Text {
            id: Uuid::new_v4(),
            timestamp: 99,
            text: "a message longer than one read chunk".into(),
        };
        wa.write_frame(&text).await.unwrap();
        wa.write_frame(&Frame::Disconnect).await.unwrap();

        assert_eq!(rb.read_frame().await.unwrap(), text);
        assert_eq!(rb.read_frame().await.unwrap(), Frame::Disconnect);
    }

    #[tokio::test]
    async fn test_close_reports_link_closed() {
        let (a, b) = tokio::io::duplex(64);
        let (_ra, mut wa) = split(a, DEFAULT_READ_CHUNK);
        let (mut rb, _wb) = split(b, DEFAULT_READ_CHUNK);

        wa.close().await;
        assert!(matches!(
            rb.read_frame().await,
            Err(LinkError::Transport(TransportError::LinkClosed))
        ));
        assert!(wa.write_frame(&Frame::Reject).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_after_frame_in_same_read() {
        let (a, b) = tokio::io::duplex(256);
        let (mut rb, _wb) = split(b, DEFAULT_READ_CHUNK);
        let (_ra, mut raw) = tokio::io::split(a);

        let text = Frame::Text {
            id: Uuid::new_v4(),
            timestamp: 7,
            text: "last good frame".into(),
        };
        let mut bytes = encode_frame(&text).unwrap();
        bytes.extend_from_slice(&[0xEE, 0, 0, 0, 1, 0]);
        raw.write_all(&bytes).await.unwrap();

        assert_eq!(rb.read_frame().await.unwrap(), text);
        // Writer stays open; the error must not wait for more bytes.
        let second = tokio::time::timeout(std::time::Duration::from_secs(1), rb.read_frame())
            .await
            .expect("corrupt tail not reported");
        assert!(matches!(
            second,
            Err(LinkError::Codec(CodecError::CorruptFrame(_)))
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_codec_error() {
        let (a, b) = tokio::io::duplex(64);
        let (mut rb, _wb) = split(b, DEFAULT_READ_CHUNK);
        let (_ra, mut raw) = tokio::io::split(a);

        raw.write_all(&[0x99, 0, 0, 0, 1, 0]).await.unwrap();
        assert!(matches!(
            rb.read_frame().await,
            Err(LinkError::Codec(CodecError::CorruptFrame(_)))
        ));
    }
}
