//! Length-prefixed frame codec.
//!
//! Every message on the wire is a 4-byte big-endian length header followed
//! by exactly that many bytes of JSON. [`FramedConnection`] owns both halves
//! of a duplex stream; reads accumulate into a persistent buffer, so a frame
//! that arrives across several short reads (or whose read future is dropped
//! by a timeout mid-frame) is never torn. The codec does not interpret
//! message contents.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::transport::IoStream;

/// Sanity cap on a single frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LENGTH_HEADER_SIZE: usize = 4;

struct ReadState {
    half: ReadHalf<Box<dyn IoStream>>,
    buf: BytesMut,
}

/// A duplex byte stream with frame-at-a-time send/receive.
///
/// The read and write halves are guarded by separate mutexes: concurrent
/// writers (worker handlers finishing out of order, a host `stop` racing an
/// in-flight call) serialize whole frames, never interleave bytes. Request/
/// response pairing on top of this is the instance layer's job.
pub struct FramedConnection {
    reader: Mutex<ReadState>,
    writer: Mutex<WriteHalf<Box<dyn IoStream>>>,
    closed: AtomicBool,
}

impl FramedConnection {
    pub fn new(stream: Box<dyn IoStream>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadState {
                half: read_half,
                buf: BytesMut::with_capacity(8192),
            }),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
        }
    }

    /// Send one frame: length header plus payload, flushed.
    pub async fn send_frame(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(data.len()).into());
        }

        let mut framed = BytesMut::with_capacity(LENGTH_HEADER_SIZE + data.len());
        framed.put_u32(data.len() as u32);
        framed.put_slice(data);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Receive one full frame body, blocking until it is complete.
    pub async fn recv_frame(&self) -> Result<Bytes> {
        let mut state = self.reader.lock().await;
        loop {
            if state.buf.len() >= LENGTH_HEADER_SIZE {
                let length = u32::from_be_bytes([
                    state.buf[0],
                    state.buf[1],
                    state.buf[2],
                    state.buf[3],
                ]) as usize;

                if length > MAX_FRAME_SIZE {
                    return Err(TransportError::FrameTooLarge(length).into());
                }
                if state.buf.len() >= LENGTH_HEADER_SIZE + length {
                    state.buf.advance(LENGTH_HEADER_SIZE);
                    return Ok(state.buf.split_to(length).freeze());
                }
                let needed = LENGTH_HEADER_SIZE + length - state.buf.len();
                state.buf.reserve(needed);
            }

            let ReadState { half, buf } = &mut *state;
            let n = half
                .read_buf(buf)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            if n == 0 {
                self.closed.store(true, Ordering::SeqCst);
                return Err(TransportError::Closed.into());
            }
        }
    }

    /// Encode and send one message envelope.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let data = message.encode()?;
        self.send_frame(&data).await
    }

    /// Shut down the write side and mark the connection closed.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
