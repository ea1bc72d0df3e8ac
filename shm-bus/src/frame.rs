use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BusError, Result};
use crate::format::FrameFormat;
use crate::names::{self, Namespace};
use crate::shmem::SharedValueChannel;

/// Capture timestamp followed by raw pixels, row-major,
/// channel-interleaved. Overwritten in place on each accepted capture;
/// no history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Capture time, epoch milliseconds.
    pub captured_at_ms: i64,
    pub pixels: Bytes,
}

const TIMESTAMP_WIRE_LEN: usize = std::mem::size_of::<i64>();

impl Frame {
    pub fn new(captured_at_ms: i64, pixels: Bytes) -> Self {
        Self {
            captured_at_ms,
            pixels,
        }
    }

    /// Frame stamped with the current wall clock.
    pub fn now(pixels: Bytes) -> Self {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            captured_at_ms,
            pixels,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TIMESTAMP_WIRE_LEN + self.pixels.len());
        buf.put_i64_le(self.captured_at_ms);
        buf.extend_from_slice(&self.pixels);
        buf.freeze()
    }

    pub fn decode(buf: Bytes) -> Result<Self> {
        if buf.len() < TIMESTAMP_WIRE_LEN {
            return Err(BusError::Malformed("frame payload shorter than timestamp"));
        }
        let mut header = &buf[..TIMESTAMP_WIRE_LEN];
        let captured_at_ms = header.get_i64_le();
        Ok(Self {
            captured_at_ms,
            pixels: buf.slice(TIMESTAMP_WIRE_LEN..),
        })
    }
}

/// Shared-memory slot for the most recent captured frame, sized from
/// the run's [`FrameFormat`]. Both publish and read enforce the format
/// contract: a frame of any other size is a [`BusError::SizeMismatch`].
pub struct FrameChannel {
    inner: SharedValueChannel,
    format: FrameFormat,
}

impl FrameChannel {
    pub fn create(ns: &Namespace, format: FrameFormat) -> Result<Self> {
        let inner = SharedValueChannel::create(
            &ns.object(names::FRAME),
            TIMESTAMP_WIRE_LEN + format.frame_len(),
        )?;
        Ok(Self { inner, format })
    }

    pub fn open(ns: &Namespace, format: FrameFormat) -> Result<Self> {
        let inner = SharedValueChannel::open(&ns.object(names::FRAME))?;
        Ok(Self { inner, format })
    }

    pub fn open_with_retry(
        ns: &Namespace,
        format: FrameFormat,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self> {
        let inner =
            SharedValueChannel::open_with_retry(&ns.object(names::FRAME), attempts, backoff)?;
        Ok(Self { inner, format })
    }

    pub fn force_remove(ns: &Namespace) {
        SharedValueChannel::force_remove(&ns.object(names::FRAME));
    }

    pub fn publish(&mut self, frame: &Frame) -> Result<()> {
        if frame.pixels.len() != self.format.frame_len() {
            return Err(BusError::SizeMismatch {
                expected: self.format.frame_len(),
                got: frame.pixels.len(),
            });
        }
        self.inner.write(&frame.encode())
    }

    /// Most recent frame, or `None` before the first publish.
    pub fn latest(&self) -> Result<Option<Frame>> {
        let snapshot = self.inner.read_snapshot()?;
        if snapshot.is_empty() {
            return Ok(None);
        }
        let frame = Frame::decode(snapshot)?;
        if frame.pixels.len() != self.format.frame_len() {
            return Err(BusError::SizeMismatch {
                expected: self.format.frame_len(),
                got: frame.pixels.len(),
            });
        }
        Ok(Some(frame))
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn unlink(&self) {
        self.inner.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_round_trips() {
        let frame = Frame::new(1_700_000_000_123, Bytes::from_static(b"pixels"));
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_payload_is_malformed() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0, 1, 2])),
            Err(BusError::Malformed(_))
        ));
    }
}
