use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BusError, Result};
use crate::names::{self, Namespace};
use crate::shmem::SharedValueChannel;

/// Pixel layout of a captured frame, with a stable wire code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Gray8,
    Bgr8,
    Rgb8,
    Rgba8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Bgr8 | PixelLayout::Rgb8 => 3,
            PixelLayout::Rgba8 => 4,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            PixelLayout::Gray8 => 0,
            PixelLayout::Bgr8 => 1,
            PixelLayout::Rgb8 => 2,
            PixelLayout::Rgba8 => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PixelLayout::Gray8),
            1 => Some(PixelLayout::Bgr8),
            2 => Some(PixelLayout::Rgb8),
            3 => Some(PixelLayout::Rgba8),
            _ => None,
        }
    }
}

impl Display for PixelLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelLayout::Gray8 => "gray8",
            PixelLayout::Bgr8 => "bgr8",
            PixelLayout::Rgb8 => "rgb8",
            PixelLayout::Rgba8 => "rgba8",
        };
        write!(f, "{}", name)
    }
}

/// Frame geometry, written exactly once by the capture stage before any
/// frame write and immutable for the rest of the run. Every frame on
/// the frame channel must be exactly [`frame_len`](Self::frame_len)
/// bytes for the lifetime of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub rows: u32,
    pub cols: u32,
    pub layout: PixelLayout,
}

/// Wire layout: three little-endian u32s (rows, cols, layout code).
const FORMAT_WIRE_LEN: usize = 3 * 4;

impl FrameFormat {
    pub fn new(rows: u32, cols: u32, layout: PixelLayout) -> Self {
        Self { rows, cols, layout }
    }

    /// Exact pixel payload size of a conforming frame.
    pub fn frame_len(&self) -> usize {
        self.rows as usize * self.cols as usize * self.layout.bytes_per_pixel()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FORMAT_WIRE_LEN);
        buf.put_u32_le(self.rows);
        buf.put_u32_le(self.cols);
        buf.put_u32_le(self.layout.code());
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != FORMAT_WIRE_LEN {
            return Err(BusError::Malformed("frame format payload has wrong size"));
        }
        let rows = buf.get_u32_le();
        let cols = buf.get_u32_le();
        let layout = PixelLayout::from_code(buf.get_u32_le())
            .ok_or(BusError::Malformed("unknown pixel layout code"))?;
        Ok(Self { rows, cols, layout })
    }
}

impl Display for FrameFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.cols, self.rows, self.layout)
    }
}

/// Shared-memory slot holding the run's [`FrameFormat`].
pub struct FrameFormatChannel {
    inner: SharedValueChannel,
}

impl FrameFormatChannel {
    pub fn create(ns: &Namespace) -> Result<Self> {
        let inner = SharedValueChannel::create(&ns.object(names::FRAME_FORMAT), FORMAT_WIRE_LEN)?;
        Ok(Self { inner })
    }

    pub fn open(ns: &Namespace) -> Result<Self> {
        let inner = SharedValueChannel::open(&ns.object(names::FRAME_FORMAT))?;
        Ok(Self { inner })
    }

    pub fn open_with_retry(ns: &Namespace, attempts: u32, backoff: Duration) -> Result<Self> {
        let inner =
            SharedValueChannel::open_with_retry(&ns.object(names::FRAME_FORMAT), attempts, backoff)?;
        Ok(Self { inner })
    }

    pub fn force_remove(ns: &Namespace) {
        SharedValueChannel::force_remove(&ns.object(names::FRAME_FORMAT));
    }

    /// First and only write of the run. A second publish is refused.
    pub fn publish(&mut self, format: &FrameFormat) -> Result<()> {
        if !self.inner.read_snapshot()?.is_empty() {
            return Err(BusError::AlreadyExists {
                name: self.inner.name().to_string(),
            });
        }
        self.inner.write(&format.encode())
    }

    pub fn read(&self) -> Result<FrameFormat> {
        let snapshot = self.inner.read_snapshot()?;
        if snapshot.is_empty() {
            return Err(BusError::NotFound {
                name: self.inner.name().to_string(),
            });
        }
        FrameFormat::decode(&snapshot)
    }

    pub fn unlink(&self) {
        self.inner.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_codec_round_trips() {
        let format = FrameFormat::new(480, 640, PixelLayout::Rgb8);
        assert_eq!(format.frame_len(), 480 * 640 * 3);
        let decoded = FrameFormat::decode(&format.encode()).unwrap();
        assert_eq!(decoded, format);
    }

    #[test]
    fn unknown_layout_code_is_malformed() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(480);
        wire.put_u32_le(640);
        wire.put_u32_le(99);
        match FrameFormat::decode(&wire) {
            Err(BusError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn short_payload_is_malformed() {
        assert!(matches!(
            FrameFormat::decode(&[1, 2, 3]),
            Err(BusError::Malformed(_))
        ));
    }
}
