use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BusError, Result};
use crate::names::{self, Namespace};
use crate::shmem::SharedValueChannel;

/// Image-space, axis-aligned box. Width and height are expected to be
/// non-negative; the codec carries whatever the detector produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Fixed size of the detection region. Leaves room for ~1000 boxes.
pub const DETECTION_REGION_BYTES: usize = 16 * 1024;

const INT_WIRE_LEN: usize = std::mem::size_of::<i32>();
const INTS_PER_BOX: usize = 4;
const BOX_WIRE_LEN: usize = INTS_PER_BOX * INT_WIRE_LEN;

/// Most boxes a result can hold within `capacity` bytes: a leading
/// integer count plus four integers per box.
pub fn max_boxes(capacity: usize) -> usize {
    capacity.saturating_sub(INT_WIRE_LEN) / BOX_WIRE_LEN
}

/// Wire layout: a leading i32 holding the number of encoded integers
/// (four per box), then that many little-endian i32s grouped as
/// (x, y, width, height). Insertion order is preserved.
pub fn encode(boxes: &[BoundingBox], capacity: usize) -> Result<Bytes> {
    let wire_len = INT_WIRE_LEN + boxes.len() * BOX_WIRE_LEN;
    if wire_len > capacity {
        return Err(BusError::CapacityExceeded {
            len: wire_len,
            capacity,
        });
    }
    let mut buf = BytesMut::with_capacity(wire_len);
    buf.put_i32_le((boxes.len() * INTS_PER_BOX) as i32);
    for b in boxes {
        buf.put_i32_le(b.x);
        buf.put_i32_le(b.y);
        buf.put_i32_le(b.width);
        buf.put_i32_le(b.height);
    }
    Ok(buf.freeze())
}

/// Bounded decode: the declared count is validated against the channel
/// capacity before anything is allocated, so a corrupt or hostile
/// count cannot drive an unbounded allocation.
pub fn decode(mut buf: &[u8], capacity: usize) -> Result<Vec<BoundingBox>> {
    if buf.len() < INT_WIRE_LEN {
        return Err(BusError::Malformed("detection payload shorter than count"));
    }
    let declared = buf.get_i32_le();
    if declared < 0 || declared as usize % INTS_PER_BOX != 0 {
        return Err(BusError::Malformed("detection count is not a box multiple"));
    }
    let declared = declared as usize;
    let wire_len = INT_WIRE_LEN + declared * INT_WIRE_LEN;
    if wire_len > capacity {
        return Err(BusError::CapacityExceeded {
            len: wire_len,
            capacity,
        });
    }
    if buf.len() < declared * INT_WIRE_LEN {
        return Err(BusError::Malformed("detection payload shorter than count"));
    }
    let mut boxes = Vec::with_capacity(declared / INTS_PER_BOX);
    for _ in 0..declared / INTS_PER_BOX {
        let x = buf.get_i32_le();
        let y = buf.get_i32_le();
        let width = buf.get_i32_le();
        let height = buf.get_i32_le();
        boxes.push(BoundingBox::new(x, y, width, height));
    }
    Ok(boxes)
}

/// Shared-memory slot for the latest detection result, overwritten
/// wholesale on each detection cycle.
pub struct DetectionChannel {
    inner: SharedValueChannel,
}

impl DetectionChannel {
    pub fn create(ns: &Namespace) -> Result<Self> {
        let inner =
            SharedValueChannel::create(&ns.object(names::DETECTIONS), DETECTION_REGION_BYTES)?;
        Ok(Self { inner })
    }

    pub fn open(ns: &Namespace) -> Result<Self> {
        let inner = SharedValueChannel::open(&ns.object(names::DETECTIONS))?;
        Ok(Self { inner })
    }

    pub fn open_with_retry(ns: &Namespace, attempts: u32, backoff: Duration) -> Result<Self> {
        let inner =
            SharedValueChannel::open_with_retry(&ns.object(names::DETECTIONS), attempts, backoff)?;
        Ok(Self { inner })
    }

    pub fn force_remove(ns: &Namespace) {
        SharedValueChannel::force_remove(&ns.object(names::DETECTIONS));
    }

    pub fn publish(&mut self, boxes: &[BoundingBox]) -> Result<()> {
        let wire = encode(boxes, self.inner.capacity())?;
        self.inner.write(&wire)
    }

    /// Latest result; empty both before the first publish and when the
    /// detector last found nothing.
    pub fn latest(&self) -> Result<Vec<BoundingBox>> {
        let snapshot = self.inner.read_snapshot()?;
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        decode(&snapshot, self.inner.capacity())
    }

    pub fn max_boxes(&self) -> usize {
        max_boxes(self.inner.capacity())
    }

    pub fn unlink(&self) {
        self.inner.unlink();
    }
}
