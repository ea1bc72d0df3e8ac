use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;

use shm_bus::control::RedactionMode;
use shm_bus::detection::BoundingBox;
use shm_bus::format::{FrameFormat, PixelLayout};
use shm_bus::frame::Frame;

/// Environment variable selecting the capture device.
pub const SOURCE_ENV: &str = "REDACTD_SOURCE";

/// Where frames come from. `test` (the default) is a synthetic moving
/// pattern; `test:ROWSxCOLS` picks its geometry; anything else is
/// treated as a device path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSelector {
    TestPattern { rows: u32, cols: u32 },
    Device(String),
}

impl SourceSelector {
    pub fn from_env() -> Self {
        match std::env::var(SOURCE_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::parse("test"),
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "test" {
            return SourceSelector::TestPattern {
                rows: 480,
                cols: 640,
            };
        }
        if let Some(geometry) = raw.strip_prefix("test:") {
            if let Some((rows, cols)) = geometry.split_once('x') {
                if let (Ok(rows), Ok(cols)) = (rows.parse(), cols.parse()) {
                    if rows > 0 && cols > 0 {
                        return SourceSelector::TestPattern { rows, cols };
                    }
                }
            }
        }
        SourceSelector::Device(raw.to_string())
    }
}

pub trait FrameSource: Send {
    /// Geometry of every frame this source will ever produce.
    fn format(&self) -> FrameFormat;
    /// Block until the next frame is available.
    fn grab(&mut self) -> anyhow::Result<Frame>;
}

pub trait FaceLocator: Send {
    fn locate(&mut self, format: &FrameFormat, frame: &Frame) -> anyhow::Result<Vec<BoundingBox>>;
}

pub trait DisplaySink: Send {
    fn present(&mut self, format: &FrameFormat, frame: &Frame) -> anyhow::Result<()>;
}

pub fn open_source(selector: &SourceSelector) -> anyhow::Result<Box<dyn FrameSource>> {
    match selector {
        SourceSelector::TestPattern { rows, cols } => {
            Ok(Box::new(TestPatternSource::new(*rows, *cols)))
        }
        SourceSelector::Device(path) => {
            bail!("no capture driver for {path:?}; this build only ships the synthetic source")
        }
    }
}

pub fn default_locator() -> Box<dyn FaceLocator> {
    Box::new(SweepLocator::new())
}

pub fn open_display() -> anyhow::Result<Box<dyn DisplaySink>> {
    Ok(Box::new(NullDisplay::default()))
}

/// Synthetic capture device: an rgb8 gradient that shifts one step per
/// frame, paced near 120 fps so the gate does the real limiting.
pub struct TestPatternSource {
    format: FrameFormat,
    tick: u64,
    pacing: Duration,
}

impl TestPatternSource {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            format: FrameFormat::new(rows, cols, PixelLayout::Rgb8),
            tick: 0,
            pacing: Duration::from_millis(8),
        }
    }
}

impl FrameSource for TestPatternSource {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn grab(&mut self) -> anyhow::Result<Frame> {
        std::thread::sleep(self.pacing);
        let len = self.format.frame_len();
        let shift = self.tick as usize;
        let mut pixels = Vec::with_capacity(len);
        for i in 0..len {
            pixels.push(((i + shift) & 0xff) as u8);
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(Frame::now(Bytes::from(pixels)))
    }
}

/// Stand-in detector: one quarter-frame box sweeping left to right,
/// with a sleep modelling inference latency.
pub struct SweepLocator {
    tick: u32,
    latency: Duration,
}

impl SweepLocator {
    pub fn new() -> Self {
        Self {
            tick: 0,
            latency: Duration::from_millis(15),
        }
    }
}

impl FaceLocator for SweepLocator {
    fn locate(&mut self, format: &FrameFormat, _frame: &Frame) -> anyhow::Result<Vec<BoundingBox>> {
        std::thread::sleep(self.latency);
        let width = (format.cols / 4).max(1) as i32;
        let height = (format.rows / 4).max(1) as i32;
        let span = (format.cols as i32 - width).max(1);
        let x = (self.tick as i32 * 8) % span;
        let y = (format.rows as i32 - height) / 2;
        self.tick = self.tick.wrapping_add(1);
        Ok(vec![BoundingBox::new(x, y, width, height)])
    }
}

/// Sink for builds without a window system; counts frames and logs a
/// heartbeat.
#[derive(Default)]
pub struct NullDisplay {
    presented: u64,
}

impl DisplaySink for NullDisplay {
    fn present(&mut self, format: &FrameFormat, frame: &Frame) -> anyhow::Result<()> {
        self.presented += 1;
        if self.presented % 30 == 1 {
            log::info!(
                "rendered {} {} frames, latest captured at {} ms",
                self.presented,
                format,
                frame.captured_at_ms
            );
        }
        Ok(())
    }
}

/// Apply `mode` to each detected region, in place. Regions are clipped
/// to the frame; boxes fully outside it are ignored.
pub fn redact(format: &FrameFormat, pixels: &mut [u8], boxes: &[BoundingBox], mode: RedactionMode) {
    for b in boxes {
        let Some(region) = clip(format, b) else {
            continue;
        };
        match mode {
            RedactionMode::Fill => fill_region(format, pixels, region),
            RedactionMode::Blur => blur_region(format, pixels, region),
        }
    }
}

/// Clipped region as (x0, y0, x1, y1), half-open.
type Region = (usize, usize, usize, usize);

fn clip(format: &FrameFormat, b: &BoundingBox) -> Option<Region> {
    if b.width <= 0 || b.height <= 0 {
        return None;
    }
    let cols = format.cols as i64;
    let rows = format.rows as i64;
    let x0 = i64::from(b.x).clamp(0, cols);
    let y0 = i64::from(b.y).clamp(0, rows);
    let x1 = (i64::from(b.x) + i64::from(b.width)).clamp(0, cols);
    let y1 = (i64::from(b.y) + i64::from(b.height)).clamp(0, rows);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some((x0 as usize, y0 as usize, x1 as usize, y1 as usize))
}

fn fill_region(format: &FrameFormat, pixels: &mut [u8], (x0, y0, x1, y1): Region) {
    let bpp = format.layout.bytes_per_pixel();
    let stride = format.cols as usize * bpp;
    for y in y0..y1 {
        let row = y * stride;
        pixels[row + x0 * bpp..row + x1 * bpp].fill(0);
    }
}

const BLUR_BLOCK: usize = 8;

/// Coarse pixelation: each 8x8 tile of the region is replaced with its
/// per-channel mean.
fn blur_region(format: &FrameFormat, pixels: &mut [u8], (x0, y0, x1, y1): Region) {
    let bpp = format.layout.bytes_per_pixel();
    let stride = format.cols as usize * bpp;
    let mut ty = y0;
    while ty < y1 {
        let tile_y1 = (ty + BLUR_BLOCK).min(y1);
        let mut tx = x0;
        while tx < x1 {
            let tile_x1 = (tx + BLUR_BLOCK).min(x1);
            let count = ((tile_y1 - ty) * (tile_x1 - tx)) as u32;
            for ch in 0..bpp {
                let mut sum = 0u32;
                for y in ty..tile_y1 {
                    for x in tx..tile_x1 {
                        sum += u32::from(pixels[y * stride + x * bpp + ch]);
                    }
                }
                let mean = (sum / count.max(1)) as u8;
                for y in ty..tile_y1 {
                    for x in tx..tile_x1 {
                        pixels[y * stride + x * bpp + ch] = mean;
                    }
                }
            }
            tx = tile_x1;
        }
        ty = tile_y1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_test_geometry_and_device_paths() {
        assert_eq!(
            SourceSelector::parse("test"),
            SourceSelector::TestPattern {
                rows: 480,
                cols: 640
            }
        );
        assert_eq!(
            SourceSelector::parse("test:120x160"),
            SourceSelector::TestPattern {
                rows: 120,
                cols: 160
            }
        );
        assert_eq!(
            SourceSelector::parse("/dev/video0"),
            SourceSelector::Device("/dev/video0".to_string())
        );
        // unparseable geometry falls through to a device path
        assert_eq!(
            SourceSelector::parse("test:0x0"),
            SourceSelector::Device("test:0x0".to_string())
        );
    }

    #[test]
    fn test_pattern_frames_match_the_declared_format() {
        let mut source = TestPatternSource::new(4, 6);
        let format = source.format();
        let frame = source.grab().unwrap();
        assert_eq!(frame.pixels.len(), format.frame_len());
        // next frame differs: the pattern moves
        assert_ne!(source.grab().unwrap().pixels, frame.pixels);
    }

    #[test]
    fn sweep_locator_stays_inside_the_frame() {
        let format = FrameFormat::new(48, 64, PixelLayout::Rgb8);
        let mut locator = SweepLocator::new();
        locator.latency = Duration::ZERO;
        for _ in 0..50 {
            let frame = Frame::new(0, Bytes::from(vec![0u8; format.frame_len()]));
            for b in locator.locate(&format, &frame).unwrap() {
                assert!(b.x >= 0 && b.y >= 0);
                assert!(b.x + b.width <= format.cols as i32);
                assert!(b.y + b.height <= format.rows as i32);
            }
        }
    }

    #[test]
    fn fill_blackens_exactly_the_region() {
        let format = FrameFormat::new(4, 4, PixelLayout::Rgb8);
        let mut pixels = vec![200u8; format.frame_len()];
        redact(
            &format,
            &mut pixels,
            &[BoundingBox::new(1, 1, 2, 2)],
            RedactionMode::Fill,
        );
        let bpp = 3;
        for y in 0..4usize {
            for x in 0..4usize {
                let inside = (1..3).contains(&x) && (1..3).contains(&y);
                let expected = if inside { 0 } else { 200 };
                for ch in 0..bpp {
                    assert_eq!(pixels[(y * 4 + x) * bpp + ch], expected, "at ({x},{y})");
                }
            }
        }
    }

    #[test]
    fn blur_replaces_the_region_with_tile_means() {
        let format = FrameFormat::new(2, 4, PixelLayout::Gray8);
        let mut pixels = vec![10, 20, 30, 40, 50, 60, 70, 80];
        redact(
            &format,
            &mut pixels,
            &[BoundingBox::new(0, 0, 4, 2)],
            RedactionMode::Blur,
        );
        // one tile covers the whole region; mean of 10..=80 is 45
        assert_eq!(pixels, vec![45u8; 8]);
    }

    #[test]
    fn out_of_bounds_boxes_are_clipped_not_fatal() {
        let format = FrameFormat::new(4, 4, PixelLayout::Gray8);
        let mut pixels = vec![9u8; format.frame_len()];
        let boxes = [
            BoundingBox::new(-2, -2, 3, 3),
            BoundingBox::new(100, 100, 5, 5),
            BoundingBox::new(0, 0, -1, 4),
        ];
        redact(&format, &mut pixels, &boxes, RedactionMode::Fill);
        // only the 1x1 overlap of the first box was cleared
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels.iter().filter(|&&p| p == 0).count(), 1);
    }
}
