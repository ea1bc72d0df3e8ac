use std::time::Duration;

use tokio_util::sync::CancellationToken;

use shm_bus::detection::DetectionChannel;
use shm_bus::format::{FrameFormat, FrameFormatChannel};
use shm_bus::frame::FrameChannel;
use shm_bus::names;
use shm_bus::rendezvous::{Rendezvous, SYNC_DEPTH};
use shm_bus::BusError;

use crate::config::config;
use crate::usage::UsageMeter;
use crate::vision::{self, FaceLocator};
use crate::worker::{finish, until_shutdown, FailFlag};

/// Detector stage. Reads the latest frame, locates faces, publishes
/// the boxes, and (when the ordering signal is on) tells the renderer
/// a new result is visible. Owns the detection channel and the sync
/// queue.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config();
    let ns = &cfg.namespace;
    let meter = UsageMeter::start();

    let format = FrameFormatChannel::open_with_retry(ns, cfg.open_attempts, cfg.open_backoff)?
        .read()?;
    let frames = FrameChannel::open_with_retry(ns, format, cfg.open_attempts, cfg.open_backoff)?;

    DetectionChannel::force_remove(ns);
    Rendezvous::force_remove(ns, names::DETECT_RENDER_SYNC);
    let detections = DetectionChannel::create(ns)?;
    let sync = if cfg.sync_detect_render {
        Some(Rendezvous::create(ns, names::DETECT_RENDER_SYNC, SYNC_DEPTH)?)
    } else {
        None
    };
    log::info!(
        "detect pid {} tracking {} frames, up to {} boxes per result",
        std::process::id(),
        format,
        detections.max_boxes()
    );

    // downstream can open everything now
    Rendezvous::open(ns, names::READY)?.signal()?;

    let locator = vision::default_locator();
    let cancel = CancellationToken::new();
    let failed = FailFlag::default();
    {
        let cancel = cancel.clone();
        let failed = failed.clone();
        std::thread::spawn(move || {
            if let Err(e) = detect_loop(locator, &format, &frames, detections, sync, &cancel) {
                log::error!("detect stage failed: {:#}", e);
                failed.raise();
                cancel.cancel();
            }
        });
    }

    until_shutdown(&cancel).await;
    finish("detect", &meter, &failed, || {
        DetectionChannel::force_remove(ns);
        Rendezvous::force_remove(ns, names::DETECT_RENDER_SYNC);
    });
}

fn detect_loop(
    mut locator: Box<dyn FaceLocator>,
    format: &FrameFormat,
    frames: &FrameChannel,
    mut detections: DetectionChannel,
    sync: Option<Rendezvous>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    while !cancel.is_cancelled() {
        let Some(frame) = frames.latest()? else {
            // capture has not published yet
            std::thread::sleep(Duration::from_millis(2));
            continue;
        };
        let boxes = locator.locate(format, &frame)?;
        match detections.publish(&boxes) {
            Err(BusError::CapacityExceeded { len, capacity }) => {
                // surfaced to us, the writer; skip the cycle
                log::error!(
                    "dropping result of {} bytes, channel holds {}",
                    len,
                    capacity
                );
                continue;
            }
            other => other?,
        }
        if let Some(sync) = &sync {
            // only after the write is visible
            sync.signal()?;
        }
    }
    Ok(())
}
