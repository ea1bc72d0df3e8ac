use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use shm_bus::control::{Command, ControlKind, ControlQueue, RedactionMode};
use shm_bus::detection::DetectionChannel;
use shm_bus::format::{FrameFormat, FrameFormatChannel};
use shm_bus::frame::{Frame, FrameChannel};
use shm_bus::names;
use shm_bus::rendezvous::Rendezvous;
use shm_bus::BusError;

use crate::config::config;
use crate::usage::UsageMeter;
use crate::vision::{self, DisplaySink};
use crate::worker::{finish, until_shutdown, FailFlag};

/// Renderer stage. Opens everything, owns nothing. Combines the latest
/// frame with the latest detection result under the current redaction
/// mode and hands the redacted frame to the display.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config();
    let ns = &cfg.namespace;
    let meter = UsageMeter::start();

    let format = FrameFormatChannel::open_with_retry(ns, cfg.open_attempts, cfg.open_backoff)?
        .read()?;
    let frames = FrameChannel::open_with_retry(ns, format, cfg.open_attempts, cfg.open_backoff)?;
    let detections = DetectionChannel::open_with_retry(ns, cfg.open_attempts, cfg.open_backoff)?;
    let sync = if cfg.sync_detect_render {
        Some(Rendezvous::open(ns, names::DETECT_RENDER_SYNC)?)
    } else {
        None
    };
    let display = vision::open_display()?;
    log::info!("render pid {} displaying {} frames", std::process::id(), format);

    let mode = Arc::new(Mutex::new(cfg.default_mode));
    let mode_commands = ControlQueue::open(ns, ControlKind::RedactionMode)?;
    {
        let mode = Arc::clone(&mode);
        std::thread::spawn(move || listen_for_mode(&mode_commands, &mode));
    }

    let cancel = CancellationToken::new();
    let failed = FailFlag::default();
    {
        let cancel = cancel.clone();
        let failed = failed.clone();
        std::thread::spawn(move || {
            if let Err(e) = render_loop(display, &format, &frames, &detections, sync, &mode, &cancel)
            {
                log::error!("render stage failed: {:#}", e);
                failed.raise();
                cancel.cancel();
            }
        });
    }

    until_shutdown(&cancel).await;
    finish("render", &meter, &failed, || {});
}

fn render_loop(
    mut display: Box<dyn DisplaySink>,
    format: &FrameFormat,
    frames: &FrameChannel,
    detections: &DetectionChannel,
    sync: Option<Rendezvous>,
    mode: &Mutex<RedactionMode>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    while !cancel.is_cancelled() {
        let Some(frame) = frames.latest()? else {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        };
        if let Some(sync) = &sync {
            // do not re-render the result we already consumed
            sync.wait()?;
        }
        let boxes = detections.latest()?;
        let mode = *mode.lock().unwrap_or_else(|e| e.into_inner());
        let mut pixels = BytesMut::from(frame.pixels.as_ref());
        vision::redact(format, &mut pixels, &boxes, mode);
        display.present(format, &Frame::new(frame.captured_at_ms, pixels.freeze()))?;
    }
    Ok(())
}

/// Blocking listener for redaction-mode commands. Malformed messages
/// are logged and discarded; the listener keeps serving.
fn listen_for_mode(commands: &ControlQueue, mode: &Mutex<RedactionMode>) {
    loop {
        match commands.recv() {
            Ok(Command::SetRedactionMode(new_mode)) => {
                log::info!("redaction mode set to {}", new_mode);
                *mode.lock().unwrap_or_else(|e| e.into_inner()) = new_mode;
            }
            Ok(other) => log::warn!("ignoring command {:?} on the mode queue", other),
            Err(BusError::Malformed(why)) => {
                log::warn!("discarding malformed mode command: {}", why);
            }
            Err(e) => {
                log::error!("mode listener stopping: {}", e);
                return;
            }
        }
    }
}
