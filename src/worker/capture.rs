use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use shm_bus::control::{Command, ControlKind, ControlQueue};
use shm_bus::format::FrameFormatChannel;
use shm_bus::frame::FrameChannel;
use shm_bus::names;
use shm_bus::rendezvous::Rendezvous;
use shm_bus::BusError;

use crate::config::config;
use crate::gate::FrameRateGate;
use crate::usage::UsageMeter;
use crate::vision::{self, FrameSource};
use crate::worker::{finish, until_shutdown, FailFlag};

/// Capture stage. Owns the format and frame channels: creates them,
/// publishes the format exactly once, then writes gated frames until
/// shutdown. The fps listener retunes the gate from the command queue.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config();
    let ns = &cfg.namespace;
    let meter = UsageMeter::start();

    let source = vision::open_source(&cfg.source)?;
    let format = source.format();

    // a crashed previous run may have left its objects behind
    FrameChannel::force_remove(ns);
    FrameFormatChannel::force_remove(ns);
    let mut format_channel = FrameFormatChannel::create(ns)?;
    format_channel.publish(&format)?;
    let frames = FrameChannel::create(ns, format)?;
    log::info!(
        "capture pid {} publishing {} frames",
        std::process::id(),
        format
    );

    let gate = Arc::new(Mutex::new(FrameRateGate::new(
        cfg.default_fps,
        cfg.gate_tolerance,
    )));
    let cancel = CancellationToken::new();
    let failed = FailFlag::default();

    let fps_commands = ControlQueue::open(ns, ControlKind::FrameRateLimit)?;
    {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || listen_for_fps(&fps_commands, &gate));
    }

    // channels exist and the format is live: let the launch proceed
    Rendezvous::open(ns, names::READY)?.signal()?;

    {
        let cancel = cancel.clone();
        let failed = failed.clone();
        std::thread::spawn(move || {
            if let Err(e) = capture_loop(source, frames, &gate, &cancel) {
                log::error!("capture stage failed: {:#}", e);
                failed.raise();
                cancel.cancel();
            }
        });
    }

    until_shutdown(&cancel).await;
    finish("capture", &meter, &failed, || {
        FrameChannel::force_remove(ns);
        FrameFormatChannel::force_remove(ns);
    });
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    mut frames: FrameChannel,
    gate: &Mutex<FrameRateGate>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    while !cancel.is_cancelled() {
        let frame = source.grab()?;
        let now = Instant::now();
        let accepted = {
            let mut gate = gate.lock().unwrap_or_else(|e| e.into_inner());
            if gate.should_accept(now) {
                gate.mark_accepted(now);
                true
            } else {
                false
            }
        };
        if !accepted {
            // rejected frames are dropped on the floor, never queued
            continue;
        }
        frames.publish(&frame)?;
    }
    Ok(())
}

/// Blocking listener for frame-rate commands. Malformed messages are
/// logged and discarded; the listener keeps serving.
fn listen_for_fps(commands: &ControlQueue, gate: &Mutex<FrameRateGate>) {
    loop {
        match commands.recv() {
            Ok(Command::SetFrameRateLimit(fps)) => {
                log::info!("frame rate cap set to {} fps", fps);
                gate.lock().unwrap_or_else(|e| e.into_inner()).set_fps(fps);
            }
            Ok(other) => log::warn!("ignoring command {:?} on the fps queue", other),
            Err(BusError::Malformed(why)) => {
                log::warn!("discarding malformed fps command: {}", why);
            }
            Err(e) => {
                log::error!("fps listener stopping: {}", e);
                return;
            }
        }
    }
}
