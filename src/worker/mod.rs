//! The three pipeline stages. Each runs as its own OS process with the
//! same shape: open or create its channels, signal readiness where the
//! launch sequence expects it, run the stage loop and any command
//! listeners on plain threads, then report usage and exit when told to
//! stop.

pub mod capture;
pub mod detect;
pub mod render;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::usage::UsageMeter;

/// Raised by a stage loop that hit a fatal error; decides the exit
/// code.
#[derive(Clone, Default)]
pub(crate) struct FailFlag(Arc<AtomicBool>);

impl FailFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Park until a termination signal arrives or the stage cancels
/// itself.
pub(crate) async fn until_shutdown(cancel: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    let (mut term, mut interrupt) = match (term, interrupt) {
        (Ok(t), Ok(i)) => (t, i),
        (t, i) => {
            log::error!(
                "could not install signal handlers: {:?} {:?}",
                t.err(),
                i.err()
            );
            cancel.cancelled().await;
            return;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = term.recv() => {
            log::info!("termination signal received");
            cancel.cancel();
        }
        _ = interrupt.recv() => {
            log::info!("interrupt received");
            cancel.cancel();
        }
    }
}

/// Common tail of every stage: give the loops a moment to observe the
/// cancellation, report usage, release owned channels, exit. Listener
/// threads blocked in a queue receive are detached on purpose; process
/// exit reclaims them.
pub(crate) fn finish(role: &str, meter: &UsageMeter, failed: &FailFlag, cleanup: impl FnOnce()) -> ! {
    std::thread::sleep(Duration::from_millis(150));
    meter.report(role);
    cleanup();
    std::process::exit(if failed.raised() { 1 } else { 0 });
}
