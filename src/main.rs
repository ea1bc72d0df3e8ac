use log::LevelFilter;

mod config;
mod console;
mod gate;
mod sched;
mod supervisor;
mod usage;
mod vision;
mod worker;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// Without arguments this is the supervisor: it creates the control
/// plane, launches one child per pipeline stage and serves the
/// interactive console. With a role argument it becomes that stage.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    match std::env::args().nth(1).as_deref() {
        None | Some("supervise") => supervisor::run().await,
        Some("capture") => worker::capture::run().await,
        Some("detect") => worker::detect::run().await,
        Some("render") => worker::render::run().await,
        Some(other) => anyhow::bail!(
            "unknown role {:?} (expected capture, detect or render)",
            other
        ),
    }
}
