use std::fmt::{Display, Formatter};
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use shm_bus::control::{Command, ControlKind, ControlQueue, RedactionMode};
use shm_bus::names;
use shm_bus::rendezvous::{Rendezvous, READY_DEPTH};

use crate::config::{config, RedactdConfig};
use crate::console;
use crate::sched::{self, Policy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Capture,
    Detector,
    Renderer,
}

impl Role {
    /// Argument the worker process is launched with.
    fn arg(self) -> &'static str {
        match self {
            Role::Capture => "capture",
            Role::Detector => "detect",
            Role::Renderer => "render",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Capture => "capture",
            Role::Detector => "detector",
            Role::Renderer => "renderer",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One spawned worker plus the tuning last applied to it. Affinity and
/// policy are cached from the last successful call so the console can
/// show them without an extra syscall per redraw.
pub struct ProcessHandle {
    pub pid: u32,
    pub role: Role,
    pub state: WorkerState,
    pub affinity: Vec<usize>,
    pub policy: Policy,
    pub priority: i32,
    child: Child,
}

/// Parent of the three pipeline stages. Spawns them in dependency
/// order, relays console commands to the control queues, and tears
/// everything down at exit.
pub struct Supervisor {
    workers: Vec<ProcessHandle>,
    fps_commands: ControlQueue,
    mode_commands: ControlQueue,
}

impl Supervisor {
    fn new(fps_commands: ControlQueue, mode_commands: ControlQueue) -> Self {
        Self {
            workers: Vec::new(),
            fps_commands,
            mode_commands,
        }
    }

    /// Launch one worker: the current executable re-run with a role
    /// argument.
    fn spawn(&mut self, role: Role) -> anyhow::Result<()> {
        let exe = std::env::current_exe().context("could not locate own executable")?;
        let child = std::process::Command::new(exe)
            .arg(role.arg())
            .spawn()
            .with_context(|| format!("could not spawn the {} worker", role))?;
        let pid = child.id();
        let affinity = sched::get_affinity(pid).unwrap_or_default();
        let policy = sched::get_policy(pid).unwrap_or(Policy::Other);
        log::info!("{} worker running as pid {}", role, pid);
        self.workers.push(ProcessHandle {
            pid,
            role,
            state: WorkerState::Running,
            affinity,
            policy,
            priority: 0,
            child,
        });
        Ok(())
    }

    /// Reap state changes; a worker that exited on its own is marked
    /// stopped and excluded from further tuning.
    pub fn refresh(&mut self) {
        for worker in &mut self.workers {
            if worker.state != WorkerState::Running {
                continue;
            }
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    log::warn!(
                        "{} worker pid {} exited: {}",
                        worker.role,
                        worker.pid,
                        status
                    );
                    worker.state = WorkerState::Stopped;
                }
                Ok(None) => {}
                Err(e) => log::warn!("could not poll {} worker: {}", worker.role, e),
            }
        }
    }

    pub fn workers(&self) -> &[ProcessHandle] {
        &self.workers
    }

    fn running_mut(&mut self, role: Role) -> anyhow::Result<&mut ProcessHandle> {
        self.workers
            .iter_mut()
            .find(|w| w.role == role && w.state == WorkerState::Running)
            .ok_or_else(|| anyhow!("no running {} worker", role))
    }

    /// Pin a worker to a core set. The cache is updated only when the
    /// kernel accepted the change.
    pub fn set_affinity(&mut self, role: Role, cores: &[usize]) -> anyhow::Result<()> {
        let worker = self.running_mut(role)?;
        sched::set_affinity(worker.pid, cores)?;
        let mut cores = cores.to_vec();
        cores.sort_unstable();
        cores.dedup();
        log::info!("{} worker pinned to cores {:?}", role, cores);
        worker.affinity = cores;
        Ok(())
    }

    pub fn set_scheduling(&mut self, role: Role, policy: Policy, priority: i32) -> anyhow::Result<()> {
        let worker = self.running_mut(role)?;
        sched::set_policy(worker.pid, policy, priority)?;
        log::info!(
            "{} worker scheduling set to {} priority {}",
            role,
            policy,
            priority
        );
        worker.policy = policy;
        worker.priority = priority;
        Ok(())
    }

    pub fn send_fps(&self, fps: u32) -> anyhow::Result<()> {
        anyhow::ensure!(fps > 0, "frame rate cap must be positive");
        self.fps_commands
            .send(Command::SetFrameRateLimit(fps))
            .context("frame rate command not accepted")?;
        Ok(())
    }

    pub fn send_mode(&self, mode: RedactionMode) -> anyhow::Result<()> {
        self.mode_commands
            .send(Command::SetRedactionMode(mode))
            .context("redaction mode command not accepted")?;
        Ok(())
    }

    /// SIGTERM every running worker, then give each a short window to
    /// exit before the parent leaves.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            if worker.state != WorkerState::Running {
                continue;
            }
            log::info!("terminating {} worker pid {}", worker.role, worker.pid);
            if let Err(e) = kill(Pid::from_raw(worker.pid as libc::pid_t), Signal::SIGTERM) {
                log::warn!("could not signal {} worker: {}", worker.role, e);
            }
            worker.state = WorkerState::Stopped;
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        for worker in &mut self.workers {
            loop {
                match worker.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(25));
                    }
                    Ok(None) => {
                        log::warn!(
                            "{} worker pid {} did not exit in time",
                            worker.role,
                            worker.pid
                        );
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Supervisor entry point: build the control plane, launch the stages
/// in dependency order with a readiness handshake between each, then
/// serve the console until an exit is requested.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config();
    let ns = &cfg.namespace;

    ControlQueue::force_remove(ns, ControlKind::FrameRateLimit);
    ControlQueue::force_remove(ns, ControlKind::RedactionMode);
    Rendezvous::force_remove(ns, names::READY);
    let fps_commands = ControlQueue::create(ns, ControlKind::FrameRateLimit)?;
    let mode_commands = ControlQueue::create(ns, ControlKind::RedactionMode)?;
    let ready = Rendezvous::create(ns, names::READY, READY_DEPTH)?;

    let mut supervisor = Supervisor::new(fps_commands, mode_commands);
    if let Err(e) = launch(&mut supervisor, &ready, cfg) {
        supervisor.shutdown();
        remove_control_plane(ns);
        return Err(e);
    }
    log::info!("pipeline up, console ready");

    let supervisor = Arc::new(Mutex::new(supervisor));
    let console_supervisor = Arc::clone(&supervisor);
    let console = tokio::task::spawn_blocking(move || console::run(&console_supervisor));
    tokio::select! {
        res = console => res.context("console task panicked")??,
        _ = tokio::signal::ctrl_c() => log::info!("interrupt, terminating workers"),
    }

    supervisor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .shutdown();
    remove_control_plane(ns);
    // the console thread may still be parked on stdin
    std::process::exit(0);
}

fn launch(
    supervisor: &mut Supervisor,
    ready: &Rendezvous,
    cfg: &RedactdConfig,
) -> anyhow::Result<()> {
    supervisor.spawn(Role::Capture)?;
    ready
        .wait_timeout(cfg.ready_timeout)
        .context("capture worker never became ready")?;
    supervisor.spawn(Role::Detector)?;
    ready
        .wait_timeout(cfg.ready_timeout)
        .context("detector worker never became ready")?;
    supervisor.spawn(Role::Renderer)?;
    Ok(())
}

fn remove_control_plane(ns: &names::Namespace) {
    ControlQueue::force_remove(ns, ControlKind::FrameRateLimit);
    ControlQueue::force_remove(ns, ControlKind::RedactionMode);
    Rendezvous::force_remove(ns, names::READY);
}
