//! Interactive control surface of the supervisor. Plain blocking
//! stdin/stdout, served from a dedicated blocking task; returns when
//! the operator asks for a full shutdown or stdin closes.

use std::io::{self, BufRead};
use std::sync::{Arc, Mutex};

use shm_bus::control::RedactionMode;

use crate::sched::{self, Policy};
use crate::supervisor::{Role, Supervisor, WorkerState};

type Lines<'a> = io::Lines<io::StdinLock<'a>>;

pub fn run(supervisor: &Arc<Mutex<Supervisor>>) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print_status(supervisor);
        println!("1. set redaction mode");
        println!("2. set worker core affinity");
        println!("3. set worker scheduling");
        println!("4. set frame rate cap");
        println!("5. terminate all and exit");
        let Some(choice) = next_line(&mut lines)? else {
            // stdin closed: treat like an exit request
            return Ok(());
        };
        let outcome = match choice.trim() {
            "1" => change_mode(supervisor, &mut lines),
            "2" => change_affinity(supervisor, &mut lines),
            "3" => change_scheduling(supervisor, &mut lines),
            "4" => change_fps(supervisor, &mut lines),
            "5" => return Ok(()),
            _ => {
                println!("invalid option, please choose 1-5");
                Ok(())
            }
        };
        // a refused tuning never takes the console down
        if let Err(e) = outcome {
            println!("error: {:#}", e);
        }
    }
}

fn print_status(supervisor: &Arc<Mutex<Supervisor>>) {
    let mut supervisor = supervisor.lock().unwrap_or_else(|e| e.into_inner());
    supervisor.refresh();
    println!();
    for worker in supervisor.workers() {
        let affinity = if worker.state == WorkerState::Running {
            format!("cores {:?}", worker.affinity)
        } else {
            String::new()
        };
        println!(
            "  {:<8} pid {:<7} {:<8} {} {} priority {}",
            worker.role.to_string(),
            worker.pid,
            worker.state.to_string(),
            affinity,
            worker.policy,
            worker.priority
        );
    }
}

fn next_line(lines: &mut Lines<'_>) -> anyhow::Result<Option<String>> {
    match lines.next() {
        None => Ok(None),
        Some(line) => Ok(Some(line?)),
    }
}

/// Re-prompt until the operator supplies something `parse` accepts, or
/// stdin closes.
fn prompt<T>(
    lines: &mut Lines<'_>,
    message: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> anyhow::Result<Option<T>> {
    loop {
        println!("{}", message);
        let Some(line) = next_line(lines)? else {
            return Ok(None);
        };
        match parse(line.trim()) {
            Some(value) => return Ok(Some(value)),
            None => println!("invalid input, try again"),
        }
    }
}

fn prompt_role(lines: &mut Lines<'_>) -> anyhow::Result<Option<Role>> {
    prompt(
        lines,
        "choose worker: 1. capture  2. detector  3. renderer",
        |s| match s {
            "1" => Some(Role::Capture),
            "2" => Some(Role::Detector),
            "3" => Some(Role::Renderer),
            _ => None,
        },
    )
}

fn change_mode(supervisor: &Arc<Mutex<Supervisor>>, lines: &mut Lines<'_>) -> anyhow::Result<()> {
    let Some(mode) = prompt(lines, "redaction mode: 0. fill  1. blur", |s| {
        s.parse().ok().and_then(RedactionMode::from_code)
    })?
    else {
        return Ok(());
    };
    supervisor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .send_mode(mode)?;
    println!("redaction mode command sent: {}", mode);
    Ok(())
}

fn change_fps(supervisor: &Arc<Mutex<Supervisor>>, lines: &mut Lines<'_>) -> anyhow::Result<()> {
    let Some(fps) = prompt(lines, "frame rate cap (frames per second, positive)", |s| {
        s.parse::<u32>().ok().filter(|&fps| fps > 0)
    })?
    else {
        return Ok(());
    };
    supervisor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .send_fps(fps)?;
    println!("frame rate command sent: {} fps", fps);
    Ok(())
}

fn change_affinity(
    supervisor: &Arc<Mutex<Supervisor>>,
    lines: &mut Lines<'_>,
) -> anyhow::Result<()> {
    let Some(role) = prompt_role(lines)? else {
        return Ok(());
    };
    let message = format!(
        "core ids, comma separated (0-{})",
        sched::available_cores().saturating_sub(1)
    );
    let Some(cores) = prompt(lines, &message, parse_core_list)? else {
        return Ok(());
    };
    supervisor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_affinity(role, &cores)?;
    println!("{} pinned to {:?}", role, cores);
    Ok(())
}

fn change_scheduling(
    supervisor: &Arc<Mutex<Supervisor>>,
    lines: &mut Lines<'_>,
) -> anyhow::Result<()> {
    let Some(role) = prompt_role(lines)? else {
        return Ok(());
    };
    let Some(policy) = prompt(
        lines,
        "policy: 1. standard  2. batch  3. idle  4. fifo  5. round-robin",
        |s| match s {
            "1" => Some(Policy::Other),
            "2" => Some(Policy::Batch),
            "3" => Some(Policy::Idle),
            "4" => Some(Policy::Fifo),
            "5" => Some(Policy::RoundRobin),
            _ => None,
        },
    )?
    else {
        return Ok(());
    };
    let priority = if policy.is_realtime() {
        let (min, max) = policy.priority_range();
        let message = format!("priority ({}-{})", min, max);
        match prompt(lines, &message, |s| s.parse::<i32>().ok())? {
            Some(priority) => priority,
            None => return Ok(()),
        }
    } else {
        0
    };
    supervisor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_scheduling(role, policy, priority)?;
    println!("{} scheduling set to {} priority {}", role, policy, priority);
    Ok(())
}

fn parse_core_list(raw: &str) -> Option<Vec<usize>> {
    let cores: Vec<usize> = raw
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    if cores.is_empty() {
        return None;
    }
    Some(cores)
}
