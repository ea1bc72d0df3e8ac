use std::fmt::{Display, Formatter};

use nix::errno::Errno;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Linux scheduling policies the console can assign to a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Other,
    Batch,
    Idle,
    Fifo,
    RoundRobin,
}

impl Policy {
    pub fn to_raw(self) -> libc::c_int {
        match self {
            Policy::Other => libc::SCHED_OTHER,
            Policy::Batch => libc::SCHED_BATCH,
            Policy::Idle => libc::SCHED_IDLE,
            Policy::Fifo => libc::SCHED_FIFO,
            Policy::RoundRobin => libc::SCHED_RR,
        }
    }

    pub fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            libc::SCHED_OTHER => Some(Policy::Other),
            libc::SCHED_BATCH => Some(Policy::Batch),
            libc::SCHED_IDLE => Some(Policy::Idle),
            libc::SCHED_FIFO => Some(Policy::Fifo),
            libc::SCHED_RR => Some(Policy::RoundRobin),
            _ => None,
        }
    }

    pub fn is_realtime(self) -> bool {
        matches!(self, Policy::Fifo | Policy::RoundRobin)
    }

    /// Valid static priority range. Non-realtime policies only accept
    /// priority 0.
    pub fn priority_range(self) -> (i32, i32) {
        if !self.is_realtime() {
            return (0, 0);
        }
        let raw = self.to_raw();
        unsafe {
            (
                libc::sched_get_priority_min(raw),
                libc::sched_get_priority_max(raw),
            )
        }
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Policy::Other => "standard",
            Policy::Batch => "batch",
            Policy::Idle => "idle",
            Policy::Fifo => "fifo",
            Policy::RoundRobin => "round-robin",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("no cores given")]
    EmptyCoreSet,
    #[error("core {core} outside the available range 0..{available}")]
    InvalidCore { core: usize, available: usize },
    #[error("priority {priority} outside the {policy} range {min}..={max}")]
    InvalidPriority {
        policy: Policy,
        priority: i32,
        min: i32,
        max: i32,
    },
    #[error("kernel reported unknown scheduling policy {0}")]
    UnknownPolicy(i32),
    #[error(transparent)]
    Os(#[from] Errno),
}

pub fn available_cores() -> usize {
    num_cpus::get()
}

/// Pin `pid` to exactly `cores`. Every core is validated against the
/// machine before any syscall, so a bad set leaves the previous
/// affinity untouched.
pub fn set_affinity(pid: u32, cores: &[usize]) -> Result<(), SchedError> {
    if cores.is_empty() {
        return Err(SchedError::EmptyCoreSet);
    }
    let available = available_cores();
    if let Some(&core) = cores.iter().find(|&&c| c >= available) {
        return Err(SchedError::InvalidCore { core, available });
    }
    let mut set = CpuSet::new();
    for &core in cores {
        set.set(core)?;
    }
    sched_setaffinity(Pid::from_raw(pid as libc::pid_t), &set)?;
    Ok(())
}

pub fn get_affinity(pid: u32) -> Result<Vec<usize>, SchedError> {
    let set = sched_getaffinity(Pid::from_raw(pid as libc::pid_t))?;
    let mut cores = Vec::new();
    for core in 0..CpuSet::count() {
        if set.is_set(core)? {
            cores.push(core);
        }
    }
    Ok(cores)
}

/// Switch `pid` to `policy`. Realtime policies take the given static
/// priority after validating it against the policy's range; the others
/// always run at priority 0 and any other request is rejected.
pub fn set_policy(pid: u32, policy: Policy, priority: i32) -> Result<(), SchedError> {
    let (min, max) = policy.priority_range();
    if priority < min || priority > max {
        return Err(SchedError::InvalidPriority {
            policy,
            priority,
            min,
            max,
        });
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(pid as libc::pid_t, policy.to_raw(), &param) };
    if rc == -1 {
        return Err(Errno::last().into());
    }
    Ok(())
}

pub fn get_policy(pid: u32) -> Result<Policy, SchedError> {
    let raw = unsafe { libc::sched_getscheduler(pid as libc::pid_t) };
    if raw == -1 {
        return Err(Errno::last().into());
    }
    Policy::from_raw(raw).ok_or(SchedError::UnknownPolicy(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_codes_round_trip() {
        for policy in [
            Policy::Other,
            Policy::Batch,
            Policy::Idle,
            Policy::Fifo,
            Policy::RoundRobin,
        ] {
            assert_eq!(Policy::from_raw(policy.to_raw()), Some(policy));
        }
    }

    #[test]
    fn nonexistent_core_is_rejected_without_touching_affinity() {
        // pid 0: the calling thread, so other tests are unaffected
        let before = get_affinity(0).unwrap();
        let bogus = available_cores() + 64;
        match set_affinity(0, &[bogus]) {
            Err(SchedError::InvalidCore { core, .. }) => assert_eq!(core, bogus),
            other => panic!("expected InvalidCore, got {:?}", other),
        }
        assert_eq!(get_affinity(0).unwrap(), before);
    }

    #[test]
    fn empty_core_set_is_rejected() {
        assert!(matches!(set_affinity(0, &[]), Err(SchedError::EmptyCoreSet)));
    }

    #[test]
    fn affinity_round_trips_on_the_calling_thread() {
        let before = get_affinity(0).unwrap();
        if before.len() < 2 {
            // already pinned to one core, nothing to narrow
            return;
        }
        let target = vec![before[0], before[1]];
        set_affinity(0, &target).unwrap();
        assert_eq!(get_affinity(0).unwrap(), target);
        set_affinity(0, &before).unwrap();
    }

    #[test]
    fn out_of_range_realtime_priority_is_rejected() {
        let (_, max) = Policy::Fifo.priority_range();
        assert!(matches!(
            set_policy(std::process::id(), Policy::Fifo, max + 1),
            Err(SchedError::InvalidPriority { .. })
        ));
    }

    #[test]
    fn nonzero_priority_on_standard_policy_is_rejected() {
        assert!(matches!(
            set_policy(std::process::id(), Policy::Other, 5),
            Err(SchedError::InvalidPriority { min: 0, max: 0, .. })
        ));
    }
}
