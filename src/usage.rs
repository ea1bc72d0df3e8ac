use std::time::{Duration, Instant};

/// Process-scoped CPU accounting: the share of wall time this process
/// (all of its threads, none of its siblings) spent on-CPU since the
/// meter was started. Workers start one at entry and report it on the
/// way out, whether the exit was signalled or self-initiated.
pub struct UsageMeter {
    wall_start: Instant,
    cpu_start: Duration,
}

impl UsageMeter {
    pub fn start() -> Self {
        Self {
            wall_start: Instant::now(),
            cpu_start: process_cpu_time(),
        }
    }

    pub fn wall_elapsed(&self) -> Duration {
        self.wall_start.elapsed()
    }

    pub fn cpu_elapsed(&self) -> Duration {
        process_cpu_time().saturating_sub(self.cpu_start)
    }

    pub fn cpu_percent(&self) -> f64 {
        let wall = self.wall_elapsed().as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        self.cpu_elapsed().as_secs_f64() / wall * 100.0
    }

    pub fn report(&self, role: &str) {
        log::info!(
            "{} pid {} used {:.1}% cpu over {:.1}s",
            role,
            std::process::id(),
            self.cpu_percent(),
            self.wall_elapsed().as_secs_f64()
        );
    }
}

fn process_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        // diagnostic only, a zero reading is better than dying for it
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_work_registers_as_cpu_time() {
        let meter = UsageMeter::start();
        let mut acc = 0u64;
        for i in 0..5_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        assert_ne!(acc, u64::MAX);
        assert!(meter.cpu_elapsed() > Duration::ZERO);
        let pct = meter.cpu_percent();
        assert!(pct.is_finite() && pct >= 0.0);
    }
}
