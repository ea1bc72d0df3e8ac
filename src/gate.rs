use std::time::{Duration, Instant};

/// Throttle evaluated before every frame publish. A frame is accepted
/// when at least `interval - tolerance` has passed since the last
/// accepted frame; rejected frames are discarded, never queued. The
/// interval derives from the configured fps cap and can be retuned at
/// runtime; a retune affects the next evaluation, already-accepted
/// frames are never reconsidered.
pub struct FrameRateGate {
    interval: Duration,
    tolerance: Duration,
    last_accepted: Option<Instant>,
}

impl FrameRateGate {
    pub fn new(fps: u32, tolerance: Duration) -> Self {
        Self {
            interval: interval_for(fps),
            tolerance,
            last_accepted: None,
        }
    }

    /// The first frame is always accepted.
    pub fn should_accept(&self, now: Instant) -> bool {
        match self.last_accepted {
            None => true,
            Some(prev) => {
                now.duration_since(prev) >= self.interval.saturating_sub(self.tolerance)
            }
        }
    }

    pub fn mark_accepted(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.interval = interval_for(fps);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_gate(gate: &mut FrameRateGate, arrivals_ms: &[u64]) -> Vec<u64> {
        let base = Instant::now();
        let mut accepted = Vec::new();
        for &ms in arrivals_ms {
            let now = base + Duration::from_millis(ms);
            if gate.should_accept(now) {
                gate.mark_accepted(now);
                accepted.push(ms);
            }
        }
        accepted
    }

    #[test]
    fn accepts_first_frame_and_spaces_the_rest() {
        // 30 fps, 5 ms tolerance: threshold is ~28.3 ms since the last
        // accepted frame
        let mut gate = FrameRateGate::new(30, Duration::from_millis(5));
        let accepted = run_gate(&mut gate, &[0, 10, 20, 30, 45, 63]);
        assert_eq!(accepted, vec![0, 30, 63]);
    }

    #[test]
    fn tolerance_admits_slightly_early_arrivals() {
        let mut gate = FrameRateGate::new(10, Duration::from_millis(5));
        // interval 100 ms; 96 ms is within tolerance, 94 ms is not
        assert_eq!(run_gate(&mut gate, &[0, 94, 96]), vec![0, 96]);
    }

    #[test]
    fn retune_applies_to_the_next_evaluation() {
        let mut gate = FrameRateGate::new(10, Duration::ZERO);
        let base = Instant::now();
        assert!(gate.should_accept(base));
        gate.mark_accepted(base);

        let early = base + Duration::from_millis(40);
        assert!(!gate.should_accept(early));
        gate.set_fps(30);
        assert!(gate.should_accept(early));
    }
}
