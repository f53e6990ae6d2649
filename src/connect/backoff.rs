use std::time::Duration;

/// Delay before a failed candidate gets its next chance. The delay grows linearly with the
///  number of faults so that a proxy that keeps failing is probed less and less often, but it
///  is never given up on while the connect is still running.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    throttle: Duration,
}

impl LinearBackoff {
    pub fn new(throttle: Duration) -> LinearBackoff {
        LinearBackoff { throttle }
    }

    #[must_use]
    pub fn delay(&self, fault_count: u32) -> Duration {
        self.throttle.saturating_mul(fault_count.saturating_add(1))
    }
}
