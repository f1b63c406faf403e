// Additive-increase / multiplicative-decrease window, after the Reno description in:
// https://intronetworks.cs.luc.edu/current/html/reno.html
//
// Only the AIMD core is kept. There is no slow start and no ssthresh; peers are trusted, so the
// window may grow without bound unless a maximum is configured.

/// Adaptive sizing state for a single peer.
#[derive(Clone, Debug)]
pub struct FlowState {
    window_size: usize,
    window_size_max: Option<usize>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_adjustment_ms: u64,
}

impl FlowState {
    pub fn new(initial_window_size: usize, window_size_max: Option<usize>) -> Self {
        assert!(initial_window_size >= 1);

        Self {
            window_size: initial_window_size,
            window_size_max,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_adjustment_ms: 0,
        }
    }

    /// An acknowledgment arrived in time.
    pub fn on_success(&mut self, now_ms: u64) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;

        let grown = self.window_size.saturating_add(1);
        self.window_size = match self.window_size_max {
            Some(max) => grown.min(max),
            None => grown,
        };
        self.last_adjustment_ms = now_ms;
    }

    /// A transmission timed out.
    pub fn on_failure(&mut self, now_ms: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;

        // Never below one, so a call can always be admitted
        self.window_size = (self.window_size / 2).max(1);
        self.last_adjustment_ms = now_ms;
    }

    /// Returns true if another call may be sent while `outstanding` calls are unfinished.
    pub fn admits(&self, outstanding: usize) -> bool {
        outstanding < self.window_size
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_adjustment_ms(&self) -> u64 {
        self.last_adjustment_ms
    }
}

/// Advisory receive-buffer hint for one peer. The first request is sized at the base; each
/// later request grows the hint by the base size until the ceiling is reached, then it starts
/// over from the base.
#[derive(Clone, Debug)]
pub struct BufferSizer {
    base: usize,
    max: usize,
    current: usize,
    seen: bool,
}

impl BufferSizer {
    pub fn new(base: usize, max: usize) -> Self {
        assert!(base > 0);
        assert!(max >= base);

        Self {
            base,
            max,
            current: base,
            seen: false,
        }
    }

    /// Adjusts the hint for a new request and returns it.
    pub fn on_request(&mut self) -> usize {
        if !self.seen {
            self.seen = true;
        } else if self.current < self.max {
            self.current = (self.current + self.base).min(self.max);
        } else {
            self.current = self.base;
        }

        self.current
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_increase() {
        let mut flow = FlowState::new(1, None);

        for _ in 0..3 {
            flow.on_success(0);
        }

        assert_eq!(flow.window_size(), 4);
        assert_eq!(flow.consecutive_successes(), 3);
    }

    #[test]
    fn multiplicative_decrease_floors_at_one() {
        let mut flow = FlowState::new(1, None);

        for _ in 0..9 {
            flow.on_success(0);
        }
        assert_eq!(flow.window_size(), 10);

        flow.on_failure(5);
        assert_eq!(flow.window_size(), 5);
        assert_eq!(flow.last_adjustment_ms(), 5);

        flow.on_failure(6);
        assert_eq!(flow.window_size(), 2);

        for _ in 0..100 {
            flow.on_failure(7);
        }
        assert_eq!(flow.window_size(), 1);
        assert_eq!(flow.consecutive_failures(), 102);
        assert_eq!(flow.consecutive_successes(), 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut flow = FlowState::new(4, None);

        flow.on_failure(0);
        flow.on_failure(0);
        flow.on_success(0);

        assert_eq!(flow.consecutive_failures(), 0);
        assert_eq!(flow.consecutive_successes(), 1);
        assert_eq!(flow.window_size(), 2);
    }

    #[test]
    fn configured_ceiling() {
        let mut flow = FlowState::new(1, Some(3));

        for _ in 0..10 {
            flow.on_success(0);
        }

        assert_eq!(flow.window_size(), 3);
        assert!(flow.admits(2));
        assert!(!flow.admits(3));
    }

    #[test]
    fn buffer_grows_then_resets() {
        let mut sizer = BufferSizer::new(1024, 4096);
        assert_eq!(sizer.current(), 1024);

        let hints: Vec<usize> = (0..6).map(|_| sizer.on_request()).collect();

        assert_eq!(hints, vec![1024, 2048, 3072, 4096, 1024, 2048]);
    }
}
