use serde::Serialize;

/// Consecutive failures that latch a device into the error state.
pub const STICKY_FAILURES: i32 = 5;

const IN_ERROR: i32 = 1;

/// Per-device connection health. `0` is healthy, negative values count recent
/// failures, and `1` is the sticky error state that only a success clears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LinkHealth(i32);

impl LinkHealth {
    pub fn value(self) -> i32 {
        self.0
    }

    pub fn is_sticky(self) -> bool {
        self.0 == IN_ERROR
    }

    pub fn record_success(&mut self) {
        self.0 = 0;
    }

    pub fn record_failure(&mut self) -> bool {
        if self.is_sticky() {
            return false;
        }
        self.0 -= 1;
        if self.0 <= -STICKY_FAILURES {
            self.0 = IN_ERROR;
            return true;
        }
        false
    }

    pub fn record(&mut self, ok: bool) -> bool {
        if ok {
            self.record_success();
            false
        } else {
            self.record_failure()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_after_exactly_five_failures() {
        let mut health = LinkHealth::default();
        for _ in 0..4 {
            assert!(!health.record_failure());
            assert!(!health.is_sticky());
        }
        assert_eq!(health.value(), -4);

        assert!(health.record_failure());
        assert!(health.is_sticky());

        assert!(!health.record_failure());
        assert_eq!(health.value(), 1);
    }

    #[test]
    fn success_clears_sticky_state() {
        let mut health = LinkHealth::default();
        for _ in 0..5 {
            health.record_failure();
        }

        health.record(true);

        assert_eq!(health, LinkHealth::default());
    }
}
