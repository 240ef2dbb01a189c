use std::time::{Duration, Instant};

/// Blocks the current task for `ms` milliseconds.
#[cfg(target_os = "espidf")]
pub fn sleep(ms: u32) {
    esp_idf_hal::delay::FreeRtos::delay_ms(ms);
}

/// Blocks the current thread for `ms` milliseconds.
#[cfg(not(target_os = "espidf"))]
pub fn sleep(ms: u32) {
    std::thread::sleep(Duration::from_millis(u64::from(ms)));
}

/// Converts a duration to whole milliseconds, saturating at `u32::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// A point in time after which a blocking operation must give up.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Starts a deadline that expires `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Returns `true` once the budget has been spent.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    /// Time spent since the deadline was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_is_expired_immediately() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u32::MAX);
    }
}
