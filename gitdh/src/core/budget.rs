//! Time budget shared by the commands of one branch deployment.

use std::time::{Duration, Instant};

/// Longest budget a deadline is computed for; larger timeouts act as "no
/// practical deadline".
pub const MAX_BUDGET: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deadline `budget` from now, clamped to [`MAX_BUDGET`].
pub fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget.min(MAX_BUDGET)).unwrap_or(now)
}

/// Time left until `deadline`, `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_deadline_has_budget() {
        let remaining = remaining_budget(Instant::now() + Duration::from_secs(60)).expect("budget");
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn huge_budget_is_clamped_instead_of_overflowing() {
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        let remaining = remaining_budget(deadline).expect("budget");
        assert!(remaining > MAX_BUDGET - Duration::from_secs(60));
        assert!(remaining <= MAX_BUDGET);
    }

    #[test]
    fn past_deadline_is_exhausted() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(remaining_budget(deadline), None);
    }
}
