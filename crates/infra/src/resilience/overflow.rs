//! Disposition of submissions that admission control turned away.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use inferq_core::Priority;

use super::backpressure::BackpressureLevel;

/// Upper bound on any overflow delay.
pub const MAX_OVERFLOW_DELAY: Duration = Duration::from_millis(300_000);

/// What to do with a job that cannot be admitted immediately.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum OverflowAction {
    /// Accept, but hold the job for `delay_ms` before it becomes claimable.
    Delay { delay_ms: u64 },
    /// Accept at the next priority up.
    UpgradePriority,
    /// Refuse the submission.
    Reject,
}

/// Overflow policy table.
///
/// | level              | urgent  | high    | normal |
/// |--------------------|---------|---------|--------|
/// | `critical`         | upgrade | reject  | reject |
/// | `heavy`            | upgrade | upgrade | delay  |
/// | `moderate`         | delay   | delay   | delay  |
/// | `none` / `light`   | upgrade | delay   | delay  |
pub fn overflow_action(priority: Priority, level: BackpressureLevel) -> OverflowAction {
    let delay = || OverflowAction::Delay {
        delay_ms: overflow_delay(priority, level).as_millis() as u64,
    };

    match (level, priority) {
        (BackpressureLevel::Critical, Priority::Urgent) => OverflowAction::UpgradePriority,
        (BackpressureLevel::Critical, _) => OverflowAction::Reject,
        (BackpressureLevel::Heavy, Priority::Normal) => delay(),
        (BackpressureLevel::Heavy, _) => OverflowAction::UpgradePriority,
        (BackpressureLevel::Moderate, _) => delay(),
        (BackpressureLevel::None | BackpressureLevel::Light, Priority::Urgent) => {
            OverflowAction::UpgradePriority
        }
        (BackpressureLevel::None | BackpressureLevel::Light, _) => delay(),
    }
}

fn base_delay_ms(priority: Priority) -> f64 {
    match priority {
        Priority::Urgent => 5_000.0,
        Priority::High => 15_000.0,
        Priority::Normal => 30_000.0,
    }
}

fn level_multiplier(level: BackpressureLevel) -> f64 {
    match level {
        BackpressureLevel::None => 0.5,
        BackpressureLevel::Light => 1.0,
        BackpressureLevel::Moderate => 2.0,
        BackpressureLevel::Heavy => 4.0,
        BackpressureLevel::Critical => 8.0,
    }
}

/// `min(base[priority] * multiplier[level], 5 minutes)`.
pub fn overflow_delay(priority: Priority, level: BackpressureLevel) -> Duration {
    let ms = (base_delay_ms(priority) * level_multiplier(level)).min(MAX_OVERFLOW_DELAY.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn critical_rejects_all_but_urgent() {
        assert_eq!(
            overflow_action(Priority::Normal, BackpressureLevel::Critical),
            OverflowAction::Reject
        );
        assert_eq!(
            overflow_action(Priority::High, BackpressureLevel::Critical),
            OverflowAction::Reject
        );
        assert_eq!(
            overflow_action(Priority::Urgent, BackpressureLevel::Critical),
            OverflowAction::UpgradePriority
        );
    }

    #[test]
    fn heavy_delays_normal_and_upgrades_the_rest() {
        assert_eq!(
            overflow_action(Priority::Normal, BackpressureLevel::Heavy),
            OverflowAction::Delay { delay_ms: 120_000 }
        );
        assert_eq!(
            overflow_action(Priority::High, BackpressureLevel::Heavy),
            OverflowAction::UpgradePriority
        );
    }

    #[test]
    fn moderate_always_delays() {
        for priority in Priority::ALL {
            assert!(matches!(
                overflow_action(priority, BackpressureLevel::Moderate),
                OverflowAction::Delay { .. }
            ));
        }
    }

    #[test]
    fn calm_levels_upgrade_urgent_only() {
        for level in [BackpressureLevel::None, BackpressureLevel::Light] {
            assert_eq!(overflow_action(Priority::Urgent, level), OverflowAction::UpgradePriority);
            assert!(matches!(overflow_action(Priority::High, level), OverflowAction::Delay { .. }));
        }
    }

    #[test]
    fn delay_table() {
        assert_eq!(overflow_delay(Priority::Urgent, BackpressureLevel::None), Duration::from_millis(2_500));
        assert_eq!(overflow_delay(Priority::High, BackpressureLevel::Moderate), Duration::from_millis(30_000));
        assert_eq!(overflow_delay(Priority::Normal, BackpressureLevel::Critical), MAX_OVERFLOW_DELAY);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_five_minutes(p in 0usize..3, l in 0usize..5) {
            let delay = overflow_delay(Priority::ALL[p], BackpressureLevel::ALL[l]);
            prop_assert!(delay <= MAX_OVERFLOW_DELAY);
        }
    }
}
