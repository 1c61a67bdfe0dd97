//! Budget knobs for the in-crate test suites.
//!
//! Two suite families scale differently: the proptest shadow-model suites
//! on the queue are sized by case count, the threaded stress tests by
//! element volume. Local runs get trimmed budgets for fast iteration; CI
//! runs each suite's full default; either can be overridden explicitly:
//!
//! | Variable | Applies to |
//! |----------|------------|
//! | `PROPTEST_CASES` | [`proptest_cases`] |
//! | `STRESS_ELEMENTS` | [`stress_elements`] |

use std::env;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

fn on_ci() -> bool {
    env::var_os("CI").is_some()
}

/// Case budget for a proptest model suite.
pub fn proptest_cases(suite_default: u32) -> u32 {
    match env_parse::<u32>("PROPTEST_CASES") {
        Some(cases) => cases.max(1),
        None if on_ci() => suite_default.max(1),
        None => suite_default.clamp(1, 8),
    }
}

/// Element volume for a threaded stress test. Local runs use a quarter of
/// the suite's default so contention paths are still exercised without
/// dominating `cargo test` time.
pub fn stress_elements(suite_default: usize) -> usize {
    match env_parse::<usize>("STRESS_ELEMENTS") {
        Some(elements) => elements.max(1),
        None if on_ci() => suite_default.max(1),
        None => (suite_default / 4).max(1),
    }
}
