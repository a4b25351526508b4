//! Process-wide local unique IDs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

// Seconds between the Unix epoch and 2020-01-01T00:00:00Z.
const EPOCH_OFFSET_SECS: u64 = 1_577_836_800;

// Seeded with seconds since 2020-01-01 to reduce collisions of IDs between
// process restarts. Not a durability guarantee.
static NEXT: LazyLock<AtomicU64> = LazyLock::new(|| {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(EPOCH_OFFSET_SECS))
        .unwrap_or(0);
    AtomicU64::new(secs)
});

/// Generate a new, process-wide unique ID.
pub fn next_luid() -> u64 {
    NEXT.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_and_unique() {
        let a = next_luid();
        let b = next_luid();
        let c = next_luid();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_nonzero() {
        assert_ne!(next_luid(), 0);
    }
}
