//! Timeout scaling, mediated through a small clock abstraction instead of
//! every worker reading the raw multiplier out of shared state.
//!
//! This is the §9 design-note improvement implemented rather than left as
//! a suggestion: workers ask the clock to scale a `Duration` or to sleep a
//! scaled amount; only [`crate::workers::emulator::EmulatorManager`] ever
//! sets the multiplier.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Multiplier applied to `QemuUp` and `NetworkUp` deadlines when hardware
/// acceleration is unavailable and not forced on. `Stop`'s budget never
/// scales.
#[derive(Debug, Clone)]
pub struct ScaledClock {
    multiplier: Arc<AtomicU32>,
}

impl ScaledClock {
    pub fn new() -> Self {
        Self {
            multiplier: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Set the multiplier. Invariant: called at most once per run, by the
    /// Emulator Manager, before `NetworkUp` is entered.
    pub fn set_multiplier(&self, value: u32) {
        self.multiplier.store(value, Ordering::SeqCst);
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier.load(Ordering::SeqCst)
    }

    /// Scale a base duration by the current multiplier.
    pub fn scaled(&self, base: Duration) -> Duration {
        base * self.multiplier()
    }

    /// Sleep for `base`, scaled by the current multiplier.
    pub async fn sleep_scaled(&self, base: Duration) {
        tokio::time::sleep(self.scaled(base)).await;
    }
}

impl Default for ScaledClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_linearly_with_multiplier() {
        let clock = ScaledClock::new();
        assert_eq!(clock.scaled(Duration::from_secs(10)), Duration::from_secs(10));
        clock.set_multiplier(5);
        assert_eq!(clock.scaled(Duration::from_secs(10)), Duration::from_secs(50));
    }

    #[test]
    fn default_multiplier_is_one() {
        let clock = ScaledClock::default();
        assert_eq!(clock.multiplier(), 1);
    }
}
