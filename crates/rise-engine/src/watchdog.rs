//! Watchdog (spec §4.I): periodic ping/pong liveness check per plugin
//! instance.
//!
//! Grounded directly on `CircuitBreaker` (`rocode-plugin::circuit_breaker`)
//! for the miss-counting/trip shape, narrowed to this spec's exact rule:
//! threshold fixed at 2 misses and no cooldown — a tripped watchdog does
//! not self-heal on a timer, the plugin must be respawned by the engine.

#[derive(Debug)]
pub struct MissCounter {
    missed: u32,
    threshold: u32,
}

impl MissCounter {
    pub fn new(threshold: u32) -> Self {
        Self { missed: 0, threshold }
    }

    /// A ping tick elapsed with no pong (or a late pong arrived after the
    /// next tick was already scheduled). Returns true once `threshold` is
    /// reached — the caller should treat this as terminal and not call
    /// `record_miss` again without an intervening respawn.
    pub fn record_miss(&mut self) -> bool {
        self.missed += 1;
        self.is_tripped()
    }

    /// A pong arrived in time; the plugin is alive, so any prior misses are
    /// forgiven.
    pub fn record_pong(&mut self) {
        self.missed = 0;
    }

    pub fn is_tripped(&self) -> bool {
        self.missed >= self.threshold
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

impl Default for MissCounter {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_two_misses() {
        let mut counter = MissCounter::default();
        assert!(!counter.record_miss());
        assert!(counter.record_miss());
        assert!(counter.is_tripped());
    }

    #[test]
    fn a_pong_resets_the_miss_count() {
        let mut counter = MissCounter::default();
        counter.record_miss();
        counter.record_pong();
        assert_eq!(counter.missed(), 0);
        assert!(!counter.is_tripped());
    }

    #[test]
    fn does_not_self_heal_once_tripped_without_an_explicit_reset() {
        let mut counter = MissCounter::default();
        counter.record_miss();
        counter.record_miss();
        assert!(counter.is_tripped());
        // no cooldown timer here: still tripped until `record_pong` is
        // called explicitly, which only happens after a respawn answers
        // a fresh ping.
        assert!(counter.is_tripped());
    }
}
