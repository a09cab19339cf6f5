//! A restart-on-touch deadline, used by the Session Controller (§4.H, the
//! `T_session` overall session deadline) and by the MCP sub-client's idle
//! check (§4.E session refresh margin).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            expires_at: Instant::now() + duration,
        }
    }

    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn touch(&mut self, duration: Duration) {
        self.expires_at = Instant::now() + duration;
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deadline_has_not_elapsed() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.has_elapsed());
    }

    #[test]
    fn zero_duration_elapses_immediately() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.has_elapsed());
    }

    #[test]
    fn touch_extends_the_deadline() {
        let mut d = Deadline::after(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(15));
        assert!(d.has_elapsed());
        d.touch(Duration::from_secs(60));
        assert!(!d.has_elapsed());
    }
}
