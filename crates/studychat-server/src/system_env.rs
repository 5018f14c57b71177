//! Production Environment implementation using system time.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::env::Environment;

/// Production environment reading the system wall clock.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    /// A clock set before 1970 reads as 0, which the sequencer rejects as
    /// predating the id epoch.
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use studychat_proto::id::ID_EPOCH_MILLIS;

    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.wall_clock_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = env.wall_clock_millis();

        assert!(t2 > t1, "Time should advance");
        assert!(t1 > ID_EPOCH_MILLIS);
    }
}
