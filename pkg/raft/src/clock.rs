//! The clock adapter contract (spec §2, §6.4): randomized election timeouts
//! and a fixed heartbeat tick. "Arms a single state-timeout; the engine
//! consumes its expiry" (spec §2) -- in this crate that single timeout is
//! realized as a `Duration` the `Server` actor loop races against its event
//! queue (`tokio::select!`); re-arming is simply recomputing that duration
//! on the next loop iteration, which is how "any timer is implicitly
//! cancelled by the next arm" (spec §5) falls out for free.

use std::time::Duration;

use rand::Rng;

/// Heartbeat interval, fixed (spec §6.4).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(75);

pub trait Clock: Send + Sync {
    /// 150 + rand(150) ms (spec §6.4).
    fn follower_election_timeout(&self) -> Duration;

    /// 15 + rand(15) ms (spec §6.4).
    fn candidate_election_timeout(&self) -> Duration;

    /// Fixed heartbeat interval. A method (not just the `HEARTBEAT_INTERVAL`
    /// constant) so tests can shrink it without touching wall-clock time.
    fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }
}

/// The real clock: a fresh PRNG draw per call, per spec §9's note to "use a
/// PRNG seeded per instance."
#[derive(Default)]
pub struct RandomClock;

impl Clock for RandomClock {
    fn follower_election_timeout(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..150);
        Duration::from_millis(150 + jitter)
    }

    fn candidate_election_timeout(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..15);
        Duration::from_millis(15 + jitter)
    }
}

/// A scripted clock for deterministic tests: returns a fixed duration
/// regardless of how many times it's asked, so that test traces are
/// reproducible. Pair with `#[tokio::test(start_paused = true)]` and
/// `tokio::time::advance` to drive timers without wall-clock delay.
pub struct ScriptedClock {
    pub follower_timeout: Duration,
    pub candidate_timeout: Duration,
    pub heartbeat: Duration,
}

impl Default for ScriptedClock {
    fn default() -> Self {
        ScriptedClock {
            follower_timeout: Duration::from_millis(150),
            candidate_timeout: Duration::from_millis(15),
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }
}

impl Clock for ScriptedClock {
    fn follower_election_timeout(&self) -> Duration {
        self.follower_timeout
    }

    fn candidate_election_timeout(&self) -> Duration {
        self.candidate_timeout
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }
}
