/**
 * MUTATION RATE LIMITER - Fixed-window write throttle per identity
 *
 * ROLE :
 * Every mutating call (triage, notes, fix operations) is counted per
 * (user, role) pair. Past the ceiling within the current window the call is
 * rejected with `RateLimited`.
 *
 * FONCTIONNEMENT :
 * - bucket created lazily on first call with reset_at = now + window
 * - window reset is lazy: the first call after reset_at starts a new window
 * - fixed window, not sliding: bursts straddling a boundary are accepted
 */

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::clock::{duration_ms, SharedClock};
use crate::error::{OpsError, OpsResult};
use crate::identity::Identity;
use crate::state::{new_state, Shared};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateBucket {
    pub identity_key: String,
    pub count: u32,
    pub reset_at: i64,
}

pub struct MutationRateLimiter {
    buckets: Shared<HashMap<String, RateBucket>>,
    ceiling: u32,
    window: Duration,
    clock: SharedClock,
}

impl MutationRateLimiter {
    pub fn new(ceiling: u32, window: Duration, clock: SharedClock) -> Self {
        Self { buckets: new_state(HashMap::new()), ceiling, window, clock }
    }

    pub fn check(&self, identity: &Identity) -> OpsResult<()> {
        let key = identity.bucket_key();
        let now = self.clock.now_ms();
        let window_ms = duration_ms(self.window);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| RateBucket {
            identity_key: key.clone(),
            count: 0,
            reset_at: now + window_ms,
        });
        if now > bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + window_ms;
        }
        bucket.count += 1;

        if bucket.count > self.ceiling {
            warn!("[ratelimit] {} over {} writes/window", key, self.ceiling);
            return Err(OpsError::RateLimited);
        }
        Ok(())
    }

    pub fn bucket(&self, identity: &Identity) -> Option<RateBucket> {
        self.buckets.lock().get(&identity.bucket_key()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Role;
    use std::sync::Arc;

    fn limiter() -> (MutationRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (MutationRateLimiter::new(40, Duration::from_secs(60), clock.clone()), clock)
    }

    #[test]
    fn test_41st_call_in_window_is_rejected() {
        let (limiter, clock) = limiter();
        let who = Identity::new("alice", Role::Operator);
        for _ in 0..40 {
            limiter.check(&who).unwrap();
            clock.advance(Duration::from_millis(500));
        }
        assert_eq!(limiter.check(&who), Err(OpsError::RateLimited));
    }

    #[test]
    fn test_window_resets_lazily() {
        let (limiter, clock) = limiter();
        let who = Identity::new("alice", Role::Operator);
        for _ in 0..41 {
            let _ = limiter.check(&who);
        }
        assert_eq!(limiter.check(&who), Err(OpsError::RateLimited));

        // reset_at itself is still inside the window
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.check(&who), Err(OpsError::RateLimited));

        clock.advance(Duration::from_millis(1));
        assert!(limiter.check(&who).is_ok());
        assert_eq!(limiter.bucket(&who).unwrap().count, 1);
    }

    #[test]
    fn test_buckets_are_per_user_and_role() {
        let (limiter, _clock) = limiter();
        let alice = Identity::new("alice", Role::Operator);
        for _ in 0..41 {
            let _ = limiter.check(&alice);
        }
        assert!(limiter.check(&Identity::new("alice", Role::Admin)).is_ok());
        assert!(limiter.check(&Identity::new("bob", Role::Operator)).is_ok());
    }
}
