use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_LIMIT: u32 = 5;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Restart budget for one supervised child.
///
/// Each admitted restart doubles the gap to the next one
/// (`interval * 2^count`); once `limit` restarts have fired the limiter
/// refuses until the next periodic [`Limiter::reset`].
#[derive(Debug)]
pub struct Limiter {
    limit: u32,
    interval: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LimiterState {
    count: u32,
    last_fire: Option<Instant>,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_LIMIT, DEFAULT_INTERVAL)
    }

    fn with_params(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Earliest instant the next restart may fire.
    ///
    /// A limiter that has never fired is ready immediately.
    pub fn next_at(&self) -> Instant {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::due(&st, self.interval)
    }

    fn due(st: &LimiterState, interval: Duration) -> Instant {
        match st.last_fire {
            None => Instant::now(),
            Some(last) => last + interval * (1u32 << st.count),
        }
    }

    /// Admit one restart attempt. Succeeds iff the exponential delay has
    /// elapsed and the budget is not exhausted; on success the count and the
    /// fire time advance atomically.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let due = Self::due(&st, self.interval);
        let now = Instant::now();
        if now < due {
            return false;
        }
        if st.count + 1 > self.limit {
            return false;
        }
        st.count += 1;
        st.last_fire = Some(now);
        true
    }

    /// Re-arm the limiter. Does not disturb delays already computed from the
    /// previous state.
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.count = 0;
        st.last_fire = None;
    }

    /// Restarts admitted since the last reset.
    pub fn count(&self) -> u32 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_at(count: u32, last_fire: Option<Instant>) -> Limiter {
        let l = Limiter::new();
        {
            let mut st = l.state.lock().unwrap();
            st.count = count;
            st.last_fire = last_fire;
        }
        l
    }

    #[test]
    fn next_is_now_when_never_fired() {
        let l = limiter_at(0, None);
        let now = Instant::now();
        let next = l.next_at();
        assert!(next <= now + Duration::from_millis(1));
    }

    #[test]
    fn next_doubles_with_count() {
        let t = Instant::now();
        for (count, secs) in [(0u32, 1u64), (1, 2), (3, 8)] {
            let l = limiter_at(count, Some(t));
            assert_eq!(l.next_at(), t + Duration::from_secs(secs));
        }
    }

    #[test]
    fn acquire_refused_before_delay_elapses() {
        let l = limiter_at(1, Some(Instant::now()));
        // next_at is ~2s out; an immediate acquire must fail.
        assert!(!l.try_acquire());
        assert_eq!(l.count(), 1);
    }

    #[test]
    fn acquire_refused_at_limit_regardless_of_time() {
        let past = Instant::now() - Duration::from_secs(3600);
        let l = limiter_at(5, Some(past));
        assert!(!l.try_acquire());
    }

    #[test]
    fn acquire_advances_count_and_fire_time() {
        let l = limiter_at(0, None);
        assert!(l.try_acquire());
        assert_eq!(l.count(), 1);
        assert!(l.state.lock().unwrap().last_fire.is_some());
        // Second immediate acquire must be gated by the 2s gap.
        assert!(!l.try_acquire());
    }

    #[test]
    fn reset_rearms() {
        let l = limiter_at(5, Some(Instant::now()));
        l.reset();
        assert_eq!(l.count(), 0);
        assert!(l.try_acquire());
    }
}
