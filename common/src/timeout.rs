use std::time::{Duration, Instant};

/// A deadline polled by loops that wait on another thread's progress.
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    /// Time left before the deadline, zero once expired.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.instant.elapsed())
    }

    /// Yields the current thread once, or fails if the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            Err(())
        } else {
            std::thread::yield_now();
            Ok(())
        }
    }

    /// Polls `cond` until it holds or the deadline passes.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) -> bool {
        loop {
            if cond() {
                return true;
            }
            if self.run().is_err() {
                return cond();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_timeout_expires_immediately() {
        let timeout = Timeout::from_millis(0);
        assert!(timeout.expired());
        assert_eq!(timeout.remaining(), Duration::ZERO);
        assert!(timeout.run().is_err());
    }

    #[test]
    fn wait_until_sees_condition() {
        let mut polls = 0;
        let timeout = Timeout::from_secs(5);
        assert!(timeout.wait_until(|| {
            polls += 1;
            polls == 3
        }));
        assert_eq!(polls, 3);
    }
}
