use std::time::Duration;

/// Idle policy of a runner: spin for a number of empty laps, then sleep with
/// a timeout that doubles up to a ceiling.
#[derive(Debug)]
pub(crate) struct Backoff {
    spins: usize,
    min: Duration,
    max: Duration,
    empty_laps: usize,
    sleep: Duration,
}

impl Backoff {
    pub(crate) fn new(spins: usize, min: Duration, max: Duration) -> Self {
        Backoff {
            spins,
            min,
            max,
            empty_laps: 0,
            sleep: min,
        }
    }

    /// Record an empty lap; returns how long to park, if at all.
    pub(crate) fn idle(&mut self) -> Option<Duration> {
        self.empty_laps += 1;
        if self.empty_laps <= self.spins {
            return None;
        }
        let sleep = self.sleep;
        self.sleep = (self.sleep * 2).min(self.max);
        Some(sleep)
    }

    /// Work was found.
    pub(crate) fn reset(&mut self) {
        self.empty_laps = 0;
        self.sleep = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_max() {
        let mut backoff = Backoff::new(2, Duration::from_micros(10), Duration::from_micros(35));
        assert_eq!(backoff.idle(), None);
        assert_eq!(backoff.idle(), None);
        assert_eq!(backoff.idle(), Some(Duration::from_micros(10)));
        assert_eq!(backoff.idle(), Some(Duration::from_micros(20)));
        assert_eq!(backoff.idle(), Some(Duration::from_micros(35)));
        assert_eq!(backoff.idle(), Some(Duration::from_micros(35)));

        backoff.reset();
        assert_eq!(backoff.idle(), None);
    }
}
