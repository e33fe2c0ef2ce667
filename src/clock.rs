use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Loop-local monotonic clock.
///
/// All loop bookkeeping (timer deadlines, DNS send times) uses monotonic
/// milliseconds since the clock was created. Wall time is recovered as
/// `epoch_bias + monotonic`; the bias is calibrated exactly once, when the
/// owning loop is constructed.
#[derive(Debug)]
pub(crate) struct Clock {
    origin: Instant,
    epoch_bias_ms: u64,
}

impl Clock {
    pub(crate) fn new() -> Clock {
        let epoch_bias_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Clock {
            origin: Instant::now(),
            epoch_bias_ms,
        }
    }

    /// Monotonic milliseconds since the clock was created.
    pub(crate) fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Wall-clock milliseconds since the Unix epoch, derived from the
    /// monotonic reading and the calibration bias.
    pub(crate) fn wall_ms(&self) -> u64 {
        self.epoch_bias_ms + self.now_ms()
    }

    pub(crate) fn epoch_bias_ms(&self) -> u64 {
        self.epoch_bias_ms
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;

    #[test]
    fn monotonic_and_biased() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        // The bias puts wall time somewhere after 2020.
        assert!(clock.wall_ms() > 1_577_836_800_000);
    }
}
