//! PTS reconstruction: unbounded 64-bit timestamps from wrapping 32-bit
//! RTP timestamps.

use std::num::NonZeroU32;

use crate::Timestamp;

/// Creates [`Timestamp`]s from 32-bit (wrapping) RTP timestamps.
///
/// The first observed timestamp establishes the origin (unless one came
/// from `RTP-Info`). A wrap is detected when the new timestamp sits more
/// than 2^31 behind the latest one; small backward steps (reordering,
/// B-frame timestamps) borrow from the current cycle instead.
#[derive(Debug)]
pub struct Timeline {
    latest: u64,
    cycles: u64,
    start: Option<u32>,
    clock_rate: NonZeroU32,
}

impl Timeline {
    /// Creates a new timeline, erroring on a zero clock rate (which would
    /// make NPT math divide by zero).
    pub fn new(start: Option<u32>, clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_owned())?;
        Ok(Timeline {
            latest: u64::from(start.unwrap_or(0)),
            cycles: 0,
            start,
            clock_rate,
        })
    }

    /// Places the given (wrapping) RTP timestamp on the unbounded
    /// timeline.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Timestamp {
        let start = match self.start {
            None => {
                self.start = Some(rtp_timestamp);
                self.latest = u64::from(rtp_timestamp);
                rtp_timestamp
            }
            Some(start) => start,
        };
        let latest_lsb = self.latest as u32;
        if rtp_timestamp < latest_lsb && latest_lsb - rtp_timestamp >= 0x8000_0000 {
            // Wrapped forward past 2^32.
            self.cycles += 1;
        }
        let mut cycles = self.cycles;
        if rtp_timestamp > latest_lsb && rtp_timestamp - latest_lsb >= 0x8000_0000 && cycles > 0 {
            // A slightly-late packet from before the wrap.
            cycles -= 1;
        }
        let timestamp = (cycles << 32) | u64::from(rtp_timestamp);
        if timestamp > self.latest {
            self.latest = timestamp;
        }
        Timestamp {
            timestamp,
            clock_rate: self.clock_rate,
            start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timeline;

    #[test]
    fn rejects_zero_clock_rate() {
        assert!(Timeline::new(Some(0), 0).is_err());
    }

    #[test]
    fn normal_advance() {
        let mut t = Timeline::new(Some(42), 90_000).unwrap();
        assert_eq!(t.advance_to(83).elapsed(), 83 - 42);
        assert_eq!(t.advance_to(453).elapsed(), 453 - 42);
    }

    #[test]
    fn wraparound() {
        let mut t = Timeline::new(Some(u32::MAX - 10), 90_000).unwrap();
        assert_eq!(t.advance_to(u32::MAX).elapsed(), 10);
        // Crossing zero increments the cycle counter.
        assert_eq!(t.advance_to(5).elapsed(), 16);
        // A straggler from before the wrap still maps below.
        assert_eq!(t.advance_to(u32::MAX).elapsed(), 10);
        // And the timeline stays in the new cycle afterwards.
        assert_eq!(t.advance_to(20).elapsed(), 31);
    }

    #[test]
    fn no_initial_rtptime() {
        let mut t = Timeline::new(None, 90_000).unwrap();
        assert_eq!(t.advance_to(218_250_000).elapsed(), 0);
        assert_eq!(t.advance_to(218_253_000).elapsed(), 3000);
    }
}
