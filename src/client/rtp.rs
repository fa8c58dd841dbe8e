//! Per-stream RTP admission: SSRC discipline and loss accounting; see
//! [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use log::debug;

/// Ensures packets have a consistent SSRC and roughly monotonic sequence
/// numbers, reporting (not prohibiting) loss. Servers sometimes drop
/// packets internally even over TCP, and some cameras keep sending data
/// from old sessions over new ones; spurious-SSRC packets are dropped
/// rather than treated as fatal.
#[derive(Debug)]
pub struct SequenceChecker {
    ssrc: Option<u32>,
    next_seq: Option<u16>,
}

/// Outcome of admitting one packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Admitted {
    /// Deliver, with the number of packets missing before this one.
    Ok { loss: u16 },
    /// Wrong SSRC or an out-of-order duplicate; skip silently.
    Spurious,
}

impl SequenceChecker {
    pub fn new(ssrc: Option<u32>, next_seq: Option<u16>) -> Self {
        SequenceChecker { ssrc, next_seq }
    }

    pub fn admit(&mut self, pkt: &crate::rtp::Packet) -> Admitted {
        if let Some(expected) = self.ssrc {
            if expected != pkt.ssrc {
                debug!(
                    "ignoring packet with ssrc={:08x} while expecting {:08x}",
                    pkt.ssrc, expected
                );
                return Admitted::Spurious;
            }
        }
        let loss = pkt
            .sequence_number
            .wrapping_sub(self.next_seq.unwrap_or(pkt.sequence_number));
        if loss > 0x8000 {
            // Behind the expected sequence number: a duplicate or
            // reordered stale packet.
            return Admitted::Spurious;
        }
        self.ssrc = Some(pkt.ssrc);
        self.next_seq = Some(pkt.sequence_number.wrapping_add(1));
        Admitted::Ok { loss }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(ssrc: u32, seq: u16) -> crate::rtp::Packet {
        crate::rtp::Packet {
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc,
            mark: false,
            payload: Bytes::from_static(&[0]),
        }
    }

    #[test]
    fn tracks_loss() {
        let mut c = SequenceChecker::new(None, None);
        assert_eq!(c.admit(&pkt(7, 100)), Admitted::Ok { loss: 0 });
        assert_eq!(c.admit(&pkt(7, 101)), Admitted::Ok { loss: 0 });
        assert_eq!(c.admit(&pkt(7, 105)), Admitted::Ok { loss: 3 });
    }

    #[test]
    fn rejects_wrong_ssrc() {
        let mut c = SequenceChecker::new(Some(7), None);
        assert_eq!(c.admit(&pkt(8, 0)), Admitted::Spurious);
        assert_eq!(c.admit(&pkt(7, 0)), Admitted::Ok { loss: 0 });
    }

    #[test]
    fn rejects_stale_reordered() {
        let mut c = SequenceChecker::new(None, Some(500));
        assert_eq!(c.admit(&pkt(7, 499)), Admitted::Spurious);
        assert_eq!(c.admit(&pkt(7, 500)), Admitted::Ok { loss: 0 });
    }

    #[test]
    fn wraps() {
        let mut c = SequenceChecker::new(None, Some(0xffff));
        assert_eq!(c.admit(&pkt(7, 0xffff)), Admitted::Ok { loss: 0 });
        assert_eq!(c.admit(&pkt(7, 0x0000)), Admitted::Ok { loss: 0 });
    }
}
