//! RTCP parsing and generation; see [RFC 3550 section
//! 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! Only the packet types the RTSP data plane needs are understood: sender
//! reports (consumed for NTP/RTP clock mapping, produced by senders every
//! report interval), receiver reports (produced by receivers, with loss and
//! jitter per RFC 3550 section 6.4.1), and source descriptions. Everything
//! else round-trips as `Unknown` and is ignored.

use std::convert::TryFrom;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::NtpTimestamp;

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_SOURCE_DESCRIPTION: u8 = 202;

/// Interval between sender/receiver reports.
pub const REPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug)]
pub enum Packet<'a> {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Unknown(UnknownPacket<'a>),
}

impl<'a> Packet<'a> {
    /// Parses the next RTCP packet in a compound datagram, returning it and
    /// the remainder.
    pub fn parse(data: &'a [u8]) -> Result<(Packet<'a>, &'a [u8]), String> {
        if data.len() < 4 {
            return Err(format!("rtcp packet must be at least 4 bytes, got {}", data.len()));
        }
        if (data[0] & 0b1100_0000) != 0b1000_0000 {
            return Err(format!("rtcp version in byte {:02x} is not 2", data[0]));
        }
        let count = usize::from(data[0] & 0b1_1111);
        let payload_type = data[1];
        let len = (usize::from(u16::from_be_bytes([data[2], data[3]])) + 1) * 4;
        if len > data.len() {
            return Err(format!(
                "rtcp packet length {} exceeds remaining {} bytes",
                len,
                data.len()
            ));
        }
        let (pkt, rest) = data.split_at(len);
        let pkt = match payload_type {
            PT_SENDER_REPORT => Packet::SenderReport(SenderReport::parse(pkt, count)?),
            PT_RECEIVER_REPORT => Packet::ReceiverReport(ReceiverReport::parse(pkt, count)?),
            _ => Packet::Unknown(UnknownPacket {
                payload_type,
                payload: pkt,
            }),
        };
        Ok((pkt, rest))
    }
}

#[derive(Debug)]
pub struct UnknownPacket<'a> {
    pub payload_type: u8,
    pub payload: &'a [u8],
}

/// A reception report block, shared by SR and RR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Cumulative packets lost, a signed 24-bit quantity on the wire.
    pub total_lost: u32,
    /// Extended highest sequence number received (cycles in the high half).
    pub last_sequence_number: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp, 0 if none seen.
    pub last_sender_report: u32,
    /// Delay since that SR in 1/65536 s units.
    pub delay: u32,
}

impl ReceptionReport {
    fn parse(data: &[u8]) -> Self {
        ReceptionReport {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction_lost: data[4],
            total_lost: u32::from_be_bytes([0, data[5], data[6], data[7]]),
            last_sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            last_sender_report: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            delay: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        buf.put_u8((self.total_lost >> 16) as u8);
        buf.put_u16(self.total_lost as u16);
        buf.put_u32(self.last_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sender_report);
        buf.put_u32(self.delay);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

impl SenderReport {
    fn parse(data: &[u8], count: usize) -> Result<Self, String> {
        if data.len() < 28 + count * 24 {
            return Err(format!("rtcp SR too short for {} report blocks", count));
        }
        let mut reports = Vec::with_capacity(count);
        for i in 0..count {
            reports.push(ReceptionReport::parse(&data[28 + i * 24..]));
        }
        Ok(SenderReport {
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ntp_timestamp: NtpTimestamp(u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ])),
            rtp_timestamp: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            packet_count: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            octet_count: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
            reports,
        })
    }

    pub fn marshal(&self) -> Bytes {
        let words = (28 + self.reports.len() * 24) / 4 - 1;
        let mut buf = BytesMut::with_capacity((words + 1) * 4);
        buf.put_u8(0b1000_0000 | self.reports.len() as u8);
        buf.put_u8(PT_SENDER_REPORT);
        buf.put_u16(words as u16);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp.0);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for r in &self.reports {
            r.write(&mut buf);
        }
        buf.freeze()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    fn parse(data: &[u8], count: usize) -> Result<Self, String> {
        if data.len() < 8 + count * 24 {
            return Err(format!("rtcp RR too short for {} report blocks", count));
        }
        let mut reports = Vec::with_capacity(count);
        for i in 0..count {
            reports.push(ReceptionReport::parse(&data[8 + i * 24..]));
        }
        Ok(ReceiverReport {
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            reports,
        })
    }

    pub fn marshal(&self) -> Bytes {
        let words = (8 + self.reports.len() * 24) / 4 - 1;
        let mut buf = BytesMut::with_capacity((words + 1) * 4);
        buf.put_u8(0b1000_0000 | self.reports.len() as u8);
        buf.put_u8(PT_RECEIVER_REPORT);
        buf.put_u16(words as u16);
        buf.put_u32(self.ssrc);
        for r in &self.reports {
            r.write(&mut buf);
        }
        buf.freeze()
    }
}

/// Writes a minimal SDES packet carrying one CNAME chunk.
pub fn marshal_sdes_cname(ssrc: u32, cname: &str) -> Bytes {
    let cname = &cname.as_bytes()[..std::cmp::min(cname.len(), 255)];
    // chunk: ssrc + item type + len + text + null terminator, padded to 32 bits.
    let chunk_len = 4 + 2 + cname.len() + 1;
    let padded = (chunk_len + 3) & !3;
    let words = (4 + padded) / 4 - 1;
    let mut buf = BytesMut::with_capacity(4 + padded);
    buf.put_u8(0b1000_0001); // one chunk
    buf.put_u8(PT_SOURCE_DESCRIPTION);
    buf.put_u16(words as u16);
    buf.put_u32(ssrc);
    buf.put_u8(1); // CNAME
    buf.put_u8(cname.len() as u8);
    buf.extend_from_slice(cname);
    for _ in chunk_len..=padded {
        buf.put_u8(0);
    }
    buf.freeze()
}

/// Per-source reception statistics, maintained as in RFC 3550 appendix A
/// and sampled into RR report blocks.
#[derive(Debug)]
pub struct ReceiverStats {
    clock_rate: u32,
    max_seq: u16,
    cycles: u32,
    base_seq: u16,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    /// Interarrival jitter estimate in clock-rate units, scaled by 16.
    jitter: u32,
    last_transit: Option<i64>,
    last_sr: Option<(NtpTimestamp, Instant)>,
    initialized: bool,
}

impl ReceiverStats {
    pub fn new(clock_rate: u32) -> Self {
        ReceiverStats {
            clock_rate,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0,
            last_transit: None,
            last_sr: None,
            initialized: false,
        }
    }

    /// Accounts for one received RTP packet.
    pub fn on_packet(&mut self, sequence_number: u16, rtp_timestamp: u32, arrival: Instant, epoch: Instant) {
        if !self.initialized {
            self.base_seq = sequence_number;
            self.max_seq = sequence_number;
            self.initialized = true;
        } else {
            let delta = sequence_number.wrapping_sub(self.max_seq);
            if delta < 0x8000 {
                if sequence_number < self.max_seq {
                    self.cycles += 1;
                }
                self.max_seq = sequence_number;
            }
        }
        self.received += 1;

        if self.clock_rate > 0 {
            let arrival_units = (arrival.duration_since(epoch).as_secs_f64()
                * f64::from(self.clock_rate)) as i64;
            let transit = arrival_units - i64::from(rtp_timestamp);
            if let Some(last) = self.last_transit {
                let d = (transit - last).unsigned_abs();
                let d = u32::try_from(d).unwrap_or(u32::MAX);
                // RFC 3550 appendix A.8; `jitter` is kept scaled by 16.
                let j = i64::from(self.jitter) + i64::from(d) - ((i64::from(self.jitter) + 8) >> 4);
                self.jitter = u32::try_from(j.max(0)).unwrap_or(u32::MAX);
            }
            self.last_transit = Some(transit);
        }
    }

    /// Records an SR arrival so RRs can echo LSR/DLSR.
    pub fn on_sender_report(&mut self, ntp: NtpTimestamp, arrival: Instant) {
        self.last_sr = Some((ntp, arrival));
    }

    fn extended_max(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    /// Samples the statistics into an RR report block.
    pub fn report(&mut self, source_ssrc: u32, now: Instant) -> ReceptionReport {
        let extended_max = self.extended_max();
        let expected = u64::from(extended_max.wrapping_sub(u32::from(self.base_seq))) + 1;
        let lost = expected.saturating_sub(self.received);
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval) as u8
        };
        let (last_sender_report, delay) = match self.last_sr {
            None => (0, 0),
            Some((ntp, when)) => (
                (ntp.0 >> 16) as u32,
                (now.duration_since(when).as_secs_f64() * 65536.0) as u32,
            ),
        };
        ReceptionReport {
            ssrc: source_ssrc,
            fraction_lost,
            total_lost: u32::try_from(lost).unwrap_or(0x7f_ffff) & 0xff_ffff,
            last_sequence_number: extended_max,
            jitter: self.jitter / 16,
            last_sender_report,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_round_trip() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp_timestamp: NtpTimestamp(0xdead_beef_0bad_f00d),
            rtp_timestamp: 0x0102_0304,
            packet_count: 42,
            octet_count: 1234,
            reports: vec![],
        };
        let wire = sr.marshal();
        assert_eq!(wire.len(), 28);
        let (parsed, rest) = Packet::parse(&wire).unwrap();
        assert!(rest.is_empty());
        match parsed {
            Packet::SenderReport(p) => assert_eq!(p, sr),
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn rr_round_trip() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![ReceptionReport {
                ssrc: 2,
                fraction_lost: 25,
                total_lost: 100,
                last_sequence_number: 0x0001_ffff,
                jitter: 7,
                last_sender_report: 0xabcd_ef01,
                delay: 65536,
            }],
        };
        let wire = rr.marshal();
        assert_eq!(wire.len(), 32);
        let (parsed, rest) = Packet::parse(&wire).unwrap();
        assert!(rest.is_empty());
        match parsed {
            Packet::ReceiverReport(p) => assert_eq!(p, rr),
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn compound_with_sdes() {
        let sr = SenderReport {
            ssrc: 9,
            ntp_timestamp: NtpTimestamp(1),
            rtp_timestamp: 2,
            packet_count: 3,
            octet_count: 4,
            reports: vec![],
        };
        let mut compound = BytesMut::new();
        compound.extend_from_slice(&sr.marshal());
        compound.extend_from_slice(&marshal_sdes_cname(9, "ocular"));
        let data = compound.freeze();
        let (first, rest) = Packet::parse(&data).unwrap();
        assert!(matches!(first, Packet::SenderReport(_)));
        let (second, rest) = Packet::parse(rest).unwrap();
        match second {
            Packet::Unknown(u) => assert_eq!(u.payload_type, PT_SOURCE_DESCRIPTION),
            o => panic!("unexpected {:?}", o),
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn receiver_stats_count_loss() {
        let epoch = Instant::now();
        let mut stats = ReceiverStats::new(8000);
        for seq in [1000u16, 1001, 1003, 1004] {
            stats.on_packet(seq, u32::from(seq) * 160, epoch, epoch);
        }
        let report = stats.report(77, epoch);
        assert_eq!(report.ssrc, 77);
        assert_eq!(report.total_lost, 1);
        assert_eq!(report.last_sequence_number, 1004);
        assert!(report.fraction_lost > 0);
    }
}
