//! AV1 RTP payload handling per the [AV1 RTP
//! specification](https://aomediacodec.github.io/av1-rtp-spec/): the
//! Z/Y/W/N aggregation header, LEB128-delimited OBU elements, and
//! fragment reassembly across packets. Units are OBUs in low-overhead
//! form (no `obu_size` field); a marked packet ends a temporal unit.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const FLAG_Z: u8 = 0b1000_0000;
const FLAG_Y: u8 = 0b0100_0000;
const MASK_W: u8 = 0b0011_0000;
const FLAG_N: u8 = 0b0000_1000;

const OBU_TYPE_SEQUENCE_HEADER: u8 = 1;

/// Upper bound on OBUs per temporal unit.
pub const MAX_OBUS_PER_TU: usize = 10;

/// Upper bound on the byte size of a reassembled temporal unit.
pub const MAX_TU_SIZE: usize = 3 * 1024 * 1024;

fn leb128_size(mut v: usize) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn write_leb128(buf: &mut BytesMut, mut v: usize) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

/// Reads a LEB128 value, returning `(value, encoded_len)`; `None` on a
/// truncated or over-long encoding.
fn read_leb128(data: &[u8]) -> Option<(usize, usize)> {
    let mut v = 0usize;
    for (i, &b) in data.iter().enumerate().take(8) {
        v |= usize::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    /// Partial OBU continued from the previous packet (its Y flag was set).
    frag: Option<BytesMut>,
    tu: Vec<Bytes>,
    tu_size: usize,
    started: bool,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frag: None,
            tu: Vec::new(),
            tu_size: 0,
            started: false,
        }
    }

    fn reset_tu(&mut self) {
        self.frag = None;
        self.tu.clear();
        self.tu_size = 0;
    }

    fn push_obu(&mut self, obu: Bytes) -> Result<(), DepacketizeError> {
        self.tu_size += obu.len();
        if self.tu_size > MAX_TU_SIZE {
            let size = self.tu_size;
            self.reset_tu();
            return Err(DepacketizeError::OversizeUnit {
                size,
                limit: MAX_TU_SIZE,
            });
        }
        self.tu.push(obu);
        if self.tu.len() > MAX_OBUS_PER_TU {
            let count = self.tu.len();
            self.reset_tu();
            return Err(DepacketizeError::ObuCountExceeded {
                count,
                limit: MAX_OBUS_PER_TU,
            });
        }
        self.started = true;
        Ok(())
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && (self.frag.is_some() || !self.tu.is_empty()) {
            debug!("lost {} packets; dropping partial AV1 temporal unit", gap);
            self.reset_tu();
        }
        let payload = &pkt.payload;
        if payload.len() < 2 {
            return Err(DepacketizeError::InvalidPayload(
                "payload too short for aggregation header".to_owned(),
            ));
        }
        let z = payload[0] & FLAG_Z != 0;
        let y = payload[0] & FLAG_Y != 0;
        let w = usize::from((payload[0] & MASK_W) >> 4);
        if payload[0] & FLAG_N != 0 {
            // New coded video sequence: whatever was buffered is stale.
            self.reset_tu();
        }

        if z && self.frag.is_none() && !self.started {
            return Ok(Depacketized::NonStartingPacketAndNoPrevious);
        }

        let mut offset = 1usize;
        let mut element_idx = 0usize;
        while offset < payload.len() {
            let last = w != 0 && element_idx == w - 1;
            let len = if last {
                payload.len() - offset
            } else {
                let (len, n) = read_leb128(&payload[offset..]).ok_or_else(|| {
                    DepacketizeError::InvalidPayload("bad LEB128 element size".to_owned())
                })?;
                offset += n;
                len
            };
            if payload.len() - offset < len {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "element claims {} bytes with {} left",
                    len,
                    payload.len() - offset
                )));
            }
            let last = last || offset + len == payload.len();
            let element = payload.slice(offset..offset + len);
            offset += len;

            let continues_next = last && y;
            if element_idx == 0 && z {
                match self.frag.take() {
                    None => {
                        // The start of this OBU was lost; skip the element.
                        element_idx += 1;
                        continue;
                    }
                    Some(mut buf) => {
                        if buf.len() + element.len() > MAX_TU_SIZE {
                            let size = buf.len() + element.len();
                            self.reset_tu();
                            return Err(DepacketizeError::OversizeUnit {
                                size,
                                limit: MAX_TU_SIZE,
                            });
                        }
                        buf.extend_from_slice(&element);
                        if continues_next {
                            self.frag = Some(buf);
                        } else {
                            self.push_obu(buf.freeze())?;
                        }
                    }
                }
            } else if continues_next {
                self.frag = Some(BytesMut::from(&element[..]));
                self.started = true;
            } else if !element.is_empty() {
                self.push_obu(element)?;
            }
            element_idx += 1;
        }
        if w != 0 && element_idx != w {
            return Err(DepacketizeError::InvalidPayload(format!(
                "aggregation header promised {} elements, found {}",
                w, element_idx
            )));
        }

        if pkt.mark {
            if self.frag.is_some() {
                self.frag = None;
                return Err(DepacketizeError::InvalidPayload(
                    "marker while an OBU fragment is open".to_owned(),
                ));
            }
            if self.tu.is_empty() {
                return Err(DepacketizeError::InvalidPayload(
                    "marked packet completed no OBUs".to_owned(),
                ));
            }
            self.tu_size = 0;
            return Ok(Depacketized::Units(std::mem::take(&mut self.tu)));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder: every element carries a LEB128 size prefix (`W=0`), fragments
/// spill across packets with Z/Y continuation flags, and N marks temporal
/// units that carry a sequence header.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
}

impl Packetizer {
    pub fn new(
        payload_type: u8,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        Packetizer {
            core: PacketizerCore::new(payload_type, ssrc, initial_seq, payload_max_size),
        }
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        if units.is_empty() {
            return Err(PacketizeError::InvalidInput("no OBUs".to_owned()));
        }
        if units.len() > MAX_OBUS_PER_TU {
            return Err(PacketizeError::InvalidInput(format!(
                "{} OBUs exceed the per-temporal-unit maximum of {}",
                units.len(),
                MAX_OBUS_PER_TU
            )));
        }
        let has_sequence_header = units
            .iter()
            .any(|o| !o.is_empty() && (o[0] >> 3) & 0b1111 == OBU_TYPE_SEQUENCE_HEADER);
        let max = self.core.payload_max_size();

        struct Build {
            body: BytesMut,
            z: bool,
            y: bool,
        }
        let mut packets: Vec<Build> = vec![Build {
            body: BytesMut::new(),
            z: false,
            y: false,
        }];
        for obu in units {
            if obu.is_empty() {
                return Err(PacketizeError::InvalidInput("empty OBU".to_owned()));
            }
            let mut off = 0usize;
            loop {
                let rem = obu.len() - off;
                let used = packets.last().unwrap().body.len();
                let space = (max - 1).saturating_sub(used);
                // Room for a size prefix and at least one payload byte.
                if space < leb128_size(rem) + 1 {
                    packets.push(Build {
                        body: BytesMut::new(),
                        z: off > 0,
                        y: false,
                    });
                    continue;
                }
                let chunk = std::cmp::min(rem, space - leb128_size(rem.min(space)));
                let cur = packets.last_mut().unwrap();
                write_leb128(&mut cur.body, chunk);
                cur.body.extend_from_slice(&obu[off..off + chunk]);
                off += chunk;
                if off < obu.len() {
                    cur.y = true;
                    packets.push(Build {
                        body: BytesMut::new(),
                        z: true,
                        y: false,
                    });
                } else {
                    break;
                }
            }
        }

        let last = packets.len() - 1;
        Ok(packets
            .into_iter()
            .enumerate()
            .map(|(i, b)| {
                let mut payload = BytesMut::with_capacity(1 + b.body.len());
                let mut header = 0u8;
                if b.z {
                    header |= FLAG_Z;
                }
                if b.y {
                    header |= FLAG_Y;
                }
                if i == 0 && has_sequence_header {
                    header |= FLAG_N;
                }
                payload.put_u8(header);
                payload.extend_from_slice(&b.body);
                self.core.packet(timestamp, i == last, payload.freeze())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_round_trip() {
        for v in [0usize, 1, 127, 128, 300, 16_383, 16_384, 1_000_000] {
            let mut buf = BytesMut::new();
            write_leb128(&mut buf, v);
            assert_eq!(buf.len(), leb128_size(v));
            assert_eq!(read_leb128(&buf), Some((v, buf.len())));
        }
    }

    #[test]
    fn small_tu_round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), None);
        let units = vec![
            Bytes::from_static(&[0x0a, 0xbb, 0xcc]), // sequence header (type 1)
            Bytes::from_static(&[0x32, 0x01, 0x02, 0x03]), // frame (type 6)
        ];
        let pkts = p.packetize(&units, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_ne!(pkts[0].payload[0] & FLAG_N, 0);
        assert!(pkts[0].mark);

        let mut d = Depacketizer::new();
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::Units(units));
    }

    #[test]
    fn fragmented_obu_round_trip() {
        let mut p = Packetizer::new(96, None, Some(5), Some(50));
        let mut big = vec![0x32u8];
        big.extend((0..200).map(|i| i as u8));
        let units = vec![Bytes::from(big)];
        let pkts = p.packetize(&units, 9).unwrap();
        assert!(pkts.len() > 1);
        assert_eq!(pkts[0].payload[0] & FLAG_Z, 0);
        assert_ne!(pkts[0].payload[0] & FLAG_Y, 0);
        assert_ne!(pkts[1].payload[0] & FLAG_Z, 0);
        for pkt in &pkts {
            assert!(pkt.payload.len() <= 50);
        }

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(units)
        );
    }

    #[test]
    fn obu_count_limit() {
        let mut d = Depacketizer::new();
        // One packet with 11 one-byte OBUs (W=0, each size-prefixed).
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        for _ in 0..=MAX_OBUS_PER_TU {
            write_leb128(&mut payload, 1);
            payload.put_u8(0x32);
        }
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: payload.freeze(),
        };
        assert_eq!(
            d.depacketize(&pkt),
            Err(DepacketizeError::ObuCountExceeded {
                count: MAX_OBUS_PER_TU + 1,
                limit: MAX_OBUS_PER_TU,
            })
        );
    }

    #[test]
    fn mid_stream_join_is_benign() {
        let mut d = Depacketizer::new();
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 3,
            timestamp: 0,
            ssrc: 0,
            mark: false,
            payload: Bytes::from_static(&[FLAG_Z, 0x02, 0xaa, 0xbb]),
        };
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::NonStartingPacketAndNoPrevious
        );
    }
}
