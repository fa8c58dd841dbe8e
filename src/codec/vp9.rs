//! VP9 RTP payload handling per
//! [draft-ietf-payload-vp9](https://datatracker.ietf.org/doc/html/draft-ietf-payload-vp9):
//! flexible-mode payload descriptor with B/E frame boundaries. One unit is
//! one VP9 frame.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const FLAG_I: u8 = 0b1000_0000;
const FLAG_P: u8 = 0b0100_0000;
const FLAG_L: u8 = 0b0010_0000;
const FLAG_F: u8 = 0b0001_0000;
const FLAG_B: u8 = 0b0000_1000;
const FLAG_E: u8 = 0b0000_0100;
const FLAG_V: u8 = 0b0000_0010;

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

fn invalid(msg: &str) -> DepacketizeError {
    DepacketizeError::InvalidPayload(msg.to_owned())
}

/// Returns the descriptor length, walking all optional fields.
fn descriptor_len(p: &[u8]) -> Result<usize, DepacketizeError> {
    if p.is_empty() {
        return Err(invalid("empty payload"));
    }
    let b0 = p[0];
    let mut len = 1usize;
    if b0 & FLAG_I != 0 {
        if p.len() <= len {
            return Err(invalid("truncated picture id"));
        }
        len += if p[len] & 0b1000_0000 != 0 { 2 } else { 1 };
    }
    if b0 & FLAG_L != 0 {
        len += 1;
        if b0 & FLAG_F == 0 {
            len += 1; // TL0PICIDX
        }
    }
    if b0 & FLAG_P != 0 && b0 & FLAG_F != 0 {
        // Up to three reference indices, N-bit terminated.
        for _ in 0..3 {
            if p.len() <= len {
                return Err(invalid("truncated reference index"));
            }
            let more = p[len] & 1 != 0;
            len += 1;
            if !more {
                break;
            }
        }
    }
    if b0 & FLAG_V != 0 {
        // Scalability structure.
        if p.len() <= len {
            return Err(invalid("truncated scalability structure"));
        }
        let ss = p[len];
        len += 1;
        let n_s = usize::from(ss >> 5) + 1;
        let y = ss & 0b0001_0000 != 0;
        let g = ss & 0b0000_1000 != 0;
        if y {
            len += n_s * 4;
        }
        let n_g = if g {
            if p.len() <= len {
                return Err(invalid("truncated scalability structure"));
            }
            let n = usize::from(p[len]);
            len += 1;
            n
        } else {
            0
        };
        for _ in 0..n_g {
            if p.len() <= len {
                return Err(invalid("truncated picture group"));
            }
            let r = usize::from((p[len] >> 2) & 0b11);
            len += 1 + r;
        }
    }
    if p.len() <= len {
        return Err(invalid("descriptor consumes whole payload"));
    }
    Ok(len)
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frame: Option<BytesMut>,
    started: bool,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frame: None,
            started: false,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.frame.is_some() {
            debug!("lost {} packets; dropping partial VP9 frame", gap);
            self.frame = None;
        }
        let len = descriptor_len(&pkt.payload)?;
        let start = pkt.payload[0] & FLAG_B != 0;
        let body = &pkt.payload[len..];

        if start {
            if self.frame.is_some() {
                self.frame = None;
                return Err(invalid("frame start while frame in progress"));
            }
            self.frame = Some(BytesMut::from(body));
            self.started = true;
        } else {
            match &mut self.frame {
                None => {
                    if !self.started {
                        return Ok(Depacketized::NonStartingPacketAndNoPrevious);
                    }
                    if gap > 0 {
                        return Err(DepacketizeError::PacketLoss { gap });
                    }
                    return Err(invalid("continuation without frame in progress"));
                }
                Some(buf) => {
                    if buf.len() + body.len() > MAX_FRAME_SIZE {
                        let size = buf.len() + body.len();
                        self.frame = None;
                        return Err(DepacketizeError::OversizeUnit {
                            size,
                            limit: MAX_FRAME_SIZE,
                        });
                    }
                    buf.extend_from_slice(body);
                }
            }
        }
        if pkt.mark {
            let frame = self.frame.take().expect("frame exists when marked");
            return Ok(Depacketized::Units(vec![frame.freeze()]));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder with a minimal descriptor: B on the first fragment, E and the
/// RTP marker on the last.
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
        let frame = match units {
            [f] if !f.is_empty() => f,
            _ => {
                return Err(PacketizeError::InvalidInput(
                    "expected exactly one non-empty frame".to_owned(),
                ))
            }
        };
        let chunk_size = self.core.payload_max_size() - 1;
        let chunks: Vec<&[u8]> = frame.chunks(chunk_size).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let mut b0 = 0u8;
                if i == 0 {
                    b0 |= FLAG_B;
                }
                if i == last {
                    b0 |= FLAG_E;
                }
                let mut payload = BytesMut::with_capacity(1 + c.len());
                payload.extend_from_slice(&[b0]);
                payload.extend_from_slice(c);
                self.core.packet(timestamp, i == last, payload.freeze())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut p = Packetizer::new(96, None, Some(1000), Some(64));
        let frame: Bytes = (0..150u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&[frame.clone()], 77).unwrap();
        assert!(pkts.len() > 1);
        assert_ne!(pkts[0].payload[0] & FLAG_B, 0);
        assert_ne!(pkts.last().unwrap().payload[0] & FLAG_E, 0);

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn skips_picture_id_and_layers() {
        // I + 15-bit picture id, L + layer byte + TL0PICIDX (F unset).
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: Bytes::from_static(&[
                FLAG_I | FLAG_L | FLAG_B | FLAG_E,
                0b1000_0000,
                0x05,
                0x21,
                0x03,
                0xaa,
                0xbb,
            ]),
        };
        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::Units(vec![Bytes::from_static(&[0xaa, 0xbb])])
        );
    }
}
