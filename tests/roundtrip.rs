//! Format-level round trips through the registry's encoder/decoder
//! constructors.

use bytes::Bytes;
use ocular::codec::aac::AudioSpecificConfig;
use ocular::codec::latm::StreamMuxConfig;
use ocular::codec::Depacketized;
use ocular::format::{Format, MediaType};

#[test]
fn h264_single_packet() {
    let format = Format::unmarshal(MediaType::Video, 96, Some("H264/90000"), &Vec::new()).unwrap();
    let mut encoder = format.create_encoder(None, Some(1000), None).unwrap();
    let au = vec![Bytes::from_static(&[0x01, 0x02, 0x03, 0x04])];
    let pkts = encoder.packetize(&au, 0).unwrap();
    assert_eq!(pkts.len(), 1);
    assert_eq!(&pkts[0].payload[..], &[0x01, 0x02, 0x03, 0x04]);
    assert!(pkts[0].mark);
    assert_eq!(pkts[0].payload_type, 96);

    let mut decoder = format.create_decoder().unwrap();
    assert_eq!(
        decoder.depacketize(&pkts[0]).unwrap(),
        Depacketized::Units(au)
    );
}

#[test]
fn aac_latm_length_prefix() {
    let format = Format::Mpeg4AudioLatm {
        payload_type: 96,
        profile_level_id: Some(1),
        cpresent: false,
        config: Some(StreamMuxConfig {
            all_streams_same_time_framing: true,
            num_sub_frames: 0,
            config: AudioSpecificConfig {
                audio_object_type: 2,
                sample_rate: 48_000,
                channels: 2,
                frame_length: 1024,
            },
        }),
    };
    assert_eq!(format.clock_rate(), 48_000);
    let mut encoder = format.create_encoder(None, None, None).unwrap();
    let frame = Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]);
    let pkts = encoder.packetize(&[frame.clone()], 0).unwrap();
    assert_eq!(pkts.len(), 1);
    // PayloadLengthInfo for 4 bytes is the single byte 0x04.
    assert_eq!(pkts[0].payload[0], 0x04);

    let mut decoder = format.create_decoder().unwrap();
    assert_eq!(
        decoder.depacketize(&pkts[0]).unwrap(),
        Depacketized::Units(vec![frame])
    );
}

#[test]
fn mpegts_fragmentation() {
    let format = Format::unmarshal(MediaType::Video, 33, None, &Vec::new()).unwrap();
    let mut encoder = format.create_encoder(None, Some(500), Some(1316)).unwrap();
    let input: Bytes = (0..8 * 188).map(|i| i as u8).collect();
    let pkts = encoder.packetize(&[input.clone()], 0).unwrap();
    assert_eq!(pkts.len(), 2);
    assert_eq!(pkts[0].sequence_number, 500);
    assert_eq!(pkts[1].sequence_number, 501);
    assert!(!pkts[0].mark);
    assert!(pkts[1].mark);
    for pkt in &pkts {
        assert_eq!(pkt.payload.len() % 188, 0);
    }

    let mut decoder = format.create_decoder().unwrap();
    let mut reassembled = Vec::new();
    for pkt in &pkts {
        match decoder.depacketize(pkt).unwrap() {
            Depacketized::Units(units) => {
                for u in units {
                    reassembled.extend_from_slice(&u);
                }
            }
            o => panic!("unexpected {:?}", o),
        }
    }
    assert_eq!(&reassembled[..], &input[..]);
}

#[test]
fn every_codec_round_trips() {
    // (format, input units, timestamp)
    let h264 = Format::unmarshal(MediaType::Video, 96, Some("H264/90000"), &Vec::new()).unwrap();
    let opus = Format::unmarshal(MediaType::Audio, 97, Some("opus/48000/2"), &Vec::new()).unwrap();
    let klv =
        Format::unmarshal(MediaType::Application, 98, Some("smpte336m/90000"), &Vec::new())
            .unwrap();
    let mut klv_unit = vec![0x06, 0x0e, 0x2b, 0x34];
    klv_unit.extend_from_slice(&[0u8; 12]);
    klv_unit.push(3);
    klv_unit.extend_from_slice(&[9, 9, 9]);
    let cases: Vec<(Format, Vec<Bytes>)> = vec![
        (h264, vec![Bytes::from_static(&[0x65, 1, 2, 3])]),
        (opus, vec![Bytes::from_static(&[0xfc, 0xff, 0xfe])]),
        (klv, vec![Bytes::from(klv_unit)]),
    ];
    for (format, units) in cases {
        let mut encoder = format.create_encoder(None, Some(0), None).unwrap();
        let mut decoder = format.create_decoder().unwrap();
        let pkts = encoder.packetize(&units, 1234).unwrap();
        let mut out = Vec::new();
        for pkt in &pkts {
            match decoder.depacketize(pkt).unwrap() {
                Depacketized::Units(mut u) => out.append(&mut u),
                Depacketized::MorePacketsNeeded => {}
                o => panic!("unexpected {:?}", o),
            }
        }
        assert_eq!(out, units, "round trip failed for {:?}", format.codec_name());
    }
}
