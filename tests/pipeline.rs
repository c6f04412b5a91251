//! End-to-end tests over the public decode pipeline: TPIU framing in,
//! typed messages out, plus the capture ring policies.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use swo_scope::dispatch::{Dispatcher, Handler};
use swo_scope::itm::{
    self, DecoderOptions, ExceptionAction, ItmDecoder, Message, TimeStatus,
};
use swo_scope::ring::{PmRing, Policy, MIN_CAPACITY};
use swo_scope::session::{Session, SessionConfig};
use swo_scope::tpiu::{self, TpiuDecoder};

const TPIU_SYNC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];

/// Build one frame: an immediate switch to `stream`, then 14 data
/// bytes. Data bytes on even wire positions have their low bit packed
/// into the auxiliary byte.
fn frame(stream: u8, data: &[u8; 14]) -> [u8; 16] {
    let mut frame = [0u8; 16];
    let mut low_bits = 0u8;
    frame[0] = (stream << 1) | 1;
    for (i, d) in data.iter().enumerate() {
        let pos = i + 1;
        if pos % 2 == 0 {
            frame[pos] = d & !1;
            low_bits |= (d & 1) << (pos / 2);
        } else {
            frame[pos] = *d;
        }
    }
    frame[15] = low_bits;
    frame
}

fn synced_decoder() -> TpiuDecoder {
    let mut decoder = TpiuDecoder::new();
    for b in TPIU_SYNC.iter() {
        decoder.pump(*b);
    }
    decoder
}

#[test]
fn demux_restores_per_stream_bytes() {
    let mut decoder = synced_decoder();

    let data_a: [u8; 14] = [
        0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xA9, 0xBA, 0xCB, 0xDC, 0xED,
    ];
    let data_b: [u8; 14] = [
        0x0F, 0x1E, 0x2D, 0x3C, 0x4B, 0x5A, 0x69, 0x78, 0x96, 0xB4, 0xD2, 0xF0, 0x0E, 0x2C,
    ];

    let mut streamed: Vec<(u8, u8)> = Vec::new();
    for frame_bytes in [frame(1, &data_a), frame(2, &data_b)].iter() {
        let mut last = tpiu::Event::None;
        for b in frame_bytes.iter() {
            last = decoder.pump(*b);
        }
        assert_eq!(last, tpiu::Event::RxedPacket);
        let packet = decoder.get_packet().unwrap();
        streamed.extend(packet.items.iter().map(|i| (i.stream, i.byte)));
    }

    // The bytes attributed to each stream are exactly the bytes that
    // were framed for it, in order; nothing is fabricated.
    let for_stream = |s: u8| -> Vec<u8> {
        streamed
            .iter()
            .filter(|(stream, _)| *stream == s)
            .map(|(_, b)| *b)
            .collect()
    };
    assert_eq!(for_stream(1), data_a.to_vec());
    assert_eq!(for_stream(2), data_b.to_vec());
}

#[test]
fn packet_needs_sixteen_bytes_modulo_half_syncs() {
    let mut decoder = synced_decoder();

    let data: [u8; 14] = [
        0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x90, 0xA0, 0xB0, 0xC0, 0xD0, 0xE0,
    ];
    let bytes = frame(1, &data);

    // Interleave a half-sync at a pair boundary; it is discarded and
    // the frame still needs its sixteen real bytes.
    let mut wire = Vec::new();
    wire.extend_from_slice(&bytes[..4]);
    wire.extend_from_slice(&[0xFF, 0x7F]);
    wire.extend_from_slice(&bytes[4..]);

    let mut packets = 0;
    for b in wire.iter() {
        if decoder.pump(*b) == tpiu::Event::RxedPacket {
            packets += 1;
        }
    }

    assert_eq!(packets, 1);
    assert_eq!(decoder.stats().half_sync_count, 1);
    assert_eq!(decoder.stats().packets, 1);
}

#[test]
fn stale_frame_loses_sync_without_packet() {
    let mut decoder = TpiuDecoder::new();
    let t0 = Instant::now();
    for b in TPIU_SYNC.iter() {
        decoder.pump_at(*b, t0);
    }

    for i in 0..15u8 {
        decoder.pump_at(0x10 + i, t0);
    }
    let event = decoder.pump_at(0x42, t0 + Duration::from_secs(4));

    assert_eq!(event, tpiu::Event::Unsynced);
    assert_eq!(decoder.stats().lost_sync, 1);
    assert_eq!(decoder.stats().packets, 0);

    // Sync accounting only ever accumulates.
    let (sync, lost) = (decoder.stats().sync_count, decoder.stats().lost_sync);
    for b in TPIU_SYNC.iter() {
        decoder.pump_at(*b, t0 + Duration::from_secs(4));
    }
    assert!(decoder.stats().sync_count >= sync);
    assert!(decoder.stats().lost_sync >= lost);
}

/// Encode a software packet by the wire layout.
fn encode_software(addr: u8, value: u32, len: u8) -> Vec<u8> {
    let ss = match len {
        1 => 0b01,
        2 => 0b10,
        4 => 0b11,
        _ => panic!("bad length"),
    };
    let mut bytes = vec![(addr << 3) | ss];
    bytes.extend_from_slice(&value.to_le_bytes()[..usize::from(len)]);
    bytes
}

/// Encode a non-instruction sync packet by the wire layout: extended
/// extension header, one type byte, four bytes of address.
fn encode_nisync(kind: u8, addr: u32) -> Vec<u8> {
    let mut bytes = vec![0x88, kind];
    bytes.extend_from_slice(&addr.to_le_bytes());
    bytes
}

/// Encode a local timestamp packet by the wire layout.
fn encode_timestamp(time_inc: u32, status: TimeStatus) -> Vec<u8> {
    let rr = match status {
        TimeStatus::Exact => 0b00,
        TimeStatus::TimeDelayed => 0b01,
        TimeStatus::PacketDelayed => 0b10,
        TimeStatus::BothDelayed => 0b11,
    };
    let mut bytes = vec![0xC0 | (rr << 4)];
    let mut rest = time_inc;
    loop {
        let part = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest != 0 {
            bytes.push(part | 0x80);
        } else {
            bytes.push(part);
            break;
        }
    }
    bytes
}

#[test]
fn itm_round_trips_field_by_field() {
    let mut decoder = ItmDecoder::new(DecoderOptions { force_sync: false });

    let mut stream = Vec::new();
    stream.extend(encode_software(3, 0xDEAD_BEEF, 4));
    stream.extend(encode_timestamp(0x1234, TimeStatus::PacketDelayed));
    stream.extend(encode_software(31, 0x42, 1));
    // Exception 11 (SVCall) exit.
    stream.extend_from_slice(&[0x0E, 0x0B, 0x20]);
    stream.extend(encode_nisync(0x03, 0x2000_1000));

    let mut messages = Vec::new();
    for b in stream.iter() {
        match decoder.pump(*b) {
            itm::Event::PacketRxed => messages.push(decoder.get_message().unwrap()),
            itm::Event::None => (),
            e => panic!("unexpected event {:?}", e),
        }
    }

    assert_eq!(
        messages,
        vec![
            Message::Software(itm::Software {
                timestamp: 0,
                src_addr: 3,
                len: 4,
                value: 0xDEAD_BEEF,
            }),
            Message::LocalTimestamp(itm::LocalTimestamp {
                timestamp: 0,
                time_inc: 0x1234,
                status: TimeStatus::PacketDelayed,
            }),
            Message::Software(itm::Software {
                timestamp: 0x1234,
                src_addr: 31,
                len: 1,
                value: 0x42,
            }),
            Message::ExceptionTrace(itm::ExceptionTrace {
                timestamp: 0x1234,
                number: 11,
                action: ExceptionAction::Exit,
            }),
            Message::NiSync(itm::NiSync {
                timestamp: 0x1234,
                kind: 0x03,
                addr: 0x2000_1000,
            }),
        ]
    );
}

#[derive(Default)]
struct Recorder(Arc<Mutex<Vec<Message>>>);

impl Handler for Recorder {
    fn software(&mut self, m: itm::Software) {
        self.0.lock().unwrap().push(Message::Software(m));
    }

    fn local_timestamp(&mut self, m: itm::LocalTimestamp) {
        self.0.lock().unwrap().push(Message::LocalTimestamp(m));
    }

    fn pc_sample(&mut self, m: itm::PcSample) {
        self.0.lock().unwrap().push(Message::PcSample(m));
    }

    fn nisync(&mut self, m: itm::NiSync) {
        self.0.lock().unwrap().push(Message::NiSync(m));
    }
}

#[test]
fn framed_itm_dispatches_in_order_with_monotone_timestamps() {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let mut session = Session::new(
        SessionConfig {
            use_tpiu: true,
            itm_stream: 1,
            itm_options: DecoderOptions { force_sync: false },
        },
        Dispatcher::new(Box::new(Recorder(messages.clone()))),
    );

    // ITM traffic padded with nulls to fill two frames.
    let mut itm_bytes = Vec::new();
    itm_bytes.extend(encode_software(0, 0x11, 1));
    itm_bytes.extend(encode_timestamp(100, TimeStatus::Exact));
    itm_bytes.extend(encode_software(0, 0x22, 1));
    itm_bytes.extend(encode_timestamp(50, TimeStatus::Exact));
    itm_bytes.extend_from_slice(&[0x17, 0x78, 0x56, 0x34, 0x12]); // pc sample
    itm_bytes.extend(encode_nisync(0x01, 0x0800_0200));
    itm_bytes.resize(28, 0x00);

    session.pump_all(&TPIU_SYNC);
    let mut halves = itm_bytes.chunks_exact(14);
    for chunk in halves.by_ref() {
        let mut data = [0u8; 14];
        data.copy_from_slice(chunk);
        session.pump_all(&frame(1, &data));
    }

    let messages = messages.lock().unwrap();
    let timestamps: Vec<u64> = messages
        .iter()
        .map(|m| match m {
            Message::Software(m) => m.timestamp,
            Message::LocalTimestamp(m) => m.timestamp,
            Message::PcSample(m) => m.timestamp,
            Message::NiSync(m) => m.timestamp,
            other => panic!("unexpected message {:?}", other),
        })
        .collect();

    assert_eq!(timestamps.len(), 6);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    match &messages[4] {
        Message::PcSample(m) => {
            assert_eq!(m.pc, 0x1234_5678);
            assert_eq!(m.timestamp, 150);
        }
        other => panic!("unexpected message {:?}", other),
    }
    match &messages[5] {
        Message::NiSync(m) => {
            assert_eq!((m.kind, m.addr), (0x01, 0x0800_0200));
            assert_eq!(m.timestamp, 150);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn running_ring_keeps_the_newest_capacity_bytes() {
    let mut ring = PmRing::new(MIN_CAPACITY, Policy::Running);
    let total = MIN_CAPACITY + 100;
    for i in 0..total {
        ring.push((i % 251) as u8);
    }

    assert!(!ring.held());
    let contents = ring.contents();
    assert_eq!(contents.len(), MIN_CAPACITY);
    let expected: Vec<u8> = (100..total).map(|i| (i % 251) as u8).collect();
    assert_eq!(contents, expected);
}

#[test]
fn single_shot_ring_freezes_until_release() {
    let mut ring = PmRing::new(MIN_CAPACITY, Policy::SingleShot);
    for i in 0..MIN_CAPACITY {
        assert!(ring.push(i as u8));
    }
    assert!(!ring.held());

    assert!(!ring.push(0xAA));
    assert!(ring.held());
    assert_eq!(ring.len(), MIN_CAPACITY);

    // Held means held: nothing enters.
    assert!(!ring.push(0xBB));
    assert_eq!(ring.contents()[0], 0);

    ring.release();
    assert!(!ring.held());
    assert!(ring.push(0xCC));
    assert!(ring.push(0xDD));
    assert_eq!(ring.contents(), vec![0xCC, 0xDD]);
}
