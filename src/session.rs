//! The trace session: owns the decoders for one input stream and
//! couples them. Bytes go in, dispatched messages come out; nothing in
//! here calls back upstream.

use crate::dispatch::Dispatcher;
use crate::etm::{ChangeSet, CpuState, EtmDecoder};
use crate::itm::{self, ItmDecoder};
use crate::log;
use crate::ring::{PmRing, Policy};
use crate::tpiu::{self, TpiuDecoder};

/// TPIU stream that carries ITM data by default.
pub const DEFAULT_ITM_STREAM: u8 = 1;

/// TPIU stream captured for post-mortem ETM decode by default.
pub const DEFAULT_ETM_STREAM: u8 = 2;

/// Streams that are legal to see and ignore: null padding and the
/// trigger stream.
const NULL_STREAM: u8 = 0;
const TRIGGER_STREAM: u8 = 0x7F;

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Whether the input is TPIU-framed; when false bytes feed the ITM
    /// decoder directly.
    pub use_tpiu: bool,
    /// TPIU stream on which ITM traffic appears.
    pub itm_stream: u8,
    pub itm_options: itm::DecoderOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_tpiu: false,
            itm_stream: DEFAULT_ITM_STREAM,
            itm_options: itm::DecoderOptions::default(),
        }
    }
}

/// A live decode session: TPIU demux (optional), ITM decode, dispatch.
pub struct Session {
    config: SessionConfig,
    tpiu: TpiuDecoder,
    itm: ItmDecoder,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn new(config: SessionConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            tpiu: TpiuDecoder::new(),
            itm: ItmDecoder::new(config.itm_options),
            dispatcher,
        }
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn itm_stats(&self) -> &itm::Stats {
        self.itm.stats()
    }

    pub fn tpiu_stats(&self) -> &tpiu::Stats {
        self.tpiu.stats()
    }

    pub fn comms_stats(&self) -> Option<&tpiu::CommsStats> {
        self.tpiu.comms_stats()
    }

    /// Put both decoders into a defined synced state.
    pub fn force_sync(&mut self) {
        self.tpiu.force_sync(0);
        self.itm.force_sync(true);
    }

    pub fn pump_all(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.pump(*byte);
        }
    }

    /// Top-level protocol pump for one byte of input.
    pub fn pump(&mut self, byte: u8) {
        if self.config.use_tpiu {
            self.tpiu_pump(byte);
        } else {
            // No TPIU in use; straight to the ITM layer.
            self.itm_pump(byte);
        }
    }

    fn tpiu_pump(&mut self, byte: u8) {
        match self.tpiu.pump(byte) {
            tpiu::Event::None | tpiu::Event::Rxing => (),
            tpiu::Event::NewSync => {
                log::info(format!(
                    "TPIU in sync ({})",
                    self.tpiu.stats().sync_count
                ));
                self.itm.force_sync(true);
            }
            tpiu::Event::Synced => self.itm.force_sync(true),
            tpiu::Event::Unsynced => {
                log::info(format!(
                    "TPIU lost sync ({})",
                    self.tpiu.stats().lost_sync
                ));
                self.itm.force_sync(false);
            }
            tpiu::Event::RxedPacket => match self.tpiu.get_packet() {
                Some(packet) => {
                    for item in packet.items {
                        if item.stream == self.config.itm_stream {
                            self.itm_pump(item.byte);
                        } else if item.stream != NULL_STREAM && item.stream != TRIGGER_STREAM {
                            // Streams we are not watching are legal;
                            // note and move on.
                            log::debug(format!("unhandled TPIU stream {:02x}", item.stream));
                        }
                    }
                }
                None => log::warn("TPIU packet fetch fell over".to_string()),
            },
            tpiu::Event::Error => log::err("TPIU decoder in illegal state".to_string()),
        }
    }

    fn itm_pump(&mut self, byte: u8) {
        match self.itm.pump(byte) {
            itm::Event::None => (),
            itm::Event::Unsynced => {
                log::warn(format!(
                    "ITM lost sync ({})",
                    self.itm.stats().lost_sync_count
                ));
            }
            itm::Event::Synced => {
                log::info(format!("ITM in sync ({})", self.itm.stats().sync_count));
            }
            itm::Event::Error => log::warn("ITM decode error".to_string()),
            itm::Event::Overflow => {
                log::warn(format!("ITM overflow ({})", self.itm.stats().overflow));
                if let Some(message) = self.itm.get_message() {
                    self.dispatcher.dispatch(message);
                }
            }
            itm::Event::PacketRxed => {
                if let Some(message) = self.itm.get_message() {
                    self.dispatcher.dispatch(message);
                }
            }
        }
    }
}

/// Capture side of the post-mortem tool: demultiplexes (or passes
/// through) the input into the ring, and replays the ring through the
/// ETM decoder on demand.
pub struct MortemCapture {
    tpiu: Option<TpiuDecoder>,
    etm_stream: u8,
    ring: PmRing,
}

impl MortemCapture {
    pub fn new(use_tpiu: bool, etm_stream: u8, ring: PmRing) -> Self {
        Self {
            tpiu: if use_tpiu {
                let mut decoder = TpiuDecoder::new();
                decoder.force_sync(0);
                Some(decoder)
            } else {
                None
            },
            etm_stream,
            ring,
        }
    }

    pub fn ring(&self) -> &PmRing {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut PmRing {
        &mut self.ring
    }

    /// Feed one input byte towards the ring.
    pub fn pump(&mut self, byte: u8) {
        match self.tpiu.as_mut() {
            None => {
                self.ring.push(byte);
            }
            Some(tpiu) => {
                if tpiu.pump(byte) == tpiu::Event::RxedPacket {
                    if let Some(packet) = tpiu.get_packet() {
                        for item in packet.items {
                            if item.stream == self.etm_stream {
                                self.ring.push(item.byte);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn pump_all(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.pump(*byte);
        }
    }

    /// Decode the capture. A wrapped running capture discarded bytes
    /// mid-packet, so the ETM decoder is desynced first and picks up at
    /// the next alignment point inside the buffer.
    pub fn decode<F>(&self, etm: &mut EtmDecoder, mut on_state: F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        if self.ring.wrapped() && self.ring.policy() == Policy::Running {
            etm.force_sync(false);
        }

        self.ring
            .drain_for_decode(|slice| etm.pump(slice, &mut on_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Handler;
    use crate::etm::EtmOptions;
    use crate::itm::{DecoderOptions, Message, Software};
    use crate::ring::MIN_CAPACITY;

    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<Message>>>);

    impl Handler for Recorder {
        fn software(&mut self, m: Software) {
            self.0.lock().unwrap().push(Message::Software(m));
        }

        fn local_timestamp(&mut self, m: crate::itm::LocalTimestamp) {
            self.0.lock().unwrap().push(Message::LocalTimestamp(m));
        }
    }

    fn session(use_tpiu: bool) -> (Session, Arc<Mutex<Vec<Message>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let session = Session::new(
            SessionConfig {
                use_tpiu,
                itm_stream: DEFAULT_ITM_STREAM,
                itm_options: DecoderOptions { force_sync: false },
            },
            Dispatcher::new(Box::new(Recorder(messages.clone()))),
        );
        (session, messages)
    }

    #[test]
    fn raw_itm_stream_dispatches_in_order() {
        let (mut session, messages) = session(false);
        session.pump_all(&[
            0x30, // ts +3
            0x01, 0x11, // sw chan 0
            0x09, 0x22, // sw chan 1
        ]);

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        match (&messages[1], &messages[2]) {
            (Message::Software(a), Message::Software(b)) => {
                assert_eq!((a.src_addr, a.value, a.timestamp), (0, 0x11, 3));
                assert_eq!((b.src_addr, b.value, b.timestamp), (1, 0x22, 3));
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn tpiu_frames_demux_to_itm() {
        let (mut session, messages) = session(true);

        // Sync up the framer.
        session.pump_all(&[0xFF, 0xFF, 0xFF, 0x7F]);

        // One frame: an immediate switch to the ITM stream, then a
        // two-byte software packet and padding nulls.
        let mut frame = [0u8; 16];
        frame[0] = (DEFAULT_ITM_STREAM << 1) | 1;
        frame[1] = 0x01; // header: sw chan 0, one byte
        frame[2] = 0xAA; // payload; its low bit lives in the aux byte
        frame[15] = 1 << 1; // aux: low bit of the byte at position 2
        session.pump_all(&frame);

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Software(m) => assert_eq!((m.src_addr, m.value), (0, 0xAB)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn mortem_demux_filters_to_stream() {
        let ring = PmRing::new(MIN_CAPACITY, Policy::Running);
        let mut capture = MortemCapture::new(true, DEFAULT_ETM_STREAM, ring);

        let mut frame = [0u8; 16];
        frame[0] = (DEFAULT_ETM_STREAM << 1) | 1;
        frame[1] = 0xAA;
        frame[2] = 0xBA; // low bit stored in aux byte
        frame[15] = 1 << 1;
        capture.pump_all(&frame);

        // Everything after the switch belongs to the ETM stream.
        let contents = capture.ring().contents();
        assert_eq!(contents[0], 0xAA);
        assert_eq!(contents[1], 0xBB);
        assert_eq!(contents.len(), 14);
    }

    #[test]
    fn mortem_raw_capture_and_decode() {
        let ring = PmRing::new(MIN_CAPACITY, Policy::Running);
        let mut capture = MortemCapture::new(false, DEFAULT_ETM_STREAM, ring);

        let mut stream = vec![0, 0, 0, 0, 0, 0x80, 0x08, 0x01];
        stream.extend_from_slice(&0x2000_0000u32.to_le_bytes());
        capture.pump_all(&stream);

        let mut etm = EtmDecoder::new(EtmOptions::default());
        let mut states = Vec::new();
        capture.decode(&mut etm, |cpu, _| states.push(*cpu));
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].addr, 0x2000_0000);
    }
}
