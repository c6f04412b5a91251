//! Decoder for the TPIU (Trace Port Interface Unit) framing protocol:
//! 16-byte frames multiplexing several logical streams onto one
//! physical link. The decoder resynchronises on the full-sync pattern,
//! filters half-sync filler, abandons stale frames, and unpacks each
//! complete frame into `(stream, byte)` items.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Length of a TPIU frame on the wire: 15 payload bytes plus the
/// auxiliary low-bits byte.
pub const FRAME_LEN: usize = 16;

/// Rolling 32-bit pattern that marks a frame boundary.
const SYNC_PATTERN: u32 = 0xFFFF_FF7F;

/// A `0xFF 0x7F` pair is filler emitted by the link when it has
/// nothing better to say; it is discarded in pairs.
const HALFSYNC_LOW: u8 = 0xFF;
const HALFSYNC_HIGH: u8 = 0x7F;

/// First payload byte of a link-statistics frame.
const STATS_FRAME_MARKER: u8 = 0xA6;

/// An in-progress frame older than this is considered stale and drops
/// the decoder back to the unsynced state.
const STALE_FRAME: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Unsynced,
    Rxing,
}

/// What a call to [`TpiuDecoder::pump`] observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing of note.
    None,
    /// A frame is being collected.
    Rxing,
    /// Sync pattern seen while previously unsynced.
    NewSync,
    /// Sync pattern seen while already receiving.
    Synced,
    /// A complete frame is available via [`TpiuDecoder::get_packet`].
    RxedPacket,
    /// Sync was lost (stale frame); the in-progress frame is abandoned.
    Unsynced,
    /// The decoder reached an invalid internal state.
    Error,
}

/// Running decode statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Complete frames delivered.
    pub packets: u64,
    /// Times the sync pattern was acquired.
    pub sync_count: u64,
    /// Times sync was lost to a stale frame.
    pub lost_sync: u64,
    /// Half-sync pairs discarded.
    pub half_sync_count: u64,
    /// Pump calls that found the decoder in an invalid state.
    pub error: u64,
}

/// Link statistics carried in-band in a frame whose first payload byte
/// is `0xA6`, little-endian fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommsStats {
    pub pending_count: u16,
    pub leds: u8,
    pub lost_frames: u16,
    pub total_frames: u32,
}

/// One demultiplexed byte: which logical stream it belongs to, and its
/// reconstructed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DemuxedByte {
    pub stream: u8,
    pub byte: u8,
}

/// The logical content of one decoded frame: up to 15 demultiplexed
/// bytes, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TpiuPacket {
    pub items: Vec<DemuxedByte>,
}

/// TPIU frame decoder.
///
/// Single-owner, byte-at-a-time: feed bytes with [`pump`](Self::pump)
/// and fetch the unpacked frame with [`get_packet`](Self::get_packet)
/// immediately after a [`Event::RxedPacket`].
pub struct TpiuDecoder {
    state: State,
    sync_monitor: u32,
    frame: [u8; FRAME_LEN],
    byte_count: usize,
    got_low_bits: bool,
    frame_complete: bool,
    current_stream: u8,
    last_packet: Instant,
    stats: Stats,
    comms: Option<CommsStats>,
}

impl TpiuDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Unsynced,
            sync_monitor: 0,
            frame: [0; FRAME_LEN],
            byte_count: 0,
            got_low_bits: false,
            frame_complete: false,
            current_stream: 0,
            last_packet: Instant::now(),
            stats: Stats::default(),
            comms: None,
        }
    }

    pub fn synced(&self) -> bool {
        self.state != State::Unsynced
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn zero_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Latest link statistics frame seen, if any.
    pub fn comms_stats(&self) -> Option<&CommsStats> {
        self.comms.as_ref()
    }

    /// Force the decoder into the receiving state at a given offset
    /// into the frame. Used by callers that know where a frame boundary
    /// is (or that have given up on finding one).
    pub fn force_sync(&mut self, offset: usize) {
        if self.state == State::Unsynced {
            self.stats.sync_count += 1;
        }

        self.state = State::Rxing;
        self.byte_count = offset;
        self.got_low_bits = false;
        self.frame_complete = false;
        self.last_packet = Instant::now();
    }

    /// Feed one byte, stamping it with the current time.
    pub fn pump(&mut self, byte: u8) -> Event {
        self.pump_at(byte, Instant::now())
    }

    /// Feed one byte with an explicit arrival time. The stale-frame
    /// check compares `now` against the previous frame boundary.
    pub fn pump_at(&mut self, byte: u8, now: Instant) -> Event {
        self.sync_monitor = (self.sync_monitor << 8) | u32::from(byte);

        if self.sync_monitor == SYNC_PATTERN {
            let event = if self.state == State::Unsynced {
                Event::NewSync
            } else {
                Event::Synced
            };

            // A statistics frame is squeezed in just before the sync
            // pattern; it is still a frame boundary reset.
            if self.byte_count == 14 && self.frame[0] == STATS_FRAME_MARKER {
                self.comms = Some(decode_comms_stats(&self.frame));
            }

            self.state = State::Rxing;
            self.stats.sync_count += 1;
            self.byte_count = 0;
            self.got_low_bits = false;
            self.frame_complete = false;
            self.last_packet = now;

            return event;
        }

        match self.state {
            State::Unsynced => Event::None,
            State::Rxing => {
                // Bytes are collected in pairs so that half-sync filler
                // can be dropped before it pollutes the frame.
                if !self.got_low_bits {
                    self.got_low_bits = true;
                    self.frame[self.byte_count] = byte;
                    return Event::None;
                }

                self.got_low_bits = false;

                if byte == HALFSYNC_HIGH && self.frame[self.byte_count] == HALFSYNC_LOW {
                    self.stats.half_sync_count += 1;
                    return Event::None;
                }

                self.byte_count += 1;
                self.frame[self.byte_count] = byte;
                self.byte_count += 1;

                if self.byte_count != FRAME_LEN {
                    return Event::Rxing;
                }

                let stale = now.duration_since(self.last_packet) >= STALE_FRAME;
                self.last_packet = now;
                self.byte_count = 0;

                if stale {
                    self.state = State::Unsynced;
                    self.stats.lost_sync += 1;
                    Event::Unsynced
                } else {
                    self.stats.packets += 1;
                    self.frame_complete = true;
                    Event::RxedPacket
                }
            }
        }
    }

    /// Unpack the most recently completed frame. Valid only directly
    /// after [`Event::RxedPacket`]; the scratch frame is overwritten by
    /// subsequent pumping.
    pub fn get_packet(&mut self) -> Option<TpiuPacket> {
        if !self.frame_complete {
            return None;
        }
        self.frame_complete = false;

        let mut packet = TpiuPacket::default();
        let mut low_bits = self.frame[FRAME_LEN - 1];
        let mut delayed_stream = None;

        for i in (0..FRAME_LEN).step_by(2) {
            if self.frame[i] & 1 != 0 {
                // Stream change; the low bit of the auxiliary byte
                // decides whether it applies before or after the
                // companion data byte.
                let stream = self.frame[i] >> 1;
                if low_bits & 1 != 0 {
                    delayed_stream = Some(stream);
                } else {
                    self.current_stream = stream;
                }
            } else {
                packet.items.push(DemuxedByte {
                    stream: self.current_stream,
                    byte: self.frame[i] | (low_bits & 1),
                });
            }

            // The second byte of the pair is always data, with its low
            // bit intact.
            if i < FRAME_LEN - 2 {
                packet.items.push(DemuxedByte {
                    stream: self.current_stream,
                    byte: self.frame[i + 1],
                });
            }

            if let Some(stream) = delayed_stream.take() {
                self.current_stream = stream;
            }

            low_bits >>= 1;
        }

        Some(packet)
    }
}

impl Default for TpiuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_comms_stats(frame: &[u8; FRAME_LEN]) -> CommsStats {
    CommsStats {
        pending_count: u16::from_le_bytes([frame[1], frame[2]]),
        leds: frame[5],
        lost_frames: u16::from_le_bytes([frame[6], frame[7]]),
        total_frames: u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]),
    }
}
