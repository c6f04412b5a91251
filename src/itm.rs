//! Decoder for the ITM (Instrumentation Trace Macrocell) packet
//! protocol: variable-length messages from software stimulus ports, the
//! DWT hardware and the local timestamp unit, as specified in the
//! ARMv7-M architecture reference manual, Appendix D4.
//!
//! The decoder is byte-at-a-time and sans-I/O: feed bytes with
//! [`pump`](ItmDecoder::pump), fetch the typed message with
//! [`get_message`](ItmDecoder::get_message) after a
//! [`Event::PacketRxed`].

use bitmatch::bitmatch;
use serde::{Deserialize, Serialize};

/// Payload length declared by the `ss` field of a source packet header.
fn payload_len(ss: u8) -> Option<u8> {
    match ss {
        0b01 => Some(1),
        0b10 => Some(2),
        0b11 => Some(4),
        _ => None,
    }
}

/// Relation between a local timestamp value and the data packets it
/// covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeStatus {
    /// The timestamp is synchronous to the corresponding data.
    Exact,
    /// The timestamp itself was delayed.
    TimeDelayed,
    /// The corresponding packet was delayed.
    PacketDelayed,
    /// Both the timestamp and the packet were delayed.
    BothDelayed,
}

impl From<u8> for TimeStatus {
    fn from(tc: u8) -> Self {
        match tc & 0x03 {
            0b00 => TimeStatus::Exact,
            0b01 => TimeStatus::TimeDelayed,
            0b10 => TimeStatus::PacketDelayed,
            _ => TimeStatus::BothDelayed,
        }
    }
}

/// What the processor did with an exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionAction {
    Enter,
    Exit,
    Resume,
}

/// Payload written to a software stimulus port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Software {
    pub timestamp: u64,
    /// Stimulus port 0..31.
    pub src_addr: u8,
    /// Number of significant bytes in `value`: 1, 2 or 4.
    pub len: u8,
    /// Little-endian assembled value.
    pub value: u32,
}

/// Local timestamp: time elapsed since the previous timestamp message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTimestamp {
    pub timestamp: u64,
    pub time_inc: u32,
    pub status: TimeStatus,
}

/// Exception entry, exit or resumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionTrace {
    pub timestamp: u64,
    pub number: u16,
    pub action: ExceptionAction,
}

/// Periodic PC sample, or a sleep indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSample {
    pub timestamp: u64,
    pub pc: u32,
    pub sleep: bool,
}

/// One or more DWT event counters wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwtEvent {
    pub timestamp: u64,
    /// Bitmap over [`DwtEvent::CPI`] .. [`DwtEvent::CYC`].
    pub events: u8,
}

impl DwtEvent {
    pub const CPI: u8 = 1 << 0;
    pub const EXC: u8 = 1 << 1;
    pub const SLEEP: u8 = 1 << 2;
    pub const LSU: u8 = 1 << 3;
    pub const FOLD: u8 = 1 << 4;
    pub const CYC: u8 = 1 << 5;

    /// Names of the set events, in bit order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        const NAMES: [&str; 6] = ["CPI", "Exc", "Sleep", "LSU", "Fold", "Cyc"];
        NAMES
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.events & (1 << i) != 0)
            .map(|(_, n)| *n)
    }
}

/// A DWT comparator matched a data read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRwwp {
    pub timestamp: u64,
    pub comparator: u8,
    pub is_write: bool,
    pub data: u32,
}

/// A DWT comparator matched an access; the packet carries the PC of the
/// matching instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccessWp {
    pub timestamp: u64,
    pub comparator: u8,
    pub data: u32,
}

/// A DWT comparator matched an address; the packet carries the low
/// half of the data address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOffsetWp {
    pub timestamp: u64,
    pub comparator: u8,
    pub offset: u16,
}

/// Non-instruction synchronisation: a sync reason plus an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiSync {
    pub timestamp: u64,
    pub kind: u8,
    pub addr: u32,
}

/// The trace unit dropped data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overflow {
    pub timestamp: u64,
}

/// A decoded ITM message. Every variant carries the running timestamp
/// as of the instant its header byte was consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Software(Software),
    LocalTimestamp(LocalTimestamp),
    ExceptionTrace(ExceptionTrace),
    PcSample(PcSample),
    DwtEvent(DwtEvent),
    DataRwwp(DataRwwp),
    DataAccessWp(DataAccessWp),
    DataOffsetWp(DataOffsetWp),
    NiSync(NiSync),
    Overflow(Overflow),
}

/// What a call to [`ItmDecoder::pump`] observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing to report.
    None,
    /// The decoder just (re)gained sync.
    Synced,
    /// The decoder lost sync (invalid header while strict).
    Unsynced,
    /// An overflow message arrived; also available via `get_message`.
    Overflow,
    /// A malformed packet was dropped.
    Error,
    /// A message is available via [`ItmDecoder::get_message`].
    PacketRxed,
}

/// Running decode statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sync_count: u64,
    pub lost_sync_count: u64,
    pub overflow: u64,
    pub sw_packets: u64,
    pub hw_packets: u64,
    pub ts_packets: u64,
    pub page_packets: u64,
    pub error_packets: u64,
}

/// [`ItmDecoder`] construction options.
#[derive(Clone, Copy, Debug)]
pub struct DecoderOptions {
    /// When set, the decoder starts unsynced and requires a real sync
    /// sequence (or an external [`ItmDecoder::force_sync`]) before it
    /// decodes anything, and an invalid header drops it back to the
    /// unsynced state.
    pub force_sync: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self { force_sync: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Unsynced,
    Idle,
    Collecting(Target),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Timestamp { status: TimeStatus },
    Software { addr: u8, len: u8 },
    Hardware { disc: u8 },
    NiSync,
}

/// ITM packet decoder.
pub struct ItmDecoder {
    state: State,
    options: DecoderOptions,
    zero_run: u32,
    payload: [u8; 5],
    count: usize,
    remaining: usize,
    /// Running timestamp, advanced by completed timestamp messages.
    timestamp: u64,
    /// `timestamp` as of the current packet's header byte.
    header_timestamp: u64,
    page: u8,
    message: Option<Message>,
    stats: Stats,
}

impl ItmDecoder {
    /// Minimum number of zero bytes before the `0x80` sync tail.
    const SYNC_ZEROES: u32 = 5;

    pub fn new(options: DecoderOptions) -> Self {
        Self {
            state: if options.force_sync {
                State::Unsynced
            } else {
                State::Idle
            },
            options,
            zero_run: 0,
            payload: [0; 5],
            count: 0,
            remaining: 0,
            timestamp: 0,
            header_timestamp: 0,
            page: 0,
            message: None,
            stats: Stats::default(),
        }
    }

    pub fn synced(&self) -> bool {
        self.state != State::Unsynced
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The running timestamp accumulator.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Current stimulus page selected by extension packets.
    pub fn stimulus_page(&self) -> u8 {
        self.page
    }

    /// Out-of-band sync control, driven by the upstream framer: `true`
    /// when the framer gained sync, `false` when it lost it.
    pub fn force_sync(&mut self, synced: bool) {
        if synced {
            if self.state == State::Unsynced {
                self.stats.sync_count += 1;
            }
            self.state = State::Idle;
        } else {
            if self.state != State::Unsynced {
                self.stats.lost_sync_count += 1;
            }
            self.state = State::Unsynced;
        }
        self.zero_run = 0;
        self.count = 0;
    }

    /// Fetch the message produced by the most recent
    /// [`Event::PacketRxed`] or [`Event::Overflow`].
    pub fn get_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    /// Feed one byte.
    pub fn pump(&mut self, byte: u8) -> Event {
        match self.state {
            State::Unsynced => {
                if byte == 0 {
                    self.zero_run += 1;
                } else {
                    let event = if byte == 0x80 && self.zero_run >= Self::SYNC_ZEROES {
                        self.stats.sync_count += 1;
                        self.state = State::Idle;
                        Event::Synced
                    } else {
                        Event::None
                    };
                    self.zero_run = 0;
                    return event;
                }
                Event::None
            }
            State::Idle => {
                if byte == 0 {
                    // Null byte: padding, or the body of a sync
                    // sequence.
                    self.zero_run += 1;
                    return Event::None;
                }
                if byte == 0x80 && self.zero_run >= Self::SYNC_ZEROES {
                    // Sync sequence while already in sync; realignment
                    // is a no-op.
                    self.zero_run = 0;
                    return Event::None;
                }
                self.zero_run = 0;
                self.header_timestamp = self.timestamp;
                self.decode_header(byte)
            }
            State::Collecting(target) => {
                self.payload[self.count] = byte;
                self.count += 1;

                let done = match target {
                    // Timestamp payloads end at the first byte without
                    // the continuation bit, or after four bytes.
                    Target::Timestamp { .. } => byte & 0x80 == 0 || self.count == 4,
                    _ => self.count == self.remaining,
                };

                if done {
                    self.state = State::Idle;
                    self.complete(target)
                } else {
                    Event::None
                }
            }
        }
    }

    #[bitmatch]
    fn decode_header(&mut self, header: u8) -> Event {
        #[bitmatch]
        match header {
            "0111_0000" => {
                self.stats.overflow += 1;
                self.message = Some(Message::Overflow(Overflow {
                    timestamp: self.header_timestamp,
                }));
                Event::Overflow
            }
            "0ttt_0000" => {
                // Short local timestamp, always exact. t is 1..=6 here:
                // zero is the null byte and seven the overflow header,
                // both matched above.
                let message = LocalTimestamp {
                    timestamp: self.header_timestamp,
                    time_inc: u32::from(t),
                    status: TimeStatus::Exact,
                };
                self.timestamp += u64::from(t);
                self.stats.ts_packets += 1;
                self.message = Some(Message::LocalTimestamp(message));
                Event::PacketRxed
            }
            "1urr_0000" => {
                // Local timestamp with continuation payload; 0x80 (all
                // status bits clear) is reserved.
                if u == 0 && r == 0 {
                    return self.invalid_header();
                }
                self.collect(Target::Timestamp { status: r.into() }, 4)
            }
            "0ppp_1000" => {
                // Single-byte extension: stimulus page select.
                self.page = p;
                self.stats.page_packets += 1;
                Event::None
            }
            "1???_1000" => {
                // Extended extension: non-instruction sync, one type
                // byte then a word of address.
                self.collect(Target::NiSync, 5)
            }
            "aaaa_a0ss" => {
                // Software source. ss is never zero here: every header
                // with zeroed low bits has been matched above.
                let len = match payload_len(s) {
                    Some(len) => len,
                    None => return self.invalid_header(),
                };
                self.collect(Target::Software { addr: a, len }, usize::from(len))
            }
            "aaaa_a1ss" => {
                // Hardware source; the address field is a
                // discriminator.
                let valid_disc = a <= 2 || (8..=23).contains(&a);
                let len = match payload_len(s) {
                    Some(len) if valid_disc => len,
                    _ => return self.invalid_header(),
                };
                self.collect(Target::Hardware { disc: a }, usize::from(len))
            }
        }
    }

    fn collect(&mut self, target: Target, len: usize) -> Event {
        self.state = State::Collecting(target);
        self.count = 0;
        self.remaining = len;
        Event::None
    }

    fn invalid_header(&mut self) -> Event {
        self.stats.error_packets += 1;
        if self.options.force_sync {
            self.stats.lost_sync_count += 1;
            self.state = State::Unsynced;
            Event::Unsynced
        } else {
            Event::Error
        }
    }

    fn malformed(&mut self) -> Event {
        self.stats.error_packets += 1;
        Event::Error
    }

    fn complete(&mut self, target: Target) -> Event {
        let timestamp = self.header_timestamp;
        let payload = &self.payload[..self.count];

        let message = match target {
            Target::Timestamp { status } => {
                let time_inc = payload
                    .iter()
                    .enumerate()
                    .fold(0u32, |acc, (i, b)| acc | u32::from(b & 0x7F) << (7 * i));
                self.timestamp += u64::from(time_inc);
                self.stats.ts_packets += 1;
                Message::LocalTimestamp(LocalTimestamp {
                    timestamp,
                    time_inc,
                    status,
                })
            }
            Target::Software { addr, len } => {
                self.stats.sw_packets += 1;
                Message::Software(Software {
                    timestamp,
                    src_addr: addr,
                    len,
                    value: le_value(payload),
                })
            }
            Target::NiSync => {
                self.stats.hw_packets += 1;
                Message::NiSync(NiSync {
                    timestamp,
                    kind: payload[0],
                    addr: le_value(&payload[1..5]),
                })
            }
            Target::Hardware { disc } => match self.complete_hardware(disc, timestamp) {
                Some(message) => {
                    self.stats.hw_packets += 1;
                    message
                }
                None => return self.malformed(),
            },
        };

        self.message = Some(message);
        Event::PacketRxed
    }

    fn complete_hardware(&self, disc: u8, timestamp: u64) -> Option<Message> {
        let payload = &self.payload[..self.count];
        let value = le_value(payload);

        Some(match disc {
            0 => {
                if payload.len() != 1 {
                    return None;
                }
                Message::DwtEvent(DwtEvent {
                    timestamp,
                    events: payload[0] & 0x3F,
                })
            }
            1 => {
                if payload.len() != 2 {
                    return None;
                }
                let number = u16::from(payload[1] & 0x01) << 8 | u16::from(payload[0]);
                let action = match (payload[1] >> 4) & 0x03 {
                    0b01 => ExceptionAction::Enter,
                    0b10 => ExceptionAction::Exit,
                    0b11 => ExceptionAction::Resume,
                    _ => return None,
                };
                Message::ExceptionTrace(ExceptionTrace {
                    timestamp,
                    number,
                    action,
                })
            }
            2 => match payload.len() {
                1 if payload[0] == 0 => Message::PcSample(PcSample {
                    timestamp,
                    pc: 0,
                    sleep: true,
                }),
                4 => Message::PcSample(PcSample {
                    timestamp,
                    pc: value,
                    sleep: false,
                }),
                _ => return None,
            },
            8..=15 => {
                let comparator = (disc >> 1) & 0x03;
                if disc & 1 == 0 {
                    if payload.len() != 4 {
                        return None;
                    }
                    Message::DataAccessWp(DataAccessWp {
                        timestamp,
                        comparator,
                        data: value,
                    })
                } else {
                    if payload.len() != 2 {
                        return None;
                    }
                    Message::DataOffsetWp(DataOffsetWp {
                        timestamp,
                        comparator,
                        offset: value as u16,
                    })
                }
            }
            16..=23 => Message::DataRwwp(DataRwwp {
                timestamp,
                comparator: (disc >> 1) & 0x03,
                is_write: disc & 1 != 0,
                data: value,
            }),
            _ => return None,
        })
    }
}

/// Assemble up to four bytes little-endian; anything beyond the fourth
/// byte is ignored.
fn le_value(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | u32::from(*b) << (8 * i))
}
