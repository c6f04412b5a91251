//! Channel configuration and event presentation: per-channel printf
//! style format templates for software messages, and the ASCII record
//! format for hardware events.

use crate::itm::{
    DataAccessWp, DataOffsetWp, DataRwwp, DwtEvent, ExceptionTrace, LocalTimestamp, NiSync,
    PcSample, Software, TimeStatus,
};

use std::fmt::Write;

use thiserror::Error;

/// Record type numbers on the hardware event channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwEvent {
    Exception = 0,
    Dwt = 1,
    PcSample = 2,
    Rwwt = 3,
    Awp = 4,
    Ofs = 5,
    Ts = 6,
    NiSync = 7,
}

const EOL: &str = "\n";

/// Largest rendered event; longer output is truncated.
pub const MAX_EVENT_LEN: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Format string ends inside a % specifier")]
    TruncatedSpec,
    #[error("Unsupported conversion %{0}")]
    BadConversion(char),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Conv {
    Signed,
    Unsigned,
    Hex { upper: bool },
    Octal,
    Char,
    Float,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Spec {
        zero_pad: bool,
        width: usize,
        precision: Option<usize>,
        conv: Conv,
    },
}

/// How the template consumes a software message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Render once with the 32-bit value.
    Value,
    /// Render once with the value reinterpreted as an IEEE-754 single.
    Float,
    /// Render once per payload byte, least significant first.
    PerByte,
}

/// A parsed printf-style channel format.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatTemplate {
    segments: Vec<Segment>,
    mode: Mode,
}

impl FormatTemplate {
    /// Parse a template. `\n`, `\t` and `\\` escapes are honoured;
    /// `%%` is a literal percent sign.
    pub fn parse(format: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut mode = Mode::Value;
        let mut chars = format.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => literal.push('\n'),
                    Some('t') => literal.push('\t'),
                    Some(other) => literal.push(other),
                    None => literal.push('\\'),
                },
                '%' => {
                    if chars.peek() == Some(&'%') {
                        chars.next();
                        literal.push('%');
                        continue;
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }

                    let mut zero_pad = false;
                    let mut width = 0usize;
                    let mut precision = None;

                    while let Some(d) = chars.peek().copied() {
                        match d {
                            '0' if width == 0 => {
                                zero_pad = true;
                                chars.next();
                            }
                            '1'..='9' => {
                                // NOTE(unwrap) arm admits digits only
                                width = width * 10 + d.to_digit(10).unwrap() as usize;
                                chars.next();
                            }
                            '0' => {
                                width *= 10;
                                chars.next();
                            }
                            '.' => {
                                chars.next();
                                let mut p = 0usize;
                                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                                    p = p * 10 + d as usize;
                                    chars.next();
                                }
                                precision = Some(p);
                            }
                            // Length modifiers are meaningless for a
                            // 32-bit value; swallow them.
                            'l' | 'h' | 'z' => {
                                chars.next();
                            }
                            _ => break,
                        }
                    }

                    let conv = match chars.next().ok_or(FormatError::TruncatedSpec)? {
                        'd' | 'i' => Conv::Signed,
                        'u' => Conv::Unsigned,
                        'x' => Conv::Hex { upper: false },
                        'X' => Conv::Hex { upper: true },
                        'o' => Conv::Octal,
                        'c' => {
                            mode = Mode::PerByte;
                            Conv::Char
                        }
                        'f' => {
                            if mode != Mode::PerByte {
                                mode = Mode::Float;
                            }
                            Conv::Float
                        }
                        other => return Err(FormatError::BadConversion(other)),
                    };

                    segments.push(Segment::Spec {
                        zero_pad,
                        width,
                        precision,
                        conv,
                    });
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments, mode })
    }

    /// Render a software message through the template.
    pub fn render(&self, m: &Software) -> String {
        let mut out = String::new();
        match self.mode {
            Mode::Value => self.render_once(&mut out, u64::from(m.value), f64::from(m.value)),
            Mode::Float => {
                let f = f32::from_bits(m.value);
                self.render_once(&mut out, f as u64, f64::from(f));
            }
            Mode::PerByte => {
                for byte in m.value.to_le_bytes().iter().take(usize::from(m.len)) {
                    self.render_once(&mut out, u64::from(*byte), f64::from(*byte));
                }
            }
        }

        if out.len() > MAX_EVENT_LEN {
            let mut end = MAX_EVENT_LEN;
            while !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
        }
        out
    }

    fn render_once(&self, out: &mut String, int: u64, float: f64) {
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Spec {
                    zero_pad,
                    width,
                    precision,
                    conv,
                } => {
                    let (w, p) = (*width, *precision);
                    let _ = match conv {
                        Conv::Signed => {
                            let v = int as u32 as i32;
                            if *zero_pad {
                                write!(out, "{:0w$}", v, w = w)
                            } else {
                                write!(out, "{:w$}", v, w = w)
                            }
                        }
                        Conv::Unsigned => {
                            if *zero_pad {
                                write!(out, "{:0w$}", int, w = w)
                            } else {
                                write!(out, "{:w$}", int, w = w)
                            }
                        }
                        Conv::Hex { upper: false } => {
                            if *zero_pad {
                                write!(out, "{:0w$x}", int, w = w)
                            } else {
                                write!(out, "{:w$x}", int, w = w)
                            }
                        }
                        Conv::Hex { upper: true } => {
                            if *zero_pad {
                                write!(out, "{:0w$X}", int, w = w)
                            } else {
                                write!(out, "{:w$X}", int, w = w)
                            }
                        }
                        Conv::Octal => {
                            if *zero_pad {
                                write!(out, "{:0w$o}", int, w = w)
                            } else {
                                write!(out, "{:w$o}", int, w = w)
                            }
                        }
                        Conv::Char => {
                            out.push(int as u8 as char);
                            Ok(())
                        }
                        Conv::Float => {
                            write!(out, "{:w$.p$}", float, w = w, p = p.unwrap_or(6))
                        }
                    };
                }
            }
        }
    }
}

/// One software channel: FIFO/file name and optional format.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub name: String,
    pub format: Option<FormatTemplate>,
}

/// The 32 software channels.
#[derive(Default)]
pub struct ChannelTable {
    channels: [Option<ChannelConfig>; 32],
}

impl ChannelTable {
    pub fn set(&mut self, index: u8, config: ChannelConfig) {
        self.channels[usize::from(index)] = Some(config);
    }

    pub fn get(&self, index: u8) -> Option<&ChannelConfig> {
        self.channels.get(usize::from(index))?.as_ref()
    }

    /// Configured channels, with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &ChannelConfig)> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i as u8, c)))
    }
}

/// The unformatted software-channel representation: the decoded value
/// in little-endian order, truncated to the message length.
pub fn raw_software_bytes(m: &Software) -> Vec<u8> {
    m.value.to_le_bytes()[..usize::from(m.len)].to_vec()
}

/// Renders hardware events as the ASCII records written to the
/// hardware channel: `{kind},{Δts},{fields…}`, one line per event,
/// where Δts is relative to the previous hardware event.
#[derive(Default)]
pub struct HwRecorder {
    last_timestamp: u64,
}

impl HwRecorder {
    fn delta(&mut self, timestamp: u64) -> u64 {
        let delta = timestamp.saturating_sub(self.last_timestamp);
        self.last_timestamp = timestamp;
        delta
    }

    pub fn exception(&mut self, m: &ExceptionTrace) -> String {
        const NAMES: [&str; 16] = [
            "Thread",
            "Reset",
            "NMI",
            "HardFault",
            "MemManage",
            "BusFault",
            "UsageFault",
            "UNKNOWN_7",
            "UNKNOWN_8",
            "UNKNOWN_9",
            "UNKNOWN_10",
            "SVCall",
            "Debug Monitor",
            "UNKNOWN_13",
            "PendSV",
            "SysTick",
        ];
        const EVENTS: [&str; 3] = ["Enter", "Exit", "Resume"];

        let delta = self.delta(m.timestamp);
        let event = EVENTS[m.action as usize];
        if m.number < 16 {
            format!(
                "{},{},{},{}{}",
                HwEvent::Exception as u8,
                delta,
                event,
                NAMES[usize::from(m.number)],
                EOL
            )
        } else {
            format!(
                "{},{},{},External,{}{}",
                HwEvent::Exception as u8,
                delta,
                event,
                m.number - 16,
                EOL
            )
        }
    }

    pub fn dwt_event(&mut self, m: &DwtEvent) -> String {
        let delta = self.delta(m.timestamp);
        let mut out = format!("{},{}", HwEvent::Dwt as u8, delta);
        for name in m.names() {
            out.push(',');
            out.push_str(name);
        }
        out.push_str(EOL);
        out
    }

    pub fn pc_sample(&mut self, m: &PcSample) -> String {
        let delta = self.delta(m.timestamp);
        if m.sleep {
            format!("{},{},**SLEEP**{}", HwEvent::PcSample as u8, delta, EOL)
        } else {
            format!("{},{},{:#010x}{}", HwEvent::PcSample as u8, delta, m.pc, EOL)
        }
    }

    pub fn data_rwwp(&mut self, m: &DataRwwp) -> String {
        let delta = self.delta(m.timestamp);
        format!(
            "{},{},{},{},{:#x}{}",
            HwEvent::Rwwt as u8,
            delta,
            m.comparator,
            if m.is_write { "Write" } else { "Read" },
            m.data,
            EOL
        )
    }

    pub fn data_access_wp(&mut self, m: &DataAccessWp) -> String {
        let delta = self.delta(m.timestamp);
        format!(
            "{},{},{},{:#010x}{}",
            HwEvent::Awp as u8,
            delta,
            m.comparator,
            m.data,
            EOL
        )
    }

    pub fn data_offset_wp(&mut self, m: &DataOffsetWp) -> String {
        let delta = self.delta(m.timestamp);
        format!(
            "{},{},{},{:#06x}{}",
            HwEvent::Ofs as u8,
            delta,
            m.comparator,
            m.offset,
            EOL
        )
    }

    pub fn local_timestamp(&mut self, m: &LocalTimestamp) -> String {
        let status = match m.status {
            TimeStatus::Exact => 0,
            TimeStatus::TimeDelayed => 1,
            TimeStatus::PacketDelayed => 2,
            TimeStatus::BothDelayed => 3,
        };
        format!("{},{},{}{}", HwEvent::Ts as u8, status, m.time_inc, EOL)
    }

    pub fn nisync(&mut self, m: &NiSync) -> String {
        format!(
            "{},{:02x},{:#010x}{}",
            HwEvent::NiSync as u8,
            m.kind,
            m.addr,
            EOL
        )
    }
}
