//! ETMv3 instruction-flow decoder. Consumes a captured buffer and
//! surfaces a packed CPU state plus a change mask describing what each
//! packet updated: branch addresses (standard and alternative
//! encodings, with exception info), execute/skip atoms with their
//! disposition, I-sync with context and ISA flags, and the VMID,
//! context-ID, timestamp, cycle-count and trigger packets.
//!
//! After a loss of sync (or a wrapped capture) the decoder waits for an
//! alignment sequence and the next I-sync before resuming.

use bitfield::bitfield;
use serde::{Deserialize, Serialize};

/// One updated aspect of the CPU state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Address = 0,
    Atoms,
    Disposition,
    Vmid,
    ContextId,
    Secure,
    NonSecureState,
    ExceptionEntry,
    ExceptionExit,
    Cancelled,
    Trigger,
    Timestamp,
    CycleCount,
    ClockSpeed,
    Islsip,
    AltIsa,
    Hyp,
    Jazelle,
    Thumb,
}

/// Set of [`Change`]s reported alongside a state callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet(u32);

impl ChangeSet {
    pub fn has(&self, change: Change) -> bool {
        self.0 & (1 << change as u32) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn set(&mut self, change: Change) {
        self.0 |= 1 << change as u32;
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Packed CPU state as reconstructed from the trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub addr: u32,
    /// Executed-instruction count of the current atom packet.
    pub eatoms: u8,
    /// Skipped-instruction count of the current atom packet.
    pub natoms: u8,
    /// Bitmap over the atom packet, bit n set when instruction n
    /// executed.
    pub disposition: u32,
    pub vmid: u8,
    pub context_id: u32,
    pub exception: u16,
    /// The last instruction before the exception was cancelled.
    pub cancelled: bool,
    pub secure: bool,
    pub thumb: bool,
    pub jazelle: bool,
    pub alt_isa: bool,
    pub hyp: bool,
    /// A load/store instruction was in progress at the I-sync point.
    pub islsip: bool,
    pub timestamp: u64,
    pub cycle_count: u32,
}

bitfield! {
    /// The I-sync information byte.
    #[derive(Clone, Copy)]
    pub struct IsyncInfo(u8);
    impl Debug;
    pub lsip, _: 7;
    pub u8, reason, _: 6, 5;
    pub jazelle, _: 4;
    pub nonsecure, _: 3;
    pub alt_isa, _: 2;
    pub hyp, _: 1;
    pub thumb, _: 0;
}

/// Running decode statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sync_count: u64,
    pub packets: u64,
    pub reserved: u64,
}

/// [`EtmDecoder`] construction options.
#[derive(Clone, Copy, Debug)]
pub struct EtmOptions {
    /// Use the alternative branch-address encoding, which carries an
    /// exception-follows flag in the final address byte.
    pub alt_addr_encoding: bool,
    /// Width of context-ID packets in bytes: 0, 1, 2 or 4.
    pub context_id_bytes: u8,
}

impl Default for EtmOptions {
    fn default() -> Self {
        Self {
            alt_addr_encoding: true,
            context_id_bytes: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Unsynced,
    /// Aligned, but the address is unknown until the next I-sync.
    WaitIsync,
    Idle,
    BranchAddress,
    Exception,
    IsyncCycleCount,
    IsyncContext,
    IsyncInfo,
    IsyncAddress,
    CycleCount,
    ContextId,
    Vmid,
    Timestamp,
}

/// ETM packet decoder.
pub struct EtmDecoder {
    state: State,
    options: EtmOptions,
    cpu: CpuState,
    changes: ChangeSet,
    zero_run: u32,
    /// Generic little-endian accumulator for multi-byte payloads.
    construct: u64,
    construct_count: u32,
    /// Bits gathered by the in-progress branch address.
    addr_bits: u32,
    addr_bit_count: u32,
    exception_first: u8,
    stats: Stats,
}

impl EtmDecoder {
    const ASYNC_ZEROES: u32 = 5;

    pub fn new(options: EtmOptions) -> Self {
        Self {
            state: State::Unsynced,
            options,
            cpu: CpuState::default(),
            changes: ChangeSet::default(),
            zero_run: 0,
            construct: 0,
            construct_count: 0,
            addr_bits: 0,
            addr_bit_count: 0,
            exception_first: 0,
            stats: Stats::default(),
        }
    }

    pub fn synced(&self) -> bool {
        !matches!(self.state, State::Unsynced)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu
    }

    /// Out-of-band sync control. `false` drops the decoder back to the
    /// unsynced state; used as the barrier after a wrapped capture.
    pub fn force_sync(&mut self, synced: bool) {
        self.state = if synced {
            State::WaitIsync
        } else {
            State::Unsynced
        };
        self.zero_run = 0;
        self.changes.clear();
    }

    /// Decode a buffer, invoking `on_state` with the CPU state and the
    /// change mask after each packet that updates it.
    pub fn pump<F>(&mut self, bytes: &[u8], mut on_state: F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        for byte in bytes {
            self.pump_byte(*byte, &mut on_state);
        }
    }

    fn pump_byte<F>(&mut self, byte: u8, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        // Alignment detection runs whenever the decoder is between
        // packets; payload bytes must not retrigger it.
        if matches!(self.state, State::Unsynced | State::WaitIsync | State::Idle) {
            if byte == 0 {
                self.zero_run += 1;
                return;
            }
            let aligned = byte == 0x80 && self.zero_run >= Self::ASYNC_ZEROES;
            self.zero_run = 0;
            if aligned {
                if self.state == State::Unsynced {
                    self.stats.sync_count += 1;
                }
                self.state = State::WaitIsync;
                return;
            }
        }

        match self.state {
            State::Unsynced => (),
            State::WaitIsync | State::Idle => self.decode_header(byte, on_state),
            State::BranchAddress => self.branch_byte(byte, on_state),
            State::Exception => self.exception_byte(byte, on_state),
            State::IsyncCycleCount => {
                if self.continuation(byte, 5) {
                    self.cpu.cycle_count = self.construct as u32;
                    self.changes.set(Change::CycleCount);
                    self.begin_isync_body();
                }
            }
            State::IsyncContext => {
                self.construct |= u64::from(byte) << (8 * self.construct_count);
                self.construct_count += 1;
                if self.construct_count == u32::from(self.options.context_id_bytes) {
                    let id = self.construct as u32;
                    if id != self.cpu.context_id {
                        self.cpu.context_id = id;
                        self.changes.set(Change::ContextId);
                    }
                    self.state = State::IsyncInfo;
                }
            }
            State::IsyncInfo => {
                self.apply_isync_info(IsyncInfo(byte));
                self.collect(State::IsyncAddress);
            }
            State::IsyncAddress => {
                self.construct |= u64::from(byte) << (8 * self.construct_count);
                self.construct_count += 1;
                if self.construct_count == 4 {
                    self.cpu.addr = self.construct as u32;
                    self.changes.set(Change::Address);
                    self.emit(on_state);
                    self.state = State::Idle;
                }
            }
            State::CycleCount => {
                if self.continuation(byte, 5) {
                    self.cpu.cycle_count = self.construct as u32;
                    self.changes.set(Change::CycleCount);
                    self.emit(on_state);
                    self.state = State::Idle;
                }
            }
            State::ContextId => {
                self.construct |= u64::from(byte) << (8 * self.construct_count);
                self.construct_count += 1;
                if self.construct_count == u32::from(self.options.context_id_bytes) {
                    self.cpu.context_id = self.construct as u32;
                    self.changes.set(Change::ContextId);
                    self.emit(on_state);
                    self.state = State::Idle;
                }
            }
            State::Vmid => {
                self.cpu.vmid = byte;
                self.changes.set(Change::Vmid);
                self.emit(on_state);
                self.state = State::Idle;
            }
            State::Timestamp => {
                if self.continuation(byte, 9) {
                    self.cpu.timestamp = self.construct;
                    self.changes.set(Change::Timestamp);
                    self.emit(on_state);
                    self.state = State::Idle;
                }
            }
        }
    }

    fn decode_header<F>(&mut self, byte: u8, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        // Before the first I-sync only I-sync headers are meaningful;
        // everything else refers to an address we do not know yet.
        if self.state == State::WaitIsync && byte != 0x08 && byte != 0x70 {
            return;
        }

        match byte {
            0x08 => {
                // I-sync.
                self.begin_isync_body();
            }
            0x70 => {
                // I-sync preceded by a cycle count.
                self.collect(State::IsyncCycleCount);
            }
            0x0C => {
                self.changes.set(Change::Trigger);
                self.emit(on_state);
            }
            0x3C => self.state = State::Vmid,
            0x6E => {
                if self.options.context_id_bytes == 0 {
                    self.stats.reserved += 1;
                } else {
                    self.collect(State::ContextId);
                }
            }
            0x76 => {
                self.changes.set(Change::ExceptionExit);
                self.emit(on_state);
            }
            0x04 => self.collect(State::CycleCount),
            b if b & 0xFB == 0x42 => self.collect(State::Timestamp),
            b if b & 0x01 == 0x01 => {
                // Branch address, first byte: six address bits.
                self.addr_bits = u32::from(b >> 1) & 0x3F;
                self.addr_bit_count = 6;
                if b & 0x80 != 0 {
                    self.state = State::BranchAddress;
                } else {
                    self.apply_branch(false, on_state);
                }
            }
            b if b & 0xF3 == 0x82 => {
                // P-header format 2: two atoms, bit set means skipped.
                let first_skipped = b & 0x08 != 0;
                let second_skipped = b & 0x04 != 0;
                let skipped = [first_skipped, second_skipped];
                self.cpu.eatoms = skipped.iter().filter(|s| !**s).count() as u8;
                self.cpu.natoms = 2 - self.cpu.eatoms;
                self.cpu.disposition = (!first_skipped as u32) | ((!second_skipped as u32) << 1);
                self.changes.set(Change::Atoms);
                self.changes.set(Change::Disposition);
                self.emit(on_state);
            }
            b if b & 0x81 == 0x80 => {
                // P-header format 1: a run of executed instructions,
                // optionally followed by one skipped.
                self.cpu.eatoms = (b >> 2) & 0x0F;
                self.cpu.natoms = (b >> 6) & 0x01;
                self.cpu.disposition = (1u32 << self.cpu.eatoms) - 1;
                self.changes.set(Change::Atoms);
                self.changes.set(Change::Disposition);
                self.emit(on_state);
            }
            _ => self.stats.reserved += 1,
        }
    }

    fn begin_isync_body(&mut self) {
        if self.options.context_id_bytes > 0 {
            self.collect(State::IsyncContext);
        } else {
            self.state = State::IsyncInfo;
        }
    }

    fn apply_isync_info(&mut self, info: IsyncInfo) {
        let mut flag = |changed: bool, change: Change, changes: &mut ChangeSet| {
            if changed {
                changes.set(change);
            }
        };

        let secure = !info.nonsecure();
        flag(secure != self.cpu.secure, Change::Secure, &mut self.changes);
        flag(
            info.nonsecure() != !self.cpu.secure,
            Change::NonSecureState,
            &mut self.changes,
        );
        flag(info.thumb() != self.cpu.thumb, Change::Thumb, &mut self.changes);
        flag(
            info.jazelle() != self.cpu.jazelle,
            Change::Jazelle,
            &mut self.changes,
        );
        flag(
            info.alt_isa() != self.cpu.alt_isa,
            Change::AltIsa,
            &mut self.changes,
        );
        flag(info.hyp() != self.cpu.hyp, Change::Hyp, &mut self.changes);
        if info.lsip() {
            self.changes.set(Change::Islsip);
        }

        self.cpu.secure = secure;
        self.cpu.thumb = info.thumb();
        self.cpu.jazelle = info.jazelle();
        self.cpu.alt_isa = info.alt_isa();
        self.cpu.hyp = info.hyp();
        self.cpu.islsip = info.lsip();
    }

    fn branch_byte<F>(&mut self, byte: u8, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        if byte & 0x80 != 0 {
            // Continuation: seven more address bits.
            self.addr_bits |= (u32::from(byte) & 0x7F) << self.addr_bit_count;
            self.addr_bit_count += 7;
            if self.addr_bit_count >= 27 {
                // Fifth byte would overflow the address; treat the
                // packet as complete.
                self.apply_branch(false, on_state);
            }
            return;
        }

        // Final byte. Under the alternative encoding bit 6 flags a
        // following exception info byte and contributes no address bit.
        let (bits, width, exception) = if self.options.alt_addr_encoding {
            (u32::from(byte) & 0x3F, 6, byte & 0x40 != 0)
        } else {
            (u32::from(byte) & 0x7F, 7, false)
        };
        self.addr_bits |= bits << self.addr_bit_count;
        self.addr_bit_count += width;
        self.apply_branch(exception, on_state);
    }

    fn apply_branch<F>(&mut self, exception_follows: bool, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        // Addresses are halfword-aligned; collected bits replace the
        // low end of the working address.
        let bit_count = (self.addr_bit_count + 1).min(31);
        let mask = !((1u32 << bit_count) - 1);
        self.cpu.addr = (self.cpu.addr & mask) | (self.addr_bits << 1);
        self.changes.set(Change::Address);

        if exception_follows {
            self.exception_first = 0;
            self.construct_count = 0;
            self.state = State::Exception;
        } else {
            self.emit(on_state);
            self.state = State::Idle;
        }
    }

    fn exception_byte<F>(&mut self, byte: u8, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        if self.construct_count == 0 && byte & 0x80 != 0 {
            // First of two: low bits now, high bits follow.
            self.exception_first = byte;
            self.construct_count = 1;
            return;
        }

        let number = if self.construct_count == 0 {
            u16::from((byte >> 1) & 0x0F)
        } else {
            u16::from((self.exception_first >> 1) & 0x0F) | (u16::from(byte & 0x7F) << 4)
        };
        let cancel = if self.construct_count == 0 {
            byte & 0x01 != 0
        } else {
            self.exception_first & 0x01 != 0
        };

        self.cpu.exception = number;
        self.cpu.cancelled = cancel;
        self.changes.set(Change::ExceptionEntry);
        if cancel {
            self.changes.set(Change::Cancelled);
        }
        self.emit(on_state);
        self.state = State::Idle;
    }

    /// Accumulate 7-bit continuation bytes little-endian. Returns true
    /// when the payload is complete.
    fn continuation(&mut self, byte: u8, max: u32) -> bool {
        self.construct |= u64::from(byte & 0x7F) << (7 * self.construct_count);
        self.construct_count += 1;
        byte & 0x80 == 0 || self.construct_count == max
    }

    fn collect(&mut self, state: State) {
        self.construct = 0;
        self.construct_count = 0;
        self.state = state;
    }

    fn emit<F>(&mut self, on_state: &mut F)
    where
        F: FnMut(&CpuState, ChangeSet),
    {
        self.stats.packets += 1;
        on_state(&self.cpu, self.changes);
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASYNC: [u8; 6] = [0, 0, 0, 0, 0, 0x80];

    fn isync(addr: u32, info: u8) -> Vec<u8> {
        let mut bytes = vec![0x08, info];
        bytes.extend_from_slice(&addr.to_le_bytes());
        bytes
    }

    fn decode(decoder: &mut EtmDecoder, bytes: &[u8]) -> Vec<(CpuState, ChangeSet)> {
        let mut out = Vec::new();
        decoder.pump(bytes, |cpu, changes| out.push((*cpu, changes)));
        out
    }

    #[test]
    fn requires_alignment_and_isync() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());

        // A P-header before alignment decodes to nothing.
        assert!(decode(&mut decoder, &[0x84]).is_empty());
        assert!(!decoder.synced());

        let mut stream = ASYNC.to_vec();
        // A P-header after alignment but before I-sync is skipped too.
        stream.push(0x84);
        stream.extend(isync(0x2000_0100, 0x01));
        let states = decode(&mut decoder, &stream);

        assert_eq!(states.len(), 1);
        let (cpu, changes) = states[0];
        assert_eq!(cpu.addr, 0x2000_0100);
        assert!(cpu.thumb);
        assert!(cpu.secure);
        assert!(changes.has(Change::Address));
        assert!(changes.has(Change::Thumb));
    }

    #[test]
    fn atoms_format_one() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x1000, 0x01));
        // Five executed, one skipped.
        stream.push(0x80 | (5 << 2) | (1 << 6));
        let states = decode(&mut decoder, &stream);

        let (cpu, changes) = states[1];
        assert_eq!(cpu.eatoms, 5);
        assert_eq!(cpu.natoms, 1);
        assert_eq!(cpu.disposition, 0b01_1111);
        assert!(changes.has(Change::Atoms));
        assert!(changes.has(Change::Disposition));
    }

    #[test]
    fn atoms_format_two() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x1000, 0x01));
        // First atom executed, second skipped.
        stream.push(0x82 | 0x04);
        let states = decode(&mut decoder, &stream);

        let (cpu, _) = states[1];
        assert_eq!(cpu.eatoms, 1);
        assert_eq!(cpu.natoms, 1);
        assert_eq!(cpu.disposition, 0b01);
    }

    #[test]
    fn branch_address_updates_low_bits() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x2000_0000, 0x01));
        // Single-byte branch: six bits, halfword aligned.
        stream.push((0x15 << 1) | 0x01);
        let states = decode(&mut decoder, &stream);

        let (cpu, changes) = states[1];
        assert_eq!(cpu.addr, 0x2000_0000 | (0x15 << 1));
        assert!(changes.has(Change::Address));
    }

    #[test]
    fn branch_with_exception() {
        let mut decoder = EtmDecoder::new(EtmOptions {
            alt_addr_encoding: true,
            context_id_bytes: 0,
        });
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x2000_0000, 0x01));
        // Two-byte branch whose final byte flags an exception; the
        // exception info byte follows: number 3, not cancelled.
        stream.push(0x81);
        stream.push(0x40);
        stream.push(3 << 1);
        let states = decode(&mut decoder, &stream);

        let (cpu, changes) = states[1];
        assert_eq!(cpu.exception, 3);
        assert!(!cpu.cancelled);
        assert!(changes.has(Change::ExceptionEntry));
        assert!(changes.has(Change::Address));
    }

    #[test]
    fn vmid_timestamp_and_trigger() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x1000, 0x01));
        stream.push(0x3C); // VMID
        stream.push(7);
        stream.push(0x42); // timestamp
        stream.push(0x85);
        stream.push(0x01);
        stream.push(0x0C); // trigger
        let states = decode(&mut decoder, &stream);

        assert_eq!(states.len(), 4);
        assert_eq!(states[1].0.vmid, 7);
        assert!(states[1].1.has(Change::Vmid));
        assert_eq!(states[2].0.timestamp, 0x85 as u64 - 0x80 + (1 << 7));
        assert!(states[2].1.has(Change::Timestamp));
        assert!(states[3].1.has(Change::Trigger));
    }

    #[test]
    fn wrapped_capture_barrier_forces_resync() {
        let mut decoder = EtmDecoder::new(EtmOptions::default());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x1000, 0x01));
        decode(&mut decoder, &stream);
        assert!(decoder.synced());

        decoder.force_sync(false);
        assert!(!decoder.synced());

        // Nothing decodes until alignment comes around again.
        assert!(decode(&mut decoder, &[0x84]).is_empty());
        let mut stream = ASYNC.to_vec();
        stream.extend(isync(0x4000, 0x01));
        assert_eq!(decode(&mut decoder, &stream).len(), 1);
    }
}
