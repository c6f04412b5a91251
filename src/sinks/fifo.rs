//! Per-channel FIFO publication: one named pipe (or regular file, with
//! permafile) per configured software channel plus one for hardware
//! event records, each serviced by its own writer thread.
//!
//! The pump thread hands rendered events to the writers over bounded
//! channels. By default the handoff is lossy, as pipe readers that
//! stall should not stall decode; under permafile every event is
//! delivered and the pump blocks instead.

use crate::channels::{raw_software_bytes, ChannelTable, FormatTemplate, HwRecorder};
use crate::dispatch::{Handler, NUM_CHANNELS};
use crate::itm::{
    DataAccessWp, DataOffsetWp, DataRwwp, DwtEvent, ExceptionTrace, LocalTimestamp, NiSync,
    PcSample, Software,
};
use crate::sinks::SinkError;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

/// Name of the hardware event FIFO under the channel path.
pub const HWFIFO_NAME: &str = "hwevent";

/// Events buffered per channel before the lossy handoff starts
/// dropping.
const EVENT_QUEUE: usize = 64;

const HW_INDEX: usize = NUM_CHANNELS as usize;

#[derive(Clone, Debug)]
pub struct FifoOptions {
    /// Directory (or prefix) under which the FIFOs are created.
    pub chan_path: PathBuf,
    /// Write regular files, truncated on open, instead of named pipes;
    /// delivery becomes blocking and lossless.
    pub permafile: bool,
}

struct ChannelWriter {
    tx: Sender<Vec<u8>>,
    path: PathBuf,
}

/// The set of live channel writers. Implements [`Handler`] so it can be
/// driven directly by the dispatcher.
pub struct FifoSet {
    writers: Vec<Option<ChannelWriter>>,
    formats: Vec<Option<FormatTemplate>>,
    hw: HwRecorder,
    permafile: bool,
    dropped: u64,
}

impl FifoSet {
    /// Create the FIFOs and writer threads for every configured
    /// channel, plus the hardware channel.
    pub fn create(table: &ChannelTable, options: &FifoOptions) -> Result<Self, SinkError> {
        let mut writers: Vec<Option<ChannelWriter>> = Vec::new();
        let mut formats = Vec::new();
        for _ in 0..=HW_INDEX {
            writers.push(None);
            formats.push(None);
        }

        for (index, config) in table.iter() {
            let path = options.chan_path.join(&config.name);
            writers[usize::from(index)] = Some(spawn_writer(path, options.permafile)?);
            formats[usize::from(index)] = config.format.clone();
        }

        let hw_path = options.chan_path.join(HWFIFO_NAME);
        writers[HW_INDEX] = Some(spawn_writer(hw_path, options.permafile)?);

        Ok(Self {
            writers,
            formats,
            hw: HwRecorder::default(),
            permafile: options.permafile,
            dropped: 0,
        })
    }

    /// Events dropped on the lossy handoff.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Close the feeding channels so the writer threads drain and exit,
    /// and remove the pipes. Threads blocked on a pipe with no reader
    /// are left for process teardown to reap.
    pub fn shutdown(&mut self) {
        for writer in self.writers.drain(..).flatten() {
            drop(writer.tx);
            if !self.permafile {
                let _ = fs::remove_file(&writer.path);
            }
        }
    }

    fn send(&mut self, index: usize, bytes: Vec<u8>) {
        let writer = match self.writers.get(index).and_then(|w| w.as_ref()) {
            Some(writer) => writer,
            None => return,
        };

        if self.permafile {
            let _ = writer.tx.send(bytes);
        } else {
            match writer.tx.try_send(bytes) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.dropped += 1;
                }
            }
        }
    }
}

impl Drop for FifoSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Handler for FifoSet {
    fn software(&mut self, m: Software) {
        if m.src_addr >= NUM_CHANNELS {
            return;
        }
        let bytes = match &self.formats[usize::from(m.src_addr)] {
            Some(template) => template.render(&m).into_bytes(),
            None => raw_software_bytes(&m),
        };
        self.send(usize::from(m.src_addr), bytes);
    }

    fn local_timestamp(&mut self, m: LocalTimestamp) {
        let record = self.hw.local_timestamp(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn exception(&mut self, m: ExceptionTrace) {
        let record = self.hw.exception(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn pc_sample(&mut self, m: PcSample) {
        let record = self.hw.pc_sample(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn dwt_event(&mut self, m: DwtEvent) {
        let record = self.hw.dwt_event(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn data_rwwp(&mut self, m: DataRwwp) {
        let record = self.hw.data_rwwp(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn data_access_wp(&mut self, m: DataAccessWp) {
        let record = self.hw.data_access_wp(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn data_offset_wp(&mut self, m: DataOffsetWp) {
        let record = self.hw.data_offset_wp(&m);
        self.send(HW_INDEX, record.into_bytes());
    }

    fn nisync(&mut self, m: NiSync) {
        let record = self.hw.nisync(&m);
        self.send(HW_INDEX, record.into_bytes());
    }
}

fn spawn_writer(path: PathBuf, permafile: bool) -> Result<ChannelWriter, SinkError> {
    // A stale file under the FIFO's name confuses readers.
    let _ = fs::remove_file(&path);

    if !permafile {
        mkfifo(
            &path,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| SinkError::MkfifoError(path.display().to_string(), e))?;
    }

    let (tx, rx) = bounded(EVENT_QUEUE);
    let thread_path = path.clone();
    // The writer is detached; it exits when its channel closes.
    let _ = thread::Builder::new()
        .name(format!("fifo:{}", path.display()))
        .spawn(move || run_writer(&thread_path, permafile, rx))
        .map_err(|e| SinkError::SetupIOError(Some("Failed to spawn writer".to_string()), e))?;

    Ok(ChannelWriter { tx, path })
}

fn run_writer(path: &Path, permafile: bool, rx: Receiver<Vec<u8>>) {
    loop {
        // Keep reopening: a FIFO's reader may come and go any number
        // of times, and a permafile is truncated for each new reader
        // generation.
        let mut file = {
            let open = if permafile {
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
            } else {
                // Read+write so the open does not block waiting for a
                // reader.
                fs::OpenOptions::new().read(true).write(true).open(path)
            };

            match open {
                Ok(file) => file,
                Err(_) => return,
            }
        };

        loop {
            match rx.recv() {
                Ok(bytes) => {
                    if file.write_all(&bytes).is_err() {
                        break;
                    }
                }
                // Pump side has shut down.
                Err(_) => return,
            }
        }
    }
}
