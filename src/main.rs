use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_channel as channel;
use structopt::StructOpt;

use swo_scope::channels::{ChannelConfig, ChannelTable, FormatTemplate, HwRecorder};
use swo_scope::dispatch::{Dispatcher, Handler, NUM_CHANNELS};
use swo_scope::etm::{Change, ChangeSet, CpuState, EtmDecoder, EtmOptions};
use swo_scope::itm::{self, DecoderOptions};
use swo_scope::log;
use swo_scope::ring::{PmRing, Policy};
use swo_scope::session::{
    MortemCapture, Session, SessionConfig, DEFAULT_ETM_STREAM, DEFAULT_ITM_STREAM,
};
use swo_scope::sinks::{FifoOptions, FifoSet, FileWriterSink};
use swo_scope::sources::{FileSource, NetSource, Source};

/// Environment variable naming the default trace server port.
const SERVER_PORT_VAR: &str = "SWO_SCOPE_SERVER_PORT";
const DEFAULT_SERVER_PORT: u16 = 3443;

const EXIT_BAD_OPTIONS: i32 = -1;
const EXIT_NET_ERROR: i32 = -2;
const EXIT_FILE_ERROR: i32 = -4;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "swo-scope",
    about = "Decode ARM Cortex debug trace streams to FIFOs, stdout, or a post-mortem buffer"
)]
struct Opts {
    /// Diagnostic verbosity: 0 errors only, 1 warnings, 2 info, 3 debug.
    #[structopt(short = "v", long = "verbose", default_value = "1")]
    verbosity: u8,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Publish decoded channels to per-channel FIFOs.
    Fifos(FifosOptions),
    /// Decode channels to stdout.
    Cat(CatOptions),
    /// Capture an instruction trace and decode it post-mortem.
    Mortem(MortemOptions),
}

#[derive(Debug, StructOpt)]
struct SourceOptions {
    /// Read raw trace data from a file instead of the trace server.
    #[structopt(short = "f", long = "file", parse(from_os_str))]
    file: Option<PathBuf>,

    /// Terminate when the input file is exhausted instead of following
    /// it.
    #[structopt(short = "e", long = "eof-terminate")]
    eof_terminate: bool,

    /// Trace server to read from, as host:port.
    #[structopt(short = "s", long = "server")]
    server: Option<String>,

    /// The input is TPIU-framed; decode ITM from this stream.
    #[structopt(short = "t", long = "tpiu")]
    tpiu_stream: Option<u8>,

    /// Do not require an ITM sync sequence before decoding.
    #[structopt(short = "n", long = "no-itm-sync")]
    no_itm_sync: bool,
}

#[derive(Debug, StructOpt)]
struct FifosOptions {
    #[structopt(flatten)]
    source: SourceOptions,

    /// Register a channel as N,NAME[,FORMAT]; may be repeated.
    #[structopt(short = "c", long = "channel", number_of_values = 1)]
    channels: Vec<String>,

    /// Directory under which the FIFOs are created.
    #[structopt(long = "chan-path", parse(from_os_str), default_value = "")]
    chan_path: PathBuf,

    /// Use permanent files, truncated on each reader, instead of FIFOs.
    #[structopt(short = "P", long = "permafile")]
    permafile: bool,

    /// Append filewriter-channel payloads to this file.
    #[structopt(short = "w", long = "filewriter", parse(from_os_str))]
    filewriter: Option<PathBuf>,
}

#[derive(Debug, StructOpt)]
struct CatOptions {
    #[structopt(flatten)]
    source: SourceOptions,

    /// Register a channel format as N,FORMAT; may be repeated.
    #[structopt(short = "c", long = "channel", number_of_values = 1)]
    channels: Vec<String>,

    /// Emit decoded messages as JSON Lines instead of formatted text.
    #[structopt(long = "json")]
    json: bool,
}

#[derive(Debug, StructOpt)]
struct MortemOptions {
    #[structopt(flatten)]
    source: SourceOptions,

    /// Capture buffer size in KiB.
    #[structopt(short = "b", long = "buffer-size", default_value = "32")]
    buffer_kib: usize,

    /// Freeze the capture once the buffer has filled, instead of
    /// keeping the newest bytes.
    #[structopt(long = "single-shot")]
    single_shot: bool,

    /// Decode and exit when the input is exhausted.
    #[structopt(short = "E", long = "end-terminate")]
    end_terminate: bool,

    /// Disable the alternative branch-address encoding.
    #[structopt(long = "no-alt-addr")]
    no_alt_addr: bool,
}

struct CliError {
    code: i32,
    inner: anyhow::Error,
}

impl CliError {
    fn render(&self) {
        log::err(format!("{:#}", self.inner));
    }
}

fn config_error(inner: anyhow::Error) -> CliError {
    CliError {
        code: EXIT_BAD_OPTIONS,
        inner,
    }
}

fn main() {
    let opts = Opts::from_args();
    log::set_verbosity(log::level_from_arg(opts.verbosity));

    if let Err(e) = match opts.cmd {
        Command::Fifos(opts) => fifos(opts),
        Command::Cat(opts) => cat(opts),
        Command::Mortem(opts) => mortem(opts),
    } {
        e.render();
        process::exit(e.code);
    }
}

fn default_port() -> u16 {
    std::env::var(SERVER_PORT_VAR)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_SERVER_PORT)
}

/// Resolve the input for a run. `bump_port` selects the
/// instruction-trace port next to the default one.
fn open_source(opts: &SourceOptions, bump_port: bool) -> Result<Box<dyn Source>, CliError> {
    if let Some(file) = &opts.file {
        let source = FileSource::open(file, opts.eof_terminate).map_err(|e| CliError {
            code: EXIT_FILE_ERROR,
            inner: anyhow!(e).context(format!("Cannot open {}", file.display())),
        })?;
        return Ok(Box::new(source));
    }

    let server = match &opts.server {
        Some(server) if server.contains(':') => server.clone(),
        Some(host) => format!("{}:{}", host, default_port()),
        None => {
            let port = if bump_port {
                default_port() + 1
            } else {
                default_port()
            };
            format!("localhost:{}", port)
        }
    };

    let source = NetSource::connect(&server).map_err(|e| {
        use swo_scope::diag::DiagnosableError;
        for hint in e.diagnose() {
            log::hint(hint);
        }
        CliError {
            code: EXIT_NET_ERROR,
            inner: anyhow!(e),
        }
    })?;
    Ok(Box::new(source))
}

fn session_config(opts: &SourceOptions) -> SessionConfig {
    SessionConfig {
        use_tpiu: opts.tpiu_stream.is_some(),
        itm_stream: opts.tpiu_stream.unwrap_or(DEFAULT_ITM_STREAM),
        itm_options: DecoderOptions {
            force_sync: !opts.no_itm_sync,
        },
    }
}

/// Parse one `-c` registration: `N,NAME[,FORMAT]` with a name, or
/// `N,FORMAT` without.
fn parse_channel(arg: &str, with_name: bool) -> Result<(u8, ChannelConfig), CliError> {
    let mut parts = arg.splitn(if with_name { 3 } else { 2 }, ',');

    let index: u8 = parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| config_error(anyhow!("Bad channel number in {:?}", arg)))?;
    if index >= NUM_CHANNELS {
        return Err(config_error(anyhow!("Channel {} out of range", index)));
    }

    let name = if with_name {
        parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| config_error(anyhow!("No name for channel {}", index)))?
            .to_string()
    } else {
        format!("{}", index)
    };

    let format = match parts.next() {
        Some(f) => Some(
            FormatTemplate::parse(f)
                .map_err(|e| config_error(anyhow!(e).context(format!("Bad format {:?}", f))))?,
        ),
        None if !with_name => {
            return Err(config_error(anyhow!("No output format for channel {}", index)))
        }
        None => None,
    };

    Ok((index, ChannelConfig { name, format }))
}

fn channel_table(args: &[String], with_name: bool) -> Result<ChannelTable, CliError> {
    let mut table = ChannelTable::default();
    for arg in args {
        let (index, config) = parse_channel(arg, with_name)?;
        table.set(index, config);
    }
    Ok(table)
}

/// Drive a session from a source until EOF or interrupt. The reader
/// runs on its own thread; decode stays on this one.
fn run_session(mut source: Box<dyn Source>, mut session: Session) -> Result<Session, CliError> {
    let (halt_tx, halt) = channel::bounded(0);
    ctrlc::set_handler(move || {
        let _ = halt_tx.send(());
    })
    .context("Failed to install interrupt handler")
    .map_err(config_error)?;

    log::status("Decoding", format!("from {}...", source.describe()));

    let (tx, data) = channel::unbounded();
    let _reader = thread::spawn(move || loop {
        match source.next() {
            Some(chunk) => {
                if tx.send(Some(chunk)).is_err() {
                    return;
                }
            }
            None => {
                let _ = tx.send(None);
                return;
            }
        }
    });

    let mut total_bytes = 0u64;
    loop {
        channel::select! {
            recv(data) -> chunk => match chunk.unwrap_or(None) {
                Some(Ok(bytes)) => {
                    total_bytes += bytes.len() as u64;
                    session.pump_all(&bytes);
                }
                Some(Err(e)) => {
                    log::err(format!("{:#}", anyhow!(e)));
                    break;
                }
                None => break,
            },
            recv(halt) -> _ => break,
            default(Duration::from_millis(1000)) => {
                let stats = session.itm_stats();
                log::cont_status("Decoding", format!(
                    "{} bytes: {} sw, {} hw, {} ts messages...",
                    total_bytes, stats.sw_packets, stats.hw_packets, stats.ts_packets,
                ));
            }
        }
    }

    // The reader may be blocked on its input; sinks and sources drop
    // with the process, so it need not be joined.
    Ok(session)
}

fn fifos(opts: FifosOptions) -> Result<(), CliError> {
    let table = channel_table(&opts.channels, true)?;
    if table.iter().next().is_none() {
        return Err(config_error(anyhow!("No channels configured")));
    }

    let sink = FifoSet::create(
        &table,
        &FifoOptions {
            chan_path: opts.chan_path.clone(),
            permafile: opts.permafile,
        },
    )
    .map_err(|e| config_error(anyhow!(e)))?;

    let mut dispatcher = Dispatcher::new(Box::new(sink));
    if let Some(path) = &opts.filewriter {
        let fw = FileWriterSink::create(path).map_err(|e| CliError {
            code: EXIT_FILE_ERROR,
            inner: anyhow!(e),
        })?;
        dispatcher.set_filewriter(Box::new(fw));
    }

    let source = open_source(&opts.source, false)?;
    let session = Session::new(session_config(&opts.source), dispatcher);
    let session = run_session(source, session)?;

    let stats = session.itm_stats();
    log::status(
        "Done",
        format!(
            "{} software, {} hardware messages ({} ITM sync losses).",
            stats.sw_packets, stats.hw_packets, stats.lost_sync_count
        ),
    );
    Ok(())
}

/// Stdout sink used by `cat`: formatted channels, hardware event
/// records, or JSON Lines.
struct CatSink {
    formats: Vec<Option<FormatTemplate>>,
    hw: HwRecorder,
    json: bool,
}

impl CatSink {
    fn new(table: &ChannelTable, json: bool) -> Self {
        let mut formats: Vec<Option<FormatTemplate>> = Vec::new();
        for _ in 0..NUM_CHANNELS {
            formats.push(None);
        }
        for (index, config) in table.iter() {
            formats[usize::from(index)] = config.format.clone();
        }
        Self {
            formats,
            hw: HwRecorder::default(),
            json,
        }
    }

    fn emit_json(&self, message: &itm::Message) {
        if let Ok(json) = serde_json::to_string(message) {
            println!("{}", json);
        }
    }
}

impl Handler for CatSink {
    fn software(&mut self, m: itm::Software) {
        if self.json {
            self.emit_json(&itm::Message::Software(m));
        } else if let Some(Some(template)) = self.formats.get(usize::from(m.src_addr)) {
            print!("{}", template.render(&m));
        }
    }

    fn local_timestamp(&mut self, m: itm::LocalTimestamp) {
        if self.json {
            self.emit_json(&itm::Message::LocalTimestamp(m));
        } else {
            print!("{}", self.hw.local_timestamp(&m));
        }
    }

    fn exception(&mut self, m: itm::ExceptionTrace) {
        if self.json {
            self.emit_json(&itm::Message::ExceptionTrace(m));
        } else {
            print!("{}", self.hw.exception(&m));
        }
    }

    fn pc_sample(&mut self, m: itm::PcSample) {
        if self.json {
            self.emit_json(&itm::Message::PcSample(m));
        } else {
            print!("{}", self.hw.pc_sample(&m));
        }
    }

    fn dwt_event(&mut self, m: itm::DwtEvent) {
        if self.json {
            self.emit_json(&itm::Message::DwtEvent(m));
        } else {
            print!("{}", self.hw.dwt_event(&m));
        }
    }

    fn data_rwwp(&mut self, m: itm::DataRwwp) {
        if self.json {
            self.emit_json(&itm::Message::DataRwwp(m));
        } else {
            print!("{}", self.hw.data_rwwp(&m));
        }
    }

    fn data_access_wp(&mut self, m: itm::DataAccessWp) {
        if self.json {
            self.emit_json(&itm::Message::DataAccessWp(m));
        } else {
            print!("{}", self.hw.data_access_wp(&m));
        }
    }

    fn data_offset_wp(&mut self, m: itm::DataOffsetWp) {
        if self.json {
            self.emit_json(&itm::Message::DataOffsetWp(m));
        } else {
            print!("{}", self.hw.data_offset_wp(&m));
        }
    }

    fn nisync(&mut self, m: itm::NiSync) {
        if self.json {
            self.emit_json(&itm::Message::NiSync(m));
        } else {
            print!("{}", self.hw.nisync(&m));
        }
    }

    fn overflow(&mut self, m: itm::Overflow) {
        if self.json {
            self.emit_json(&itm::Message::Overflow(m));
        }
    }
}

fn cat(opts: CatOptions) -> Result<(), CliError> {
    let table = channel_table(&opts.channels, false)?;
    let sink = CatSink::new(&table, opts.json);

    let source = open_source(&opts.source, false)?;
    let session = Session::new(session_config(&opts.source), Dispatcher::new(Box::new(sink)));
    run_session(source, session)?;
    Ok(())
}

/// Wall-clock pacing of the post-mortem capture loop.
const TICK_TIME: Duration = Duration::from_millis(100);
const INTERVAL_TIME: Duration = Duration::from_millis(1000);
const HANG_TIME: Duration = Duration::from_millis(200);

fn mortem(opts: MortemOptions) -> Result<(), CliError> {
    let use_tpiu = opts.source.tpiu_stream.is_some();
    let etm_stream = opts.source.tpiu_stream.unwrap_or(DEFAULT_ETM_STREAM);
    let policy = if opts.single_shot {
        Policy::SingleShot
    } else {
        Policy::Running
    };

    let ring = PmRing::new(opts.buffer_kib * 1024, policy);
    let mut capture = MortemCapture::new(use_tpiu, etm_stream, ring);
    let mut etm = EtmDecoder::new(EtmOptions {
        alt_addr_encoding: !opts.no_alt_addr,
        context_id_bytes: 0,
    });

    let source_opts = SourceOptions {
        eof_terminate: opts.source.eof_terminate || opts.end_terminate,
        ..opts.source
    };
    let mut source = open_source(&source_opts, !use_tpiu)?;

    let (halt_tx, halt) = channel::bounded(0);
    ctrlc::set_handler(move || {
        let _ = halt_tx.send(());
    })
    .context("Failed to install interrupt handler")
    .map_err(config_error)?;

    log::status(
        "Capturing",
        format!(
            "{} KiB {} buffer from {}...",
            capture.ring().capacity() / 1024,
            match policy {
                Policy::Running => "running",
                Policy::SingleShot => "single-shot",
            },
            source.describe()
        ),
    );

    let (tx, data) = channel::unbounded();
    let _reader = thread::spawn(move || loop {
        match source.next() {
            Some(chunk) => {
                if tx.send(Some(chunk)).is_err() {
                    return;
                }
            }
            None => {
                let _ = tx.send(None);
                return;
            }
        }
    });

    let ticker = channel::tick(TICK_TIME);
    let mut last_byte = Instant::now();
    let mut last_interval = Instant::now();
    let mut interval_bytes = 0u64;
    let mut total_bytes = 0u64;

    loop {
        channel::select! {
            recv(data) -> chunk => match chunk.unwrap_or(None) {
                Some(Ok(bytes)) => {
                    capture.pump_all(&bytes);
                    last_byte = Instant::now();
                    interval_bytes += bytes.len() as u64;
                    total_bytes += bytes.len() as u64;
                }
                Some(Err(e)) => {
                    log::err(format!("{:#}", anyhow!(e)));
                    break;
                }
                None => break,
            },
            recv(halt) -> _ => {
                decode_capture(&capture, &mut etm);
                return Ok(());
            },
            recv(ticker) -> _ => {
                if capture.ring().held() {
                    // Single-shot capture complete.
                    break;
                }

                if !capture.ring().is_empty() && last_byte.elapsed() >= HANG_TIME {
                    // The stream went quiet; decode what we have.
                    decode_capture(&capture, &mut etm);
                    if policy == Policy::Running {
                        capture.ring_mut().release();
                    }
                }

                if last_interval.elapsed() >= INTERVAL_TIME {
                    log::cont_status("Capturing", format!(
                        "{} bytes ({}/s), {} buffered...",
                        total_bytes,
                        interval_bytes * 1000 / INTERVAL_TIME.as_millis() as u64,
                        capture.ring().len(),
                    ));
                    last_interval = Instant::now();
                    interval_bytes = 0;
                }
            }
        }
    }

    decode_capture(&capture, &mut etm);
    log::status(
        "Done",
        format!(
            "{} bytes captured, {} ETM packets.",
            total_bytes,
            etm.stats().packets
        ),
    );
    Ok(())
}

fn decode_capture(capture: &MortemCapture, etm: &mut EtmDecoder) {
    if capture.ring().is_empty() {
        return;
    }
    capture.decode(etm, report_state);
}

/// Print what an ETM packet changed, one line per aspect, in capture
/// order.
fn report_state(cpu: &CpuState, changes: ChangeSet) {
    if changes.has(Change::Address) {
        println!("jump to {:#010x}", cpu.addr);
    }
    if changes.has(Change::Atoms) {
        println!(
            "exec {} skip {} (disposition {:b})",
            cpu.eatoms, cpu.natoms, cpu.disposition
        );
    }
    if changes.has(Change::ExceptionEntry) {
        println!(
            "exception {} entry at {:#010x}{}",
            cpu.exception,
            cpu.addr,
            if cpu.cancelled {
                ", last instruction cancelled"
            } else {
                ""
            }
        );
    }
    if changes.has(Change::ExceptionExit) {
        println!("exception exit");
    }
    if changes.has(Change::Trigger) {
        println!("trigger");
    }
    if changes.has(Change::Timestamp) {
        println!("timestamp {}", cpu.timestamp);
    }
    if changes.has(Change::CycleCount) {
        println!("cycle count {}", cpu.cycle_count);
    }
    if changes.has(Change::Vmid) {
        println!("VMID now {}", cpu.vmid);
    }
    if changes.has(Change::ContextId) {
        println!("context ID now {}", cpu.context_id);
    }
    if changes.has(Change::Secure) {
        println!("secure state now {}", cpu.secure);
    }
    if changes.has(Change::Thumb) {
        println!("Thumb now {}", cpu.thumb);
    }
    if changes.has(Change::Jazelle) {
        println!("Jazelle now {}", cpu.jazelle);
    }
    if changes.has(Change::AltIsa) {
        println!("AltISA now {}", cpu.alt_isa);
    }
    if changes.has(Change::Hyp) {
        println!("Hypervisor now {}", cpu.hyp);
    }
    if changes.has(Change::Islsip) {
        println!("load/store in progress at sync point");
    }
}
