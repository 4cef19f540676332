//! UART transport for the SEM monitor.
//!
//! The transport owns the duplex channel. Exactly one background thread reads
//! from it, frames CR/LF terminated lines and pushes them, timestamped, onto a
//! lock-protected queue. Everything above this layer consumes lines from that
//! queue and never touches the read half of the channel, which is what allows
//! a scheduler thread to write while the controller drains replies.
//!
//! ```rust,no_run
//! # #[cfg(feature = "serial")]
//! # fn demo() -> semfi::error::SemResult<()> {
//! use semfi::semio::transport::{SerialLinkConfig, Transport};
//! use std::time::Duration;
//!
//! let tr = Transport::open(SerialLinkConfig::new("/dev/ttyUSB0", 1_250_000))?;
//! tr.start_reader()?;
//! tr.write_line("S")?;
//! for line in tr.read_until_prompt(Duration::from_millis(500)) {
//!     println!("{}", line.text);
//! }
//! tr.close();
//! # Ok(())
//! # }
//! ```
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use regex::Regex;

use crate::error::{SemError, SemResult};
use crate::logutil::escape_log;
use crate::semio::framer::LineFramer;

/// Default prompt detector: a bare `I>`, `O>` or `D>` line.
pub const DEFAULT_PROMPT_PATTERN: &str = r"^[IOD]>\s*$";

/// Poll slice used while waiting for a prompt.
const PROMPT_POLL: Duration = Duration::from_millis(50);

/// Serial link parameters. Immutable once the transport is built.
#[derive(Debug, Clone)]
pub struct SerialLinkConfig {
    pub device: String,
    pub baud: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub open_timeout: Duration,
    pub terminator: String,
    pub prompt: Regex,
}

impl SerialLinkConfig {
    /// Link settings with the monitor's usual timeouts (50 ms read, 100 ms
    /// write, 2 s open) and `\r` terminator.
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
            read_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(100),
            open_timeout: Duration::from_secs(2),
            terminator: "\r".to_string(),
            prompt: default_prompt(),
        }
    }
}

/// Compiled default prompt pattern.
pub fn default_prompt() -> Regex {
    Regex::new(DEFAULT_PROMPT_PATTERN).expect("Invalid prompt regex")
}

/// A decoded line together with the monotonic instant it was framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxLine {
    pub text: String,
    pub received_at: Instant,
}

impl RxLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct LineQueue {
    lines: Mutex<VecDeque<RxLine>>,
    ready: Condvar,
}

impl LineQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<RxLine>> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, line: RxLine) {
        self.lock().push_back(line);
        self.ready.notify_all();
    }
}

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

/// Line-framed duplex transport with a single background reader.
pub struct Transport {
    cfg: SerialLinkConfig,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    queue: Arc<LineQueue>,
    rx_stop: Arc<AtomicBool>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Transport {
    /// Open the serial device. The open itself runs on a helper thread so a
    /// wedged driver cannot hold the caller past `open_timeout`.
    #[cfg(feature = "serial")]
    pub fn open(cfg: SerialLinkConfig) -> SemResult<Self> {
        info!("Opening SEM link on {} at {} baud", cfg.device, cfg.baud);
        let (tx, rx) = std::sync::mpsc::channel();
        let device = cfg.device.clone();
        let baud = cfg.baud;
        let read_timeout = cfg.read_timeout;
        std::thread::Builder::new()
            .name("sem-open".into())
            .spawn(move || {
                let mut builder = serialport::new(&device, baud).timeout(read_timeout);
                #[cfg(unix)]
                {
                    builder = builder
                        .data_bits(serialport::DataBits::Eight)
                        .stop_bits(serialport::StopBits::One)
                        .parity(serialport::Parity::None);
                }
                let _ = tx.send(builder.open());
            })
            .map_err(|e| connection_error(&cfg, e.to_string()))?;

        let mut port = match rx.recv_timeout(cfg.open_timeout) {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => return Err(connection_error(&cfg, e.to_string())),
            Err(_) => {
                return Err(connection_error(
                    &cfg,
                    format!("open did not complete within {:?}", cfg.open_timeout),
                ))
            }
        };

        // Keep the monitor's UART bridge awake.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);

        let mut writer = port
            .try_clone()
            .map_err(|e| connection_error(&cfg, format!("cannot clone port handle: {e}")))?;
        if let Err(e) = writer.set_timeout(cfg.write_timeout) {
            warn!("Could not apply write timeout on {}: {}", cfg.device, e);
        }
        debug!("Serial port {} initialised", cfg.device);
        Ok(Self::from_parts(cfg, Box::new(port), Box::new(writer)))
    }

    #[cfg(not(feature = "serial"))]
    pub fn open(cfg: SerialLinkConfig) -> SemResult<Self> {
        Err(connection_error(
            &cfg,
            "serial support not compiled in (enable the 'serial' feature)".to_string(),
        ))
    }

    /// Build a transport over an already-open pair of read and write halves.
    pub fn from_parts(cfg: SerialLinkConfig, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            cfg,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            queue: Arc::new(LineQueue::default()),
            rx_stop: Arc::new(AtomicBool::new(false)),
            rx_thread: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SerialLinkConfig {
        &self.cfg
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// True when `line` is a bare device prompt.
    pub fn is_prompt(&self, line: &str) -> bool {
        self.cfg.prompt.is_match(line)
    }

    /// Spawn the background reader. Calling this again is a no-op.
    pub fn start_reader(&self) -> SemResult<()> {
        if !self.is_open() {
            return Err(SemError::Closed);
        }
        let reader = match self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(r) => r,
            None => return Ok(()),
        };
        let queue = Arc::clone(&self.queue);
        let stop = Arc::clone(&self.rx_stop);
        let handle = std::thread::Builder::new()
            .name("sem-rx".into())
            .spawn(move || reader_loop(reader, queue, stop))?;
        *self.rx_thread.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        debug!("SEM reader thread started");
        Ok(())
    }

    /// Write one command line, appending the terminator if missing. Does not
    /// wait for any reply.
    pub fn write_line(&self, text: &str) -> SemResult<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let writer = guard.as_mut().ok_or(SemError::Closed)?;
        let mut payload: Vec<u8> = text.bytes().filter(u8::is_ascii).collect();
        if !text.ends_with(self.cfg.terminator.as_str()) {
            payload.extend_from_slice(self.cfg.terminator.as_bytes());
        }
        writer.write_all(&payload).map_err(SemError::Write)?;
        writer.flush().map_err(SemError::Write)?;
        trace!("TX {}", escape_log(text));
        Ok(())
    }

    /// Drain queued lines. If nothing is queued, wait up to `timeout` for the
    /// first arrival. Returns an empty vector when the window passes quietly.
    pub fn read_lines(&self, timeout: Duration) -> Vec<RxLine> {
        let deadline = Instant::now() + timeout;
        let mut lines = self.queue.lock();
        loop {
            if !lines.is_empty() {
                return lines.drain(..).collect();
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let (guard, _) = self
                .queue
                .ready
                .wait_timeout(lines, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            lines = guard;
        }
    }

    /// Collect lines until one matches the prompt pattern or `timeout`
    /// elapses. Every collected line is returned, the prompt included; the
    /// caller decides whether the exchange succeeded.
    pub fn read_until_prompt(&self, timeout: Duration) -> Vec<RxLine> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let batch = self.read_lines(PROMPT_POLL.min(deadline - now));
            if batch.is_empty() {
                continue;
            }
            let saw_prompt = batch.iter().any(|l| self.is_prompt(&l.text));
            out.extend(batch);
            if saw_prompt {
                break;
            }
        }
        out
    }

    /// Stop the reader and release the channel. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rx_stop.store(true, Ordering::Release);
        let handle = self.rx_thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("SEM reader thread panicked during shutdown");
            }
        }
        self.writer.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();
        info!("SEM link {} closed", self.cfg.device);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn connection_error(cfg: &SerialLinkConfig, reason: String) -> SemError {
    SemError::Connection {
        device: cfg.device.clone(),
        baud: cfg.baud,
        reason,
    }
}

fn reader_loop(mut reader: BoxedReader, queue: Arc<LineQueue>, stop: Arc<AtomicBool>) {
    let mut framer = LineFramer::new();
    let mut buffer = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => {
                framer.push(&buffer[..n]);
                while let Some(line) = framer.next_line() {
                    if line.dropped > 0 {
                        info!(
                            "Dropped {} undecodable byte(s) in RX line '{}'",
                            line.dropped,
                            escape_log(&line.text)
                        );
                    }
                    trace!("RX {}", escape_log(&line.text));
                    queue.push(RxLine::new(line.text));
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    error!("SEM read error, reader stopping: {}", e);
                }
                break;
            }
        }
    }
    debug!("SEM reader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semio::sim::MemoryLink;

    fn transport(link: &MemoryLink) -> Transport {
        let (r, w) = link.endpoints();
        let mut cfg = SerialLinkConfig::new("mem", 115_200);
        cfg.read_timeout = Duration::from_millis(10);
        Transport::from_parts(cfg, r, w)
    }

    #[test]
    fn default_prompt_matches_bare_prompts_only() {
        let re = default_prompt();
        assert!(re.is_match("I>"));
        assert!(re.is_match("O> "));
        assert!(re.is_match("D>"));
        assert!(!re.is_match("I> N C00A098000"));
        assert!(!re.is_match("SC 00"));
    }

    #[test]
    fn write_line_appends_terminator_once() {
        let link = MemoryLink::new();
        let tr = transport(&link);
        tr.write_line("S").unwrap();
        tr.write_line("I\r").unwrap();
        assert_eq!(link.sent_raw(), b"S\rI\r".to_vec());
    }

    #[test]
    fn read_lines_returns_empty_after_quiet_window() {
        let link = MemoryLink::new();
        let tr = transport(&link);
        tr.start_reader().unwrap();
        let start = Instant::now();
        assert!(tr.read_lines(Duration::from_millis(30)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
        tr.close();
    }

    #[test]
    fn close_is_idempotent_and_writes_fail_afterwards() {
        let link = MemoryLink::new();
        let tr = transport(&link);
        tr.start_reader().unwrap();
        tr.close();
        tr.close();
        assert!(!tr.is_open());
        assert!(matches!(tr.write_line("S"), Err(SemError::Closed)));
    }

    #[test]
    fn broken_channel_surfaces_write_error() {
        let link = MemoryLink::new();
        let tr = transport(&link);
        link.fail_writes(true);
        assert!(matches!(tr.write_line("N C00A098000"), Err(SemError::Write(_))));
    }
}
