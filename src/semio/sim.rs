//! In-memory duplex link and a simulated SEM monitor.
//!
//! [`MemoryLink`] hands out a reader and a writer that can be plugged into
//! [`Transport::from_parts`](crate::semio::transport::Transport::from_parts).
//! Bytes written by the transport are recorded; bytes pushed with
//! [`MemoryLink::push_line`] show up on the read side. An optional responder
//! turns every complete command line into reply lines, which is how
//! [`SemSimulator`] stands in for real hardware in tests and dry runs.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::semio::protocol::DeviceMode;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct Shared {
    rx: Mutex<VecDeque<u8>>,
    rx_ready: Condvar,
    sent: Mutex<Vec<u8>>,
    partial: Mutex<Vec<u8>>,
    responder: Mutex<Option<Responder>>,
    fail_writes: AtomicBool,
    read_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Cloneable handle to both ends of an in-memory serial line.
#[derive(Clone)]
pub struct MemoryLink {
    shared: Arc<Shared>,
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLink {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                rx: Mutex::new(VecDeque::new()),
                rx_ready: Condvar::new(),
                sent: Mutex::new(Vec::new()),
                partial: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                fail_writes: AtomicBool::new(false),
                read_timeout: Duration::from_millis(10),
            }),
        }
    }

    /// Link wired to a [`SemSimulator`] that has just printed its boot banner.
    pub fn with_simulated_sem() -> Self {
        let link = Self::new();
        let mut sem = SemSimulator::new();
        for line in sem.banner() {
            link.push_line(&line);
        }
        link.set_responder(move |cmd| sem.respond(cmd));
        link
    }

    /// Reader and writer halves for a transport.
    pub fn endpoints(&self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
        (
            Box::new(LinkReader {
                shared: Arc::clone(&self.shared),
            }),
            Box::new(LinkWriter {
                shared: Arc::clone(&self.shared),
            }),
        )
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        *lock(&self.shared.responder) = Some(Box::new(f));
    }

    /// Make every subsequent write fail with `BrokenPipe`.
    pub fn fail_writes(&self, on: bool) {
        self.shared.fail_writes.store(on, Ordering::Release);
    }

    pub fn push_bytes(&self, data: &[u8]) {
        lock(&self.shared.rx).extend(data.iter().copied());
        self.shared.rx_ready.notify_all();
    }

    /// Queue `text` followed by CRLF on the device-to-host side.
    pub fn push_line(&self, text: &str) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.push_bytes(&bytes);
    }

    pub fn sent_raw(&self) -> Vec<u8> {
        lock(&self.shared.sent).clone()
    }

    /// Host-to-device traffic split into command lines.
    pub fn sent_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.sent_raw())
            .split(['\r', '\n'])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Sent lines that are injections, as their address text.
    pub fn injected(&self) -> Vec<String> {
        self.sent_lines()
            .into_iter()
            .filter_map(|l| l.strip_prefix("N ").map(str::to_string))
            .collect()
    }
}

struct LinkReader {
    shared: Arc<Shared>,
}

impl Read for LinkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = lock(&self.shared.rx);
        if rx.is_empty() {
            let (guard, _) = self
                .shared
                .rx_ready
                .wait_timeout(rx, self.shared.read_timeout)
                .unwrap_or_else(|p| p.into_inner());
            rx = guard;
        }
        if rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct LinkWriter {
    shared: Arc<Shared>,
}

impl Write for LinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        lock(&self.shared.sent).extend_from_slice(buf);

        let commands: Vec<String> = {
            let mut partial = lock(&self.shared.partial);
            partial.extend_from_slice(buf);
            let mut out = Vec::new();
            while let Some(pos) = partial.iter().position(|b| *b == b'\r' || *b == b'\n') {
                let line: Vec<u8> = partial.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
                if !text.is_empty() {
                    out.push(text);
                }
            }
            out
        };

        let replies: Vec<String> = {
            let mut responder = lock(&self.shared.responder);
            match responder.as_mut() {
                Some(f) => commands.iter().flat_map(|c| f(c)).collect(),
                None => Vec::new(),
            }
        };
        if !replies.is_empty() {
            let mut rx = lock(&self.shared.rx);
            for line in replies {
                rx.extend(line.bytes());
                rx.extend(b"\r\n".iter().copied());
            }
            drop(rx);
            self.shared.rx_ready.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        Ok(())
    }
}

/// Behavioural model of the SEM monitor command interpreter.
#[derive(Debug, Clone)]
pub struct SemSimulator {
    mode: DeviceMode,
    injections: u64,
}

impl Default for SemSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SemSimulator {
    pub fn new() -> Self {
        Self {
            mode: DeviceMode::Idle,
            injections: 0,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn injections(&self) -> u64 {
        self.injections
    }

    pub fn banner(&self) -> Vec<String> {
        vec![
            "SEM_ULTRA_V3_1".to_string(),
            "SC 01".to_string(),
            "SC 00".to_string(),
            self.prompt(),
        ]
    }

    fn prompt(&self) -> String {
        format!("{}>", self.mode.prompt_char().unwrap_or('I'))
    }

    fn state_code(&self) -> &'static str {
        match self.mode {
            DeviceMode::Observation => "02",
            _ => "00",
        }
    }

    /// Reply lines for one command line.
    pub fn respond(&mut self, cmd: &str) -> Vec<String> {
        let mut parts = cmd.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").to_ascii_uppercase();
        match verb.as_str() {
            "S" => vec![
                "FC 00".to_string(),
                format!("SC {}", self.state_code()),
                self.prompt(),
            ],
            "I" => {
                self.mode = DeviceMode::Idle;
                vec!["SC 00".to_string(), self.prompt()]
            }
            "O" => {
                self.mode = DeviceMode::Observation;
                vec!["SC 02".to_string(), self.prompt()]
            }
            "D" => {
                self.mode = DeviceMode::DetectOnly;
                vec!["SC 00".to_string(), self.prompt()]
            }
            "N" if !arg.is_empty() => {
                self.injections += 1;
                vec![
                    format!("{} N {}", self.prompt(), arg),
                    "SC 10".to_string(),
                    "SC 00".to_string(),
                    self.prompt(),
                ]
            }
            "R" => {
                self.mode = DeviceMode::Idle;
                self.banner()
            }
            "P" | "Q" | "T" | "X" if !arg.is_empty() => {
                vec![format!("{verb} {arg} 00000000"), self.prompt()]
            }
            _ => vec![self.prompt()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_answers_each_complete_line() {
        let link = MemoryLink::new();
        link.set_responder(|cmd| vec![format!("ack {cmd}")]);
        let (mut r, mut w) = link.endpoints();
        w.write_all(b"S\rI").unwrap();
        w.write_all(b"\r").unwrap();
        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack S\r\nack I\r\n");
        assert_eq!(link.sent_lines(), vec!["S", "I"]);
    }

    #[test]
    fn simulator_injection_reply_sequence() {
        let mut sem = SemSimulator::new();
        assert_eq!(
            sem.respond("N c00a098000"),
            vec!["I> N C00A098000", "SC 10", "SC 00", "I>"]
        );
        assert_eq!(sem.injections(), 1);
        sem.respond("O");
        assert_eq!(sem.mode(), DeviceMode::Observation);
        assert_eq!(sem.respond("S"), vec!["FC 00", "SC 02", "O>"]);
    }

    #[test]
    fn empty_reader_times_out() {
        let link = MemoryLink::new();
        let (mut r, _w) = link.endpoints();
        let mut buf = [0u8; 8];
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
