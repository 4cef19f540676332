//! SEM monitor command encoding and reply classification.
//!
//! Every command is a thin encode-and-write over the [`Transport`]; nothing
//! here waits for a reply except [`SemProtocol::sync_prompt`] and the
//! [`SemProtocol::status`] convenience. Reply lines are classified by shape:
//!
//! | line                 | meaning                                   |
//! |----------------------|-------------------------------------------|
//! | `I>` `O>` `D>`       | prompt, carries the device mode           |
//! | `I> N C00A098000`    | echo of an injection command              |
//! | `SC 10` / `SC 00`    | status code (accepted / idle)             |
//! | `FC 00`, `AF 01` ... | generic two-letter counter                |
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use log::{debug, info};
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::area::Lfa;
use crate::error::SemResult;
use crate::semio::transport::{RxLine, Transport};

/// `SC` value reported once the monitor is idle again.
pub const SC_IDLE: u8 = 0x00;
/// `SC` value reported while an injection is in progress.
pub const SC_ACCEPTED: u8 = 0x10;

static RE_ECHO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([IOD])>\s+N\s+(\S+)").expect("Invalid echo regex"));
static RE_SC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SC\s+([0-9A-Fa-f]{2})$").expect("Invalid status code regex"));
static RE_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([IOD])>\s*$").expect("Invalid prompt regex"));
static RE_COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]{2})\s+([0-9A-FXx]+)$").expect("Invalid counter regex"));

/// Mode the monitor reports through its prompt character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    Idle,
    Observation,
    DetectOnly,
    DiagnosticScan,
    Unknown,
}

impl DeviceMode {
    pub fn from_prompt_char(c: char) -> Self {
        match c {
            'I' => DeviceMode::Idle,
            'O' => DeviceMode::Observation,
            'D' => DeviceMode::DetectOnly,
            _ => DeviceMode::Unknown,
        }
    }

    pub fn prompt_char(self) -> Option<char> {
        match self {
            DeviceMode::Idle => Some('I'),
            DeviceMode::Observation => Some('O'),
            DeviceMode::DetectOnly => Some('D'),
            DeviceMode::DiagnosticScan | DeviceMode::Unknown => None,
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceMode::Idle => "idle",
            DeviceMode::Observation => "observation",
            DeviceMode::DetectOnly => "detect-only",
            DeviceMode::DiagnosticScan => "diagnostic-scan",
            DeviceMode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// SEM monitor commands. `Display` yields the exact line sent, without the
/// terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Idle,
    Observe,
    DetectOnly,
    DiagnosticScan,
    Inject(Lfa),
    FrameRead(String),
    Translate(String),
    Peek(u8),
    XmemRead(String),
    Reset(u8),
    Raw(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Status => f.write_str("S"),
            Command::Idle => f.write_str("I"),
            Command::Observe => f.write_str("O"),
            Command::DetectOnly => f.write_str("D"),
            Command::DiagnosticScan => f.write_str("U"),
            Command::Inject(lfa) => write!(f, "N {lfa}"),
            Command::FrameRead(addr) => write!(f, "Q {}", addr.to_ascii_uppercase()),
            Command::Translate(addr) => write!(f, "T {}", addr.to_ascii_uppercase()),
            Command::Peek(reg) => write!(f, "P {reg:02X}"),
            Command::XmemRead(addr) => write!(f, "X {}", addr.to_ascii_uppercase()),
            Command::Reset(code) => write!(f, "R {code:02X}"),
            Command::Raw(text) => f.write_str(text.trim()),
        }
    }
}

/// Shape of a single reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Prompt(DeviceMode),
    InjectEcho { mode: DeviceMode, target: String },
    StatusCode(u8),
    Counter { key: String, value: String },
    Other,
}

/// Classify one received line. Never fails; unknown shapes are `Other`.
pub fn classify(line: &str) -> Reply {
    let line = line.trim_end();
    if let Some(c) = RE_PROMPT.captures(line) {
        return Reply::Prompt(prompt_mode(&c[1]));
    }
    if let Some(c) = RE_ECHO.captures(line) {
        return Reply::InjectEcho {
            mode: prompt_mode(&c[1]),
            target: c[2].to_string(),
        };
    }
    if let Some(c) = RE_SC.captures(line) {
        if let Ok(v) = u8::from_str_radix(&c[1], 16) {
            return Reply::StatusCode(v);
        }
    }
    if let Some(c) = RE_COUNTER.captures(line.trim_start()) {
        return Reply::Counter {
            key: c[1].to_string(),
            value: c[2].to_string(),
        };
    }
    Reply::Other
}

fn prompt_mode(s: &str) -> DeviceMode {
    s.chars()
        .next()
        .map(DeviceMode::from_prompt_char)
        .unwrap_or(DeviceMode::Unknown)
}

/// Insertion-ordered counter map from one status reply. Values keep the
/// device's formatting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    entries: Vec<(String, String)>,
}

impl StatusSnapshot {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `SC 00` and `FC` absent or all zeros.
    pub fn is_quiescent(&self) -> bool {
        let sc_idle = self.get("SC").map(|v| v == "00").unwrap_or(false);
        let fc_clear = self
            .get("FC")
            .map(|v| v.chars().all(|c| c == '0'))
            .unwrap_or(true);
        sc_idle && fc_clear
    }
}

impl Serialize for StatusSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Build a snapshot from status-shaped lines; everything else is ignored.
pub fn parse_status<'a, I>(lines: I) -> StatusSnapshot
where
    I: IntoIterator<Item = &'a str>,
{
    let mut snap = StatusSnapshot::default();
    for line in lines {
        if let Some(c) = RE_COUNTER.captures(line.trim()) {
            snap.insert(&c[1], &c[2]);
        }
    }
    snap
}

/// Write-side seam handed to schedulers: fire an injection, nothing else.
pub trait Injector: Send + Sync {
    fn inject(&self, lfa: &Lfa) -> SemResult<()>;
}

/// Command helpers over a shared transport.
#[derive(Clone)]
pub struct SemProtocol {
    tr: Arc<Transport>,
}

impl SemProtocol {
    pub fn new(tr: Arc<Transport>) -> Self {
        Self { tr }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.tr
    }

    pub fn send(&self, cmd: &Command) -> SemResult<()> {
        self.tr.write_line(&cmd.to_string())
    }

    /// Send `S`. Replies are collected by whoever owns the RX queue.
    pub fn request_status(&self) -> SemResult<()> {
        self.send(&Command::Status)
    }

    /// Send `S`, read until the prompt for at most `window`, and parse. An
    /// empty snapshot means nothing status-shaped arrived in time.
    pub fn status(&self, window: Duration) -> SemResult<(StatusSnapshot, Vec<RxLine>)> {
        self.request_status()?;
        let lines = self.tr.read_until_prompt(window);
        let snap = parse_status(lines.iter().map(|l| l.text.as_str()));
        Ok((snap, lines))
    }

    pub fn goto_idle(&self) -> SemResult<()> {
        self.send(&Command::Idle)
    }

    pub fn goto_observe(&self) -> SemResult<()> {
        self.send(&Command::Observe)
    }

    pub fn goto_detect_only(&self) -> SemResult<()> {
        self.send(&Command::DetectOnly)
    }

    pub fn diagnostic_scan(&self) -> SemResult<()> {
        self.send(&Command::DiagnosticScan)
    }

    /// Fire-and-forget injection.
    pub fn inject_lfa(&self, lfa: &Lfa) -> SemResult<()> {
        self.tr.write_line(&format!("N {lfa}"))
    }

    pub fn passthrough(&self, raw: &str) -> SemResult<()> {
        self.send(&Command::Raw(raw.to_string()))
    }

    /// Consume the initial burst until a prompt shows up. Returns the mode of
    /// that prompt, or `None` if the window passed without one. Never fails.
    pub fn sync_prompt(&self, window: Duration) -> Option<DeviceMode> {
        let deadline = Instant::now() + window;
        let mut seen = 0usize;
        while Instant::now() < deadline {
            let slice = Duration::from_millis(50).min(deadline.saturating_duration_since(Instant::now()));
            for line in self.tr.read_lines(slice) {
                seen += 1;
                if let Reply::Prompt(mode) = classify(&line.text) {
                    debug!("Prompt sync: {} after {} line(s)", mode, seen);
                    return Some(mode);
                }
            }
        }
        info!("Prompt sync: no prompt within {:?} ({} line(s) drained)", window, seen);
        None
    }
}

impl Injector for SemProtocol {
    fn inject(&self, lfa: &Lfa) -> SemResult<()> {
        self.inject_lfa(lfa)
    }
}

/// Mode implied by the last prompt in `lines`, if any.
pub fn last_prompt_mode(lines: &[RxLine]) -> Option<DeviceMode> {
    lines.iter().rev().find_map(|l| match classify(&l.text) {
        Reply::Prompt(mode) => Some(mode),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_are_exact() {
        let lfa: Lfa = "c00a098000".parse().unwrap();
        assert_eq!(Command::Status.to_string(), "S");
        assert_eq!(Command::DiagnosticScan.to_string(), "U");
        assert_eq!(Command::Inject(lfa).to_string(), "N C00A098000");
        assert_eq!(Command::Peek(0x0a).to_string(), "P 0A");
        assert_eq!(Command::Reset(0).to_string(), "R 00");
        assert_eq!(Command::FrameRead("00001a".into()).to_string(), "Q 00001A");
    }

    #[test]
    fn classifies_reply_shapes() {
        assert_eq!(classify("O>"), Reply::Prompt(DeviceMode::Observation));
        assert_eq!(classify("I> "), Reply::Prompt(DeviceMode::Idle));
        assert_eq!(
            classify("I> N C00A098000"),
            Reply::InjectEcho {
                mode: DeviceMode::Idle,
                target: "C00A098000".into()
            }
        );
        assert_eq!(classify("SC 10"), Reply::StatusCode(SC_ACCEPTED));
        assert_eq!(classify("SC 00"), Reply::StatusCode(SC_IDLE));
        assert_eq!(
            classify("FC 00"),
            Reply::Counter {
                key: "FC".into(),
                value: "00".into()
            }
        );
        assert_eq!(classify("SEM_ULTRA banner v4.1"), Reply::Other);
    }

    #[test]
    fn status_parse_keeps_order_and_formatting() {
        let snap = parse_status(["FC 00", "junk line", "SC 00", "TS 0x1F", "I>"]);
        let keys: Vec<_> = snap.iter().collect();
        assert_eq!(keys, vec![("FC", "00"), ("SC", "00"), ("TS", "0x1F")]);
        assert!(snap.is_quiescent());
    }

    #[test]
    fn quiescent_requires_sc_idle_and_fc_clear() {
        assert!(!parse_status(["SC 10"]).is_quiescent());
        assert!(!parse_status(["SC 00", "FC 02"]).is_quiescent());
        assert!(parse_status(["SC 00"]).is_quiescent());
    }

    #[test]
    fn snapshot_serializes_in_insertion_order() {
        let snap = parse_status(["SC 00", "FC 00"]);
        assert_eq!(serde_json::to_string(&snap).unwrap(), r#"{"SC":"00","FC":"00"}"#);
    }
}
