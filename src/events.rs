//! Per-session event log.
//!
//! Events are kept in memory with a monotonic offset from session start and
//! written once, on [`EventLogger::close`], to
//! `<results_dir>/<run>/<session>/injection_log.txt`. Writing late keeps file
//! I/O off the injection and RX paths. Each tag can be switched off in
//! `[logging.tags]`.
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::config::{LogTags, LoggingConfig, ProfileArgs};

pub const LOG_FILE_NAME: &str = "injection_log.txt";
const RULE_WIDTH: usize = 110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    SemCmd,
    Info,
    Error,
    CnslCmd,
    ProfTime,
    ProfArea,
}

impl EventTag {
    pub const ALL: [EventTag; 6] = [
        EventTag::SemCmd,
        EventTag::Info,
        EventTag::Error,
        EventTag::CnslCmd,
        EventTag::ProfTime,
        EventTag::ProfArea,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EventTag::SemCmd => "SEM CMD",
            EventTag::Info => "INFO",
            EventTag::Error => "ERROR",
            EventTag::CnslCmd => "CNSL CMD",
            EventTag::ProfTime => "PROF TIME",
            EventTag::ProfArea => "PROF AREA",
        }
    }

    fn enabled(self, tags: &LogTags) -> bool {
        match self {
            EventTag::SemCmd => tags.sem_cmd,
            EventTag::Info => tags.info,
            EventTag::Error => tags.error,
            EventTag::CnslCmd => tags.cnsl_cmd,
            EventTag::ProfTime => tags.prof_time,
            EventTag::ProfArea => tags.prof_area,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub offset: Duration,
    pub tag: EventTag,
    pub text: String,
}

#[derive(Debug, Default, Clone)]
struct Header {
    device: Option<(String, u32)>,
    sem_freq_hz: Option<f64>,
    area: Option<(String, ProfileArgs)>,
    time: Option<(String, ProfileArgs)>,
}

#[derive(Default)]
struct State {
    header: Header,
    events: Vec<Event>,
    closed: bool,
}

pub struct EventLogger {
    t0: Instant,
    started: DateTime<Utc>,
    run: String,
    session: String,
    out_dir: PathBuf,
    tags: LogTags,
    tx_gap: usize,
    state: Mutex<State>,
}

impl EventLogger {
    pub fn new(cfg: &LoggingConfig) -> Self {
        let out_dir = PathBuf::from(&cfg.results_dir)
            .join(&cfg.run_name)
            .join(&cfg.session_label);
        Self {
            t0: Instant::now(),
            started: Utc::now(),
            run: cfg.run_name.clone(),
            session: cfg.session_label.clone(),
            out_dir,
            tags: cfg.tags,
            tx_gap: cfg.tx_marker_gap,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn path(&self) -> PathBuf {
        self.out_dir.join(LOG_FILE_NAME)
    }

    pub fn set_device(&self, device: &str, baud: u32) {
        self.lock().header.device = Some((device.to_string(), baud));
    }

    pub fn set_sem_freq(&self, hz: f64) {
        self.lock().header.sem_freq_hz = Some(hz);
    }

    pub fn set_area(&self, name: &str, args: &ProfileArgs) {
        self.lock().header.area = Some((name.to_string(), args.clone()));
    }

    pub fn set_time(&self, name: &str, args: &ProfileArgs) {
        self.lock().header.time = Some((name.to_string(), args.clone()));
    }

    /// Transmitted command, marked with a trailing `*`.
    pub fn log_tx(&self, cmd: &str) {
        let gap = " ".repeat(self.tx_gap);
        self.append(EventTag::SemCmd, format!("[SEND]: {cmd}{gap}*"));
    }

    pub fn log_rx(&self, line: &str) {
        self.append(EventTag::SemCmd, format!("[RECV]: {line}"));
    }

    pub fn log_info(&self, msg: &str) {
        self.append(EventTag::Info, msg.to_string());
    }

    pub fn log_error(&self, msg: &str) {
        self.append(EventTag::Error, msg.to_string());
    }

    pub fn log_console(&self, cmd: &str) {
        self.append(EventTag::CnslCmd, cmd.to_string());
    }

    pub fn log_prof_time(&self, msg: &str) {
        self.append(EventTag::ProfTime, msg.to_string());
    }

    pub fn log_prof_area(&self, msg: &str) {
        self.append(EventTag::ProfArea, msg.to_string());
    }

    fn append(&self, tag: EventTag, text: String) {
        if !tag.enabled(&self.tags) {
            return;
        }
        let offset = self.t0.elapsed();
        let mut state = self.lock();
        if state.closed {
            debug!("event after close dropped: {} {}", tag.label(), text);
            return;
        }
        state.events.push(Event { offset, tag, text });
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Full file content: header followed by one line per event.
    pub fn render(&self) -> String {
        let state = self.lock();
        self.render_locked(&state)
    }

    fn render_locked(&self, state: &State) -> String {
        let big = "=".repeat(RULE_WIDTH);
        let small = "-".repeat(RULE_WIDTH);
        let h = &state.header;
        let mut out = String::new();
        let _ = writeln!(out, "{big}");
        let _ = writeln!(out, "Fatori-V - SEM log");
        let _ = writeln!(out, "{small}");
        let _ = writeln!(out, "Run: {}", self.run);
        let _ = writeln!(out, "Session: {}", self.session);
        let _ = writeln!(out, "Started: {}", self.started.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some((dev, baud)) = &h.device {
            let _ = writeln!(out, "Device: {dev} @ {baud} baud");
        }
        if let Some(hz) = h.sem_freq_hz {
            let _ = writeln!(out, "SEM clock: {hz:.0} Hz");
        }
        let _ = writeln!(out, "{small}");
        for (label, profile) in [("Area Profile", &h.area), ("Time Profile", &h.time)] {
            if let Some((name, args)) = profile {
                let _ = writeln!(out, "{label}: {name}");
                for (k, v) in args.iter() {
                    let _ = writeln!(out, "  {k:<10}: {v}");
                }
            }
        }
        let _ = writeln!(out, "{small}");
        let _ = writeln!(out, "Logged tags:");
        for tag in EventTag::ALL.iter().filter(|t| t.enabled(&self.tags)) {
            let _ = writeln!(out, "  - {}", tag.label());
        }
        let _ = writeln!(out, "Tags can be switched in the [logging.tags] config section");
        let _ = writeln!(out, "{small}");
        let _ = writeln!(out, "Conventions:");
        let _ = writeln!(
            out,
            "  - Transmission ([SEND]) entries are marked with '*' in this log."
        );
        let _ = writeln!(out, "{big}");
        for ev in &state.events {
            let _ = writeln!(
                out,
                "[+{:8.3}s] {} {}",
                ev.offset.as_secs_f64(),
                ev.tag.label(),
                ev.text
            );
        }
        out
    }

    /// Write the session file. Only the first call writes; later calls
    /// return `Ok(None)`.
    pub fn close(&self) -> std::io::Result<Option<PathBuf>> {
        let content = {
            let mut state = self.lock();
            if state.closed {
                return Ok(None);
            }
            state.closed = true;
            self.render_locked(&state)
        };
        std::fs::create_dir_all(&self.out_dir)?;
        let path = self.path();
        std::fs::write(&path, content)?;
        info!("Session log written to {}", path.display());
        Ok(Some(path))
    }
}
