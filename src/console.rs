//! Interactive console output.
//!
//! Everything the operator sees goes through [`Console`]: `[SEND]`/`[RECV]`
//! echoes, `[INFO]`/`[ERROR]` messages, rules, banners and help text. ANSI
//! styling is applied only when stdout is a terminal. A muted console drops
//! all output, which is what the one-shot CLI commands and tests use.
//!
//! [`TxEchoGate`] reorders injection echoes for readability only: a `[SEND]`
//! line for shot *k+1* is held back until the `SC 00` that completes shot *k*
//! has been printed. It never delays a transmission.
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

pub const LINE_WIDTH: usize = 110;

pub const PREFIX_INFO: &str = "[INFO] ";
pub const PREFIX_TX: &str = "[SEND] ";
pub const PREFIX_RX: &str = "[RECV] ";
pub const PREFIX_ERROR: &str = "[ERROR] ";

pub const PROMPT_MANUAL: &str = "> ";

pub const CONSOLE_HELP: &str = "\
  status               one-shot parsed counters
  manual               switch to manual mode (raw SEM commands)
  resume               (manual mode) re-check the link and continue the campaign
  help                 show this help
  sem                  show SEM command cheat sheet
  exit                 close the session";

pub const SEM_CHEATSHEET: &str = "\
  S                 : Status report (valid in Idle and Observation).
  O                 : Enter Observation (command from Idle; mitigation modes only).
  I                 : Enter Idle (command from Observation or Detect-only).
  D                 : Enter Detect-only (command from Idle).
  U                 : Enter Diagnostic Scan (single sweep; command from Idle).

  N <ADDR>          : Error injection using frame address encoding.
                       10 digit LFA with word/bit fields encoded into the hex.
                       Example: N C00A098000

  Q <ADDR>          : Configuration frame read (LFA or PFA accepted).
  T <ADDR>          : Frame address translation between PFA and LFA (valid in Idle).
  P <REG>           : Configuration register peek, 2 hex digits, valid in Idle.
  X <ADDR>          : External memory read; valid in Idle.
  R <xx>            : Software reset; argument ignored; valid in Idle.";

#[derive(Debug, Clone, Copy)]
enum Style {
    Info,
    Send,
    Recv,
    Error,
    Rule,
    Alert,
    Title,
    Ok,
}

impl Style {
    fn ansi(self) -> &'static str {
        match self {
            Style::Info => "\x1b[94m",
            Style::Send => "\x1b[93m",
            Style::Recv => "\x1b[92m",
            Style::Error | Style::Alert => "\x1b[91m",
            Style::Rule => "\x1b[94m",
            Style::Title => "\x1b[1m\x1b[92m",
            Style::Ok => "\x1b[96m",
        }
    }
}

type Sink = Box<dyn Fn(&str) + Send + Sync>;

pub struct Console {
    sink: Option<Sink>,
    color: bool,
    gate: Option<TxEchoGate>,
}

impl Console {
    /// Console writing to stdout, with the injection echo gate when `echo_gate`.
    pub fn stdout(echo_gate: bool) -> Self {
        let sink: Sink = Box::new(|line| {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{line}");
        });
        Self {
            sink: Some(sink),
            color: atty::is(atty::Stream::Stdout),
            gate: echo_gate.then(TxEchoGate::new),
        }
    }

    pub fn muted() -> Self {
        Self {
            sink: None,
            color: false,
            gate: None,
        }
    }

    /// Console that hands each finished line to `sink`, uncoloured.
    pub fn with_sink(sink: impl Fn(&str) + Send + Sync + 'static, echo_gate: bool) -> Self {
        Self {
            sink: Some(Box::new(sink)),
            color: false,
            gate: echo_gate.then(TxEchoGate::new),
        }
    }

    fn paint(&self, text: &str, style: Style) -> String {
        if self.color {
            format!("{}{}\x1b[0m", style.ansi(), text)
        } else {
            text.to_string()
        }
    }

    fn emit(&self, line: &str) {
        if let Some(sink) = &self.sink {
            sink(line);
        }
    }

    pub fn info(&self, msg: &str) {
        self.emit(&self.paint(&format!("{PREFIX_INFO}{msg}"), Style::Info));
    }

    pub fn error(&self, msg: &str) {
        self.emit(&self.paint(&format!("{PREFIX_ERROR}{msg}"), Style::Error));
    }

    pub fn tx(&self, cmd: &str) {
        self.emit(&self.paint(&format!("{PREFIX_TX}{cmd}"), Style::Send));
    }

    pub fn rx(&self, line: &str) {
        self.emit(&self.paint(&format!("{PREFIX_RX}{line}"), Style::Recv));
    }

    /// Echo an injection command, through the gate when one is configured.
    pub fn inject_tx(&self, cmd: &str) {
        let line = self.paint(&format!("{PREFIX_TX}{cmd}"), Style::Send);
        match &self.gate {
            Some(gate) => {
                if let Some(now) = gate.send_echo(line) {
                    self.emit(&now);
                }
            }
            None => self.emit(&line),
        }
    }

    /// An injection completed; print the next held echo if any.
    pub fn inject_completed(&self) {
        if let Some(gate) = &self.gate {
            if let Some(next) = gate.on_sc00() {
                self.emit(&next);
            }
        }
    }

    pub fn has_gate(&self) -> bool {
        self.gate.is_some()
    }

    pub fn rule_big(&self) {
        self.emit(&self.paint(&"=".repeat(LINE_WIDTH), Style::Rule));
    }

    pub fn rule_alert(&self) {
        self.emit(&self.paint(&"=".repeat(LINE_WIDTH), Style::Alert));
    }

    pub fn rule_small(&self) {
        self.emit(&self.paint(&"-".repeat(LINE_WIDTH), Style::Rule));
    }

    pub fn plain(&self, text: &str) {
        self.emit(text);
    }

    pub fn title(&self, text: &str) {
        self.emit(&self.paint(&center(text, LINE_WIDTH), Style::Title));
    }

    /// Outcome of the start-up connectivity check.
    pub fn preflight_banner(&self, confirmed: bool) {
        let dash = "-".repeat(LINE_WIDTH);
        if confirmed {
            self.emit(&self.paint(&dash, Style::Ok));
            self.emit("Connection confirmed");
            self.emit(&self.paint(&center("Session Ready to Start", LINE_WIDTH), Style::Recv));
            self.emit(&self.paint(&dash, Style::Ok));
        } else {
            self.emit(&self.paint(&dash, Style::Alert));
            self.emit("Connection with the board was not confirmed");
            self.emit(&self.paint(&center("Session Aborted", LINE_WIDTH), Style::Error));
            self.emit(&self.paint(&dash, Style::Alert));
        }
    }

    pub fn help(&self) {
        self.rule_small();
        self.emit(&self.paint("Console commands", Style::Alert));
        self.emit(CONSOLE_HELP);
        self.sem_cheatsheet();
    }

    pub fn sem_cheatsheet(&self) {
        self.rule_small();
        self.emit(&self.paint("SEM IP commands", Style::Alert));
        self.emit(SEM_CHEATSHEET);
        self.rule_small();
    }

    pub fn start_mode_notes(&self) {
        self.emit(&self.paint("Start mode: driven", Style::Alert));
        self.emit("  • In driven mode only: help, sem, status, manual, exit.");
        self.emit("  • For raw SEM commands, type 'manual'. To return, type 'resume'.");
        self.emit("  • Type 'help' anytime for the command list; 'sem' prints the SEM cheatsheet.");
    }

    /// `  • label : value` line used by the session header.
    pub fn field(&self, label: &str, value: &str) {
        self.emit(&format!("  • {label:<12}: {value}"));
    }

    pub fn manual_prompt(&self) {
        if self.sink.is_some() {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "{PROMPT_MANUAL}");
            let _ = out.flush();
        }
    }
}

pub fn center(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    format!("{}{}", " ".repeat((width - len) / 2), text)
}

#[derive(Default)]
struct GateState {
    printed: u64,
    completed: u64,
    held: VecDeque<String>,
}

/// Holds injection echoes so at most one is ahead of the completions seen.
#[derive(Default)]
pub struct TxEchoGate {
    state: Mutex<GateState>,
}

impl TxEchoGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the line to print now, or `None` if it was held.
    pub fn send_echo(&self, line: String) -> Option<String> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.printed <= st.completed && st.held.is_empty() {
            st.printed += 1;
            Some(line)
        } else {
            st.held.push_back(line);
            None
        }
    }

    /// Record one completion and release the oldest held echo.
    pub fn on_sc00(&self) -> Option<String> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.completed += 1;
        let next = st.held.pop_front();
        if next.is_some() {
            st.printed += 1;
        }
        next
    }

    pub fn held(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).held.len()
    }
}
