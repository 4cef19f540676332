//! Synchronized request/reply exchanges.
//!
//! These helpers read the RX queue directly through
//! [`Transport::read_until_prompt`](crate::semio::transport::Transport::read_until_prompt),
//! so they must only run while nobody else drains it: before the controller's
//! RX loop starts, inside its gated section, or from one-shot CLI commands.
use std::time::{Duration, Instant};

use log::debug;

use crate::area::Lfa;
use crate::error::SemResult;
use crate::semio::protocol::{classify, Reply, SemProtocol, StatusSnapshot, SC_ACCEPTED, SC_IDLE};
use crate::semio::transport::RxLine;

/// Window for a mode transition to show its prompt.
pub const MODE_SWITCH_WINDOW: Duration = Duration::from_secs(2);
/// Extra window granted to a slow injection acknowledgement.
const INJECT_GRACE: Duration = Duration::from_millis(500);
const ASSIST_POLL: Duration = Duration::from_millis(100);

/// Send `I` and collect the transition lines.
pub fn ensure_idle(proto: &SemProtocol, window: Duration) -> SemResult<Vec<RxLine>> {
    proto.goto_idle()?;
    Ok(proto.transport().read_until_prompt(window))
}

/// Send `O` and collect the transition lines.
pub fn go_observe(proto: &SemProtocol, window: Duration) -> SemResult<Vec<RxLine>> {
    proto.goto_observe()?;
    Ok(proto.transport().read_until_prompt(window))
}

/// Which parts of an injection acknowledgement were seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectAck {
    pub echo: bool,
    pub accepted: bool,
    pub completed: bool,
}

impl InjectAck {
    pub fn scan<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Self {
        let mut ack = InjectAck::default();
        ack.absorb(lines);
        ack
    }

    fn absorb<'a, I: IntoIterator<Item = &'a str>>(&mut self, lines: I) {
        for line in lines {
            match classify(line) {
                Reply::InjectEcho { .. } => self.echo = true,
                Reply::StatusCode(SC_ACCEPTED) => self.accepted = true,
                Reply::StatusCode(SC_IDLE) => self.completed = true,
                _ => {}
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.echo && self.accepted && self.completed
    }
}

#[derive(Debug, Clone)]
pub struct InjectOutcome {
    pub lines: Vec<RxLine>,
    pub ack: InjectAck,
}

/// Send `N <addr>` and block until the monitor acknowledges it or the window
/// (plus a short grace period) runs out. Console and CLI use only.
pub fn inject_once(proto: &SemProtocol, lfa: &Lfa, window: Duration) -> SemResult<InjectOutcome> {
    proto.inject_lfa(lfa)?;
    let tr = proto.transport();
    let mut lines = tr.read_until_prompt(window);
    let mut ack = InjectAck::scan(lines.iter().map(|l| l.text.as_str()));
    if !ack.is_complete() {
        let more = tr.read_until_prompt(INJECT_GRACE);
        ack.absorb(more.iter().map(|l| l.text.as_str()));
        lines.extend(more);
    }
    debug!("inject {} -> {:?}", lfa, ack);
    Ok(InjectOutcome { lines, ack })
}

/// Poll status until `SC 00` with no pending frame corrections, or until
/// `timeout`. Returns whether the monitor settled, the last snapshot and all
/// lines read.
pub fn assist_until_fc(
    proto: &SemProtocol,
    timeout: Duration,
    window: Duration,
) -> SemResult<(bool, StatusSnapshot, Vec<RxLine>)> {
    let deadline = Instant::now() + timeout;
    let mut all = Vec::new();
    let mut last = StatusSnapshot::default();
    while Instant::now() < deadline {
        let (snap, lines) = proto.status(window)?;
        all.extend(lines);
        if snap.is_quiescent() {
            return Ok((true, snap, all));
        }
        last = snap;
        std::thread::sleep(ASSIST_POLL);
    }
    Ok((false, last, all))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semio::sim::MemoryLink;
    use crate::semio::transport::{SerialLinkConfig, Transport};
    use std::sync::Arc;

    fn proto_over(link: &MemoryLink) -> SemProtocol {
        let (r, w) = link.endpoints();
        let tr = Arc::new(Transport::from_parts(SerialLinkConfig::new("mem", 115_200), r, w));
        tr.start_reader().unwrap();
        SemProtocol::new(tr)
    }

    #[test]
    fn inject_once_sees_full_acknowledgement() {
        let link = MemoryLink::with_simulated_sem();
        let proto = proto_over(&link);
        proto.sync_prompt(Duration::from_millis(300));
        let lfa: Lfa = "00001A2B3C".parse().unwrap();
        let out = inject_once(&proto, &lfa, Duration::from_secs(1)).unwrap();
        assert!(out.ack.is_complete());
        assert_eq!(link.injected(), vec!["00001A2B3C"]);
        proto.transport().close();
    }

    #[test]
    fn inject_once_reports_missing_ack() {
        let link = MemoryLink::new();
        let proto = proto_over(&link);
        let lfa: Lfa = "00001A2B3C".parse().unwrap();
        let out = inject_once(&proto, &lfa, Duration::from_millis(50)).unwrap();
        assert!(!out.ack.is_complete());
        assert!(out.lines.is_empty());
        proto.transport().close();
    }

    #[test]
    fn ensure_idle_and_observe_return_prompted_lines() {
        let link = MemoryLink::with_simulated_sem();
        let proto = proto_over(&link);
        proto.sync_prompt(Duration::from_millis(300));
        let lines = go_observe(&proto, MODE_SWITCH_WINDOW).unwrap();
        assert_eq!(lines.last().map(|l| l.text.as_str()), Some("O>"));
        let lines = ensure_idle(&proto, MODE_SWITCH_WINDOW).unwrap();
        assert_eq!(lines.last().map(|l| l.text.as_str()), Some("I>"));
        proto.transport().close();
    }

    #[test]
    fn assist_settles_on_idle_monitor() {
        let link = MemoryLink::with_simulated_sem();
        let proto = proto_over(&link);
        proto.sync_prompt(Duration::from_millis(300));
        let (settled, snap, _) =
            assist_until_fc(&proto, Duration::from_secs(1), Duration::from_millis(300)).unwrap();
        assert!(settled);
        assert_eq!(snap.get("SC"), Some("00"));
        proto.transport().close();
    }
}
