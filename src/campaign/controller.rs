//! Campaign controller.
//!
//! The controller is the only consumer of the transport's RX queue. Its RX
//! loop feeds every line to the acknowledgement tracker, the event log and the
//! console, in arrival order. Any exchange that has to read replies itself
//! (preflight, start mode, operator `status`) runs inside
//! [`Controller::synchronized`], which parks the RX loop for the duration.
//!
//! Threads owned here: the RX loop and the end-of-campaign watcher. The
//! scheduler thread is owned by the [`Scheduler`] held in the campaign slot.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use super::{CampaignPlan, ControllerEvent, ExitStatus, Flow, ShotEcho};
use crate::area::AreaProfile;
use crate::config::{Config, OnEnd, StartMode};
use crate::console::Console;
use crate::error::{SemError, SemResult};
use crate::events::EventLogger;
use crate::semio::exchange::{self, MODE_SWITCH_WINDOW};
use crate::semio::protocol::{classify, last_prompt_mode, Command, Reply, SC_IDLE};
use crate::semio::{AckTracker, DeviceMode, RxLine, SemProtocol, StatusSnapshot, Transport};
use crate::time::scheduler::Outcome;
use crate::time::{FinishReason, Scheduler, SchedulerState, Termination};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    rx_poll: Duration,
    sync_window: Duration,
    watcher_poll: Duration,
    preflight_attempts: u32,
    preflight_interval: Duration,
    preflight_window: Duration,
}

impl Timing {
    fn from_config(cfg: &Config) -> Self {
        Self {
            rx_poll: Duration::from_millis(cfg.controller.rx_poll_ms.max(1)),
            sync_window: Duration::from_millis(cfg.controller.sync_window_ms),
            watcher_poll: Duration::from_millis(cfg.controller.watcher_poll_ms.max(1)),
            preflight_attempts: cfg.preflight.attempts.max(1),
            preflight_interval: Duration::from_millis(cfg.preflight.interval_ms.max(50)),
            preflight_window: Duration::from_millis(cfg.preflight.window_ms),
        }
    }
}

/// Enable flag plus the lock the RX loop holds while it drains the queue.
struct RxGate {
    enabled: AtomicBool,
    busy: Mutex<()>,
}

pub struct Controller {
    plan: CampaignPlan,
    timing: Timing,
    start_mode: StartMode,
    status_on_start: bool,
    proto: SemProtocol,
    ack: Arc<AckTracker>,
    log: Arc<EventLogger>,
    console: Arc<Console>,
    rx: RxGate,
    mode: Mutex<DeviceMode>,
    campaign: Mutex<Option<Scheduler>>,
    spent_area: Mutex<Option<Box<dyn AreaProfile>>>,
    driven: AtomicBool,
    stop: AtomicBool,
    shut: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl Controller {
    /// Build a controller over an open transport. Nothing is sent until
    /// [`Controller::start`].
    pub fn new(
        cfg: &Config,
        transport: Arc<Transport>,
        console: Arc<Console>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControllerEvent>) {
        let seed = cfg.resolve_seed();
        let plan = CampaignPlan::from_config(cfg, seed);
        let log = Arc::new(EventLogger::new(&cfg.logging));
        log.set_device(&cfg.serial.device, cfg.serial.baud_rate);
        log.set_sem_freq(cfg.platform.sem_freq_hz);
        log.set_area(&plan.area, &plan.area_args);
        log.set_time(&plan.time, &plan.time_args);
        info!("Campaign plan: {}", plan);

        let (tx, rx) = mpsc::unbounded_channel();
        let ctrl = Arc::new(Self {
            plan,
            timing: Timing::from_config(cfg),
            start_mode: cfg.campaign.start_mode,
            status_on_start: cfg.campaign.status_on_start,
            proto: SemProtocol::new(transport),
            ack: Arc::new(AckTracker::new()),
            log,
            console,
            rx: RxGate {
                enabled: AtomicBool::new(true),
                busy: Mutex::new(()),
            },
            mode: Mutex::new(DeviceMode::Unknown),
            campaign: Mutex::new(None),
            spent_area: Mutex::new(None),
            driven: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            events: tx,
        });
        (ctrl, rx)
    }

    pub fn logger(&self) -> &Arc<EventLogger> {
        &self.log
    }

    pub fn plan(&self) -> &CampaignPlan {
        &self.plan
    }

    pub fn seed(&self) -> u64 {
        self.plan.seed
    }

    pub fn is_driven(&self) -> bool {
        self.driven.load(Ordering::Acquire)
    }

    /// Device mode last seen in the RX stream.
    pub fn device_mode(&self) -> DeviceMode {
        *lock(&self.mode)
    }

    /// State of the armed campaign, `None` once it has been collected.
    pub fn campaign_state(&self) -> Option<SchedulerState> {
        lock(&self.campaign).as_ref().map(Scheduler::state)
    }

    pub fn shots(&self) -> u64 {
        lock(&self.campaign).as_ref().map(Scheduler::shots).unwrap_or(0)
    }

    /// Prompt sync, start mode, then launch the RX loop and the watcher.
    pub fn start(self: &Arc<Self>) -> SemResult<()> {
        self.proto.transport().start_reader()?;
        let mode = self.proto.sync_prompt(self.timing.sync_window);
        self.set_mode(mode.unwrap_or(DeviceMode::Unknown));
        self.enter_start_mode()?;

        let rx = Arc::clone(self);
        let rx_handle = std::thread::Builder::new()
            .name("sem-rx-loop".into())
            .spawn(move || rx.rx_loop())?;
        let watcher = Arc::clone(self);
        let watch_handle = std::thread::Builder::new()
            .name("campaign-watch".into())
            .spawn(move || watcher.watch_loop())?;
        lock(&self.threads).extend([rx_handle, watch_handle]);
        Ok(())
    }

    /// Preflight, banner and arming at session start.
    pub fn begin(&self) -> Flow {
        self.console
            .info("Sending test messages to verify connection with the board.");
        let snap = self.preflight();
        self.console.preflight_banner(snap.is_some());
        let Some(snap) = snap else {
            self.log
                .log_error("Preflight connectivity check failed: status not confirmed.");
            error!(
                "Preflight failed after {} attempt(s)",
                self.timing.preflight_attempts
            );
            return Flow::Exit(ExitStatus::Aborted);
        };
        if self.status_on_start {
            self.console.info(&format!("status: {snap}"));
        }
        if let Some(notice) = self.plan.cap_notice {
            let msg = notice.to_string();
            self.log.log_info(&msg);
            self.console.info(&msg);
        }
        match self.arm(None) {
            Ok(()) => Flow::Continue,
            Err(e) => self.arming_failed(&format!(
                "Failed to load campaign ({}): {}",
                self.plan.label(),
                e
            )),
        }
    }

    /// Run `f` with the RX loop parked, so `f` may read the queue itself.
    pub fn synchronized<T>(&self, f: impl FnOnce(&SemProtocol) -> T) -> T {
        self.rx.enabled.store(false, Ordering::SeqCst);
        let out = {
            let _busy = lock(&self.rx.busy);
            f(&self.proto)
        };
        self.rx.enabled.store(true, Ordering::SeqCst);
        out
    }

    /// Bounded status attempts; the first non-empty snapshot wins.
    pub fn preflight(&self) -> Option<StatusSnapshot> {
        let attempts = self.timing.preflight_attempts;
        for attempt in 1..=attempts {
            let result = self.synchronized(|p| {
                self.note_tx(&Command::Status.to_string());
                p.status(self.timing.preflight_window)
            });
            match result {
                Ok((snap, lines)) => {
                    self.absorb(&lines);
                    if !snap.is_empty() {
                        info!("Preflight ok on attempt {}/{}: {}", attempt, attempts, snap);
                        return Some(snap);
                    }
                    debug!("Preflight attempt {}/{}: no counters", attempt, attempts);
                }
                Err(e) => {
                    warn!("Preflight attempt {}/{} failed: {}", attempt, attempts, e);
                    self.log
                        .log_error(&format!("Preflight status attempt {attempt} failed: {e}"));
                    if matches!(e, SemError::Closed) {
                        break;
                    }
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.timing.preflight_interval);
            }
        }
        None
    }

    /// Build and launch a campaign. A recycled area is rewound first.
    fn arm(&self, recycled: Option<Box<dyn AreaProfile>>) -> SemResult<()> {
        let (area, time) = self.plan.arm(recycled)?;
        let area_desc = area.describe();
        self.log.log_prof_area(&format!("start — {area_desc}"));
        self.console
            .info(&format!("PROF AREA [{}] start — {}", area.name(), area_desc));
        let time_desc = time.describe();
        self.log.log_prof_time(&format!("start — {time_desc}"));
        self.console
            .info(&format!("PROF TIME [{}] start — {}", time.name(), time_desc));

        let listener = Arc::new(ShotEcho::new(Arc::clone(&self.log), Arc::clone(&self.console)));
        let mut scheduler = Scheduler::new(
            time,
            area,
            Arc::new(self.proto.clone()),
            Arc::clone(&self.ack),
            listener,
        );
        scheduler.start()?;
        *lock(&self.campaign) = Some(scheduler);
        self.driven.store(true, Ordering::Release);
        Ok(())
    }

    fn arming_failed(&self, msg: &str) -> Flow {
        self.console.rule_alert();
        self.console.error(msg);
        self.log.log_error(msg);
        warn!("{}", msg);
        match self.plan.on_end {
            OnEnd::Exit => Flow::Exit(ExitStatus::Aborted),
            OnEnd::Manual => {
                self.driven.store(false, Ordering::Release);
                self.console
                    .info("Campaign paused. Fix the issue and type 'resume' to retry arming.");
                Flow::Continue
            }
        }
    }

    /// Hand control to the operator; the scheduler stops at the next shot
    /// boundary.
    pub fn pause(&self) {
        if let Some(s) = lock(&self.campaign).as_ref() {
            s.pause();
        }
        self.driven.store(false, Ordering::Release);
    }

    /// Re-check the link, then continue the paused campaign or re-arm a
    /// finished one. Returns whether driven mode was restored.
    pub fn resume(&self) -> bool {
        if self.preflight().is_none() {
            self.console
                .error("Device not responding yet. Resolve and 'resume' again.");
            return false;
        }
        let needs_arm = {
            let mut slot = lock(&self.campaign);
            match slot.as_ref() {
                Some(s) if !s.is_finished() => {
                    s.resume();
                    false
                }
                _ => {
                    // Ended before the watcher collected it.
                    if let Some(scheduler) = slot.take() {
                        match scheduler.join() {
                            Some(outcome) => {
                                debug!(
                                    "collected ended campaign on resume: {:?}",
                                    outcome.termination
                                );
                                *lock(&self.spent_area) = Some(outcome.area);
                            }
                            None => {
                                let msg = "Scheduler thread panicked; re-arming from scratch.";
                                self.log.log_error(msg);
                                self.log.log_prof_time("finished (panicked)");
                            }
                        }
                    }
                    true
                }
            }
        };
        if needs_arm {
            let recycled = lock(&self.spent_area).take();
            if let Err(e) = self.arm(recycled) {
                let msg = format!("Failed to arm on resume: {e}");
                self.console.rule_alert();
                self.console.error(&msg);
                self.log.log_error(&msg);
                return false;
            }
        }
        self.console.rule_alert();
        self.console.info("Resumed driven mode. Campaign continues.");
        self.log.log_info("Resumed driven mode.");
        self.driven.store(true, Ordering::Release);
        true
    }

    /// One synchronized status query, echoed and logged. A running campaign
    /// is held for the duration of the exchange.
    pub fn status(&self) -> SemResult<StatusSnapshot> {
        let held = self.hold_campaign();
        let mut result = self.query_status();
        // An in-flight shot's prompt can close the window before the counters.
        if held && matches!(&result, Ok(snap) if snap.is_empty()) {
            result = self.query_status();
        }
        if held {
            if let Some(s) = lock(&self.campaign).as_ref() {
                s.resume();
            }
        }
        result
    }

    fn query_status(&self) -> SemResult<StatusSnapshot> {
        let (snap, lines) = self.synchronized(|p| {
            self.note_tx(&Command::Status.to_string());
            p.status(self.timing.sync_window.max(self.timing.preflight_window))
        })?;
        self.absorb(&lines);
        Ok(snap)
    }

    /// Pause a live, unpaused campaign. Returns whether it was paused here.
    fn hold_campaign(&self) -> bool {
        match lock(&self.campaign).as_ref() {
            Some(s) if !s.is_finished() && !s.is_paused() => {
                s.pause();
                true
            }
            _ => false,
        }
    }

    fn show_status(&self) {
        match self.status() {
            Ok(snap) if snap.is_empty() => self.console.plain("<no counters seen>"),
            Ok(snap) => self.console.info(&format!("status: {snap}")),
            Err(e) => {
                self.console.error(&e.to_string());
                self.log.log_error(&format!("status failed: {e}"));
            }
        }
    }

    /// Interpret one line typed by the operator.
    pub fn handle_input(&self, line: &str) -> Flow {
        let cmd = line.trim();
        if cmd.is_empty() {
            return Flow::Continue;
        }
        if self.is_driven() {
            self.driven_command(cmd)
        } else {
            self.manual_command(cmd)
        }
    }

    fn driven_command(&self, cmd: &str) -> Flow {
        match cmd {
            "exit" => {
                self.log.log_console(cmd);
                return Flow::Exit(ExitStatus::Normal);
            }
            "help" => self.console.help(),
            "sem" => self.console.sem_cheatsheet(),
            "status" => {
                self.log.log_console(cmd);
                self.show_status();
            }
            "manual" => {
                self.log.log_console(cmd);
                self.console.rule_alert();
                self.console.info(
                    "Switched to manual mode. Profiles paused. Type raw SEM; 'resume' to return.",
                );
                self.pause();
            }
            _ => self
                .console
                .info("Command disabled in driven mode. Type 'manual' to gain control."),
        }
        Flow::Continue
    }

    fn manual_command(&self, cmd: &str) -> Flow {
        match cmd {
            "exit" => {
                self.log.log_console(cmd);
                return Flow::Exit(ExitStatus::Normal);
            }
            "help" => self.console.help(),
            "sem" => self.console.sem_cheatsheet(),
            "status" => {
                self.log.log_console(cmd);
                self.show_status();
            }
            "resume" => {
                self.log.log_console(cmd);
                self.resume();
            }
            raw => {
                self.log.log_console(raw);
                self.note_tx(raw);
                if let Err(e) = self.proto.passthrough(raw) {
                    self.console.error(&e.to_string());
                    self.log.log_error(&format!("'{raw}' not sent: {e}"));
                }
            }
        }
        Flow::Continue
    }

    /// Stop everything and write the session log. Safe to call twice.
    pub fn shutdown(&self) -> Option<PathBuf> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.stop.store(true, Ordering::Release);
        let active = lock(&self.campaign).take();
        if let Some(scheduler) = active {
            scheduler.stop();
            if let Some(outcome) = scheduler.join() {
                debug!(
                    "campaign stopped at shutdown after {} shot(s): {:?}",
                    outcome.shots, outcome.termination
                );
            }
        }
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("controller thread panicked");
            }
        }
        self.proto.transport().close();
        match self.log.close() {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to write session log: {}", e);
                None
            }
        }
    }

    fn enter_start_mode(&self) -> SemResult<()> {
        let cmd = match self.start_mode {
            StartMode::Idle => Command::Idle,
            StartMode::Observe => Command::Observe,
        };
        let lines = self.synchronized(|p| {
            self.note_tx(&cmd.to_string());
            match self.start_mode {
                StartMode::Idle => exchange::ensure_idle(p, MODE_SWITCH_WINDOW),
                StartMode::Observe => exchange::go_observe(p, MODE_SWITCH_WINDOW),
            }
        })?;
        self.absorb(&lines);
        if let Some(mode) = last_prompt_mode(&lines) {
            info!("Device in {} mode", mode);
        }
        Ok(())
    }

    fn note_tx(&self, cmd: &str) {
        self.log.log_tx(cmd);
        self.console.tx(cmd);
    }

    /// Lines read inside a synchronized exchange.
    fn absorb(&self, lines: &[RxLine]) {
        let mut in_inject = false;
        for line in lines {
            self.dispatch(line, &mut in_inject);
        }
    }

    /// Per-line RX handling: ack, status-code detection, log, echo.
    fn dispatch(&self, line: &RxLine, in_inject: &mut bool) {
        let text = line.text.as_str();
        let reply = classify(text);
        if matches!(reply, Reply::InjectEcho { .. }) {
            *in_inject = true;
        }
        let released = self.ack.on_rx(text);
        let completed = matches!(reply, Reply::StatusCode(SC_IDLE));
        if let Reply::Prompt(mode) = reply {
            self.set_mode(mode);
        }
        self.log.log_rx(text);
        self.console.rx(text);
        if completed && (*in_inject || released) {
            self.console.inject_completed();
            *in_inject = false;
        }
    }

    fn set_mode(&self, mode: DeviceMode) {
        let mut current = lock(&self.mode);
        if *current != mode {
            debug!("device mode {} -> {}", *current, mode);
            *current = mode;
        }
    }

    fn rx_loop(&self) {
        let tr = Arc::clone(self.proto.transport());
        let mut in_inject = false;
        while !self.stop.load(Ordering::Acquire) {
            if !self.rx.enabled.load(Ordering::SeqCst) {
                std::thread::sleep(self.timing.rx_poll);
                continue;
            }
            let _busy = lock(&self.rx.busy);
            if !self.rx.enabled.load(Ordering::SeqCst) {
                continue;
            }
            if !tr.is_open() {
                debug!("RX loop: transport closed");
                break;
            }
            for line in tr.read_lines(self.timing.rx_poll) {
                self.dispatch(&line, &mut in_inject);
            }
        }
    }

    fn watch_loop(&self) {
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(self.timing.watcher_poll);
            let ended = {
                let mut slot = lock(&self.campaign);
                match slot.as_ref() {
                    Some(s) if s.is_finished() => slot.take(),
                    _ => None,
                }
            };
            if let Some(scheduler) = ended {
                let shots = scheduler.shots();
                match scheduler.join() {
                    Some(outcome) => self.campaign_ended(outcome),
                    None => self.campaign_lost(shots),
                }
            }
        }
    }

    /// The scheduler thread died without handing back its profiles.
    fn campaign_lost(&self, shots: u64) {
        let msg = format!("Scheduler thread panicked after {shots} shot(s), campaign ended.");
        error!("{}", msg);
        self.console.rule_alert();
        self.console.error(&msg);
        self.log.log_error(&msg);
        self.log.log_prof_time("finished (panicked)");
        self.apply_end_policy(
            ExitStatus::Aborted,
            "Switched to manual mode because the campaign failed.",
        );
    }

    fn campaign_ended(&self, outcome: Outcome) {
        let Outcome {
            termination,
            time,
            area,
            shots,
        } = outcome;
        match termination {
            Termination::Stopped => {
                debug!("campaign stopped after {} shot(s)", shots);
                *lock(&self.spent_area) = Some(area);
            }
            Termination::Finished(reason) => {
                info!("campaign finished after {} shot(s): {}", shots, reason);
                self.console.rule_alert();
                if reason == FinishReason::AreaExhausted {
                    let msg = area
                        .end_condition_prompt(reason)
                        .unwrap_or_else(|| "(address list exhausted)".into());
                    self.log.log_prof_area("finished");
                    self.console
                        .info(&format!("Area profile [{}] finished. {}", area.name(), msg));
                } else {
                    self.log.log_prof_time(&format!("finished ({reason})"));
                    match time.end_condition_prompt(reason) {
                        Some(msg) => self
                            .console
                            .info(&format!("Time profile [{}] finished. {}", time.name(), msg)),
                        None => self
                            .console
                            .info(&format!("Time profile [{}] finished.", time.name())),
                    }
                }
                *lock(&self.spent_area) = Some(area);
                self.apply_end_policy(
                    ExitStatus::Normal,
                    "Switched to manual mode because the profile finished.",
                );
            }
            Termination::Failed(e) => {
                let msg = format!("Injection failed after {shots} shot(s), campaign ended: {e}");
                error!("{}", msg);
                self.console.rule_alert();
                self.console.error(&msg);
                self.log.log_error(&msg);
                self.log.log_prof_time("finished (write_failed)");
                *lock(&self.spent_area) = Some(area);
                self.apply_end_policy(
                    ExitStatus::Aborted,
                    "Switched to manual mode because the campaign failed.",
                );
            }
        }
    }

    fn apply_end_policy(&self, status: ExitStatus, manual_msg: &str) {
        match self.plan.on_end {
            OnEnd::Exit => {
                let _ = self.events.send(ControllerEvent::Exit(status));
            }
            OnEnd::Manual => {
                self.driven.store(false, Ordering::Release);
                self.log.log_info(manual_msg);
                self.console.info(manual_msg);
                let _ = self.events.send(ControllerEvent::ManualMode);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semio::sim::MemoryLink;
    use crate::semio::transport::SerialLinkConfig;

    type Events = mpsc::UnboundedReceiver<ControllerEvent>;

    fn controller_with_events(
        link: &MemoryLink,
        cfg: &mut Config,
    ) -> (Arc<Controller>, Events, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        cfg.logging.results_dir = dir.path().display().to_string();
        cfg.controller.sync_window_ms = 300;
        cfg.preflight.window_ms = 300;
        cfg.preflight.interval_ms = 50;
        let (r, w) = link.endpoints();
        let tr = Arc::new(Transport::from_parts(SerialLinkConfig::new("mem", 115_200), r, w));
        let (ctrl, events) = Controller::new(cfg, tr, Arc::new(Console::muted()));
        (ctrl, events, dir)
    }

    fn controller(link: &MemoryLink, cfg: &mut Config) -> (Arc<Controller>, tempfile::TempDir) {
        let (ctrl, _events, dir) = controller_with_events(link, cfg);
        (ctrl, dir)
    }

    /// Fires one shot, then blows up computing the next deadline.
    struct Exploding;

    impl crate::time::TimeProfile for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }
        fn describe(&self) -> String {
            String::new()
        }
        fn ack_timeout(&self) -> Option<Duration> {
            None
        }
        fn anchor(&mut self, _origin: std::time::Instant) {}
        fn check_end(&self, _now: std::time::Instant, _shots: u64) -> Option<FinishReason> {
            None
        }
        fn next_deadline(
            &mut self,
            _shots: u64,
            _now: std::time::Instant,
        ) -> Option<std::time::Instant> {
            panic!("deadline arithmetic blew up");
        }
        fn end_condition_prompt(&self, _reason: FinishReason) -> Option<String> {
            None
        }
    }

    struct Endless;

    impl AreaProfile for Endless {
        fn name(&self) -> &'static str {
            "endless"
        }
        fn describe(&self) -> String {
            String::new()
        }
        fn next_address(&mut self) -> Option<crate::area::Lfa> {
            "00001A2B3C".parse().ok()
        }
        fn reset(&mut self) {}
        fn end_condition_prompt(&self, _reason: FinishReason) -> Option<String> {
            None
        }
    }

    #[test]
    fn start_enters_idle_and_preflight_confirms() {
        let link = MemoryLink::with_simulated_sem();
        let mut cfg = Config::default();
        let (ctrl, _dir) = controller(&link, &mut cfg);
        ctrl.start().unwrap();
        assert_eq!(ctrl.device_mode(), DeviceMode::Idle);
        let snap = ctrl.preflight().expect("simulated monitor answers");
        assert_eq!(snap.get("SC"), Some("00"));
        assert!(link.sent_lines().contains(&"I".to_string()));
        ctrl.shutdown();
    }

    #[test]
    fn silent_device_fails_preflight_and_aborts() {
        let link = MemoryLink::new();
        let mut cfg = Config::default();
        cfg.preflight.attempts = 2;
        let (ctrl, _dir) = controller(&link, &mut cfg);
        ctrl.start().unwrap();
        assert_eq!(ctrl.begin(), Flow::Exit(ExitStatus::Aborted));
        let statuses = link.sent_lines().iter().filter(|l| *l == "S").count();
        assert_eq!(statuses, 2);
        ctrl.shutdown();
    }

    #[test]
    fn arming_failure_under_manual_policy_pauses() {
        let link = MemoryLink::with_simulated_sem();
        let mut cfg = Config::default();
        cfg.campaign.area_args = "path=/nonexistent/lfas.txt".into();
        let (ctrl, _dir) = controller(&link, &mut cfg);
        ctrl.start().unwrap();
        assert_eq!(ctrl.begin(), Flow::Continue);
        assert!(!ctrl.is_driven());
        assert!(ctrl.campaign_state().is_none());
        let errors: Vec<_> = ctrl
            .logger()
            .events()
            .into_iter()
            .filter(|e| e.tag == crate::events::EventTag::Error)
            .collect();
        assert!(errors[0].text.starts_with("Failed to load campaign (area='address_list'"));
        ctrl.shutdown();
    }

    #[test]
    fn driven_mode_rejects_raw_commands() {
        let link = MemoryLink::with_simulated_sem();
        let mut cfg = Config::default();
        let (ctrl, _dir) = controller(&link, &mut cfg);
        ctrl.start().unwrap();
        let before = link.sent_lines().len();
        assert_eq!(ctrl.handle_input("P 05"), Flow::Continue);
        assert_eq!(link.sent_lines().len(), before);
        assert_eq!(ctrl.handle_input("exit"), Flow::Exit(ExitStatus::Normal));
        ctrl.shutdown();
        assert!(ctrl.shutdown().is_none());
    }

    #[test]
    fn panicked_scheduler_ends_the_campaign_as_a_failure() {
        let link = MemoryLink::with_simulated_sem();
        let mut cfg = Config::default();
        cfg.controller.watcher_poll_ms = 20;
        cfg.campaign.on_end = OnEnd::Manual;
        let (ctrl, mut events, _dir) = controller_with_events(&link, &mut cfg);
        ctrl.start().unwrap();

        let mut scheduler = Scheduler::new(
            Box::new(Exploding),
            Box::new(Endless),
            Arc::new(ctrl.proto.clone()),
            Arc::clone(&ctrl.ack),
            Arc::new(crate::time::scheduler::NullListener),
        );
        scheduler.start().unwrap();
        *lock(&ctrl.campaign) = Some(scheduler);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = None;
        while seen.is_none() && std::time::Instant::now() < deadline {
            seen = events.try_recv().ok();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen, Some(ControllerEvent::ManualMode));
        assert!(!ctrl.is_driven());
        assert!(ctrl.campaign_state().is_none());
        assert_eq!(link.injected().len(), 1);

        let logged = ctrl.logger().events();
        let errors: Vec<_> = logged
            .iter()
            .filter(|e| e.tag == crate::events::EventTag::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].text.starts_with("Scheduler thread panicked after 1 shot(s)"));
        assert!(logged
            .iter()
            .any(|e| e.tag == crate::events::EventTag::ProfTime && e.text == "finished (panicked)"));
        ctrl.shutdown();
    }
}
