//! Scheduler runtime shared by every time profile.
//!
//! The scheduler owns one area profile and one time profile and runs them on
//! a dedicated thread. It only ever writes: shots go out through an
//! [`Injector`], acknowledgements come back through the [`AckTracker`] that
//! the controller's RX loop feeds. Pause and stop are cooperative flags
//! checked between shots, never in the middle of one.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::{instant_after, FinishReason, TimeProfile};
use crate::area::{AreaProfile, Lfa};
use crate::error::SemError;
use crate::semio::{AckTracker, Injector};

/// Below this margin the deadline wait spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);
/// Longest single sleep, so a stop request is seen reasonably quickly.
const COARSE_SLICE: Duration = Duration::from_millis(50);
const PAUSE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Running,
    Paused,
    Finished,
    Stopped,
}

/// How a scheduler run ended.
#[derive(Debug)]
pub enum Termination {
    Finished(FinishReason),
    Stopped,
    /// A shot could not be written.
    Failed(SemError),
}

/// Observer for each shot, used for the event log and console echo.
pub trait ShotListener: Send + Sync {
    /// Called right before `N <lfa>` is written.
    fn on_shot(&self, lfa: &Lfa);

    fn on_ack_timeout(&self, _lfa: &Lfa) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl ShotListener for NullListener {
    fn on_shot(&self, _lfa: &Lfa) {}
}

/// Profiles handed back when the scheduler thread is joined.
pub struct Outcome {
    pub termination: Termination,
    pub time: Box<dyn TimeProfile>,
    pub area: Box<dyn AreaProfile>,
    pub shots: u64,
}

struct Parts {
    time: Box<dyn TimeProfile>,
    area: Box<dyn AreaProfile>,
    injector: Arc<dyn Injector>,
    ack: Arc<AckTracker>,
    listener: Arc<dyn ShotListener>,
}

struct Shared {
    pause: AtomicBool,
    stop: AtomicBool,
    shots: AtomicU64,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn set_state(&self, s: SchedulerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = s;
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    parts: Option<Parts>,
    handle: Option<JoinHandle<Outcome>>,
}

impl Scheduler {
    pub fn new(
        time: Box<dyn TimeProfile>,
        area: Box<dyn AreaProfile>,
        injector: Arc<dyn Injector>,
        ack: Arc<AckTracker>,
        listener: Arc<dyn ShotListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pause: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                shots: AtomicU64::new(0),
                state: Mutex::new(SchedulerState::Created),
            }),
            parts: Some(Parts {
                time,
                area,
                injector,
                ack,
                listener,
            }),
            handle: None,
        }
    }

    /// Launch the worker thread. Calling it twice is a no-op.
    pub fn start(&mut self) -> std::io::Result<()> {
        let Some(parts) = self.parts.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        shared.set_state(SchedulerState::Running);
        let handle = std::thread::Builder::new()
            .name(format!("sched-{}", parts.time.name()))
            .spawn(move || run(parts, shared))?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn shots(&self) -> u64 {
        self.shared.shots.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.shared.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.pause.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.load(Ordering::Acquire)
    }

    /// Request a terminal stop; takes effect at the next shot boundary.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// True once the worker has returned (or was never started).
    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(h) => h.is_finished(),
            None => self.parts.is_none(),
        }
    }

    /// Wait for the worker and take back the profiles. `None` only if the
    /// worker panicked.
    pub fn join(mut self) -> Option<Outcome> {
        if let Some(parts) = self.parts.take() {
            self.shared.set_state(SchedulerState::Stopped);
            return Some(Outcome {
                termination: Termination::Stopped,
                time: parts.time,
                area: parts.area,
                shots: 0,
            });
        }
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!("scheduler thread panicked");
                self.shared.set_state(SchedulerState::Stopped);
                None
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

fn run(parts: Parts, shared: Arc<Shared>) -> Outcome {
    let Parts {
        mut time,
        mut area,
        injector,
        ack,
        listener,
    } = parts;
    let termination = drive(
        time.as_mut(),
        area.as_mut(),
        injector.as_ref(),
        &ack,
        listener.as_ref(),
        &shared,
    );
    let end_state = match termination {
        Termination::Finished(_) => SchedulerState::Finished,
        Termination::Stopped | Termination::Failed(_) => SchedulerState::Stopped,
    };
    shared.set_state(end_state);
    debug!("scheduler [{}] ended: {:?}", time.name(), termination);
    Outcome {
        termination,
        time,
        area,
        shots: shared.shots.load(Ordering::Acquire),
    }
}

fn drive(
    time: &mut dyn TimeProfile,
    area: &mut dyn AreaProfile,
    injector: &dyn Injector,
    ack: &AckTracker,
    listener: &dyn ShotListener,
    shared: &Shared,
) -> Termination {
    let mut shots: u64 = 0;
    let mut origin: Option<Instant> = None;

    loop {
        if shared.stopping() {
            return Termination::Stopped;
        }
        if shared.pause.load(Ordering::Acquire) {
            shared.set_state(SchedulerState::Paused);
            while shared.pause.load(Ordering::Acquire) && !shared.stopping() {
                std::thread::sleep(PAUSE_POLL);
            }
            if shared.stopping() {
                return Termination::Stopped;
            }
            shared.set_state(SchedulerState::Running);
        }

        let now = Instant::now();
        if let Some(reason) = time.check_end(now, shots) {
            return Termination::Finished(reason);
        }
        let Some(lfa) = area.next_address() else {
            return Termination::Finished(FinishReason::AreaExhausted);
        };

        if origin.is_none() {
            let delay = time.startup_delay();
            if !delay.is_zero() {
                sleep_until(instant_after(Instant::now(), delay), shared);
                if shared.stopping() {
                    return Termination::Stopped;
                }
            }
            let t0 = Instant::now();
            time.anchor(t0);
            origin = Some(t0);
        }

        let gated = time.ack_timeout();
        if gated.is_some() {
            ack.start();
        }
        listener.on_shot(&lfa);
        if let Err(e) = injector.inject(&lfa) {
            warn!("injection of {} failed: {}", lfa, e);
            return Termination::Failed(e);
        }
        shots += 1;
        shared.shots.store(shots, Ordering::Release);

        if let Some(timeout) = gated {
            if !ack.wait(timeout) {
                debug!("no acknowledgement for {} within {:?}", lfa, timeout);
                listener.on_ack_timeout(&lfa);
            }
        }

        match time.next_deadline(shots, Instant::now()) {
            Some(deadline) => sleep_until(deadline, shared),
            None => return Termination::Finished(FinishReason::ScheduleExhausted),
        }
    }
}

/// Coarse sleep until close to `deadline`, then spin the rest.
fn sleep_until(deadline: Instant, shared: &Shared) {
    loop {
        let now = Instant::now();
        if now >= deadline || shared.stopping() {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            std::thread::sleep((remaining - SPIN_THRESHOLD).min(COARSE_SLICE));
        } else {
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SemResult;
    use crate::time::ShotBudget;

    struct Recorder(Mutex<Vec<String>>);

    impl Injector for Recorder {
        fn inject(&self, lfa: &Lfa) -> SemResult<()> {
            self.0.lock().unwrap().push(lfa.to_string());
            Ok(())
        }
    }

    struct Fixed(Vec<Lfa>, usize);

    impl AreaProfile for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn describe(&self) -> String {
            "fixed".into()
        }
        fn next_address(&mut self) -> Option<Lfa> {
            let l = self.0.get(self.1).cloned();
            self.1 += 1;
            l
        }
        fn reset(&mut self) {
            self.1 = 0;
        }
        fn end_condition_prompt(&self, _: FinishReason) -> Option<String> {
            None
        }
    }

    /// Back-to-back shots with an optional budget.
    struct Burst(ShotBudget, Option<Instant>);

    impl TimeProfile for Burst {
        fn name(&self) -> &'static str {
            "burst"
        }
        fn describe(&self) -> String {
            "burst".into()
        }
        fn startup_delay(&self) -> Duration {
            Duration::ZERO
        }
        fn ack_timeout(&self) -> Option<Duration> {
            None
        }
        fn anchor(&mut self, origin: Instant) {
            self.1 = Some(origin);
        }
        fn check_end(&self, now: Instant, shots: u64) -> Option<FinishReason> {
            self.0.check(self.1, now, shots)
        }
        fn next_deadline(&mut self, _: u64, now: Instant) -> Option<Instant> {
            Some(now)
        }
        fn end_condition_prompt(&self, _: FinishReason) -> Option<String> {
            None
        }
    }

    fn area(n: usize) -> Box<dyn AreaProfile> {
        Box::new(Fixed(
            (0..n).map(|i| format!("{i:010X}").parse().unwrap()).collect(),
            0,
        ))
    }

    fn sched(budget: ShotBudget, n: usize) -> (Scheduler, Arc<Recorder>) {
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        let s = Scheduler::new(
            Box::new(Burst(budget, None)),
            area(n),
            rec.clone(),
            Arc::new(AckTracker::new()),
            Arc::new(NullListener),
        );
        (s, rec)
    }

    #[test]
    fn exhaustion_is_detected_by_the_runtime() {
        let (mut s, rec) = sched(ShotBudget::default(), 3);
        assert_eq!(s.state(), SchedulerState::Created);
        s.start().unwrap();
        let out = s.join().unwrap();
        assert!(matches!(
            out.termination,
            Termination::Finished(FinishReason::AreaExhausted)
        ));
        assert_eq!(out.shots, 3);
        assert_eq!(rec.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn max_shots_stops_before_pulling_another_address() {
        let budget = ShotBudget {
            duration: None,
            max_shots: Some(2),
        };
        let (mut s, rec) = sched(budget, 5);
        s.start().unwrap();
        let mut out = s.join().unwrap();
        assert!(matches!(
            out.termination,
            Termination::Finished(FinishReason::MaxReached)
        ));
        assert_eq!(rec.0.lock().unwrap().len(), 2);
        assert_eq!(out.area.next_address().unwrap().to_string(), "0000000002");
    }

    #[test]
    fn stop_before_start_returns_profiles() {
        let (s, rec) = sched(ShotBudget::default(), 3);
        s.stop();
        let out = s.join().unwrap();
        assert!(matches!(out.termination, Termination::Stopped));
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn hybrid_wait_reaches_deadline() {
        let shared = Shared {
            pause: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            shots: AtomicU64::new(0),
            state: Mutex::new(SchedulerState::Running),
        };
        let deadline = Instant::now() + Duration::from_millis(15);
        sleep_until(deadline, &shared);
        assert!(Instant::now() >= deadline);
    }
}
