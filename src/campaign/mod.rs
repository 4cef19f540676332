//! # Campaign lifecycle
//!
//! A campaign is one area profile and one time profile driven by a
//! [`Scheduler`](crate::time::Scheduler). This module resolves what to arm
//! ([`CampaignPlan`]) and defines the values the controller reports back to
//! the binary. The controller itself lives in [`controller`].
//!
//! ## Lifecycle
//!
//! 1. Prompt sync and start mode (synchronized, RX loop not yet running)
//! 2. Preflight: bounded status attempts until a non-empty snapshot
//! 3. Arm: area profile first, then the time profile against it
//! 4. Run: scheduler thread fires shots, RX loop resolves acknowledgements
//! 5. End: the watcher reports the reason and applies the `on_end` policy
//!
//! `manual` pauses the scheduler between shots; `resume` repeats the preflight
//! and either clears the pause or re-arms a finished campaign.

pub mod controller;

use std::fmt;
use std::sync::Arc;

use crate::area::{self, AreaProfile, Lfa};
use crate::config::{Config, OnEnd, ProfileArgs};
use crate::console::Console;
use crate::error::ArmingError;
use crate::events::EventLogger;
use crate::time::{self, CapNotice, RateCap, ShotListener, TimeProfile};

pub use controller::Controller;

/// Process exit status decided by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Session ended normally (operator exit or finished campaign).
    Normal,
    /// The serial device could not be opened.
    OpenFailed,
    /// Preflight failed, or arming/injection failed under `on_end = exit`.
    Aborted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Normal => 0,
            ExitStatus::OpenFailed => 1,
            ExitStatus::Aborted => 2,
        }
    }
}

/// What the interactive loop should do after handing the controller a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(ExitStatus),
}

/// Notifications from controller threads to the interactive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Control passed to the operator; show the manual prompt.
    ManualMode,
    /// `on_end = exit` fired.
    Exit(ExitStatus),
}

/// Resolved profile selection for a session.
///
/// The global seed is injected into both argument lists when they lack one,
/// and the time arguments are already rewritten to the platform rate cap.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub area: String,
    pub area_args: ProfileArgs,
    pub time: String,
    pub time_args: ProfileArgs,
    pub seed: u64,
    pub on_end: OnEnd,
    pub cap: RateCap,
    pub cap_notice: Option<CapNotice>,
}

impl CampaignPlan {
    pub fn from_config(cfg: &Config, seed: u64) -> Self {
        let mut area_args = ProfileArgs::parse(&cfg.campaign.area_args);
        area_args.set_default("seed", seed.to_string());
        let mut time_args = ProfileArgs::parse(&cfg.campaign.time_args);
        time_args.set_default("seed", seed.to_string());
        let cap = RateCap::from_platform(&cfg.platform);
        let cap_notice = cap.reconcile(&mut time_args);
        Self {
            area: cfg.campaign.area.trim().to_ascii_lowercase(),
            area_args,
            time: cfg.campaign.time.trim().to_ascii_lowercase(),
            time_args,
            seed,
            on_end: cfg.campaign.on_end,
            cap,
            cap_notice,
        }
    }

    pub fn build_area(&self) -> Result<Box<dyn AreaProfile>, ArmingError> {
        area::build(&self.area, &self.area_args)
    }

    pub fn build_time(&self, area: &dyn AreaProfile) -> Result<Box<dyn TimeProfile>, ArmingError> {
        time::build(&self.time, &self.time_args, area)
    }

    /// Area then time, in that order. A recycled area is rewound instead of
    /// rebuilt.
    pub fn arm(
        &self,
        recycled: Option<Box<dyn AreaProfile>>,
    ) -> Result<(Box<dyn AreaProfile>, Box<dyn TimeProfile>), ArmingError> {
        let area = match recycled {
            Some(mut a) => {
                a.reset();
                a
            }
            None => self.build_area()?,
        };
        let time = self.build_time(area.as_ref())?;
        Ok((area, time))
    }

    /// One-line summary used in arming failure messages.
    pub fn label(&self) -> String {
        format!("area='{}', time='{}'", self.area, self.time)
    }
}

/// Logs and echoes every shot the scheduler fires.
pub struct ShotEcho {
    log: Arc<EventLogger>,
    console: Arc<Console>,
}

impl ShotEcho {
    pub fn new(log: Arc<EventLogger>, console: Arc<Console>) -> Self {
        Self { log, console }
    }
}

impl ShotListener for ShotEcho {
    fn on_shot(&self, lfa: &Lfa) {
        let cmd = format!("N {lfa}");
        self.log.log_tx(&cmd);
        self.console.inject_tx(&cmd);
    }

    fn on_ack_timeout(&self, lfa: &Lfa) {
        self.log.log_info(&format!("ack timeout for N {lfa}"));
    }
}

impl fmt::Display for CampaignPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] / {} [{}] (seed {})",
            self.area, self.area_args, self.time, self.time_args, self.seed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_injected_only_when_missing() {
        let mut cfg = Config::default();
        cfg.campaign.area_args = "path=x.txt,seed=5".into();
        let plan = CampaignPlan::from_config(&cfg, 99);
        assert_eq!(plan.area_args.get("seed"), Some("5"));
        assert_eq!(plan.time_args.get("seed"), Some("99"));
    }

    #[test]
    fn over_cap_rate_is_rewritten() {
        let mut cfg = Config::default();
        cfg.platform.uart_cap_hz = 100.0;
        cfg.campaign.time_args = "hz=500,max_shots=2".into();
        let plan = CampaignPlan::from_config(&cfg, 1);
        let notice = plan.cap_notice.expect("cap applied");
        assert_eq!(notice.cap_hz, 100.0);
        assert!(plan.time_args.get("hz").is_none());
        assert_eq!(plan.time_args.get("max_shots"), Some("2"));
    }

    #[test]
    fn unknown_area_is_an_arming_error() {
        let mut cfg = Config::default();
        cfg.campaign.area = "nowhere".into();
        let plan = CampaignPlan::from_config(&cfg, 1);
        match plan.arm(None) {
            Err(ArmingError::UnknownProfile { kind, .. }) => assert_eq!(kind, "area"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Normal.code(), 0);
        assert_eq!(ExitStatus::OpenFailed.code(), 1);
        assert_eq!(ExitStatus::Aborted.code(), 2);
    }
}
