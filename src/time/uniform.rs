//! Constant-cadence time profile.
//!
//! Without ack gating, shot `k` is due at `t0 + k * period`, so a late shot
//! never pushes the rest of the schedule back. With ack gating, each next
//! deadline is measured from the moment the previous shot was acknowledged
//! (or its wait timed out).
//!
//! Arguments: `period_s` (aliases `period`, `period_sec`) or `rate_hz`
//! (aliases `rate`, `hz`, `freq_hz`, `frequency_hz`), default 1 Hz;
//! `duration_s`, `max_shots`, `ack`, `ack_timeout_s` (default 1.5),
//! `startup_delay_ms` (default 80).
use std::time::{Duration, Instant};

use log::debug;

use super::{
    instant_after, secs_arg, Cadence, FinishReason, Gating, ShotBudget, TimeProfile, PERIOD_KEYS,
    RATE_KEYS,
};
use crate::area::AreaProfile;
use crate::config::ProfileArgs;
use crate::error::ArmingError;

pub const NAME: &str = "uniform";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformConfig {
    pub period: Duration,
    pub budget: ShotBudget,
    pub gating: Gating,
}

impl UniformConfig {
    pub fn from_args(args: &ProfileArgs) -> Result<Self, ArmingError> {
        let period = match args.f64(NAME, PERIOD_KEYS)? {
            Some(p) if p < 0.0 => {
                return Err(ArmingError::InvalidArgument {
                    profile: NAME,
                    key: format!("period_s={p}"),
                    reason: "must not be negative".into(),
                })
            }
            Some(p) => secs_arg(NAME, "period_s", p)?,
            None => {
                let rate = args.f64(NAME, RATE_KEYS)?.unwrap_or(1.0);
                if rate <= 0.0 {
                    return Err(ArmingError::InvalidArgument {
                        profile: NAME,
                        key: format!("rate_hz={rate}"),
                        reason: "must be positive".into(),
                    });
                }
                secs_arg(NAME, "rate_hz", 1.0 / rate)?
            }
        };
        Ok(Self {
            period,
            budget: ShotBudget::from_args(NAME, args)?,
            gating: Gating::from_args(NAME, args)?,
        })
    }

    pub fn rate_hz(&self) -> f64 {
        if self.period.is_zero() {
            0.0
        } else {
            1.0 / self.period.as_secs_f64()
        }
    }
}

pub struct Uniform {
    cfg: UniformConfig,
    cadence: Option<Cadence>,
}

impl Uniform {
    pub fn new(cfg: UniformConfig) -> Self {
        Self { cfg, cadence: None }
    }

    pub fn config(&self) -> &UniformConfig {
        &self.cfg
    }
}

pub fn build(args: &ProfileArgs, area: &dyn AreaProfile) -> Result<Box<dyn TimeProfile>, ArmingError> {
    let cfg = UniformConfig::from_args(args)?;
    if let (Some(max), Some(len)) = (cfg.budget.max_shots, area.len_hint()) {
        if max > len as u64 {
            debug!("uniform: max_shots={} exceeds {} address(es); area ends first", max, len);
        }
    }
    Ok(Box::new(Uniform::new(cfg)))
}

impl TimeProfile for Uniform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn describe(&self) -> String {
        let mut s = format!(
            "uniform: rate_hz={:.6}, period_s={:.6}",
            self.cfg.rate_hz(),
            self.cfg.period.as_secs_f64()
        );
        self.cfg.budget.describe_into(&mut s);
        if let Some(t) = self.cfg.gating.ack_timeout() {
            s.push_str(&format!(", ack=true, ack_timeout_s={:.3}", t.as_secs_f64()));
        }
        s
    }

    fn startup_delay(&self) -> Duration {
        self.cfg.gating.startup_delay
    }

    fn ack_timeout(&self) -> Option<Duration> {
        self.cfg.gating.ack_timeout()
    }

    fn anchor(&mut self, origin: Instant) {
        self.cadence = Some(Cadence::new(origin, self.cfg.period));
    }

    fn check_end(&self, now: Instant, shots: u64) -> Option<FinishReason> {
        self.cfg.budget.check(self.cadence.map(|c| c.origin), now, shots)
    }

    fn next_deadline(&mut self, shots: u64, now: Instant) -> Option<Instant> {
        if self.cfg.period.is_zero() {
            return Some(now);
        }
        if self.cfg.gating.ack_timeout().is_some() {
            return Some(instant_after(now, self.cfg.period));
        }
        let cadence = *self.cadence.get_or_insert_with(|| Cadence::new(now, self.cfg.period));
        Some(cadence.deadline(shots))
    }

    fn end_condition_prompt(&self, reason: FinishReason) -> Option<String> {
        match reason {
            FinishReason::DurationElapsed => Some("Duration limit reached.".into()),
            FinishReason::MaxReached => Some("Maximum shots limit reached.".into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(args: &str) -> Uniform {
        Uniform::new(UniformConfig::from_args(&ProfileArgs::parse(args)).unwrap())
    }

    #[test]
    fn period_wins_over_rate_and_aliases_apply() {
        assert_eq!(uniform("period=0.25,rate_hz=100").cfg.period, Duration::from_millis(250));
        assert_eq!(uniform("freq_hz=4").cfg.period, Duration::from_millis(250));
        assert_eq!(uniform("").cfg.period, Duration::from_secs(1));
    }

    #[test]
    fn rejects_non_positive_rate_and_garbage() {
        for bad in ["rate_hz=0", "rate_hz=-2", "period_s=-1", "rate_hz=ten", "max_shots=-3"] {
            assert!(UniformConfig::from_args(&ProfileArgs::parse(bad)).is_err(), "{bad}");
        }
    }

    #[test]
    fn deadlines_do_not_accumulate_lateness() {
        let mut u = uniform("period_s=0.015625");
        let t0 = Instant::now();
        u.anchor(t0);
        // Every call reports lateness; the schedule must ignore it.
        for k in 1..=50u64 {
            let late_now = t0 + Duration::from_micros(15_625 * k + 7_000);
            assert_eq!(
                u.next_deadline(k, late_now),
                Some(t0 + Duration::from_micros(15_625 * k))
            );
        }
    }

    #[test]
    fn ack_gating_anchors_to_now() {
        let mut u = uniform("rate_hz=8,ack=true");
        let t0 = Instant::now();
        u.anchor(t0);
        let acked = t0 + Duration::from_millis(333);
        assert_eq!(u.next_deadline(1, acked), Some(acked + Duration::from_millis(125)));
        assert_eq!(u.ack_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unrepresentable_durations_are_arming_errors() {
        for bad in ["rate_hz=1e-310", "period_s=1e300", "duration_s=1e300", "ack_timeout_s=1e300"] {
            match UniformConfig::from_args(&ProfileArgs::parse(bad)) {
                Err(ArmingError::InvalidArgument { reason, .. }) => {
                    assert_eq!(reason, "out of range", "{bad}")
                }
                other => panic!("{bad}: unexpected {:?}", other.map(|_| ())),
            }
        }
        assert!(UniformConfig::from_args(&ProfileArgs::parse("startup_delay_ms=1e300")).is_err());
    }

    #[test]
    fn gated_deadline_saturates_instead_of_overflowing() {
        let mut u = uniform("period_s=1e15,ack=true");
        let now = Instant::now();
        u.anchor(now);
        assert!(u.next_deadline(1, now).unwrap() > now);
        let mut grid = uniform("period_s=1e15");
        grid.anchor(now);
        assert!(grid.next_deadline(1_000_000, now).unwrap() > now);
    }

    #[test]
    fn end_messages() {
        let u = uniform("max_shots=3");
        assert_eq!(u.check_end(Instant::now(), 3), Some(FinishReason::MaxReached));
        assert!(u.end_condition_prompt(FinishReason::MaxReached).is_some());
        assert!(u.end_condition_prompt(FinishReason::AreaExhausted).is_none());
        assert!(u.describe().contains("max_shots=3"));
    }
}
