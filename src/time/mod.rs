//! # Time profiles
//!
//! A time profile decides *when* to inject. The profile itself is a pure
//! policy: it reports the first-shot delay, whether shots are ack-gated, when
//! its own end condition is met and where the next deadline lies. The
//! [`scheduler`] runs any profile on a dedicated thread, pulling addresses
//! from an area profile and firing them through a write-only [`Injector`].
//!
//! [`Injector`]: crate::semio::Injector

pub mod poisson;
pub mod scheduler;
pub mod uniform;

use std::fmt;
use std::time::{Duration, Instant};

use log::debug;

use crate::area::AreaProfile;
use crate::config::{PlatformConfig, ProfileArgs};
use crate::error::ArmingError;

pub use scheduler::{Scheduler, SchedulerState, ShotListener, Termination};

/// Keys accepted for an explicit period, in seconds.
pub const PERIOD_KEYS: &[&str] = &["period_s", "period", "period_sec"];
/// Keys accepted for a rate, in hertz.
pub const RATE_KEYS: &[&str] = &["rate_hz", "rate", "hz", "freq_hz", "frequency_hz", "lambda_hz"];

pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(80);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Stand-in for deadlines too far out for `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Seconds from a profile argument as a `Duration`. Values too large to
/// represent are an arming error.
pub fn secs_arg(profile: &'static str, key: &str, secs: f64) -> Result<Duration, ArmingError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ArmingError::InvalidArgument {
        profile,
        key: format!("{key}={secs}"),
        reason: "out of range".into(),
    })
}

/// `base + d`, saturating at a far-future instant instead of overflowing.
pub fn instant_after(base: Instant, d: Duration) -> Instant {
    base.checked_add(d)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Why a campaign ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    DurationElapsed,
    MaxReached,
    AreaExhausted,
    ScheduleExhausted,
    ProfileComplete,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::DurationElapsed => "duration_elapsed",
            FinishReason::MaxReached => "max_reached",
            FinishReason::AreaExhausted => "area_exhausted",
            FinishReason::ScheduleExhausted => "schedule_exhausted",
            FinishReason::ProfileComplete => "profile_complete",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When-to-inject policy driven by the [`Scheduler`].
pub trait TimeProfile: Send {
    fn name(&self) -> &'static str;

    fn describe(&self) -> String;

    /// One-time pause before the very first shot.
    fn startup_delay(&self) -> Duration {
        DEFAULT_STARTUP_DELAY
    }

    /// `Some(timeout)` when each shot waits for the device acknowledgement.
    fn ack_timeout(&self) -> Option<Duration>;

    /// Called once, right before the first shot is fired.
    fn anchor(&mut self, origin: Instant);

    /// Profile-owned end condition, checked before every shot.
    fn check_end(&self, now: Instant, shots: u64) -> Option<FinishReason>;

    /// Deadline for the next shot after `shots` have been fired. `None` ends
    /// the run with [`FinishReason::ScheduleExhausted`].
    fn next_deadline(&mut self, shots: u64, now: Instant) -> Option<Instant>;

    fn end_condition_prompt(&self, reason: FinishReason) -> Option<String>;
}

/// Fixed-origin schedule: shot `k` is due at `origin + k * period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub origin: Instant,
    pub period: Duration,
}

impl Cadence {
    pub fn new(origin: Instant, period: Duration) -> Self {
        Self { origin, period }
    }

    pub fn deadline(&self, k: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(k));
        instant_after(self.origin, Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Optional duration and shot-count limits shared by the bundled profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShotBudget {
    pub duration: Option<Duration>,
    pub max_shots: Option<u64>,
}

impl ShotBudget {
    pub fn from_args(profile: &'static str, args: &ProfileArgs) -> Result<Self, ArmingError> {
        let duration = match args.f64(profile, &["duration_s", "duration"])? {
            Some(d) if d < 0.0 => return Err(negative(profile, "duration_s", d)),
            Some(d) if d > 0.0 => Some(secs_arg(profile, "duration_s", d)?),
            _ => None,
        };
        let max_shots = args.u64(profile, &["max_shots"])?;
        Ok(Self {
            duration,
            max_shots,
        })
    }

    pub fn check(&self, origin: Option<Instant>, now: Instant, shots: u64) -> Option<FinishReason> {
        if let (Some(limit), Some(origin)) = (self.duration, origin) {
            if now.saturating_duration_since(origin) >= limit {
                return Some(FinishReason::DurationElapsed);
            }
        }
        match self.max_shots {
            Some(max) if shots >= max => Some(FinishReason::MaxReached),
            _ => None,
        }
    }

    pub fn describe_into(&self, out: &mut String) {
        if let Some(d) = self.duration {
            out.push_str(&format!(", duration_s={:.3}", d.as_secs_f64()));
        }
        if let Some(m) = self.max_shots {
            out.push_str(&format!(", max_shots={m}"));
        }
    }
}

/// Ack gating and first-shot delay, shared by the bundled profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gating {
    pub ack: bool,
    pub ack_timeout: Duration,
    pub startup_delay: Duration,
}

impl Gating {
    pub fn from_args(profile: &'static str, args: &ProfileArgs) -> Result<Self, ArmingError> {
        let ack = args.bool(profile, &["ack"])?.unwrap_or(false);
        let ack_timeout = match args.f64(profile, &["ack_timeout_s"])? {
            Some(t) if t < 0.0 => return Err(negative(profile, "ack_timeout_s", t)),
            Some(t) => secs_arg(profile, "ack_timeout_s", t)?,
            None => DEFAULT_ACK_TIMEOUT,
        };
        let startup_delay = match args.f64(profile, &["startup_delay_ms"])? {
            Some(ms) if ms < 0.0 => return Err(negative(profile, "startup_delay_ms", ms)),
            Some(ms) => secs_arg(profile, "startup_delay_ms", ms / 1000.0)?,
            None => DEFAULT_STARTUP_DELAY,
        };
        Ok(Self {
            ack,
            ack_timeout,
            startup_delay,
        })
    }

    /// Gating is off when disabled or when the timeout is zero.
    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack && !self.ack_timeout.is_zero()).then_some(self.ack_timeout)
    }
}

fn negative(profile: &'static str, key: &str, value: f64) -> ArmingError {
    ArmingError::InvalidArgument {
        profile,
        key: format!("{key}={value}"),
        reason: "must not be negative".into(),
    }
}

pub type TimeFactory =
    fn(&ProfileArgs, &dyn AreaProfile) -> Result<Box<dyn TimeProfile>, ArmingError>;

/// Registered time profiles.
pub const REGISTRY: &[(&str, TimeFactory)] = &[
    (uniform::NAME, uniform::build),
    (poisson::NAME, poisson::build),
];

pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

/// Instantiate a time profile by registry name. The area is already armed so
/// the profile can check its arguments against it.
pub fn build(
    name: &str,
    args: &ProfileArgs,
    area: &dyn AreaProfile,
) -> Result<Box<dyn TimeProfile>, ArmingError> {
    let wanted = name.trim().to_ascii_lowercase();
    let factory = REGISTRY
        .iter()
        .find(|(n, _)| *n == wanted)
        .map(|(_, f)| *f)
        .ok_or_else(|| ArmingError::UnknownProfile {
            kind: "time",
            name: name.to_string(),
            available: names().join(", "),
        })?;
    factory(args, area)
}

/// Platform-derived ceiling on the injection rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCap {
    pub max_rate_hz: f64,
}

/// What [`RateCap::reconcile`] changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapNotice {
    pub requested_hz: f64,
    pub cap_hz: f64,
}

impl fmt::Display for CapNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Requested time rate ({:.6} Hz) exceeds platform cap ({:.6} Hz). Capping to {:.6} Hz (period {:.6} s).",
            self.requested_hz,
            self.cap_hz,
            self.cap_hz,
            1.0 / self.cap_hz
        )
    }
}

impl RateCap {
    /// `derate / (latency_at_fmax * icap_fmax / sem_freq)`, further limited by
    /// the UART cap when one is set.
    pub fn from_platform(p: &PlatformConfig) -> Self {
        let latency_at_fmax = (p.inject_latency_us_at_fmax / 1e6).max(1e-9);
        let scale = p.icap_fmax_hz / p.sem_freq_hz.max(1.0);
        let derate = p.safety_derate.clamp(0.0, 1.0);
        let mut max_rate_hz = derate / (latency_at_fmax * scale);
        if p.uart_cap_hz > 0.0 {
            max_rate_hz = max_rate_hz.min(p.uart_cap_hz);
        }
        Self {
            max_rate_hz: max_rate_hz.max(0.0),
        }
    }

    /// Requested cadence from rate or period keys, if any parses.
    pub fn requested_rate(args: &ProfileArgs) -> Option<f64> {
        if let Some((_, v)) = args.first(RATE_KEYS) {
            if let Ok(r) = v.parse::<f64>() {
                return Some(r);
            }
        }
        let (_, v) = args.first(PERIOD_KEYS)?;
        v.parse::<f64>().ok().filter(|p| *p > 0.0).map(|p| 1.0 / p)
    }

    /// Rewrite `rate_hz`/`period_s` to the cap when the request exceeds it.
    pub fn reconcile(&self, args: &mut ProfileArgs) -> Option<CapNotice> {
        let requested_hz = Self::requested_rate(args)?;
        if self.max_rate_hz <= 0.0 || requested_hz <= self.max_rate_hz {
            return None;
        }
        for key in RATE_KEYS.iter().chain(PERIOD_KEYS) {
            args.remove(key);
        }
        args.set("rate_hz", format!("{:.12}", self.max_rate_hz));
        args.set("period_s", format!("{:.12}", 1.0 / self.max_rate_hz));
        debug!(
            "rate capped: requested {:.3} Hz, platform allows {:.3} Hz",
            requested_hz, self.max_rate_hz
        );
        Some(CapNotice {
            requested_hz,
            cap_hz: self.max_rate_hz,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_is_origin_plus_k_periods() {
        let origin = Instant::now();
        let c = Cadence::new(origin, Duration::from_micros(333));
        assert_eq!(c.deadline(0), origin);
        assert_eq!(c.deadline(3), origin + Duration::from_micros(999));
        assert_eq!(c.deadline(1_000_000), origin + Duration::from_secs(333));
    }

    #[test]
    fn budget_reports_max_before_duration_starts() {
        let b = ShotBudget {
            duration: Some(Duration::from_secs(10)),
            max_shots: Some(2),
        };
        let now = Instant::now();
        assert_eq!(b.check(None, now, 0), None);
        assert_eq!(b.check(Some(now), now, 2), Some(FinishReason::MaxReached));
        let later = now + Duration::from_secs(11);
        assert_eq!(b.check(Some(now), later, 0), Some(FinishReason::DurationElapsed));
    }

    #[test]
    fn gating_defaults_and_zero_timeout() {
        let g = Gating::from_args("uniform", &ProfileArgs::parse("ack")).unwrap();
        assert_eq!(g.ack_timeout(), Some(DEFAULT_ACK_TIMEOUT));
        assert_eq!(g.startup_delay, DEFAULT_STARTUP_DELAY);
        let g = Gating::from_args("uniform", &ProfileArgs::parse("ack,ack_timeout_s=0")).unwrap();
        assert_eq!(g.ack_timeout(), None);
        assert!(Gating::from_args("uniform", &ProfileArgs::parse("startup_delay_ms=-1")).is_err());
    }

    #[test]
    fn default_platform_cap_is_ten_khz() {
        let cap = RateCap::from_platform(&PlatformConfig::default());
        assert!((cap.max_rate_hz - 10_000.0).abs() < 1e-6);
        let uart = RateCap::from_platform(&PlatformConfig {
            uart_cap_hz: 500.0,
            ..PlatformConfig::default()
        });
        assert_eq!(uart.max_rate_hz, 500.0);
    }

    #[test]
    fn reconcile_rewrites_only_excessive_rates() {
        let cap = RateCap { max_rate_hz: 100.0 };
        let mut slow = ProfileArgs::parse("rate_hz=10");
        assert!(cap.reconcile(&mut slow).is_none());
        assert_eq!(slow.get("rate_hz"), Some("10"));

        let mut fast = ProfileArgs::parse("period=0.001,max_shots=5");
        let notice = cap.reconcile(&mut fast).unwrap();
        assert!((notice.requested_hz - 1000.0).abs() < 1e-9);
        assert!(fast.get("period").is_none());
        assert_eq!(fast.get("period_s").map(|p| p.parse::<f64>().unwrap()), Some(0.01));
        assert_eq!(fast.get("max_shots"), Some("5"));
    }
}
