//! Poisson-process time profile.
//!
//! Inter-shot gaps are drawn from an exponential distribution with rate `λ`
//! (`rate_hz`, or `1/period_s` when a positive period is given). The RNG is
//! seeded from `seed` so a campaign can be replayed exactly. Shares
//! `duration_s`, `max_shots`, `ack`, `ack_timeout_s` and `startup_delay_ms`
//! with the uniform profile.
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{instant_after, FinishReason, Gating, ShotBudget, TimeProfile, PERIOD_KEYS, RATE_KEYS};
use crate::area::AreaProfile;
use crate::config::ProfileArgs;
use crate::error::ArmingError;

pub const NAME: &str = "poisson";

#[derive(Debug, Clone, PartialEq)]
pub struct PoissonConfig {
    pub lambda_hz: f64,
    pub seed: Option<u64>,
    pub budget: ShotBudget,
    pub gating: Gating,
}

impl PoissonConfig {
    pub fn from_args(args: &ProfileArgs) -> Result<Self, ArmingError> {
        let lambda_hz = match args.f64(NAME, PERIOD_KEYS)? {
            Some(p) if p > 0.0 => 1.0 / p,
            _ => args.f64(NAME, RATE_KEYS)?.unwrap_or(1.0),
        };
        if lambda_hz <= 0.0 {
            return Err(ArmingError::InvalidArgument {
                profile: NAME,
                key: format!("rate_hz={lambda_hz}"),
                reason: "must be positive".into(),
            });
        }
        Ok(Self {
            lambda_hz,
            seed: args.u64(NAME, &["seed"])?,
            budget: ShotBudget::from_args(NAME, args)?,
            gating: Gating::from_args(NAME, args)?,
        })
    }
}

pub struct Poisson {
    cfg: PoissonConfig,
    rng: StdRng,
    origin: Option<Instant>,
}

impl Poisson {
    pub fn new(cfg: PoissonConfig) -> Self {
        let rng = match cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            cfg,
            rng,
            origin: None,
        }
    }

    /// Exponential gap via inverse transform: `-ln(U) / λ`, `U` in (0, 1].
    /// Saturates when the gap is too large for a `Duration`.
    fn draw_gap(&mut self) -> Duration {
        let u: f64 = 1.0 - self.rng.gen::<f64>();
        Duration::try_from_secs_f64(-u.ln() / self.cfg.lambda_hz).unwrap_or(Duration::MAX)
    }
}

pub fn build(args: &ProfileArgs, _area: &dyn AreaProfile) -> Result<Box<dyn TimeProfile>, ArmingError> {
    Ok(Box::new(Poisson::new(PoissonConfig::from_args(args)?)))
}

impl TimeProfile for Poisson {
    fn name(&self) -> &'static str {
        NAME
    }

    fn describe(&self) -> String {
        let mut s = format!(
            "poisson: rate_hz={:.6}, mean_period_s={:.6}",
            self.cfg.lambda_hz,
            1.0 / self.cfg.lambda_hz
        );
        self.cfg.budget.describe_into(&mut s);
        if let Some(seed) = self.cfg.seed {
            s.push_str(&format!(", seed={seed}"));
        }
        if self.cfg.gating.ack_timeout().is_some() {
            s.push_str(", ack=true");
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
        self.origin = Some(origin);
    }

    fn check_end(&self, now: Instant, shots: u64) -> Option<FinishReason> {
        self.cfg.budget.check(self.origin, now, shots)
    }

    fn next_deadline(&mut self, _shots: u64, now: Instant) -> Option<Instant> {
        Some(instant_after(now, self.draw_gap()))
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

    fn poisson(args: &str) -> Poisson {
        Poisson::new(PoissonConfig::from_args(&ProfileArgs::parse(args)).unwrap())
    }

    #[test]
    fn same_seed_same_gaps() {
        let mut a = poisson("rate_hz=50,seed=11");
        let mut b = poisson("rate_hz=50,seed=11");
        let ga: Vec<_> = (0..20).map(|_| a.draw_gap()).collect();
        let gb: Vec<_> = (0..20).map(|_| b.draw_gap()).collect();
        assert_eq!(ga, gb);
    }

    #[test]
    fn mean_gap_tracks_lambda() {
        let mut p = poisson("rate_hz=100,seed=1");
        let n = 20_000;
        let total: f64 = (0..n).map(|_| p.draw_gap().as_secs_f64()).sum();
        let mean = total / n as f64;
        assert!((mean - 0.01).abs() < 0.001, "mean gap {mean}");
    }

    #[test]
    fn tiny_rate_saturates_the_gap() {
        let mut p = poisson("rate_hz=1e-300,seed=5");
        let now = Instant::now();
        p.anchor(now);
        for k in 1..=5 {
            assert!(p.next_deadline(k, now).unwrap() >= now);
        }
        let mut q = poisson("rate_hz=1e-310,seed=5");
        assert_eq!(q.draw_gap(), Duration::MAX);
    }

    #[test]
    fn period_sets_lambda() {
        assert_eq!(poisson("period_s=0.5").cfg.lambda_hz, 2.0);
        assert!(PoissonConfig::from_args(&ProfileArgs::parse("rate_hz=0")).is_err());
    }
}
