//! # Area profiles
//!
//! An area profile decides *where* to inject: it hands out one validated
//! [`Lfa`] at a time and reports the end of its sequence with `None`. Area
//! profiles do no I/O after construction, and given the same arguments and
//! seed they produce the same sequence.
//!
//! Profiles are looked up by name in a compile-time registry:
//!
//! ```rust,no_run
//! use semfi::area;
//! use semfi::config::ProfileArgs;
//!
//! let args = ProfileArgs::parse("path=lfas.txt,mode=random,seed=7");
//! let mut area = area::build("address_list", &args)?;
//! while let Some(lfa) = area.next_address() {
//!     println!("{lfa}");
//! }
//! # Ok::<(), semfi::error::ArmingError>(())
//! ```

pub mod address_list;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::ProfileArgs;
use crate::error::ArmingError;
use crate::time::FinishReason;

/// Linear frame address: exactly ten uppercase hexadecimal digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lfa(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a 10-digit hexadecimal LFA")]
pub struct InvalidLfa(pub String);

impl Lfa {
    pub const DIGITS: usize = 10;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Lfa {
    type Err = InvalidLfa;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.len() == Self::DIGITS && t.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Lfa(t.to_ascii_uppercase()))
        } else {
            Err(InvalidLfa(s.to_string()))
        }
    }
}

impl fmt::Display for Lfa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where-to-inject policy.
pub trait AreaProfile: Send {
    fn name(&self) -> &'static str;

    /// One-line summary for banners and the session log.
    fn describe(&self) -> String;

    /// Next address, or `None` once the sequence is exhausted.
    fn next_address(&mut self) -> Option<Lfa>;

    /// Rewind so a re-armed campaign starts from the first address.
    fn reset(&mut self);

    /// Total number of addresses, when finite and known.
    fn len_hint(&self) -> Option<usize> {
        None
    }

    /// Operator-facing message for an end reason this profile caused, or
    /// `None` if the reason is not its own.
    fn end_condition_prompt(&self, reason: FinishReason) -> Option<String>;
}

/// Traversal order for a loaded address list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Sequential,
    Shuffle,
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ordering::Sequential => f.write_str("sequential"),
            Ordering::Shuffle => f.write_str("random"),
        }
    }
}

/// Read an address file: one LFA per line, `#` starts a comment, blank lines
/// are skipped. Every remaining token must be a valid LFA.
pub fn load_address_file(profile: &'static str, path: &Path) -> Result<Vec<Lfa>, ArmingError> {
    let content = std::fs::read_to_string(path).map_err(|source| ArmingError::AddressFile {
        profile,
        path: path.display().to_string(),
        source,
    })?;
    parse_address_list(profile, &content)
}

pub fn parse_address_list(profile: &'static str, content: &str) -> Result<Vec<Lfa>, ArmingError> {
    let mut out = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let body = raw.split('#').next().unwrap_or("").trim();
        if body.is_empty() {
            continue;
        }
        let lfa = body.parse::<Lfa>().map_err(|_| ArmingError::InvalidAddress {
            profile,
            line: idx + 1,
            text: raw.trim().to_string(),
        })?;
        out.push(lfa);
    }
    Ok(out)
}

/// Apply `order`. A shuffle is a seeded Fisher-Yates pass, so the same seed
/// yields the same permutation; without a seed it is nondeterministic.
pub fn apply_ordering(mut addrs: Vec<Lfa>, order: Ordering, seed: Option<u64>) -> Vec<Lfa> {
    if order == Ordering::Shuffle {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        addrs.shuffle(&mut rng);
    }
    addrs
}

pub type AreaFactory = fn(&ProfileArgs) -> Result<Box<dyn AreaProfile>, ArmingError>;

/// Registered area profiles.
pub const REGISTRY: &[(&str, AreaFactory)] = &[(address_list::NAME, address_list::build)];

pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

/// Instantiate an area profile by registry name (case-insensitive).
pub fn build(name: &str, args: &ProfileArgs) -> Result<Box<dyn AreaProfile>, ArmingError> {
    let wanted = name.trim().to_ascii_lowercase();
    let factory = REGISTRY
        .iter()
        .find(|(n, _)| *n == wanted)
        .map(|(_, f)| *f)
        .ok_or_else(|| ArmingError::UnknownProfile {
            kind: "area",
            name: name.to_string(),
            available: names().join(", "),
        })?;
    factory(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lfas(v: &[&str]) -> Vec<Lfa> {
        v.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn lfa_accepts_ten_hex_digits_and_uppercases() {
        let lfa: Lfa = " c00a098000 ".parse().unwrap();
        assert_eq!(lfa.as_str(), "C00A098000");
        for bad in ["C00A09800", "C00A0980000", "G00A098000", "", "C00A 98000"] {
            assert!(bad.parse::<Lfa>().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn parse_skips_comments_and_reports_line_numbers() {
        let text = "# header\n\n00000000AA  # first\n00000000bb\nnot-an-lfa\n";
        let err = parse_address_list("address_list", text).unwrap_err();
        assert!(matches!(err, ArmingError::InvalidAddress { line: 5, .. }));
        let ok = parse_address_list("address_list", "# x\n00000000AA\n00000000bb # y\n").unwrap();
        assert_eq!(ok, lfas(&["00000000AA", "00000000BB"]));
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let base = lfas(&[
            "0000000001", "0000000002", "0000000003", "0000000004", "0000000005",
            "0000000006", "0000000007", "0000000008",
        ]);
        let a = apply_ordering(base.clone(), Ordering::Shuffle, Some(42));
        let b = apply_ordering(base.clone(), Ordering::Shuffle, Some(42));
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, base);
        assert_eq!(apply_ordering(base.clone(), Ordering::Sequential, Some(42)), base);
    }

    #[test]
    fn unknown_profile_lists_available() {
        let err = build("bitstream", &ProfileArgs::default()).err().unwrap();
        assert!(err.to_string().contains("address_list"));
    }
}
