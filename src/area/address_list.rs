//! Area profile backed by a plain-text list of LFAs.
//!
//! Arguments (keys case-insensitive):
//!
//! | key              | meaning                                             |
//! |------------------|-----------------------------------------------------|
//! | `path` / `file`  | address file, required                              |
//! | `mode` / `order` | `sequential` (default), `random` or `shuffle`       |
//! | `seed`           | shuffle seed; the controller fills in the run seed  |
use std::path::{Path, PathBuf};

use log::debug;

use super::{apply_ordering, load_address_file, AreaProfile, Lfa, Ordering};
use crate::config::ProfileArgs;
use crate::error::ArmingError;
use crate::time::FinishReason;

pub const NAME: &str = "address_list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressListConfig {
    pub path: PathBuf,
    pub order: Ordering,
    pub seed: Option<u64>,
}

impl AddressListConfig {
    pub fn from_args(args: &ProfileArgs) -> Result<Self, ArmingError> {
        let path = args
            .str(&["path", "file"])
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ArmingError::InvalidArgument {
                profile: NAME,
                key: "path".into(),
                reason: "an address file is required (path=<file>)".into(),
            })?;
        let order = match args.first(&["mode", "order"]) {
            None => Ordering::Sequential,
            Some((key, value)) => match value.to_ascii_lowercase().as_str() {
                "sequential" => Ordering::Sequential,
                "random" | "shuffle" => Ordering::Shuffle,
                _ => {
                    return Err(ArmingError::InvalidArgument {
                        profile: NAME,
                        key: format!("{key}={value}"),
                        reason: "expected sequential, random or shuffle".into(),
                    })
                }
            },
        };
        let seed = args.u64(NAME, &["seed"])?;
        Ok(Self {
            path: PathBuf::from(path),
            order,
            seed,
        })
    }
}

pub struct AddressList {
    cfg: AddressListConfig,
    addrs: Vec<Lfa>,
    cursor: usize,
}

impl AddressList {
    pub fn new(cfg: AddressListConfig) -> Result<Self, ArmingError> {
        let loaded = load_address_file(NAME, &cfg.path)?;
        if loaded.is_empty() {
            return Err(ArmingError::EmptyArea { profile: NAME });
        }
        let addrs = apply_ordering(loaded, cfg.order, cfg.seed);
        debug!(
            "address_list: {} address(es) from {} ({})",
            addrs.len(),
            cfg.path.display(),
            cfg.order
        );
        Ok(Self {
            cfg,
            addrs,
            cursor: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.addrs.len() - self.cursor
    }
}

pub fn build(args: &ProfileArgs) -> Result<Box<dyn AreaProfile>, ArmingError> {
    Ok(Box::new(AddressList::new(AddressListConfig::from_args(args)?)?))
}

impl AreaProfile for AddressList {
    fn name(&self) -> &'static str {
        NAME
    }

    fn describe(&self) -> String {
        let file = self
            .cfg
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| Path::new(&self.cfg.path).display().to_string());
        let mut s = format!(
            "address_list: mode={}, file={}, N={}",
            self.cfg.order,
            file,
            self.addrs.len()
        );
        if let (Ordering::Shuffle, Some(seed)) = (self.cfg.order, self.cfg.seed) {
            s.push_str(&format!(", seed={seed}"));
        }
        s
    }

    fn next_address(&mut self) -> Option<Lfa> {
        let lfa = self.addrs.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(lfa)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.addrs.len())
    }

    fn end_condition_prompt(&self, reason: FinishReason) -> Option<String> {
        match reason {
            FinishReason::AreaExhausted => Some("Address list exhausted.".to_string()),
            _ => None,
        }
    }
}
