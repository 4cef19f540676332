//! # semfi - SEM fault-injection session engine
//!
//! semfi drives a Soft-Error Mitigation (SEM) monitor over a UART link to run
//! fault-injection campaigns: it feeds injection commands to the device at a
//! policy-defined cadence, correlates each injection with the device's
//! acknowledgement, and keeps a per-session event log of everything sent and
//! received.
//!
//! ## Features
//!
//! - **Single-reader transport**: one background thread owns the physical read
//!   path; lines are timestamped and consumed exactly once.
//! - **Exact command encoding**: status, mode transitions, injection, frame
//!   read/translate, register peek, external memory read and reset.
//! - **Pluggable profiles**: area profiles decide *where* to inject, time
//!   profiles decide *when*; both are selected by name from a compile-time
//!   registry and configured from `key=value` arguments.
//! - **Drift-free scheduling**: shot `k` is due at `t0 + k * period`, with
//!   optional acknowledgement gating.
//! - **Operator console**: driven and manual modes, pause/resume with a fresh
//!   connectivity check, configurable end-of-campaign policy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use semfi::campaign::{Controller, Flow};
//! use semfi::config::Config;
//! use semfi::console::Console;
//! use semfi::semio::Transport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("semfi.toml").await?;
//!     let transport = Arc::new(Transport::open(config.serial.link_config()?)?);
//!     let (ctrl, _events) = Controller::new(&config, transport, Arc::new(Console::stdout(true)));
//!     ctrl.start()?;
//!     if let Flow::Continue = ctrl.begin() {
//!         // hand operator input to ctrl.handle_input(..)
//!     }
//!     ctrl.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`semio`] - transport, protocol, acknowledgement tracking, simulated link
//! - [`area`] - area profiles and the validated [`area::Lfa`] address type
//! - [`time`] - time profiles and the scheduler runtime
//! - [`campaign`] - controller: RX loop, preflight, arming, pause/resume
//! - [`events`] - deferred per-session event log
//! - [`console`] - operator-facing echo and help output
//! - [`config`] - configuration loading and profile argument parsing
//! - [`error`] - error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Controller    │ ← RX loop, lifecycle, operator input
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌─────────────────┐
//! │  Ack   │ │    Scheduler    │ ← area + time profile, write-only
//! │Tracker │ └─────────────────┘
//! └────────┘        │
//! ┌─────────────────┐
//! │ Protocol /      │ ← command bytes, reply shapes
//! │ Transport       │ ← UART, background reader, line queue
//! └─────────────────┘
//! ```

pub mod area;
pub mod campaign;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod logutil;
pub mod semio;
pub mod time;
