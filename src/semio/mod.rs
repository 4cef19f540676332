//! # SEM monitor I/O
//!
//! Layered from the wire up:
//!
//! - [`framer`] - CR/LF line framing over raw bytes
//! - [`transport`] - owns the UART, single background reader, line queue
//! - [`protocol`] - command encoding, reply classification, status parsing
//! - [`ack`] - injection acknowledgement latch shared by scheduler and RX loop
//! - [`exchange`] - blocking request/reply helpers for synchronized sections
//! - [`sim`] - in-memory link and simulated monitor

pub mod ack;
pub mod exchange;
pub mod framer;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use ack::{AckState, AckTracker};
pub use protocol::{Command, DeviceMode, Injector, SemProtocol, StatusSnapshot};
pub use transport::{RxLine, SerialLinkConfig, Transport};
