//! Test utilities & fixtures.
//! A controller wired to the simulated SEM monitor, with its session log and
//! address file under a temp dir.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use semfi::campaign::{Controller, ControllerEvent};
use semfi::config::Config;
use semfi::console::Console;
use semfi::semio::sim::MemoryLink;
use semfi::semio::{SerialLinkConfig, Transport};
use tokio::sync::mpsc::UnboundedReceiver;

pub const LFAS: [&str; 3] = ["00001A2B3C", "00001A2B3D", "00001A2B3E"];

pub struct Harness {
    pub link: MemoryLink,
    pub ctrl: Arc<Controller>,
    pub events: UnboundedReceiver<ControllerEvent>,
    pub dir: tempfile::TempDir,
}

/// One address per line, with a comment and a blank line mixed in.
pub fn write_addresses(dir: &Path, lfas: &[&str]) -> PathBuf {
    let path = dir.join("lfas.txt");
    let mut body = String::from("# test addresses\n\n");
    for lfa in lfas {
        body.push_str(lfa);
        body.push('\n');
    }
    std::fs::write(&path, body).unwrap();
    path
}

/// Fast timings, results under the temp dir, `address_list` pointed at
/// `lfas`. `configure` runs last.
#[allow(dead_code)]
pub fn harness(link: MemoryLink, lfas: &[&str], configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_addresses(dir.path(), lfas);
    let mut cfg = Config::default();
    cfg.logging.results_dir = dir.path().join("results").display().to_string();
    cfg.controller.sync_window_ms = 300;
    cfg.controller.watcher_poll_ms = 20;
    cfg.preflight.window_ms = 300;
    cfg.preflight.interval_ms = 50;
    cfg.campaign.area_args = format!("path={}", path.display());
    cfg.campaign.seed = Some(7);
    configure(&mut cfg);

    let (r, w) = link.endpoints();
    let transport = Arc::new(Transport::from_parts(SerialLinkConfig::new("mem", 115_200), r, w));
    let (ctrl, events) = Controller::new(&cfg, transport, Arc::new(Console::muted()));
    Harness {
        link,
        ctrl,
        events,
        dir,
    }
}

/// Poll the controller's event channel until something arrives.
#[allow(dead_code)]
pub fn wait_for_event(
    events: &mut UnboundedReceiver<ControllerEvent>,
    timeout: Duration,
) -> Option<ControllerEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(ev) = events.try_recv() {
            return Some(ev);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}

/// Wait until `cond` holds or `timeout` passes; returns the final check.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
