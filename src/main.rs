//! Binary entrypoint for the semfi CLI.
//!
//! Commands:
//! - `run` (default) - arm a campaign and open the operator console
//! - `status [--json]` - one status query, printed raw or as JSON
//! - `inject <ADDR> [--assist-ms <ms>]` - one blocking injection with ack check
//! - `init` - write a default `semfi.toml`
//!
//! Device and campaign flags (`--dev`, `--baud`, `--area`, `--area-args`,
//! `--time`, `--time-args`, `--seed`, `--on-end`) override the config file and
//! may appear before or after the subcommand.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use semfi::area::Lfa;
use semfi::campaign::{Controller, ControllerEvent, ExitStatus, Flow};
use semfi::config::{CliOverrides, Config, OnEnd, DEFAULT_CONFIG_PATH};
use semfi::console::Console;
use semfi::error::SemResult;
use semfi::semio::exchange;
use semfi::semio::sim::MemoryLink;
use semfi::semio::{SemProtocol, Transport};

#[derive(Parser)]
#[command(name = "semfi")]
#[command(about = "Fault-injection campaigns against a SEM monitor over UART")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Talk to the built-in simulated SEM monitor instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Serial device (e.g., /dev/ttyUSB0)
    #[arg(long, global = true)]
    dev: Option<String>,

    /// Baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Area profile name
    #[arg(long, global = true)]
    area: Option<String>,

    /// Area profile arguments, CSV key=value
    #[arg(long, global = true)]
    area_args: Option<String>,

    /// Time profile name
    #[arg(long, global = true)]
    time: Option<String>,

    /// Time profile arguments, CSV key=value
    #[arg(long, global = true)]
    time_args: Option<String>,

    /// Global seed for randomized profiles
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// What to do when the campaign ends or cannot be armed
    #[arg(long, value_enum, global = true)]
    on_end: Option<OnEnd>,

    /// Run name (results/<run>/...)
    #[arg(long, global = true)]
    run_name: Option<String>,

    /// Session label (results/<run>/<session>/...)
    #[arg(long, global = true)]
    session: Option<String>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            device: self.dev.clone(),
            baud: self.baud,
            area: self.area.clone(),
            area_args: self.area_args.clone(),
            time: self.time.clone(),
            time_args: self.time_args.clone(),
            seed: self.seed,
            on_end: self.on_end,
            run_name: self.run_name.clone(),
            session_label: self.session.clone(),
        }
    }
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Arm the configured campaign and open the console
    Run,
    /// Query the monitor status once
    Status {
        /// Print a JSON object instead of the raw reply lines
        #[arg(long)]
        json: bool,
    },
    /// Inject once at a 10-digit LFA and wait for the acknowledgement
    Inject {
        /// Linear frame address, 10 hex digits
        addr: String,
        /// Afterwards, poll status until the monitor settles (milliseconds)
        #[arg(long)]
        assist_ms: Option<u64>,
    },
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Run);

    if let Commands::Init = command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load_or_default(&cli.config).await?;
    config.apply_overrides(&cli.overrides());
    config.validate().context("Invalid configuration")?;
    init_logging(&Some(config.clone()), cli.verbose);
    info!("Starting semfi v{}", env!("CARGO_PKG_VERSION"));

    let transport = match open_transport(&config, cli.simulate) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {e:#}");
            std::process::exit(ExitStatus::OpenFailed.code());
        }
    };

    let code = match command {
        Commands::Run => run_session(&config, transport).await?,
        Commands::Status { json } => {
            let cfg = config.clone();
            tokio::task::spawn_blocking(move || one_shot_status(&cfg, transport, json)).await??
        }
        Commands::Inject { addr, assist_ms } => {
            let cfg = config.clone();
            tokio::task::spawn_blocking(move || one_shot_inject(&cfg, transport, &addr, assist_ms))
                .await??
        }
        Commands::Init => 0,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn open_transport(config: &Config, simulate: bool) -> Result<Transport> {
    let link_cfg = config.serial.link_config()?;
    if simulate {
        info!("Using the simulated SEM monitor instead of {}", link_cfg.device);
        let link = MemoryLink::with_simulated_sem();
        let (reader, writer) = link.endpoints();
        return Ok(Transport::from_parts(link_cfg, reader, writer));
    }
    Transport::open(link_cfg).context("Failed to open SEM link")
}

async fn run_session(config: &Config, transport: Arc<Transport>) -> Result<i32> {
    let console = Arc::new(Console::stdout(config.controller.echo_gate));
    let (ctrl, mut events) = Controller::new(config, transport, Arc::clone(&console));
    print_header(&console, config, &ctrl);

    let c = Arc::clone(&ctrl);
    let started = tokio::task::spawn_blocking(move || -> SemResult<Flow> {
        c.start()?;
        Ok(c.begin())
    })
    .await?;
    let flow = match started {
        Ok(flow) => flow,
        Err(e) => {
            error!("Session start failed: {}", e);
            console.error(&format!("Session start failed: {e}"));
            Flow::Exit(ExitStatus::Aborted)
        }
    };

    let status = match flow {
        Flow::Exit(status) => status,
        Flow::Continue => interactive(Arc::clone(&ctrl), Arc::clone(&console), &mut events).await?,
    };

    let c = Arc::clone(&ctrl);
    if let Some(path) = tokio::task::spawn_blocking(move || c.shutdown()).await? {
        console.info(&format!("Session log written to {}", path.display()));
    }
    Ok(status.code())
}

async fn interactive(
    ctrl: Arc<Controller>,
    console: Arc<Console>,
    events: &mut UnboundedReceiver<ControllerEvent>,
) -> Result<ExitStatus> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    if !ctrl.is_driven() {
        console.manual_prompt();
    }
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    if ctrl.plan().on_end == OnEnd::Exit {
                        debug!("stdin closed; waiting for the campaign to end");
                        stdin_open = false;
                        continue;
                    }
                    info!("stdin closed");
                    return Ok(ExitStatus::Normal);
                };
                let c = Arc::clone(&ctrl);
                let flow = tokio::task::spawn_blocking(move || c.handle_input(&line)).await?;
                if let Flow::Exit(status) = flow {
                    return Ok(status);
                }
                if !ctrl.is_driven() {
                    console.manual_prompt();
                }
            }
            Some(event) = events.recv() => match event {
                ControllerEvent::Exit(status) => return Ok(status),
                ControllerEvent::ManualMode => console.manual_prompt(),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(ExitStatus::Normal);
            }
        }
    }
}

fn print_header(console: &Console, config: &Config, ctrl: &Controller) {
    let plan = ctrl.plan();
    console.rule_big();
    console.title("SEM Console");
    console.rule_big();
    console.plain("Currently Running:");
    console.field("run", &config.logging.run_name);
    console.field("session", &config.logging.session_label);
    console.field(
        "started",
        &chrono::Local::now().format("%Y-%m-%d %H:%M").to_string(),
    );
    console.field("sem_freq", &format!("{} Hz", config.platform.sem_freq_hz));
    console.field(
        "baud/device",
        &format!("{} @ {}", config.serial.baud_rate, config.serial.device),
    );
    console.field("seed", &plan.seed.to_string());
    console.field("on_end", &plan.on_end.to_string());
    console.plain(&format!("  • Area Profile: {}", plan.area));
    for (k, v) in plan.area_args.iter() {
        console.plain(&format!("      {k:<12}: {v}"));
    }
    console.plain(&format!("  • Time Profile: {}", plan.time));
    for (k, v) in plan.time_args.iter() {
        console.plain(&format!("      {k:<12}: {v}"));
    }
    console.help();
    console.start_mode_notes();
    console.rule_big();
}

fn one_shot_status(config: &Config, transport: Arc<Transport>, json: bool) -> Result<i32> {
    let console = if json { Console::muted() } else { Console::stdout(false) };
    transport.start_reader()?;
    let proto = SemProtocol::new(Arc::clone(&transport));
    let mode = proto.sync_prompt(Duration::from_millis(config.controller.sync_window_ms));
    console.tx("S");
    let (snap, lines) = proto.status(Duration::from_millis(config.preflight.window_ms))?;
    for line in &lines {
        console.rx(&line.text);
    }
    transport.close();
    if json {
        let payload = serde_json::json!({
            "device": config.serial.device,
            "mode": mode.map(|m| m.to_string()),
            "counters": &snap,
            "ok": !snap.is_empty(),
        });
        println!("{}", payload);
    } else if snap.is_empty() {
        console.error("No status counters received.");
    }
    Ok(if snap.is_empty() {
        ExitStatus::Aborted.code()
    } else {
        ExitStatus::Normal.code()
    })
}

fn one_shot_inject(
    config: &Config,
    transport: Arc<Transport>,
    addr: &str,
    assist_ms: Option<u64>,
) -> Result<i32> {
    let lfa: Lfa = addr.parse()?;
    let console = Console::stdout(false);
    let window = Duration::from_millis(config.controller.sync_window_ms.max(500));
    transport.start_reader()?;
    let proto = SemProtocol::new(Arc::clone(&transport));
    proto.sync_prompt(window);

    console.tx(&format!("N {lfa}"));
    let outcome = exchange::inject_once(&proto, &lfa, window)?;
    for line in &outcome.lines {
        console.rx(&line.text);
    }
    let mut ok = outcome.ack.is_complete();
    if ok {
        console.info(&format!("Injection at {lfa} acknowledged."));
    } else {
        console.error(&format!("Injection at {lfa} not acknowledged: {:?}", outcome.ack));
    }

    if let Some(ms) = assist_ms {
        let (settled, snap, lines) =
            exchange::assist_until_fc(&proto, Duration::from_millis(ms), window)?;
        for line in &lines {
            console.rx(&line.text);
        }
        if settled {
            console.info(&format!("Monitor settled: {snap}"));
        } else {
            console.error(&format!("Monitor did not settle within {ms} ms: {snap}"));
            ok = false;
        }
    }
    transport.close();
    Ok(if ok {
        ExitStatus::Normal.code()
    } else {
        ExitStatus::Aborted.code()
    })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    use std::str::FromStr;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let configured = config
        .as_ref()
        .and_then(|c| log::LevelFilter::from_str(&c.logging.level).ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(file) = file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Mirror to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            eprintln!("Warning: cannot open log file {}; logging to stderr", file);
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
