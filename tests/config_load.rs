//! Config file round trip and CLI override precedence.
use semfi::config::{CliOverrides, Config, OnEnd};

#[tokio::test]
async fn default_file_loads_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("semfi.toml");
    let path = path.to_str().unwrap();
    Config::create_default(path).await.unwrap();
    let cfg = Config::load(path).await.unwrap();
    let def = Config::default();
    assert_eq!(cfg.serial.device, def.serial.device);
    assert_eq!(cfg.serial.baud_rate, def.serial.baud_rate);
    assert_eq!(cfg.campaign.time_args, def.campaign.time_args);
    assert_eq!(cfg.logging.tags, def.logging.tags);
}

#[tokio::test]
async fn partial_file_fills_defaults_and_flags_win() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("semfi.toml");
    std::fs::write(
        &path,
        "[serial]\ndevice = \"/dev/ttyUSB3\"\n\n[campaign]\ntime = \"poisson\"\non_end = \"exit\"\n\n[logging.tags]\nsem_cmd = false\n",
    )
    .unwrap();
    let mut cfg = Config::load(path.to_str().unwrap()).await.unwrap();
    assert_eq!(cfg.serial.device, "/dev/ttyUSB3");
    assert_eq!(cfg.campaign.time, "poisson");
    assert_eq!(cfg.campaign.on_end, OnEnd::Exit);
    assert!(!cfg.logging.tags.sem_cmd);
    assert!(cfg.logging.tags.error);
    assert_eq!(cfg.preflight.attempts, Config::default().preflight.attempts);

    cfg.apply_overrides(&CliOverrides {
        device: Some("/dev/ttyUSB0".into()),
        baud: Some(1_250_000),
        on_end: Some(OnEnd::Manual),
        seed: Some(11),
        ..CliOverrides::default()
    });
    assert_eq!(cfg.serial.device, "/dev/ttyUSB0");
    assert_eq!(cfg.serial.baud_rate, 1_250_000);
    assert_eq!(cfg.campaign.on_end, OnEnd::Manual);
    assert_eq!(cfg.resolve_seed(), 11);
    assert!(cfg.validate().is_ok());
}

#[tokio::test]
async fn missing_file_means_defaults_but_broken_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let cfg = Config::load_or_default(missing.to_str().unwrap()).await.unwrap();
    assert_eq!(cfg.serial.device, Config::default().serial.device);

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[serial\nbaud_rate = ").unwrap();
    assert!(Config::load_or_default(broken.to_str().unwrap()).await.is_err());

    let invalid = dir.path().join("invalid.toml");
    std::fs::write(&invalid, "[serial]\nbaud_rate = 0\n").unwrap();
    assert!(Config::load(invalid.to_str().unwrap()).await.is_err());
}
