//! Configuration and scan files on disk.

use instrument_link::config::{LinkConfig, ScanParameters};
use instrument_link::drivers::PanelSize;
use serial_test::serial;
use std::time::Duration;
use tempfile::tempdir;

const BENCH: &str = r#"
[application]
name = "hom-bench"
log_level = "debug"

[timeouts]
quick_ms = 150
readout_ms = 800

[piezo]
port = "/dev/ttyACM0"

[coincidence]
port = "/dev/ttyACM1"
sampling_period_ms = 400
legacy_binary = true

[dmd]
width = 1024
height = 768

[acquisition]
cadence_ms = 250
buffer_capacity = 16
"#;

#[test]
#[serial]
fn test_load_bench_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("instrument_link.toml");
    std::fs::write(&path, BENCH).unwrap();

    let config = LinkConfig::load_from(&path).unwrap();
    assert_eq!(config.application.name, "hom-bench");

    let timeouts = config.timeouts.to_exchange_timeouts();
    assert_eq!(timeouts.quick, Duration::from_millis(150));
    assert_eq!(timeouts.readout, Duration::from_millis(800));
    assert_eq!(timeouts.motion, Duration::from_millis(1000));

    let piezo = config.piezo.as_ref().unwrap();
    assert_eq!(piezo.baud_rate, 115_200);
    assert!(config.photodiode.is_none());

    let coincidence = config.coincidence.as_ref().unwrap();
    assert_eq!(coincidence.sampling_period_ms, 400);
    assert!(coincidence.legacy_binary);

    let dmd = config.dmd.as_ref().unwrap();
    assert_eq!(dmd.panel(), PanelSize { width: 1024, height: 768 });
    assert_eq!(dmd.vendor_id, 0x0451);

    let loop_config = config.acquisition.to_acquisition_config("counter-display");
    assert_eq!(loop_config.cadence, Duration::from_millis(250));
    assert_eq!(loop_config.capacity, 16);
    assert_eq!(loop_config.max_consecutive_timeouts, 3);
    assert_eq!(loop_config.owner, "counter-display");
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    let dir = tempdir().unwrap();
    let config = LinkConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, LinkConfig::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("instrument_link.toml");
    std::fs::write(&path, BENCH).unwrap();

    std::env::set_var("INSTRUMENT_LINK_TIMEOUTS__QUICK_MS", "350");
    std::env::set_var("INSTRUMENT_LINK_APPLICATION__LOG_LEVEL", "warn");
    let result = LinkConfig::load_from(&path);
    std::env::remove_var("INSTRUMENT_LINK_TIMEOUTS__QUICK_MS");
    std::env::remove_var("INSTRUMENT_LINK_APPLICATION__LOG_LEVEL");

    let config = result.unwrap();
    assert_eq!(config.timeouts.quick_ms, 350);
    assert_eq!(config.application.log_level, "warn");
    assert_eq!(config.timeouts.readout_ms, 800);
}

#[test]
#[serial]
fn test_invalid_environment_value_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("instrument_link.toml");
    std::fs::write(&path, BENCH).unwrap();

    std::env::set_var("INSTRUMENT_LINK_COINCIDENCE__SAMPLING_PERIOD_MS", "0");
    let result = LinkConfig::load_from(&path);
    std::env::remove_var("INSTRUMENT_LINK_COINCIDENCE__SAMPLING_PERIOD_MS");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("sampling_period_ms"));
}

#[test]
#[serial]
fn test_saved_config_loads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("saved.toml");
    let original = LinkConfig::from_toml_str(BENCH).unwrap();

    std::fs::write(&path, original.to_toml_string().unwrap()).unwrap();
    assert_eq!(LinkConfig::load_from(&path).unwrap(), original);
}

#[test]
fn test_scan_file_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.txt");

    let mut scan = ScanParameters::new(2.0, 1.0, 250.0);
    scan.exposure_time = Some(15_000.0);
    scan.fps = Some(20);
    scan.patterns.push((1, "patterns/checker.bmp".to_string()));
    scan.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("Z Init (um) = 1\n"));
    assert!(text.contains("Pattern 1 = patterns/checker.bmp"));

    let loaded = ScanParameters::load(&path).unwrap();
    assert_eq!(loaded, scan);
    assert_eq!(loaded.z_positions().unwrap().len(), 3);
}

#[test]
fn test_scan_file_errors_name_the_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.txt");
    let err = ScanParameters::load(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("missing.txt"));

    let broken = dir.path().join("broken.txt");
    std::fs::write(&broken, "Z Init (um) = 1\nZ Step (nm) = 10\n").unwrap();
    let err = ScanParameters::load(&broken).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("broken.txt"));
    assert!(message.contains("Z Final"));
}
