//! Loading site configuration from disk.

use std::fs;

use ledfleet_core::{ClockFormat, ProducerSpec, DEFAULT_DEVICE_PORT};
use ledfleetd::config::{ConfigError, FleetConfig};
use tempfile::TempDir;

const SITES: &str = r##"
[tuning]
batch_timeout_ms = 500

[[site]]
name = "pool"
width = 100
fps = 25

[[site.channel]]
host = "pool-ctl.local"
name = "Pool Rail"
length = 100
batch_size = 4
compress = false

[[site.schedule]]
days = ["sat", "sun"]
start = "09:00"
end = "24:00"
producer = { kind = "marquee", color = "#00ffcc", spacing = 5 }

[[site]]
name = "gate"
width = 30

[[site.channel]]
host = "10.0.0.7"
port = 50000
name = "Gate"
length = 30
clock = "legacy32"
"##;

fn write_config(text: &str) -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sites.toml");
    fs::write(&path, text).unwrap();
    (dir, path)
}

#[test]
fn test_load_sites_file() {
    let (_dir, path) = write_config(SITES);
    let config = FleetConfig::load(&path).unwrap();

    assert_eq!(config.tuning.batch_timeout_ms, 500);
    assert_eq!(config.tuning.max_queue_depth, 50);
    assert_eq!(config.sites.len(), 2);
    assert_eq!(config.channel_count(), 2);

    let pool = &config.sites[0];
    assert_eq!(pool.channels[0].port, DEFAULT_DEVICE_PORT);
    assert_eq!(pool.channels[0].batch_size, 4);
    assert!(!pool.channels[0].compress);
    assert!(matches!(
        pool.schedule[0].producer,
        ProducerSpec::Marquee { spacing: 5, .. }
    ));

    let gate = &config.sites[1];
    assert_eq!(gate.fps, 0);
    assert_eq!(gate.channels[0].port, 50000);
    assert_eq!(gate.channels[0].clock, ClockFormat::Legacy32);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = FleetConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_malformed_file_is_parse_error() {
    let (_dir, path) = write_config("[[site]]\nname = ");
    assert!(matches!(
        FleetConfig::load(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_segment_beyond_width_rejected_on_load() {
    let text = SITES.replace("length = 30", "length = 31");
    let (_dir, path) = write_config(&text);
    assert!(matches!(
        FleetConfig::load(&path),
        Err(ConfigError::InvalidSite { site, .. }) if site == "gate"
    ));
}
