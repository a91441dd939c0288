//! Tests for config module

use upload_rate::config::{
    ConnectFailurePolicy, NetworkType, PayloadSchedule, ProbeConfig, ProbeOptions,
    RateControlConfig, RateControlOptions, DEFAULT_PART_SIZE_BYTES, DEFAULT_SEND_BUFFER_SIZE,
};

#[test]
fn test_rate_config_valid() {
    let config =
        RateControlConfig::new(100_000, 2_000_000, 1_000_000, RateControlOptions::default())
            .unwrap();
    assert_eq!(config.min_bitrate, 100_000);
    assert_eq!(config.max_bitrate, 2_000_000);
    assert_eq!(config.initial_bitrate, 1_000_000);
    assert!(config.min_adjustment_interval_ms.is_none());
}

#[test]
fn test_rate_config_clamps_initial() {
    let high = RateControlConfig::new(100, 200, 500, RateControlOptions::default()).unwrap();
    assert_eq!(high.initial_bitrate, 200);

    let low = RateControlConfig::new(100, 200, 1, RateControlOptions::default()).unwrap();
    assert_eq!(low.initial_bitrate, 100);
}

#[test]
fn test_rate_config_rejects_bad_bounds() {
    assert!(RateControlConfig::new(0, 200, 100, RateControlOptions::default()).is_err());
    assert!(RateControlConfig::new(-5, 200, 100, RateControlOptions::default()).is_err());
    assert!(RateControlConfig::new(300, 200, 250, RateControlOptions::default()).is_err());
}

#[test]
fn test_rate_config_equal_bounds_allowed() {
    let config = RateControlConfig::new(500, 500, 1, RateControlOptions::default()).unwrap();
    assert_eq!(config.initial_bitrate, 500);
}

#[test]
fn test_rate_config_keeps_interval_option() {
    let config = RateControlConfig::new(
        100,
        200,
        150,
        RateControlOptions {
            min_adjustment_interval_ms: Some(250),
        },
    )
    .unwrap();
    assert_eq!(config.min_adjustment_interval_ms, Some(250));
}

#[test]
fn test_network_default_bitrates() {
    assert_eq!(NetworkType::Wifi.default_bitrate(), 3 * 1024 * 1024);
    assert_eq!(NetworkType::FourG.default_bitrate(), 2 * 1024 * 1024);
    assert_eq!(NetworkType::ThreeG.default_bitrate(), 1024 * 1024);
    assert_eq!(NetworkType::Other.default_bitrate(), 1024 * 1024);
}

#[test]
fn test_for_network_clamps_default() {
    let config = RateControlConfig::for_network(NetworkType::Wifi, 100_000, 2_000_000).unwrap();
    assert_eq!(config.initial_bitrate, 2_000_000);
}

#[test]
fn test_probe_config_defaults() {
    let config = ProbeConfig::new(1024, ProbeOptions::default()).unwrap();
    assert_eq!(config.data_size_bytes, 1024);
    assert_eq!(config.rounds, 1);
    assert_eq!(config.timeout_secs, 0);
    assert_eq!(config.connect_failure_policy, ConnectFailurePolicy::Report);
    assert_eq!(config.payload_schedule, PayloadSchedule::Full);
    assert_eq!(config.part_size_bytes, DEFAULT_PART_SIZE_BYTES);
    assert_eq!(config.send_buffer_size, DEFAULT_SEND_BUFFER_SIZE);
    assert_eq!(config.stream_key, "live");
}

#[test]
fn test_probe_config_rejects_invalid() {
    assert!(ProbeConfig::new(0, ProbeOptions::default()).is_err());
    assert!(ProbeConfig::new(
        1024,
        ProbeOptions {
            rounds: Some(0),
            ..ProbeOptions::default()
        }
    )
    .is_err());
    assert!(ProbeConfig::new(
        1024,
        ProbeOptions {
            part_size_bytes: Some(0),
            ..ProbeOptions::default()
        }
    )
    .is_err());
    assert!(ProbeConfig::new(
        1024,
        ProbeOptions {
            stream_key: Some("  ".to_string()),
            ..ProbeOptions::default()
        }
    )
    .is_err());
}

#[test]
fn test_payload_schedule_sizes() {
    assert_eq!(PayloadSchedule::Full.payload_size(1000, 3), 1000);
    assert_eq!(PayloadSchedule::Halving.payload_size(1000, 0), 1000);
    assert_eq!(PayloadSchedule::Halving.payload_size(1000, 2), 250);
    assert_eq!(PayloadSchedule::Halving.payload_size(1000, 200), 0);
    assert_eq!(PayloadSchedule::Divided.payload_size(1000, 0), 1000);
    assert_eq!(PayloadSchedule::Divided.payload_size(1000, 3), 250);
}

#[test]
fn test_payload_schedule_from_str() {
    assert_eq!("full".parse::<PayloadSchedule>().unwrap(), PayloadSchedule::Full);
    assert_eq!(" Halving ".parse::<PayloadSchedule>().unwrap(), PayloadSchedule::Halving);
    assert_eq!("DIVIDED".parse::<PayloadSchedule>().unwrap(), PayloadSchedule::Divided);
    assert!("doubling".parse::<PayloadSchedule>().is_err());
}
