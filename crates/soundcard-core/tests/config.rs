use std::time::Duration;

use soundcard_core::rt::{BridgeMode, Presets, PresetsError, SampleFormat, TimingError};
use soundcard_core::{ConfigError, LatencyMetrics, SoundcardConfig};

#[test]
fn latency_computation() {
    let config = SoundcardConfig::default()
        .with_presets(Presets::new(2, 48_000, 128, SampleFormat::S16))
        .with_ring_slots(4);
    let latency = LatencyMetrics::new(
        config.presets.samplerate,
        config.presets.buffer_size,
        config.ring_slots,
    );
    assert!((latency.buffer_ms - 2.666_666_7).abs() < 1e-4);
    assert!((latency.ring_ms - latency.buffer_ms * 4.0).abs() < 1e-4);
    assert!(latency.round_trip_ms > latency.ring_ms);
}

#[test]
fn defaults_are_valid() {
    let config = SoundcardConfig::default();
    config.validate().unwrap();
    assert_eq!(config.bpm, 120.0);
    assert_eq!(config.effective_delay_factor().unwrap(), 0.25);
    assert_eq!(config.bridge_mode, BridgeMode::Blocking);
    assert_eq!(config.write_retries, 4);
}

#[test]
fn json_fills_missing_fields_with_defaults() {
    let config = SoundcardConfig::from_json_str(
        r#"{ "bpm": 138.0, "ring_slots": 8, "bridge_mode": "pass_through",
             "presets": { "samplerate": 48000, "format": "s32" } }"#,
    )
    .unwrap();
    assert_eq!(config.bpm, 138.0);
    assert_eq!(config.ring_slots, 8);
    assert_eq!(config.bridge_mode, BridgeMode::PassThrough);
    assert_eq!(config.presets.samplerate, 48_000);
    assert_eq!(config.presets.channels, 2);
    assert_eq!(config.presets.format, SampleFormat::S32);
    assert_eq!(config.sub_block_count, 8);
}

#[test]
fn segmentation_overrides_the_delay_factor() {
    let config = SoundcardConfig::default()
        .with_delay_factor(1.0)
        .with_segmentation("4/4");
    assert_eq!(config.effective_delay_factor().unwrap(), 0.25);
    let table = config.timing_table().unwrap();
    assert_eq!(table.tick_duration(), Duration::from_millis(125));

    let config = config.with_delay_factor(0.5);
    assert_eq!(config.segmentation, None);
    assert_eq!(config.effective_delay_factor().unwrap(), 0.5);
}

#[test]
fn invalid_values_are_rejected_not_clamped() {
    let err = SoundcardConfig::default().with_ring_slots(6).validate().unwrap_err();
    assert!(matches!(err, ConfigError::RingSlots(6)));

    let err = SoundcardConfig::default().with_bpm(0.0).validate().unwrap_err();
    assert!(matches!(err, ConfigError::Timing(TimingError::InvalidConfiguration(_))));

    let err = SoundcardConfig::default()
        .with_presets(Presets::new(2, 1_000, 1_024, SampleFormat::S16))
        .validate()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Presets(PresetsError::Samplerate(1_000))));

    let err = SoundcardConfig::default()
        .with_sub_block_count(0)
        .validate()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Layout(_)));

    let err = SoundcardConfig::default()
        .with_segmentation("four")
        .validate()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Timing(_)));

    let mut config = SoundcardConfig::default();
    config.position_queue_capacity = 0;
    assert!(matches!(
        config.validate().unwrap_err(),
        ConfigError::Zero {
            field: "position_queue_capacity"
        }
    ));
}

#[test]
fn unreadable_or_malformed_files_fail() {
    let err = SoundcardConfig::load("/nonexistent/soundcard.json").unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));

    let err = SoundcardConfig::from_json_str("{ \"bpm\": ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn config_survives_a_json_round_trip() {
    let config = SoundcardConfig::default()
        .with_bpm(96.0)
        .with_device("/dev/dsp1")
        .with_write_retries(2);
    let json = config.to_json_string().unwrap();
    assert_eq!(SoundcardConfig::from_json_str(&json).unwrap(), config);
}
