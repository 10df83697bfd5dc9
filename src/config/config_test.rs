use std::time::Duration;

use super::*;

#[test]
fn test_defaults_are_valid() {
    let cfg = LeaderConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.tick_time_ms, 2000);
    assert_eq!(cfg.init_limit, 10);
    assert_eq!(cfg.sync_limit, 5);
    assert!(cfg.nodelay);
    assert!(cfg.leader_serves);
    assert!(!cfg.reconfig_enabled);
    assert!(!cfg.listen_on_all_ips);
    assert_eq!(cfg.testing_initial_zxid, None);
}

#[test]
fn test_timeouts_are_tick_multiples() {
    let cfg = LeaderConfig {
        tick_time_ms: 500,
        init_limit: 10,
        sync_limit: 5,
        ..Default::default()
    };
    assert_eq!(cfg.tick_time(), Duration::from_millis(500));
    assert_eq!(cfg.init_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.sync_timeout(), Duration::from_millis(2500));
}

#[test]
fn test_zero_tick_time_is_rejected() {
    let cfg = LeaderConfig {
        tick_time_ms: 0,
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_limits_are_rejected() {
    let cfg = LeaderConfig {
        init_limit: 0,
        ..Default::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = LeaderConfig {
        sync_limit: 0,
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_max_epoch_wait_disabled_by_negative() {
    let cfg = LeaderConfig::default();
    assert_eq!(cfg.max_epoch_wait(), None);

    let cfg = LeaderConfig {
        max_time_to_wait_for_epoch_ms: 300,
        ..Default::default()
    };
    assert_eq!(cfg.max_epoch_wait(), Some(Duration::from_millis(300)));
}

#[test]
fn test_load_without_file_yields_defaults() {
    let cfg = LeaderConfig::load(None).unwrap();
    assert_eq!(cfg.tick_time_ms, LeaderConfig::default().tick_time_ms);
}
