use super::*;

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache.host, "127.0.0.1");
    assert_eq!(settings.cache.port, 6379);
    assert_eq!(settings.cache.db, 0);
    assert_eq!(settings.cache.max_connections.get(), 20);
    assert_eq!(settings.cache.socket_timeout, Duration::from_secs(5));
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(3_600));
    assert_eq!(settings.cache.max_ttl, Duration::from_secs(86_400));
    assert_eq!(settings.cache.compression_threshold, 1_024);
    assert_eq!(settings.cache.mode, DeploymentMode::Standalone);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.logging.format, LogFormat::Compact);
    assert_eq!(settings.worker.interval, Duration::from_secs(300));
    assert_eq!(settings.worker.warm_batch_size.get(), 50);
    assert_eq!(settings.worker.warm_pause, Duration::from_millis(100));
    assert_eq!(settings.worker.batch_retention, Duration::from_secs(24 * 3_600));
    assert_eq!(settings.worker.stats_ttl, Duration::from_secs(300));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.port = Some(6380);
    raw.logging.level = Some("info".to_string());
    raw.worker.interval_seconds = Some(60);

    let overrides = RunOverrides {
        store: StoreOverrides {
            cache_port: Some(7000),
            log_level: Some("debug".to_string()),
            ..Default::default()
        },
        worker_interval_seconds: Some(15),
        ..Default::default()
    };

    raw.apply_run_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.port, 7000);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.worker.interval, Duration::from_secs(15));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = StoreOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_store_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn sentinel_mode_collects_hosts_and_default_service() {
    let mut raw = RawSettings::default();
    raw.cache.mode = Some("Sentinel".to_string());
    raw.cache.sentinel_hosts = vec![
        "10.0.0.1:26379".to_string(),
        "  ".to_string(),
        " 10.0.0.2:26379 ".to_string(),
    ];

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.mode,
        DeploymentMode::Sentinel {
            hosts: vec!["10.0.0.1:26379".to_string(), "10.0.0.2:26379".to_string()],
            service_name: "mymaster".to_string(),
        }
    );
}

#[test]
fn empty_cluster_list_is_left_to_validation() {
    let mut raw = RawSettings::default();
    raw.cache.mode = Some("cluster".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    let config = crate::cache::CacheConfig::from(&settings.cache);
    assert!(config.validate()[0].contains("cluster"));
}

#[test]
fn unknown_mode_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.mode = Some("replicated".to_string());

    let err = Settings::from_raw(raw).expect_err("mode should be rejected");
    assert!(matches!(err, LoadError::Invalid { key: "cache.mode", .. }));
}

#[test]
fn unparsable_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("level should be rejected");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn zero_interval_is_rejected() {
    let mut raw = RawSettings::default();
    raw.worker.interval_seconds = Some(0);

    let err = Settings::from_raw(raw).expect_err("interval should be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "worker.interval_seconds",
            ..
        }
    ));
}

#[test]
fn blank_password_is_treated_as_absent() {
    let mut raw = RawSettings::default();
    raw.cache.password = Some("   ".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.cache.password.is_none());
}

#[test]
fn default_to_run_command() {
    let args = CliArgs::try_parse_from(["anno-cache"]).expect("parse");
    assert!(args.command.is_none());
}

#[test]
fn parse_run_overrides() {
    let args = CliArgs::try_parse_from([
        "anno-cache",
        "run",
        "--cache-host",
        "redis.internal",
        "--cache-mode",
        "memory",
        "--log-json",
        "yes",
        "--worker-interval-seconds",
        "30",
    ])
    .expect("parse");

    match args.command {
        Some(Command::Run(run)) => {
            assert_eq!(run.overrides.store.cache_host.as_deref(), Some("redis.internal"));
            assert_eq!(run.overrides.store.cache_mode.as_deref(), Some("memory"));
            assert_eq!(run.overrides.store.log_json, Some(true));
            assert_eq!(run.overrides.worker_interval_seconds, Some(30));
        }
        other => panic!("expected run command, got {other:?}"),
    }
}

#[test]
fn parse_check_command() {
    let args = CliArgs::try_parse_from(["anno-cache", "check", "--cache-port", "6390"])
        .expect("parse");

    match args.command {
        Some(Command::Check(check)) => {
            assert_eq!(check.overrides.cache_port, Some(6390));
        }
        other => panic!("expected check command, got {other:?}"),
    }
}
