//! Tests for config loading

use serial_test::serial;
use std::io::Write;

use orbweaver::config::{Config, DistributedConfig};
use orbweaver::utils::BackoffConfig;

const ENV_KEYS: &[&str] = &[
    "ORBWEAVER_MAX_WORKERS",
    "ORBWEAVER_TASK_QUEUE_LIMIT",
    "ORBWEAVER_WORKER_IDLE_TIMEOUT",
    "ORBWEAVER_WORKERS",
    "ORBWEAVER_WORKER_PREFIX",
    "ORBWEAVER_CB_FAILURE_THRESHOLD",
    "ORBWEAVER_BIND_ADDRESS",
    "ORBWEAVER_LOG_FORMAT",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

#[test]
fn test_from_file_overrides_only_given_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[distributed]
max_workers = 3
task_queue_limit = 50

[worker]
workers = 2
id_prefix = "crawler"

[backoff]
strategy = "linear"
base_ms = 100
increment_ms = 50
max_ms = 1000

[api]
bind_address = "127.0.0.1:9000"
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.distributed.max_workers, 3);
    assert_eq!(config.distributed.task_queue_limit, 50);
    assert_eq!(config.distributed.retry_count, 3);
    assert_eq!(config.worker.workers, 2);
    assert_eq!(config.worker.id_prefix, "crawler");
    assert_eq!(
        config.backoff,
        BackoffConfig::Linear {
            base_ms: 100,
            increment_ms: 50,
            max_ms: 1000
        }
    );
    assert_eq!(config.api.bind_address.port(), 9000);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    config.validate().unwrap();
}

#[test]
fn test_from_file_errors() {
    let missing = Config::from_file(std::path::Path::new("/nonexistent/orbweaver.toml"));
    assert!(missing.is_err());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[distributed\nmax_workers = ").unwrap();
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
#[serial]
fn test_from_env_reads_overrides() {
    clear_env();
    std::env::set_var("ORBWEAVER_MAX_WORKERS", "7");
    std::env::set_var("ORBWEAVER_TASK_QUEUE_LIMIT", " 25 ");
    std::env::set_var("ORBWEAVER_WORKERS", "3");
    std::env::set_var("ORBWEAVER_WORKER_PREFIX", "node");
    std::env::set_var("ORBWEAVER_CB_FAILURE_THRESHOLD", "2");
    std::env::set_var("ORBWEAVER_BIND_ADDRESS", "127.0.0.1:7070");
    std::env::set_var("ORBWEAVER_LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.distributed.max_workers, 7);
    assert_eq!(config.distributed.task_queue_limit, 25);
    assert_eq!(config.worker.workers, 3);
    assert_eq!(config.worker.id_prefix, "node");
    assert_eq!(config.circuit_breaker.failure_threshold, 2);
    assert_eq!(config.api.bind_address.port(), 7070);
    assert_eq!(config.logging.format, "json");
}

#[test]
#[serial]
fn test_from_env_rejects_malformed_values() {
    clear_env();
    std::env::set_var("ORBWEAVER_MAX_WORKERS", "many");

    let err = Config::from_env().unwrap_err();
    clear_env();

    assert!(err.to_string().contains("ORBWEAVER_MAX_WORKERS"));
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut config = Config::default();
    config.distributed.worker_idle_timeout_secs = config.distributed.heartbeat_interval_secs;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.worker.workers = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.circuit_breaker.failure_threshold = 0;
    assert!(config.validate().is_err());

    assert!(DistributedConfig::builder().task_queue_limit(0).build().is_err());
    assert!(DistributedConfig::builder().max_workers(0).build().is_err());
}
