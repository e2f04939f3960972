use super::*;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.central.bind_interface, "127.0.0.1");
    assert_eq!(settings.central.rpc_endpoint, "tcp://{bindInterface}:7500");
    assert_eq!(settings.central.subscribe_endpoint, "tcp://{bindInterface}:7501");
    assert_eq!(settings.central.publish_endpoint, "tcp://{bindInterface}:7502");
    assert_eq!(settings.central.sweep_interval_ms, 5000);
    assert!(!settings.central.foreground);
    assert_eq!(settings.publisher.publish_endpoint, "tcp://127.0.0.1:random");
    assert_eq!(
        settings.publisher.central_rpc_endpoint,
        format!("tcp://{{centralHost}}:{DEFAULT_CENTRAL_RPC_PORT}")
    );
    assert_eq!(settings.publisher.heartbeat_period_ms, 5000);
    assert_eq!(settings.publisher.keepalive_ms, None);
    assert_eq!(
        settings.subscriber.central_publish_endpoint,
        "tcp://{centralHost}:7502"
    );
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("central.toml");
    let toml = r#"
        [central]
        bind_interface = "0.0.0.0"
        log_dir = "/var/log/central"
        subscribe_to = ["gps@tcp://10.0.0.5:9000"]

        [publisher]
        module_name = "camera"
        keepalive_ms = 3000
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = temp_env::with_vars_unset(["CENTRALBUS_CENTRAL__LOG_DIR"], || {
        load_config_from(&path).expect("load_config_from failed")
    });
    assert_eq!(cfg.central.bind_interface, "0.0.0.0");
    assert_eq!(cfg.central.log_dir, "/var/log/central");
    assert_eq!(cfg.central.subscribe_to, vec!["gps@tcp://10.0.0.5:9000"]);
    // untouched values keep their defaults
    assert_eq!(cfg.central.message_log, "central-messages-%s.txt");
    assert_eq!(cfg.publisher.module_name, "camera");
    assert_eq!(cfg.publisher.keepalive_ms, Some(3000));
    assert_eq!(cfg.publisher.heartbeat_period_ms, 5000);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("central.toml");
    fs::write(&path, "[central]\nlog_dir = \"from-file\"\n").expect("write config file");

    temp_env::with_vars(
        [
            ("CENTRALBUS_CENTRAL__LOG_DIR", Some("from-env")),
            ("CENTRALBUS_CENTRAL__SWEEP_INTERVAL_MS", Some("250")),
        ],
        || {
            let cfg = load_config_from(&path).expect("load_config_from failed");
            assert_eq!(cfg.central.log_dir, "from-env");
            assert_eq!(cfg.central.sweep_interval_ms, 250);
        },
    );
}

#[test]
fn missing_explicit_file_is_an_error() {
    let tmp = TempDir::new().expect("create tempdir");
    assert!(load_config_from(&tmp.path().join("absent.toml")).is_err());
}
