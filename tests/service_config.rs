use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use image::RgbImage;
use tempfile::{Builder, NamedTempFile};

use roadwatch::config::ServiceConfig;
use roadwatch::{Annotator, DetectError, DetectionService, ModelType};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROADWATCH_CONFIG",
        "ROADWATCH_API_ADDR",
        "ROADWATCH_MAX_REQUEST_BYTES",
        "ROADWATCH_UPLOAD_DIR",
        "ROADWATCH_OUTPUT_DIR",
        "ROADWATCH_FONT_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": {
            "addr": "0.0.0.0:9000",
            "max_request_bytes": 1048576,
            "max_connections": 4
        },
        "storage": {
            "upload_dir": "/srv/roadwatch/in",
            "output_dir": "/srv/roadwatch/out"
        },
        "stats": {
            "recent_events_capacity": 10,
            "max_locations": 500
        },
        "models": {
            "pothole": {
                "labels": ["pothole"],
                "input_size": 320,
                "conf_threshold": 0.4
            }
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("ROADWATCH_CONFIG", file.path());
    std::env::set_var("ROADWATCH_API_ADDR", "127.0.0.1:5050");
    std::env::set_var("ROADWATCH_OUTPUT_DIR", "/tmp/roadwatch-out");

    let cfg = ServiceConfig::load().expect("load config");

    assert_eq!(cfg.api.addr, "127.0.0.1:5050");
    assert_eq!(cfg.api.max_request_bytes, 1048576);
    assert_eq!(cfg.api.max_connections, 4);
    assert_eq!(cfg.storage.upload_dir, PathBuf::from("/srv/roadwatch/in"));
    assert_eq!(cfg.storage.output_dir, PathBuf::from("/tmp/roadwatch-out"));
    assert_eq!(cfg.stats.recent_events_capacity, 10);
    assert_eq!(cfg.stats.max_locations, Some(500));

    let pothole = cfg.model(ModelType::Pothole);
    assert_eq!(pothole.labels, vec!["pothole".to_string()]);
    assert_eq!(pothole.input_size, 320);
    assert_eq!(pothole.conf_threshold, 0.4);
    assert_eq!(pothole.iou_threshold, 0.45);
    assert_eq!(cfg.model(ModelType::TrafficViolation).input_size, 640);

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[api]
addr = "127.0.0.1:6000"

[stats]
recent_events_capacity = 3
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.api.addr, "127.0.0.1:6000");
    assert_eq!(cfg.stats.recent_events_capacity, 3);
    assert_eq!(cfg.build_stats().recent_capacity(), 3);

    clear_env();
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.api.addr, "127.0.0.1:5000");
    assert_eq!(cfg.api.max_request_bytes, 256 * 1024 * 1024);
    assert_eq!(cfg.api.max_connections, 16);
    assert_eq!(cfg.storage.upload_dir, PathBuf::from("static/uploads"));
    assert!(cfg.font_path.is_none());

    let registry = cfg.build_registry().expect("empty registry");
    for model in ModelType::ALL {
        assert!(!registry.contains(model));
    }
}

#[test]
fn unconfigured_model_requests_fail_as_unknown_model() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load config");
    let service = DetectionService::new(
        Arc::new(cfg.build_registry().expect("registry")),
        Arc::new(Annotator::new()),
        Arc::new(cfg.build_stats()),
    );
    let err = service
        .handle_image(&RgbImage::new(16, 16), ModelType::Pothole, None)
        .unwrap_err();
    assert!(matches!(err, DetectError::UnknownModel(_)), "{}", err);
    assert_eq!(service.snapshot().count(ModelType::Pothole), 0);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROADWATCH_MAX_REQUEST_BYTES", "lots");
    assert!(ServiceConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_API_ADDR", "not-an-address");
    let err = ServiceConfig::load().unwrap_err().to_string();
    assert!(err.contains("api.addr"), "{}", err);
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"stats": {"recent_events_capacity": 0}}"#)
        .expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());
    let err = ServiceConfig::load().unwrap_err().to_string();
    assert!(err.contains("recent_events_capacity"), "{}", err);
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"unknown_section": {}}"#)
        .expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());
    assert!(ServiceConfig::load().is_err());
    clear_env();
}
