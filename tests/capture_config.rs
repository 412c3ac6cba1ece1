use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use depth_capture::config::{CaptureConfig, DriverKind};
use depth_capture::{FeedLayout, PixelFormat, StreamKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_API_ADDR",
        "CAPTURE_DATA_DIR",
        "CAPTURE_DRIVER",
        "CAPTURE_IMAGE_WIDTH",
        "CAPTURE_IMAGE_HEIGHT",
        "CAPTURE_FPS",
        "CAPTURE_FALLBACK_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = CaptureConfig::load().expect("load defaults");

    assert_eq!((cfg.image_width, cfg.image_height, cfg.fps), (640, 480, 30));
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.data_dir, PathBuf::from("data"));
    assert_eq!(cfg.driver_kind().unwrap(), DriverKind::Synthetic);
    assert_eq!(cfg.synthetic_serials, vec!["SYN0001"]);
    assert_eq!(cfg.emitter, None);
    assert_eq!(cfg.laser_power_mw, None);
    assert!(cfg.alignment_enabled().unwrap());

    let options = cfg.session_options().unwrap();
    assert!(options.enable_alignment);
    assert_eq!(options.preset, None);
    assert_eq!(options.streams.len(), 2);
    assert_eq!(options.streams[0].kind, StreamKind::Color);
    assert_eq!(options.streams[0].format, PixelFormat::Bgr8);
    assert_eq!(options.streams[1].format, PixelFormat::Z16);

    let feed = cfg.feed_settings().unwrap();
    assert_eq!(feed.interval, Duration::from_millis(100));
    assert_eq!(feed.layout, FeedLayout::Color);
    assert_eq!((feed.width, feed.height), (640, 480));
    assert_eq!(cfg.captures_dir(), PathBuf::from("data").join("captures"));

    clear_env();
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "image_width": 1280,
        "image_height": 720,
        "fps": 15,
        "data_dir": "/var/lib/capture",
        "emitter": false,
        "synthetic_serials": ["SN1", "SN2"],
        "streams": {
            "color_format": "rgb8",
            "align_to": "none"
        },
        "feed": {
            "fallback_interval_ms": 250,
            "layout": "color_depth",
            "jpeg_quality": 60,
            "fallback_color": [32, 32, 32]
        },
        "api": {
            "addr": "0.0.0.0:8080"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_FPS", "30");
    std::env::set_var("CAPTURE_API_ADDR", "127.0.0.1:9000");

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!((cfg.image_width, cfg.image_height), (1280, 720));
    assert_eq!(cfg.fps, 30);
    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/capture"));
    assert_eq!(cfg.emitter, Some(false));
    assert_eq!(cfg.synthetic_serials, vec!["SN1", "SN2"]);
    assert_eq!(cfg.color_format().unwrap(), PixelFormat::Rgb8);
    assert!(!cfg.alignment_enabled().unwrap());

    let options = cfg.session_options().unwrap();
    assert_eq!(options.emitter, Some(false));
    assert!(!options.enable_alignment);
    assert!(options.streams.iter().all(|s| s.fps == 30));

    let feed = cfg.feed_settings().unwrap();
    assert_eq!(feed.interval, Duration::from_millis(250));
    assert_eq!(feed.layout, FeedLayout::ColorDepth);
    assert_eq!(feed.jpeg_quality, 60);
    assert_eq!(feed.fallback_color, [32, 32, 32]);

    let driver = cfg.build_driver().expect("synthetic driver");
    let serials: Vec<String> = driver
        .query_devices()
        .expect("query devices")
        .into_iter()
        .map(|d| d.serial)
        .collect();
    assert_eq!(serials, vec!["SN1", "SN2"]);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
image_width = 848
image_height = 480
driver = "Synthetic"

[feed]
layout = "color_depth"

[api]
addr = "0.0.0.0:5001"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!(cfg.image_width, 848);
    assert_eq!(cfg.api_addr, "0.0.0.0:5001");
    assert_eq!(cfg.driver, "synthetic");
    assert_eq!(cfg.feed_layout().unwrap(), FeedLayout::ColorDepth);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let cases = [
        r#"{ "image_width": 0 }"#,
        r#"{ "image_width": 100000 }"#,
        r#"{ "image_height": 4294967295 }"#,
        r#"{ "laser_power_mw": -1.0 }"#,
        r#"{ "fps": 0 }"#,
        r#"{ "driver": "librealsense" }"#,
        r#"{ "streams": { "color_format": "z16" } }"#,
        r#"{ "streams": { "depth_format": "y8" } }"#,
        r#"{ "streams": { "align_to": "depth" } }"#,
        r#"{ "feed": { "jpeg_quality": 0 } }"#,
        r#"{ "feed": { "layout": "side_by_side" } }"#,
        r#"{ "feed": { "fallback_interval_ms": 0 } }"#,
        r#"{ "synthetic_serials": ["SN1", " "] }"#,
        r#"{ "image_width": "wide" }"#,
    ];
    for json in cases {
        clear_env();
        let mut file = NamedTempFile::new().expect("temp config");
        std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
        std::env::set_var("CAPTURE_CONFIG", file.path());
        assert!(CaptureConfig::load().is_err(), "accepted {json}");
    }

    clear_env();
    std::env::set_var("CAPTURE_IMAGE_HEIGHT", "tall");
    assert!(CaptureConfig::load().is_err());

    clear_env();
}

#[test]
fn projector_settings_and_preset_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut preset = NamedTempFile::new().expect("temp preset");
    std::io::Write::write_all(&mut preset, br#"{"param-depthunits": "1000"}"#)
        .expect("write preset");
    let mut file = NamedTempFile::new().expect("temp config");
    let json = serde_json::json!({
        "emitter": true,
        "laser_power_mw": 330.0,
        "preset_file": preset.path(),
    })
    .to_string();
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());

    let cfg = CaptureConfig::load().expect("load config");
    let options = cfg.session_options().expect("session options");
    assert_eq!(options.emitter, Some(true));
    assert_eq!(options.laser_power, Some(330.0));
    assert_eq!(
        options.preset.as_deref(),
        Some(r#"{"param-depthunits": "1000"}"#)
    );

    let mut cfg = cfg;
    cfg.preset_file = Some(PathBuf::from("/nonexistent/preset.json"));
    let err = cfg.session_options().unwrap_err();
    assert!(err.to_string().contains("failed to read preset file"));

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("CAPTURE_CONFIG", "/nonexistent/capture.json");
    let err = CaptureConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
