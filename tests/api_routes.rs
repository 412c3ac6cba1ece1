use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use depth_capture::api::{ApiConfig, ApiHandle, ApiServer};
use depth_capture::driver::{SyntheticDevice, SyntheticDriver};
use depth_capture::{DeviceSessionRegistry, FeedSettings, PixelFormat, SessionOptions, StreamSpec};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    dir: tempfile::TempDir,
    rig: SyntheticDriver,
    registry: Arc<DeviceSessionRegistry>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_data_dir(|dir| Ok(dir.to_path_buf()))
    }

    fn with_data_dir(data_dir: impl FnOnce(&Path) -> Result<PathBuf>) -> Result<Self> {
        let dir = tempdir()?;
        let data_dir = data_dir(dir.path())?;
        let rig = SyntheticDriver::with_devices([
            SyntheticDevice::new("SN1", "D400"),
            SyntheticDevice::new("SN2", "D400").with_name("Bench Camera"),
        ]);
        let registry = Arc::new(DeviceSessionRegistry::new(Arc::new(rig.clone())));

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            data_dir,
            session: SessionOptions::new(vec![
                StreamSpec::color(32, 24, PixelFormat::Bgr8, 30),
                StreamSpec::depth(32, 24, 30),
            ])
            .with_alignment(true),
            feed: FeedSettings {
                interval: Duration::from_millis(10),
                width: 32,
                height: 24,
                ..FeedSettings::default()
            },
        };
        let api_handle = ApiServer::new(api_config, Arc::clone(&registry)).spawn()?;

        Ok(Self {
            dir,
            rig,
            registry,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn get(&self, path: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn post(&self, path: &str, body: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_and_device_listing() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(serde_json::from_str::<Value>(&body)?["status"], "ok");

    let (headers, body) = api.get("/devices")?;
    assert!(headers.contains("200 OK"));
    let devices: Value = serde_json::from_str(&body)?;
    let devices = devices.as_array().expect("device array");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["serial"], "SN1");
    assert_eq!(devices[1]["name"], "Bench Camera");
    Ok(())
}

#[test]
fn start_and_stop_stream() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.post("/start_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("204 No Content"));
    assert!(api.registry.is_active("SN1"));
    assert_eq!(api.rig.live_pipelines("SN1"), 1);

    let (headers, _) = api.post("/start_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("204 No Content"));
    assert_eq!(api.rig.pipelines_opened("SN1"), 1);

    let (headers, _) = api.post("/stop_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("204 No Content"));
    assert!(!api.registry.is_active("SN1"));

    let (headers, body) = api.post("/stop_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains("stream not found"));
    Ok(())
}

#[test]
fn start_stream_errors() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.post("/start_stream", "{}")?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, body) = api.post("/start_stream", r#"{"serial": "SN404"}"#)?;
    assert!(headers.contains("500 Internal Server Error"));
    assert!(body.contains("failed to start stream"));
    assert!(api.registry.is_empty());
    Ok(())
}

#[test]
fn capture_writes_color_and_depth_files() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.post("/capture", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _) = api.post("/start_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("204 No Content"));
    let (headers, body) = api.post("/capture", r#"{"serial": "SN1", "folder_name": "bench"}"#)?;
    assert!(headers.contains("200 OK"));
    let timestamp = serde_json::from_str::<Value>(&body)?["timestamp"]
        .as_str()
        .expect("timestamp")
        .to_string();

    let folder = api.dir.path().join("captures").join("bench");
    let color = std::fs::read(folder.join(format!("color_SN1_{timestamp}.jpg")))?;
    let depth = std::fs::read(folder.join(format!("depth_SN1_{timestamp}.png")))?;
    assert!(color.starts_with(&[0xFF, 0xD8]));
    assert!(depth.starts_with(b"\x89PNG"));

    let (headers, _) = api.post("/capture", r#"{"serial": "SN1", "folder_name": "../escape"}"#)?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn calibration_info_is_written_to_data_dir() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.post("/get_calibration_info", r#"{"serial": "SN2"}"#)?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _) = api.post("/start_stream", r#"{"serial": "SN2"}"#)?;
    assert!(headers.contains("204 No Content"));
    let (headers, body) = api.post("/get_calibration_info", r#"{"serial": "SN2"}"#)?;
    assert!(headers.contains("200 OK"));

    let filename = serde_json::from_str::<Value>(&body)?["filename"]
        .as_str()
        .expect("filename")
        .to_string();
    let expected = api.dir.path().join("calibrations").join("SN2_32x24.json");
    assert_eq!(PathBuf::from(&filename), expected);

    let record: Value = serde_json::from_str(&std::fs::read_to_string(&expected)?)?;
    assert_eq!(record["serial"], "SN2");
    assert_eq!(record["width"], 32);
    assert!(record["color_intrinsics"]["fx"].is_number());
    assert_eq!(record["extrinsics"]["rotation"].as_array().map(Vec::len), Some(9));
    Ok(())
}

#[test]
fn unwritable_data_dir_is_reported_as_server_error() -> Result<()> {
    // A regular file where the data directory should be.
    let api = TestApi::with_data_dir(|dir| {
        let blocker = dir.join("data");
        std::fs::write(&blocker, b"not a directory")?;
        Ok(blocker)
    })?;

    let (headers, _) = api.post("/start_stream", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("204 No Content"));

    let (headers, body) = api.post("/capture", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("500 Internal Server Error"));
    assert!(body.contains("failed to save captured images"));

    let (headers, body) = api.post("/get_calibration_info", r#"{"serial": "SN1"}"#)?;
    assert!(headers.contains("500 Internal Server Error"));
    assert!(body.contains("failed to save calibration info"));

    assert!(api.registry.is_active("SN1"));
    let (headers, _) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn video_feed_streams_multipart_chunks() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.get("/video_feed")?;
    assert!(headers.contains("400 Bad Request"));

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(b"GET /video_feed?serial=SN1 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received
        .windows(7)
        .filter(|w| *w == b"--frame")
        .count()
        < 2
    {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "feed closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("Content-Type: image/jpeg"));
    drop(stream);
    Ok(())
}

#[test]
fn wrong_method_and_unknown_path() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.get("/start_stream")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.post("/devices", "{}")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.get("/events")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}
