use crate::calibration::{CalibrationExtractor, CalibrationRecord};
use crate::capture::{capture_once, Capture};
use crate::driver::{PixelFormat, StreamSpec};
use crate::error::{CalibrationError, CaptureError};
use crate::feed::{FeedSettings, FrameFeedGenerator, MULTIPART_CONTENT_TYPE};
use crate::registry::{DeviceSessionRegistry, SessionOptions};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_FOLDER: &str = "default";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub data_dir: PathBuf,
    /// Used by `/start_stream`.
    pub session: SessionOptions,
    pub feed: FeedSettings,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            data_dir: PathBuf::from("data"),
            session: SessionOptions::new(vec![
                StreamSpec::color(640, 480, PixelFormat::Bgr8, 30),
                StreamSpec::depth(640, 480, 30),
            ])
            .with_alignment(true),
            feed: FeedSettings::default(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, then wait for in-flight requests and feeds to end.
    /// Feeds notice the flag on their next tick.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

struct ApiState {
    cfg: ApiConfig,
    registry: Arc<DeviceSessionRegistry>,
    feeds: FrameFeedGenerator,
    calibration: CalibrationExtractor,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<DeviceSessionRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<DeviceSessionRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ApiState {
            feeds: FrameFeedGenerator::new(Arc::clone(&self.registry), self.cfg.feed.clone())?,
            calibration: CalibrationExtractor::new(Arc::clone(&self.registry)),
            registry: self.registry,
            cfg: self.cfg,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("capture-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, state) {
                    log::error!("capture api stopped: {}", err);
                }
            })?;
        log::info!("capture api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ApiState>) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        workers.retain(|worker| !worker.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                let worker = std::thread::Builder::new()
                    .name(format!("capture-api-{peer}"))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state) {
                            log::warn!("capture api request from {} failed: {}", peer, err);
                        }
                    })?;
                workers.push(worker);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct DeviceRequest {
    serial: Option<String>,
    folder_name: Option<String>,
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!("{} {}", request.method, request.raw_path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", "/devices") => list_devices(&mut stream, state),
        ("GET", "/video_feed") => video_feed(stream, state, &request),
        ("POST", "/start_stream") => start_stream(&mut stream, state, &request),
        ("POST", "/stop_stream") => stop_stream(&mut stream, state, &request),
        ("POST", "/capture") => capture(&mut stream, state, &request),
        ("POST", "/get_calibration_info") => calibration_info(&mut stream, state, &request),
        (
            _,
            "/health" | "/devices" | "/video_feed" | "/start_stream" | "/stop_stream" | "/capture"
            | "/get_calibration_info",
        ) => write_error(&mut stream, 405, "method_not_allowed"),
        _ => write_error(&mut stream, 404, "not_found"),
    }
}

fn list_devices(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    match state.registry.enumerator().list_devices() {
        Ok(devices) => write_json_response(stream, 200, &serde_json::to_value(devices)?),
        Err(err) => {
            log::error!("device enumeration failed: {}", err);
            write_error(stream, 500, &err.to_string())
        }
    }
}

fn start_stream(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let Some(serial) = request.device()?.serial else {
        log::error!("device serial number is required to start streaming");
        return write_error(stream, 400, "device serial number is required");
    };
    match state.registry.start_with(&serial, &state.cfg.session) {
        Ok(()) => write_empty_response(stream, 204),
        Err(err) => {
            log::error!("failed to start stream: {}", err);
            write_error(stream, 500, &format!("failed to start stream: {err}"))
        }
    }
}

fn stop_stream(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let Some(serial) = request.device()?.serial else {
        return write_error(stream, 400, "device serial number is required");
    };
    match state.registry.stop(&serial) {
        Ok(_) => write_empty_response(stream, 204),
        Err(_) => write_error(stream, 404, "stream not found"),
    }
}

fn capture(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let body = request.device()?;
    let Some(serial) = body.serial else {
        return write_error(stream, 400, "device serial number is required");
    };
    let folder = body.folder_name.unwrap_or_else(|| DEFAULT_FOLDER.to_string());
    if !is_safe_component(&folder) {
        return write_error(stream, 400, "folder_name must be a single path component");
    }

    let shot = match capture_once(&state.registry, &serial) {
        Ok(shot) => shot,
        Err(CaptureError::NotFound(_)) => {
            return write_error(stream, 400, "streaming is not active")
        }
        Err(err @ CaptureError::Frame(_)) => {
            log::error!("failed to capture frames: {}", err);
            return write_error(stream, 500, "failed to capture frames");
        }
    };

    let save_path = state.cfg.data_dir.join("captures").join(&folder);
    if let Err(err) = save_capture(&save_path, &shot, state.cfg.feed.jpeg_quality) {
        log::error!(
            "failed to save captured images for device {}: {:#}",
            serial,
            err
        );
        return write_error(stream, 500, "failed to save captured images");
    }
    log::info!(
        "captured images saved at {} for device {}",
        save_path.display(),
        serial
    );
    write_json_response(stream, 200, &json!({"timestamp": shot.timestamp}))
}

fn calibration_info(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let Some(serial) = request.device()?.serial else {
        return write_error(stream, 400, "device serial number is required");
    };
    let record = match state.calibration.extract(&serial) {
        Ok(record) => record,
        Err(CalibrationError::NotFound(_)) => {
            log::warn!(
                "calibration info requested while streaming is inactive for device {}",
                serial
            );
            return write_error(stream, 400, "streaming is not active");
        }
        Err(err) => {
            log::error!("error retrieving calibration info: {}", err);
            return write_error(stream, 500, &err.to_string());
        }
    };

    let save_path = state.cfg.data_dir.join("calibrations");
    let filename = match save_calibration(&save_path, &record) {
        Ok(filename) => filename,
        Err(err) => {
            log::error!(
                "failed to save calibration info for device {}: {:#}",
                serial,
                err
            );
            return write_error(stream, 500, "failed to save calibration info");
        }
    };
    log::info!("calibration info saved as {}", filename.display());
    write_json_response(
        stream,
        200,
        &json!({"filename": filename.to_string_lossy()}),
    )
}

/// Stream multipart chunks until the client goes away or the server stops.
fn video_feed(mut stream: TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let Some(serial) = request.query("serial") else {
        return write_error(&mut stream, 400, "serial query parameter is required");
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {MULTIPART_CONTENT_TYPE}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;

    let mut feed = state.feeds.stream(&serial);
    log::info!("video feed opened for device {}", serial);
    while !state.shutdown.load(Ordering::SeqCst) {
        let chunk = feed.tick().into_chunk();
        if let Err(err) = stream.write_all(&chunk).and_then(|()| stream.flush()) {
            log::debug!("video feed for device {} closed: {}", serial, err);
            break;
        }
    }
    log::info!(
        "video feed for device {} ended after {} ticks ({} fallback)",
        serial,
        feed.ticks(),
        feed.fallbacks()
    );
    Ok(())
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn save_capture(dir: &Path, shot: &Capture, jpeg_quality: u8) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let (color_name, depth_name) = shot.file_names();
    std::fs::write(dir.join(color_name), shot.color_jpeg(jpeg_quality)?)?;
    std::fs::write(dir.join(depth_name), shot.depth_png()?)?;
    Ok(())
}

fn save_calibration(dir: &Path, record: &CalibrationRecord) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let filename = dir.join(record.file_name());
    std::fs::write(&filename, format!("{}\n", record.to_json_pretty()?))?;
    Ok(filename)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.split_off(header_end.min(data.len()));
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json_response(stream, status, &json!({"error": message}))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    write_response(stream, status, "application/json", &serde_json::to_vec(body)?)
}

fn write_empty_response(stream: &mut TcpStream, status: u16) -> Result<()> {
    write_response(stream, status, "text/plain", &[])
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    /// JSON body of the device routes. An empty body reads as no fields.
    fn device(&self) -> Result<DeviceRequest> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(DeviceRequest::default());
        }
        let mut parsed: DeviceRequest = serde_json::from_slice(&self.body)
            .map_err(|e| anyhow!("invalid request body: {}", e))?;
        parsed.serial = parsed.serial.filter(|s| !s.trim().is_empty());
        Ok(parsed)
    }

    /// Percent-decoded value of a query parameter. Empty values read as absent.
    fn query(&self, key: &str) -> Option<String> {
        let (_, query) = self.raw_path.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    }
}
