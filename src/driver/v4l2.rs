//! V4L2 depth camera backend.
//!
//! A depth camera shows up as several `/dev/video*` nodes sharing one
//! `bus_info`. This backend pairs the node that offers `Z16 ` (depth) with a
//! node that offers packed RGB/BGR (color), and uses the bus as the serial.
//!
//! Plain V4L2 exposes no optical calibration, so profiles carry no intrinsics
//! and depth→color extrinsics are unsupported. Alignment and calibration
//! extraction therefore fail cleanly on this backend.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ouroboros::self_referencing;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::{
    DeviceInfo, Driver, DriverError, DriverErrorKind, Extrinsics, Frame, FrameBundle, Pipeline,
    PipelineProfile, PixelFormat, StreamKind, StreamProfile, StreamSpec, VideoProfile,
};
use crate::frame::ImageBuffer;

const FOURCC_Z16: &[u8; 4] = b"Z16 ";
const FOURCC_RGB3: &[u8; 4] = b"RGB3";
const FOURCC_BGR3: &[u8; 4] = b"BGR3";
const EBUSY: i32 = 16;
const BUFFER_COUNT: u32 = 4;

#[derive(Clone, Debug)]
struct NodePair {
    bus_info: String,
    card: String,
    driver: String,
    color: PathBuf,
    depth: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct V4l2Driver {
    dev_dir: PathBuf,
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
        }
    }

    fn scan(&self) -> Result<Vec<NodePair>, DriverError> {
        let entries = std::fs::read_dir(&self.dev_dir).map_err(|err| {
            DriverError::new(
                DriverErrorKind::Context,
                format!("cannot list {}: {}", self.dev_dir.display(), err),
            )
        })?;

        let mut by_bus: BTreeMap<String, NodePair> = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_video = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("video"))
                .unwrap_or(false);
            if !is_video {
                continue;
            }
            let Ok(device) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            let formats: Vec<FourCC> = device
                .enum_formats()
                .into_iter()
                .flatten()
                .map(|desc| desc.fourcc)
                .collect();
            let has_depth = formats.contains(&FourCC::new(FOURCC_Z16));
            let has_color = formats
                .iter()
                .any(|f| *f == FourCC::new(FOURCC_RGB3) || *f == FourCC::new(FOURCC_BGR3));
            if !has_depth && !has_color {
                continue;
            }
            log::debug!(
                "v4l2 node {} on {} (depth={}, color={})",
                path.display(),
                caps.bus,
                has_depth,
                has_color
            );

            let pair = by_bus.entry(caps.bus.clone()).or_insert_with(|| NodePair {
                bus_info: caps.bus.clone(),
                card: caps.card.clone(),
                driver: caps.driver.clone(),
                color: PathBuf::new(),
                depth: PathBuf::new(),
            });
            if has_depth && pair.depth.as_os_str().is_empty() {
                pair.depth = path;
            } else if has_color && pair.color.as_os_str().is_empty() {
                pair.color = path;
            }
        }

        Ok(by_bus
            .into_values()
            .filter(|pair| {
                !pair.color.as_os_str().is_empty() && !pair.depth.as_os_str().is_empty()
            })
            .collect())
    }
}

impl Driver for V4l2Driver {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn query_devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        Ok(self
            .scan()?
            .into_iter()
            .map(|pair| DeviceInfo {
                serial: pair.bus_info,
                name: pair.card,
                product_line: pair.driver,
            })
            .collect())
    }

    fn open_pipeline(
        &self,
        serial: &str,
        streams: &[StreamSpec],
    ) -> Result<Box<dyn Pipeline>, DriverError> {
        let pair = self
            .scan()?
            .into_iter()
            .find(|pair| pair.bus_info == serial)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::NotFound, format!("no v4l2 pair on {serial}"))
            })?;
        if streams.is_empty() {
            return Err(DriverError::new(
                DriverErrorKind::Unsupported,
                "no streams requested",
            ));
        }

        let mut nodes = Vec::with_capacity(streams.len());
        let mut profiles = Vec::with_capacity(streams.len());
        for spec in streams {
            let (path, fourcc) = match (spec.kind, spec.format) {
                (StreamKind::Color, PixelFormat::Rgb8) => (&pair.color, FOURCC_RGB3),
                (StreamKind::Color, PixelFormat::Bgr8) => (&pair.color, FOURCC_BGR3),
                (StreamKind::Depth, PixelFormat::Z16) => (&pair.depth, FOURCC_Z16),
                (kind, format) => {
                    return Err(DriverError::new(
                        DriverErrorKind::Unsupported,
                        format!("{kind} as {format} is not available over v4l2"),
                    ))
                }
            };
            if nodes.iter().any(|node: &NodeCapture| node.kind == spec.kind) {
                return Err(DriverError::new(
                    DriverErrorKind::Unsupported,
                    format!("{} requested twice", spec.kind),
                ));
            }
            nodes.push(NodeCapture::open(path, spec, fourcc)?);
            profiles.push(StreamProfile {
                kind: spec.kind,
                format: spec.format,
                fps: spec.fps,
                video: Some(VideoProfile {
                    width: spec.width,
                    height: spec.height,
                    intrinsics: None,
                }),
            });
        }

        log::info!(
            "v4l2 pipeline on {} ({} + {})",
            pair.bus_info,
            pair.color.display(),
            pair.depth.display()
        );
        Ok(Box::new(V4l2Pipeline {
            profile: PipelineProfile {
                serial: serial.to_string(),
                streams: profiles,
                depth_scale: 0.001,
            },
            nodes,
            started: Instant::now(),
            frame_number: 0,
        }))
    }
}

#[self_referencing]
struct NodeStream {
    device: Device,
    #[borrows(device)]
    #[not_covariant]
    stream: MmapStream<'this>,
}

struct NodeCapture {
    kind: StreamKind,
    spec: StreamSpec,
    state: Option<NodeStream>,
}

impl NodeCapture {
    fn open(path: &Path, spec: &StreamSpec, fourcc: &[u8; 4]) -> Result<Self, DriverError> {
        let device = Device::with_path(path).map_err(io_error)?;
        let requested = Format::new(spec.width, spec.height, FourCC::new(fourcc));
        let actual = device.set_format(&requested).map_err(io_error)?;
        if actual.width != spec.width
            || actual.height != spec.height
            || actual.fourcc != requested.fourcc
        {
            return Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!(
                    "{} negotiated {}x{} {} instead of {}x{} {}",
                    path.display(),
                    actual.width,
                    actual.height,
                    actual.fourcc,
                    spec.width,
                    spec.height,
                    requested.fourcc
                ),
            ));
        }
        let params = v4l::video::capture::Parameters::with_fps(spec.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("v4l2: failed to set fps on {}: {}", path.display(), err);
        }

        let state = NodeStreamTryBuilder {
            device,
            stream_builder: |device| MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT),
        }
        .try_build()
        .map_err(io_error)?;
        Ok(Self {
            kind: spec.kind,
            spec: *spec,
            state: Some(state),
        })
    }

    fn next_image(&mut self) -> Result<ImageBuffer, DriverError> {
        let state = self.state.as_mut().ok_or_else(|| {
            DriverError::new(DriverErrorKind::Stopped, "pipeline stopped")
        })?;
        let expected =
            self.spec.width as usize * self.spec.height as usize * self.spec.format.bytes_per_pixel();
        let data = state.with_stream_mut(|stream| {
            stream.next().map(|(buf, _meta)| buf.get(..expected).map(<[u8]>::to_vec))
        });
        match data.map_err(io_error)? {
            Some(data) => Ok(ImageBuffer::new(
                self.spec.width,
                self.spec.height,
                self.spec.format,
                data,
            )),
            None => Err(DriverError::new(
                DriverErrorKind::Hardware,
                format!("short {} buffer", self.kind),
            )),
        }
    }
}

struct V4l2Pipeline {
    profile: PipelineProfile,
    nodes: Vec<NodeCapture>,
    started: Instant,
    frame_number: u64,
}

impl Pipeline for V4l2Pipeline {
    fn profile(&self) -> &PipelineProfile {
        &self.profile
    }

    fn wait_for_frames(&mut self) -> Result<FrameBundle, DriverError> {
        self.frame_number += 1;
        let mut frames = Vec::with_capacity(self.nodes.len());
        for node in &mut self.nodes {
            let image = node.next_image()?;
            frames.push(Frame {
                kind: node.kind,
                image,
                timestamp_ms: self.started.elapsed().as_secs_f64() * 1000.0,
                frame_number: self.frame_number,
            });
        }
        Ok(FrameBundle { frames })
    }

    fn extrinsics(&self, from: StreamKind, to: StreamKind) -> Result<Extrinsics, DriverError> {
        if from == to {
            return Ok(Extrinsics::identity());
        }
        Err(DriverError::new(
            DriverErrorKind::Unsupported,
            "v4l2 exposes no stream extrinsics",
        ))
    }

    fn set_emitter(&mut self, _enabled: bool) -> Result<bool, DriverError> {
        Ok(false)
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        for node in &mut self.nodes {
            node.state = None;
        }
        Ok(())
    }
}

fn io_error(err: io::Error) -> DriverError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => DriverErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => DriverErrorKind::Permission,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DriverErrorKind::Timeout,
        _ if err.raw_os_error() == Some(EBUSY) => DriverErrorKind::Busy,
        _ => DriverErrorKind::Hardware,
    };
    DriverError::new(kind, err.to_string())
}
