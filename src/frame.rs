//! Decoded image buffers and per-device framesets.
//!
//! - `ImageBuffer`: owned, immediately usable pixel data for one stream
//! - `FrameSet`: the frames one device delivered in one wait, keyed by stream kind
//!
//! Every `FrameSet` owns its pixel data outright. Two consumers of the same
//! device never share a buffer, so a capture request and a streaming feed can
//! interleave freely without seeing each other's frames.

use std::collections::BTreeMap;
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::driver::{FrameBundle, PixelFormat, StreamKind};
use crate::error::EncodeError;

/// Scale applied to raw depth units before the colormap lookup.
pub const DEPTH_COLORMAP_ALPHA: f32 = 0.03;

// ----------------------------------------------------------------------------
// ImageBuffer
// ----------------------------------------------------------------------------

/// Owned pixel buffer. Multi-byte formats are little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    data: Vec<u8>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Solid RGB image.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    /// Z16 image from depth units.
    pub fn from_depth(width: u32, height: u32, depth: &[u16]) -> Self {
        let data = depth.iter().flat_map(|d| d.to_le_bytes()).collect();
        Self::new(width, height, PixelFormat::Z16, data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn expected_len(&self) -> usize {
        self.pixel_count() * self.format.bytes_per_pixel()
    }

    /// Reject buffers whose length disagrees with their dimensions.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.data.len() != self.expected_len() {
            return Err(EncodeError::BadBuffer {
                width: self.width,
                height: self.height,
                format: self.format,
                expected: self.expected_len(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Depth units of a Z16 buffer.
    pub fn depth_values(&self) -> Option<Vec<u16>> {
        if self.format != PixelFormat::Z16 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|px| u16::from_le_bytes([px[0], px[1]]))
                .collect(),
        )
    }

    /// Convert to packed RGB8 for display. Depth is run through the colormap.
    pub fn to_rgb8(&self) -> Result<ImageBuffer, EncodeError> {
        self.validate()?;
        let data = match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Y8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            PixelFormat::Y16 => self
                .data
                .chunks_exact(2)
                .flat_map(|px| [px[1], px[1], px[1]])
                .collect(),
            PixelFormat::Z16 => return Ok(colorize_depth(self, DEPTH_COLORMAP_ALPHA)),
            PixelFormat::Xyz32f => return Err(EncodeError::UnsupportedFormat(self.format)),
        };
        Ok(ImageBuffer::new(
            self.width,
            self.height,
            PixelFormat::Rgb8,
            data,
        ))
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, EncodeError> {
        let rgb = self.to_rgb8()?;
        let mut out = Vec::with_capacity(rgb.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality).write_image(
            &rgb.data,
            rgb.width,
            rgb.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }

    /// Lossless PNG. Z16/Y16 keep their full 16-bit range.
    pub fn encode_png(&self) -> Result<Vec<u8>, EncodeError> {
        self.validate()?;
        let mut out = Vec::new();
        let encoder = PngEncoder::new(&mut out);
        match self.format {
            PixelFormat::Z16 | PixelFormat::Y16 => {
                // The encoder expects native-endian samples.
                let native: Vec<u8> = self
                    .data
                    .chunks_exact(2)
                    .flat_map(|px| u16::from_le_bytes([px[0], px[1]]).to_ne_bytes())
                    .collect();
                encoder.write_image(&native, self.width, self.height, ExtendedColorType::L16)?;
            }
            PixelFormat::Y8 => {
                encoder.write_image(&self.data, self.width, self.height, ExtendedColorType::L8)?;
            }
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                let rgb = self.to_rgb8()?;
                encoder.write_image(&rgb.data, rgb.width, rgb.height, ExtendedColorType::Rgb8)?;
            }
            PixelFormat::Xyz32f => return Err(EncodeError::UnsupportedFormat(self.format)),
        }
        Ok(out)
    }
}

/// Map depth units to a blue-to-red ramp: `saturate(depth * alpha)` indexes a
/// JET-style palette. Zero depth (no return) maps to the dark-blue end.
pub fn colorize_depth(depth: &ImageBuffer, alpha: f32) -> ImageBuffer {
    let data = depth
        .data
        .chunks_exact(2)
        .flat_map(|px| {
            let raw = u16::from_le_bytes([px[0], px[1]]) as f32;
            let level = (raw * alpha).round().clamp(0.0, 255.0) / 255.0;
            jet(level)
        })
        .collect();
    ImageBuffer::new(depth.width, depth.height, PixelFormat::Rgb8, data)
}

fn jet(level: f32) -> [u8; 3] {
    let channel = |offset: f32| {
        let v = 1.5 - (4.0 * level - offset).abs();
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Place two images side by side. Both are converted to RGB8 first; the
/// shorter one is padded with black rows.
pub fn hstack(left: &ImageBuffer, right: &ImageBuffer) -> Result<ImageBuffer, EncodeError> {
    let left = left.to_rgb8()?;
    let right = right.to_rgb8()?;
    let height = left.height.max(right.height);
    let width = left.width + right.width;
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for row in 0..height {
        for image in [&left, &right] {
            let stride = image.width as usize * 3;
            if row < image.height {
                let start = row as usize * stride;
                data.extend_from_slice(&image.data[start..start + stride]);
            } else {
                data.resize(data.len() + stride, 0);
            }
        }
    }
    Ok(ImageBuffer::new(width, height, PixelFormat::Rgb8, data))
}

// ----------------------------------------------------------------------------
// FrameSet
// ----------------------------------------------------------------------------

/// Frames one device delivered in one wait.
#[derive(Clone, Debug)]
pub struct FrameSet {
    pub serial: String,
    /// Driver timestamp of the newest frame, milliseconds.
    pub timestamp_ms: f64,
    /// Host wall-clock time the frameset was assembled.
    pub captured_at: SystemTime,
    frames: BTreeMap<StreamKind, ImageBuffer>,
}

impl FrameSet {
    pub fn new(serial: &str, timestamp_ms: f64) -> Self {
        Self {
            serial: serial.to_string(),
            timestamp_ms,
            captured_at: SystemTime::now(),
            frames: BTreeMap::new(),
        }
    }

    /// Key every frame of a driver bundle by its stream kind. A later frame of
    /// the same kind replaces an earlier one.
    pub fn from_bundle(serial: &str, bundle: FrameBundle) -> Self {
        let mut set = Self::new(serial, bundle.timestamp_ms());
        for frame in bundle.frames {
            set.insert(frame.kind, frame.image);
        }
        set
    }

    pub fn insert(&mut self, kind: StreamKind, image: ImageBuffer) -> Option<ImageBuffer> {
        self.frames.insert(kind, image)
    }

    pub fn get(&self, kind: StreamKind) -> Option<&ImageBuffer> {
        self.frames.get(&kind)
    }

    pub fn take(&mut self, kind: StreamKind) -> Option<ImageBuffer> {
        self.frames.remove(&kind)
    }

    pub fn color(&self) -> Option<&ImageBuffer> {
        self.get(StreamKind::Color)
    }

    pub fn depth(&self) -> Option<&ImageBuffer> {
        self.get(StreamKind::Depth)
    }

    pub fn contains(&self, kind: StreamKind) -> bool {
        self.frames.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        self.frames.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Requested kinds this frameset lacks.
    pub fn missing(&self, required: &[StreamKind]) -> Vec<StreamKind> {
        required
            .iter()
            .copied()
            .filter(|kind| !self.contains(*kind))
            .collect()
    }

    /// Drop every frame whose kind was not requested.
    pub fn retain(&mut self, required: &[StreamKind]) {
        self.frames.retain(|kind, _| required.contains(kind));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Frame;
    use anyhow::Result;

    #[test]
    fn solid_image_fills_every_pixel() {
        let image = ImageBuffer::solid(4, 2, [10, 20, 30]);
        assert_eq!(image.data().len(), 4 * 2 * 3);
        assert!(image.data().chunks_exact(3).all(|px| px == [10, 20, 30]));
    }

    #[test]
    fn bgr_is_swapped_to_rgb() -> Result<()> {
        let image = ImageBuffer::new(1, 1, PixelFormat::Bgr8, vec![1, 2, 3]);
        assert_eq!(image.to_rgb8()?.data(), &[3, 2, 1]);
        Ok(())
    }

    #[test]
    fn short_buffer_is_rejected_not_panicking() {
        let image = ImageBuffer::new(4, 4, PixelFormat::Rgb8, vec![0; 10]);
        assert!(matches!(
            image.encode_jpeg(80),
            Err(EncodeError::BadBuffer { expected: 48, .. })
        ));
    }

    #[test]
    fn depth_colormap_spans_blue_to_red() {
        let depth = ImageBuffer::from_depth(2, 1, &[0, 10_000]);
        let rgb = colorize_depth(&depth, DEPTH_COLORMAP_ALPHA);
        let near = &rgb.data()[0..3];
        let far = &rgb.data()[3..6];
        assert!(near[2] > near[0], "zero depth should be blue: {near:?}");
        assert!(far[0] > far[2], "saturated depth should be red: {far:?}");
    }

    #[test]
    fn jpeg_and_png_encoders_emit_signatures() -> Result<()> {
        let color = ImageBuffer::solid(8, 8, [200, 0, 0]);
        let jpeg = color.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let depth = ImageBuffer::from_depth(8, 8, &[1234; 64]);
        let png = depth.encode_png()?;
        assert_eq!(&png[1..4], b"PNG");
        Ok(())
    }

    #[test]
    fn hstack_places_images_side_by_side() -> Result<()> {
        let left = ImageBuffer::solid(2, 2, [255, 0, 0]);
        let right = ImageBuffer::solid(3, 1, [0, 255, 0]);
        let combined = hstack(&left, &right)?;
        assert_eq!((combined.width, combined.height), (5, 2));
        // Second row: red, red, then black padding for the shorter image.
        let row1 = &combined.data()[15..30];
        assert_eq!(&row1[0..3], &[255, 0, 0]);
        assert_eq!(&row1[6..9], &[0, 0, 0]);
        Ok(())
    }

    #[test]
    fn frameset_reports_missing_kinds() {
        let bundle = FrameBundle {
            frames: vec![Frame {
                kind: StreamKind::Depth,
                image: ImageBuffer::from_depth(1, 1, &[5]),
                timestamp_ms: 12.5,
                frame_number: 1,
            }],
        };
        let set = FrameSet::from_bundle("SN1", bundle);
        assert_eq!(set.timestamp_ms, 12.5);
        assert_eq!(
            set.missing(&[StreamKind::Color, StreamKind::Depth]),
            vec![StreamKind::Color]
        );
    }
}
