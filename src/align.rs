//! Depth-to-color alignment.
//!
//! Reprojects a depth image into the pixel grid of the color stream so that
//! pixel (u, v) of the aligned depth and of the color image observe the same
//! surface point.

use crate::driver::{Extrinsics, Intrinsics, PipelineProfile, StreamKind};
use crate::frame::{FrameSet, ImageBuffer};

/// Precomputed depth→color reprojection for one session's profile.
#[derive(Clone, Debug)]
pub struct Aligner {
    target: StreamKind,
    depth: Intrinsics,
    color: Intrinsics,
    depth_to_color: Extrinsics,
    depth_scale: f32,
}

impl Aligner {
    /// Build an aligner for a live profile. Fails with a human-readable
    /// reason when the profile lacks intrinsics for either stream.
    pub fn new(
        profile: &PipelineProfile,
        target: StreamKind,
        depth_to_target: Extrinsics,
    ) -> Result<Self, String> {
        let depth = profile
            .intrinsics(StreamKind::Depth)
            .ok_or_else(|| "depth stream exposes no intrinsics".to_string())?;
        let color = profile
            .intrinsics(target)
            .ok_or_else(|| format!("{target} stream exposes no intrinsics"))?;
        if profile.depth_scale <= 0.0 {
            return Err(format!("invalid depth scale {}", profile.depth_scale));
        }
        Ok(Self {
            target,
            depth,
            color,
            depth_to_color: depth_to_target,
            depth_scale: profile.depth_scale,
        })
    }

    pub fn target(&self) -> StreamKind {
        self.target
    }

    /// Replace the frameset's depth image with its aligned counterpart. A
    /// frameset without depth is left untouched.
    pub fn process(&self, frames: &mut FrameSet) {
        if let Some(depth) = frames.take(StreamKind::Depth) {
            let aligned = self.align_depth(&depth).unwrap_or(depth);
            frames.insert(StreamKind::Depth, aligned);
        }
    }

    /// Returns `None` when the input is not a well-formed Z16 image of the
    /// depth stream's resolution.
    pub fn align_depth(&self, depth: &ImageBuffer) -> Option<ImageBuffer> {
        if depth.width != self.depth.width || depth.height != self.depth.height {
            return None;
        }
        let values = depth.depth_values()?;
        if values.len() != depth.pixel_count() {
            return None;
        }

        let out_w = self.color.width as usize;
        let out_h = self.color.height as usize;
        let mut out = vec![0u16; out_w * out_h];
        let in_w = self.depth.width as usize;

        for (index, &raw) in values.iter().enumerate() {
            if raw == 0 {
                continue;
            }
            let u = (index % in_w) as f32;
            let v = (index / in_w) as f32;
            let z = raw as f32 * self.depth_scale;
            let point = [
                (u - self.depth.cx) / self.depth.fx * z,
                (v - self.depth.cy) / self.depth.fy * z,
                z,
            ];
            let [x, y, z] = self.depth_to_color.transform(point);
            if z <= 0.0 {
                continue;
            }
            let cu = (x / z * self.color.fx + self.color.cx).round();
            let cv = (y / z * self.color.fy + self.color.cy).round();
            if cu < 0.0 || cv < 0.0 || cu >= out_w as f32 || cv >= out_h as f32 {
                continue;
            }
            let slot = &mut out[cv as usize * out_w + cu as usize];
            // Nearest surface wins.
            if *slot == 0 || raw < *slot {
                *slot = raw;
            }
        }

        Some(ImageBuffer::from_depth(
            self.color.width,
            self.color.height,
            &out,
        ))
    }
}
