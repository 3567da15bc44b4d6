// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod stateless;

use std::sync::Arc;

use crate::gop::GopConfig;
use crate::lookahead::LookaheadConfig;
use crate::rate_control::RcConfig;
use crate::Resolution;

/// Specifies the encoder operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControl {
    /// The encoder shall maintain the constant bitrate
    ConstantBitrate(u64),

    /// The encoder shall maintain codec specific quality parameter constant (eg. QP for H.264)
    /// disregarding bitrate.
    ConstantQuality(u32),
}

impl RateControl {
    pub(crate) fn is_same_variant(left: &Self, right: &Self) -> bool {
        std::mem::discriminant(left) == std::mem::discriminant(right)
    }

    pub(crate) fn bitrate_target(&self) -> Option<u64> {
        match self {
            RateControl::ConstantBitrate(target) => Some(*target),
            RateControl::ConstantQuality(_) => None,
        }
    }
}

/// Dynamic parameters of the encoded stream that client may choose to change during the encoding
/// session without recreating the entire encoder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunings {
    /// The stream's [`RateControl`]
    pub rate_control: RateControl,
    /// Stream framerate in frames per second
    pub framerate: u32,
    /// Minimum value of codec specific quality parameter constant (eg. QP for H.264)
    pub min_quality: u32,
    /// Maximum value of codec specific quality parameter constant (eg. QP for H.264)
    pub max_quality: u32,
}

impl Default for Tunings {
    fn default() -> Self {
        Self {
            rate_control: RateControl::ConstantBitrate(200_000),
            framerate: 30,
            min_quality: 0,
            max_quality: u32::MAX,
        }
    }
}

/// Codec produced by the hardware. Only decides the CTB size the per-CTB maps are laid out on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    H264,
    #[default]
    Hevc,
    Vp9,
}

impl Codec {
    pub fn ctb_size(self) -> u32 {
        match self {
            Codec::H264 => 16,
            Codec::Hevc | Codec::Vp9 => 64,
        }
    }
}

/// Frame rate as a fraction. Time increments are counted in units of `1 / num` seconds, so one
/// picture normally lasts `denom` units.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub denom: u32,
}

impl Default for FrameRate {
    fn default() -> Self {
        Self { num: 30, denom: 1 }
    }
}

/// How a picture is predicted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodingType {
    Intra,
    Predicted,
    Bipredicted,
}

/// Static configuration of an encoding session.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub codec: Codec,
    pub frame_rate: FrameRate,
    pub rate_control: RateControl,
    pub rc: RcConfig,
    pub gop: GopConfig,
    /// Enables the look-ahead when set.
    pub lookahead: Option<LookaheadConfig>,
    /// Number of QP-delta buffers shared with the look-ahead. Derived from the look-ahead depth
    /// and the largest mini-GOP when not set, which is also the smallest size accepted.
    pub buffer_pool_size: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            codec: Codec::default(),
            frame_rate: FrameRate::default(),
            rate_control: RateControl::ConstantBitrate(2_000_000),
            rc: RcConfig::default(),
            gop: GopConfig::default(),
            lookahead: None,
            buffer_pool_size: None,
        }
    }
}

impl EncoderConfig {
    pub fn ctb_size(&self) -> u32 {
        self.codec.ctb_size()
    }

    pub fn num_ctbs(&self) -> usize {
        let (cols, rows) = self.resolution.blocks(self.ctb_size());
        (cols * rows) as usize
    }

    /// Frame duration in time increment units.
    pub fn frame_duration(&self) -> u32 {
        self.frame_rate.denom
    }
}

/// Encoder's input metadata
#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    pub timestamp: u64,
    /// Time elapsed since the previous picture, in units of `1 / FrameRate::num` seconds.
    pub time_increment: u32,
    pub force_keyframe: bool,
}

/// Luma plane of an input picture. The chroma planes are never looked at by this crate and stay
/// with the caller.
///
/// Cloning is cheap: the plane is shared.
#[derive(Clone)]
pub struct Picture {
    resolution: Resolution,
    stride: usize,
    luma: Arc<[u8]>,
}

impl Picture {
    pub fn new(resolution: Resolution, luma: impl Into<Arc<[u8]>>) -> Self {
        Self::with_stride(resolution, resolution.width as usize, luma)
    }

    pub fn with_stride(resolution: Resolution, stride: usize, luma: impl Into<Arc<[u8]>>) -> Self {
        Self {
            resolution,
            stride,
            luma: luma.into(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    /// Whether the plane holds every pixel of the picture.
    pub fn is_complete(&self) -> bool {
        let (width, height) = (
            self.resolution.width as usize,
            self.resolution.height as usize,
        );
        if width == 0 || height == 0 {
            return false;
        }
        self.stride >= width && self.luma.len() >= self.stride * (height - 1) + width
    }
}

impl std::fmt::Debug for Picture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("resolution", &self.resolution)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Encoder's coded output.
#[derive(Debug)]
pub struct CodedPicture {
    /// [`FrameMetadata`] of the frame that is compressed in [`Self::bitstream`]
    pub metadata: FrameMetadata,
    pub coding_type: CodingType,
    pub temporal_id: u32,
    /// Picture QP
    pub qp: u32,
    /// The picture was coded as a skipped picture, either as decided by the rate control or
    /// because it was dropped after overflowing the buffer.
    pub skipped: bool,
    pub bitstream: Vec<u8>,
}

impl From<CodedPicture> for Vec<u8> {
    fn from(value: CodedPicture) -> Self {
        value.bitstream
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn get_test_frame_t(ts: u64, max_ts: u64) -> f32 {
        2.0 * std::f32::consts::PI * (ts as f32) / (max_ts as f32)
    }

    /// Generates the luma of a gradient with a dot moving along a Lissajous curve.
    pub fn gen_test_frame<F>(frame_width: usize, frame_height: usize, t: f32, mut set_pix: F)
    where
        F: FnMut(usize, usize, f32),
    {
        let width = frame_width as f32;
        let height = frame_height as f32;
        let (sin, cos) = f32::sin_cos(t);

        // Pick the dot position
        let dot_col = height * (1.1 + 2.0 * sin * cos) / 2.2;
        let dot_row = width * (1.1 + sin) / 2.2;
        let dot_size2 = (width.min(height) * 0.05).powi(2);

        for frame_row in 0..frame_height {
            for frame_col in 0..frame_width {
                let row = frame_row as f32;
                let col = frame_col as f32;

                let dist = (dot_col - col).powi(2) + (dot_row - row).powi(2);

                let y = if dist < dot_size2 {
                    0.0
                } else {
                    (row + col) / (width + height)
                };

                set_pix(frame_col, frame_row, y);
            }
        }
    }

    pub fn gen_test_picture(resolution: Resolution, t: f32) -> Picture {
        const MAX_COMP_VAL: f32 = 0xff as f32;

        let (width, height) = (resolution.width as usize, resolution.height as usize);
        let mut luma = vec![0u8; width * height];
        gen_test_frame(width, height, t, |col, row, y| {
            luma[row * width + col] = (y * MAX_COMP_VAL).clamp(0.0, MAX_COMP_VAL) as u8;
        });

        Picture::new(resolution, luma)
    }

    /// `count` pictures of the moving dot sequence with their metadata.
    pub fn gen_test_sequence(
        resolution: Resolution,
        count: u64,
    ) -> impl Iterator<Item = (FrameMetadata, Picture)> {
        (0..count).map(move |ts| {
            let meta = FrameMetadata {
                timestamp: ts,
                time_increment: 1,
                force_keyframe: false,
            };
            (meta, gen_test_picture(resolution, get_test_frame_t(ts, count)))
        })
    }

    #[test]
    fn picture_completeness() {
        let resolution = Resolution::from((16, 4));
        assert!(Picture::new(resolution, vec![0u8; 64]).is_complete());
        assert!(!Picture::new(resolution, vec![0u8; 63]).is_complete());
        assert!(Picture::with_stride(resolution, 32, vec![0u8; 32 * 3 + 16]).is_complete());
        assert!(!Picture::with_stride(resolution, 8, vec![0u8; 64]).is_complete());
    }

    #[test]
    fn test_sequence_moves() {
        let resolution = Resolution::from((64, 48));
        let pictures = gen_test_sequence(resolution, 8)
            .map(|(_, picture)| picture)
            .collect::<Vec<_>>();

        assert_eq!(pictures.len(), 8);
        assert_ne!(pictures[0].luma(), pictures[1].luma());
        assert!(pictures.iter().all(Picture::is_complete));
    }
}
