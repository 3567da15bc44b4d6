// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software side of a hardware video encoder: look-ahead analysis, rate control, adaptive GOP
//! decisions and the pool of QP-delta buffers shared with the hardware.
//!
//! The hardware encode call itself is abstracted by [`encoder::stateless::EncodeBackend`].

pub mod backend;
pub mod buffer_pool;
pub mod encoder;
pub mod gop;
pub mod lookahead;
pub mod rate_control;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Number of `block`x`block` units needed to cover the resolution.
    pub fn blocks(&self, block: u32) -> (u32, u32) {
        (self.width.div_ceil(block), self.height.div_ceil(block))
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// Whether a call may wait for its result.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}
