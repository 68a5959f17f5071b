// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core of a hardware-accelerated VP9 decoder.
//!
//! The crate parses VP9 frame headers, keeps track of the reference frames and of the frames in
//! flight, and drives an external [`Accelerator`](backend::Accelerator) through the
//! [`Vp9Decoder`](decoder::stateless::vp9::Vp9Decoder) pipeline. Pixel memory and the hardware
//! itself are provided by the client through the traits of the [`backend`] module.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;

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

    /// Rounds both dimensions up to a multiple of `alignment`, which must be a power of two.
    pub fn round(mut self, alignment: u32) -> Self {
        self.width = (self.width + alignment - 1) & !(alignment - 1);
        self.height = (self.height + alignment - 1) & !(alignment - 1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
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
