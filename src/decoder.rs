// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types shared by the decoders and their clients.

pub mod stateless;

use crate::backend::OutputSurface;
use crate::Resolution;

/// Timestamp unit: decoders derive missing timestamps on a 90 kHz clock.
pub const TIMESTAMP_CLOCK_RATE: u64 = 90_000;

/// A chunk of compressed data submitted by the client.
///
/// The decoder consumes the chunk in place: [`Bitstream::consumed`] only moves once every frame
/// of the chunk has been submitted, so a chunk must be presented again until it is empty.
#[derive(Debug)]
pub struct Bitstream<'a> {
    data: &'a [u8],
    offset: usize,
    /// Presentation timestamp of the chunk, if known.
    pub timestamp: Option<u64>,
}

impl<'a> Bitstream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            timestamp: None,
        }
    }

    pub fn with_timestamp(data: &'a [u8], timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::new(data)
        }
    }

    /// The bytes not consumed yet.
    pub fn data(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.offset..]
    }

    /// Number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn consume_all(&mut self) {
        self.offset = self.data.len();
    }
}

/// Output surface offered by the client for the next frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub resolution: Resolution,
    /// Bits per sample.
    pub bit_depth: u8,
    /// Set while the client still holds the surface.
    pub locked: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicStruct {
    #[default]
    Progressive,
}

/// A frame ready to be displayed once its decode task has run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub surface: OutputSurface,
    pub timestamp: u64,
    /// Display order of the frame.
    pub frame_order: u32,
    /// Visible area of the frame.
    pub crop: Resolution,
    pub pic_struct: PicStruct,
}
