// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of VP9 superframes (Annex B) into their frames.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;

use crate::codec::vp9::parser::ParseError;
use crate::codec::vp9::parser::ParseResult;

/// Value of the 3 most significant bits of the superframe marker byte.
pub const SUPERFRAME_MARKER: u8 = 0x06;
pub const MAX_FRAMES_IN_SUPERFRAME: usize = 8;

/// The trailing index of a superframe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperframeIndex {
    frame_sizes: Vec<usize>,
    index_size: usize,
}

impl SuperframeIndex {
    /// Reads the index at the end of `chunk`. Returns `None` when the chunk carries a single
    /// frame.
    pub fn parse(chunk: &[u8]) -> ParseResult<Option<Self>> {
        let Some(&marker) = chunk.last() else {
            return Ok(None);
        };

        if marker >> 5 != SUPERFRAME_MARKER {
            return Ok(None);
        }

        let bytes_per_framesize = usize::from((marker >> 3) & 0x3) + 1;
        let frames_in_superframe = usize::from(marker & 0x7) + 1;
        let index_size = 2 + bytes_per_framesize * frames_in_superframe;

        if chunk.len() < index_size {
            return Ok(None);
        }

        let index = &chunk[chunk.len() - index_size..];
        if index[0] != marker {
            // Both markers have to match for this to be a superframe.
            return Ok(None);
        }

        let frame_sizes: Vec<usize> = index[1..index_size - 1]
            .chunks_exact(bytes_per_framesize)
            .map(|size| LittleEndian::read_uint(size, bytes_per_framesize) as usize)
            .collect();

        let total = frame_sizes.iter().try_fold(0usize, |acc, &s| acc.checked_add(s));
        match total {
            Some(total) if total + index_size <= chunk.len() => (),
            _ => {
                return Err(ParseError::Malformed(format!(
                    "superframe sizes {:?} overrun a {} byte chunk",
                    frame_sizes,
                    chunk.len()
                )))
            }
        }

        Ok(Some(Self {
            frame_sizes,
            index_size,
        }))
    }

    pub fn frame_sizes(&self) -> &[usize] {
        &self.frame_sizes
    }

    /// Size of the index in bytes, both markers included.
    pub fn index_size(&self) -> usize {
        self.index_size
    }
}

/// Location of one frame inside a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubFrame {
    pub offset: usize,
    pub size: usize,
    /// Position of the frame within the chunk.
    pub index: usize,
    /// Whether this is the last frame of the chunk.
    pub last: bool,
}

impl SubFrame {
    pub fn data<'a>(&self, chunk: &'a [u8]) -> &'a [u8] {
        &chunk[self.offset..self.offset + self.size]
    }
}

/// Hands out the frames of a chunk one at a time.
///
/// The same chunk is presented again for every frame it contains; the splitter remembers how many
/// frames have been consumed so far.
#[derive(Debug, Default)]
pub struct SuperframeSplitter {
    frame_sizes: Vec<usize>,
    cursor: usize,
}

impl SuperframeSplitter {
    /// Returns the next frame of `chunk` without consuming it.
    pub fn next_frame(&mut self, chunk: &[u8]) -> ParseResult<SubFrame> {
        let frame_sizes = match SuperframeIndex::parse(chunk)? {
            Some(index) => index.frame_sizes,
            None => vec![chunk.len()],
        };

        if self.cursor == 0 {
            if frame_sizes.len() > 1 {
                debug!("Superframe with frame sizes {:?}", frame_sizes);
            }
            self.frame_sizes = frame_sizes;
        } else if frame_sizes.len() != self.frame_sizes.len() {
            let expected = self.frame_sizes.len();
            self.reset();
            return Err(ParseError::Malformed(format!(
                "superframe frame count changed from {} to {}",
                expected,
                frame_sizes.len()
            )));
        }

        let offset = self.frame_sizes[..self.cursor].iter().sum();

        Ok(SubFrame {
            offset,
            size: self.frame_sizes[self.cursor],
            index: self.cursor,
            last: self.cursor + 1 == self.frame_sizes.len(),
        })
    }

    /// Consumes the frame last returned by [`SuperframeSplitter::next_frame`]. Returns `true` once
    /// every frame of the chunk has been consumed.
    pub fn advance(&mut self) -> bool {
        self.cursor += 1;

        if self.cursor >= self.frame_sizes.len() {
            self.reset();
            return true;
        }

        false
    }

    /// Forgets the current chunk.
    pub fn reset(&mut self) {
        self.frame_sizes.clear();
        self.cursor = 0;
    }
}
