// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use bytes::Buf;
use thiserror::Error;

/// Error returned when a read cannot be satisfied by the underlying slice.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitReaderError {
    #[error("stream truncated: {requested} bits requested at bit {position} of {length}")]
    Truncated {
        position: u64,
        length: u64,
        requested: u8,
    },
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(u8),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// MSB-first bit reader over a fixed byte slice.
///
/// Every read is bounds-checked before any bit is consumed, so a failed read leaves the position
/// untouched.
pub struct BitReader<'a> {
    inner: bitreader::BitReader<'a>,
    length: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            inner: bitreader::BitReader::new(data),
            length: data.len() as u64 * 8,
        }
    }

    fn check_remaining(&self, num_bits: u8) -> Result<(), BitReaderError> {
        if self.length - self.inner.position() < u64::from(num_bits) {
            return Err(BitReaderError::Truncated {
                position: self.inner.position(),
                length: self.length,
                requested: num_bits,
            });
        }

        Ok(())
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, BitReaderError> {
        self.check_remaining(1)?;
        self.inner.read_bool().map_err(|_| BitReaderError::Truncated {
            position: self.inner.position(),
            length: self.length,
            requested: 1,
        })
    }

    /// Read up to 32 bits from the stream, most significant bit first.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: u8) -> Result<U, BitReaderError> {
        if num_bits > 32 {
            return Err(BitReaderError::TooManyBitsRequested(num_bits));
        }

        let value = if num_bits == 0 {
            0
        } else {
            self.check_remaining(num_bits)?;
            self.inner
                .read_u32(num_bits)
                .map_err(|_| BitReaderError::Truncated {
                    position: self.inner.position(),
                    length: self.length,
                    requested: num_bits,
                })?
        };

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Number of bits consumed so far.
    pub fn bits_decoded(&self) -> u64 {
        self.inner.position()
    }

    /// Number of bytes consumed so far, counting a partially read byte as whole.
    pub fn bytes_decoded(&self) -> u64 {
        (self.bits_decoded() + 7) / 8
    }
}

/// Iterator over IVF packets.
pub struct IvfIterator<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> IvfIterator<'a> {
    const FILE_HEADER_SIZE: u64 = 32;
    const FRAME_HEADER_SIZE: usize = 12;

    pub fn new(data: &'a [u8]) -> Self {
        let mut cursor = Cursor::new(data);

        // Skip the IVF file header entirely.
        cursor.set_position(Self::FILE_HEADER_SIZE.min(data.len() as u64));

        Self { cursor }
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        // Make sure we have a header.
        if self.cursor.remaining() < Self::FRAME_HEADER_SIZE {
            return None;
        }

        let len = self.cursor.get_u32_le() as usize;
        // Skip PTS.
        let _ = self.cursor.get_u64_le();

        if self.cursor.remaining() < len {
            return None;
        }

        let start = self.cursor.position() as usize;
        self.cursor.advance(len);

        Some(&self.cursor.get_ref()[start..start + len])
    }
}

/// Writes bits MSB-first into a byte vector. Used to synthesize bitstreams in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct BitWriter {
    out: Vec<u8>,
    nth_bit: u8,
    curr_byte: u8,
}

#[cfg(test)]
impl BitWriter {
    pub fn write_bit(&mut self, bit: bool) {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.push(self.curr_byte);
            self.nth_bit = 0;
            self.curr_byte = 0;
        }
    }

    pub fn write_bits(&mut self, bits: u8, value: u32) {
        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1);
        }
    }

    /// Writes a magnitude followed by a sign bit.
    pub fn write_signed(&mut self, bits: u8, value: i32) {
        self.write_bits(bits, value.unsigned_abs());
        self.write_bit(value < 0);
    }

    pub fn bits_written(&self) -> u64 {
        self.out.len() as u64 * 8 + u64::from(self.nth_bit)
    }

    /// Pads the last byte with zeroes and returns the written data.
    pub fn finish(mut self) -> Vec<u8> {
        if self.nth_bit != 0 {
            self.out.push(self.curr_byte);
        }

        self.out
    }
}
