// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the hardware API targeted by these decoders. The decoders themselves
//! hold the decoding state (reference frames, frames in flight, persistent header state) so the
//! accelerator doesn't need to.

pub mod vp9;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::FrameMemId;
use crate::backend::WaitError;
use crate::codec::vp9::parser::ParseError;
use crate::Resolution;

/// Unrecoverable device failure. Once reported, every further call of the session fails with it.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("GPU hang")]
    GpuHang,
    #[error("device failed")]
    DeviceFailed,
}

impl From<WaitError> for FatalError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::GpuHang => FatalError::GpuHang,
            WaitError::DeviceFailed => FatalError::DeviceFailed,
        }
    }
}

/// Error returned by the [`Vp9Decoder`](vp9::Vp9Decoder) methods.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder is not initialized")]
    NotInitialized,
    #[error("output surface is locked, another one is needed")]
    NeedMoreSurfaces,
    #[error("device busy, retry once pending frames have completed")]
    DeviceBusy,
    #[error("incompatible stream parameters: {0}")]
    Incompatible(String),
    #[error("output surfaces must be reallocated to {}x{}", .0.width, .0.height)]
    Realloc(Resolution),
    #[error("malformed bitstream: {0}")]
    Malformed(ParseError),
    #[error("unsupported bitstream: {0}")]
    Unsupported(ParseError),
    #[error("frame {0:?} is already in flight")]
    DuplicateSubmission(FrameMemId),
    #[error("fatal error: {0}")]
    Fatal(#[from] FatalError),
    #[error(transparent)]
    BackendError(#[from] BackendError),
}

impl From<ParseError> for DecodeError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Unsupported(_) => DecodeError::Unsupported(e),
            ParseError::Truncated(_) | ParseError::Malformed(_) => DecodeError::Malformed(e),
        }
    }
}

impl DecodeError {
    /// Whether the same call may succeed later without any change to the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DecodeError::DeviceBusy | DecodeError::NeedMoreSurfaces
        )
    }
}
