// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the collaborators a decoder relies on.
//!
//! Pixel memory is owned by an [`Allocator`], which hands out reference-counted frame handles. The
//! hardware is driven through an [`Accelerator`]. The decoder never frees memory itself: it only
//! increments and decrements the counts of the handles it holds.

#[cfg(test)]
pub(crate) mod dummy;

use thiserror::Error;

use crate::decoder::stateless::vp9::picture_params::PictureParameters;

/// Identifier of a frame buffer owned by an [`Allocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameMemId(pub u32);

/// Opaque description of the surface a decoded frame is presented through.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputSurface(pub u64);

/// Error returned by collaborator methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unknown frame handle {0:?}")]
    UnknownHandle(FrameMemId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by collaborator methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failure reported while waiting for the hardware to finish a frame. Both are unrecoverable.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("GPU hang detected")]
    GpuHang,
    #[error("device failure")]
    DeviceFailed,
}

/// Owner of the decoded picture memory.
pub trait Allocator: Send {
    /// Returns a handle that is not referenced by anyone, or `None` if all are in use.
    fn acquire_free_handle(&mut self) -> Option<FrameMemId>;
    fn increase_reference(&mut self, id: FrameMemId) -> BackendResult<()>;
    fn decrease_reference(&mut self, id: FrameMemId) -> BackendResult<()>;
    /// Returns the surface through which `id` is presented to the client.
    fn resolve_output_surface(&mut self, id: FrameMemId) -> BackendResult<OutputSurface>;
}

/// Hardware decode device.
///
/// Submission happens with the decoder session locked, while [`Accelerator::wait_for_completion`]
/// and [`Accelerator::copy_surface`] are called from a deferred task without any lock held, so
/// implementations must be shareable across threads.
pub trait Accelerator: Send + Sync {
    /// Starts decoding into `target`.
    fn begin_submission(&self, target: FrameMemId) -> BackendResult<()>;
    /// Sends the parameters and the compressed frame of the current submission.
    fn execute(&self, params: &PictureParameters, bitstream: &[u8]) -> BackendResult<()>;
    /// Ends the current submission.
    fn end_submission(&self) -> BackendResult<()>;
    /// Blocks until decoding into `target` has finished.
    fn wait_for_completion(&self, target: FrameMemId) -> Result<(), WaitError>;
    /// Copies the pixels of `src` into `dst`. Used to display a frame again.
    fn copy_surface(&self, src: FrameMemId, dst: FrameMemId) -> BackendResult<()>;
}
