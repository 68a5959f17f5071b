// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::backend::Allocator;
use crate::backend::BackendResult;
use crate::backend::FrameMemId;
use crate::codec::vp9::parser::Header;
use crate::codec::vp9::parser::NUM_REF_FRAMES;
use crate::Resolution;

/// A decoded frame held in a reference slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefEntry {
    pub handle: FrameMemId,
    pub resolution: Resolution,
}

/// Copy of the reference slots taken when a frame is submitted.
pub type RefSnapshot = [Option<RefEntry>; NUM_REF_FRAMES];

/// The eight VP9 reference slots. Every filled slot holds exactly one allocator reference on its
/// handle.
#[derive(Debug, Default)]
pub struct ReferenceFrameTable {
    slots: RefSnapshot,
}

impl ReferenceFrameTable {
    /// Installs `handle`, the decode target of `hdr`, in every slot selected by
    /// `refresh_frame_flags` as well as in every empty slot. Nothing changes for a re-shown frame.
    ///
    /// Every selected slot is visited even if a reference count update fails; the first failure
    /// is returned. A slot whose new reference could not be taken keeps its previous entry.
    pub fn update_ref_frames(
        &mut self,
        handle: FrameMemId,
        hdr: &Header,
        allocator: &mut dyn Allocator,
    ) -> BackendResult<()> {
        if hdr.show_existing_frame {
            return Ok(());
        }

        let mut result = Ok(());

        for (i, slot) in self.slots.iter_mut().enumerate() {
            // An empty slot can only be seen before the first key frame, e.g. when the stream
            // starts with an intra-only frame. Filling it keeps later lookups valid.
            if hdr.refresh_frame_flags & (1 << i) == 0 && slot.is_some() {
                continue;
            }

            if let Err(e) = allocator.increase_reference(handle) {
                if result.is_ok() {
                    result = Err(e);
                }
                continue;
            }

            let previous = slot.replace(RefEntry {
                handle,
                resolution: hdr.resolution(),
            });

            if let Some(previous) = previous {
                let released = allocator.decrease_reference(previous.handle);
                if result.is_ok() {
                    result = released;
                }
            }
        }

        debug!(
            "Reference slots after {:?}: {:?}",
            handle,
            self.slots.map(|s| s.map(|e| e.handle.0))
        );

        result
    }

    /// Releases and empties every slot. All slots are emptied even if releasing one of them
    /// fails; the first failure is returned.
    pub fn clean_ref_list(&mut self, allocator: &mut dyn Allocator) -> BackendResult<()> {
        let mut result = Ok(());

        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.take() {
                let released = allocator.decrease_reference(entry.handle);
                if result.is_ok() {
                    result = released;
                }
            }
        }

        result
    }

    pub fn snapshot(&self) -> RefSnapshot {
        self.slots
    }

    pub fn slot(&self, idx: usize) -> Option<&RefEntry> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Handles of all slots, `None` for empty ones.
    pub fn handles(&self) -> [Option<FrameMemId>; NUM_REF_FRAMES] {
        self.slots.map(|s| s.map(|e| e.handle))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
