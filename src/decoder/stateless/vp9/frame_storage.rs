// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bookkeeping of the frames that have been submitted but not yet retired.
//!
//! Each entry pins its decode target and the references it was decoded against, so that none of
//! them can be recycled by the allocator while the hardware may still read from them.

use std::collections::VecDeque;

use log::debug;
use log::warn;

use crate::backend::Allocator;
use crate::backend::BackendResult;
use crate::backend::FrameMemId;
use crate::codec::vp9::dpb::RefEntry;
use crate::codec::vp9::dpb::RefSnapshot;
use crate::codec::vp9::parser::Header;
use crate::decoder::stateless::DecodeError;

/// A frame in flight.
#[derive(Clone, Debug)]
pub struct DecoderFrame {
    /// Decode target.
    pub handle: FrameMemId,
    /// Reference slots at submission time.
    pub refs: RefSnapshot,
    pub refresh_frame_flags: u8,
    pub show_frame: bool,
    /// Slot displayed again by a show_existing_frame.
    pub shown_slot: Option<RefEntry>,
    pub is_decoded: bool,
    /// References acquired by [`FrameStorage::add`], released on completion.
    held: Vec<FrameMemId>,
}

impl DecoderFrame {
    pub fn new(handle: FrameMemId, hdr: &Header, refs: RefSnapshot) -> Self {
        let shown_slot = if hdr.show_existing_frame {
            refs[usize::from(hdr.frame_to_show_map_idx)]
        } else {
            None
        };

        Self {
            handle,
            refs,
            refresh_frame_flags: hdr.refresh_frame_flags,
            show_frame: hdr.show_frame,
            shown_slot,
            is_decoded: false,
            held: Vec::new(),
        }
    }

    pub fn show_existing_frame(&self) -> bool {
        self.shown_slot.is_some()
    }

    fn release(&mut self, allocator: &mut dyn Allocator) -> BackendResult<()> {
        let mut result = Ok(());

        for handle in self.held.drain(..) {
            let released = allocator.decrease_reference(handle);
            if let Err(e) = &released {
                warn!("Failed to release {:?}: {}", handle, e);
            }
            if result.is_ok() {
                result = released;
            }
        }

        result
    }
}

/// Frames in submission order.
#[derive(Debug, Default)]
pub struct FrameStorage {
    frames: VecDeque<DecoderFrame>,
}

impl FrameStorage {
    /// Registers `frame` and acquires its references: the decode target, plus the re-shown slot
    /// for a show_existing_frame or every filled reference slot otherwise.
    pub fn add(
        &mut self,
        mut frame: DecoderFrame,
        allocator: &mut dyn Allocator,
    ) -> Result<(), DecodeError> {
        if self.contains(frame.handle) {
            return Err(DecodeError::DuplicateSubmission(frame.handle));
        }

        let mut to_hold = vec![frame.handle];
        match frame.shown_slot {
            Some(shown) => to_hold.push(shown.handle),
            None => to_hold.extend(frame.refs.iter().flatten().map(|entry| entry.handle)),
        }

        for handle in to_hold {
            if let Err(e) = allocator.increase_reference(handle) {
                // Release failures are dropped in favor of `e`.
                let _ = frame.release(allocator);
                return Err(e.into());
            }
            frame.held.push(handle);
        }

        debug!(
            "Frame {:?} in flight, holding {:?}",
            frame.handle, frame.held
        );
        self.frames.push_back(frame);

        Ok(())
    }

    /// Marks the frame decoding into `handle` as done. Unknown handles are ignored.
    pub fn decode_frame(&mut self, handle: FrameMemId) {
        match self.frames.iter_mut().find(|f| f.handle == handle) {
            Some(frame) => frame.is_decoded = true,
            None => debug!("No frame in flight for {:?}", handle),
        }
    }

    /// Retires every decoded frame, releasing its references. Undecoded frames keep their order.
    pub fn complete_frames(&mut self, allocator: &mut dyn Allocator) -> BackendResult<()> {
        let mut result = Ok(());
        let mut pending = VecDeque::with_capacity(self.frames.len());

        for mut frame in self.frames.drain(..) {
            if !frame.is_decoded {
                pending.push_back(frame);
                continue;
            }

            let released = frame.release(allocator);
            if result.is_ok() {
                result = released;
            }
        }

        self.frames = pending;
        result
    }

    /// Drops the frame decoding into `handle` without waiting for it, releasing its references.
    /// Unknown handles are ignored.
    pub fn remove(
        &mut self,
        handle: FrameMemId,
        allocator: &mut dyn Allocator,
    ) -> BackendResult<()> {
        let pos = self.frames.iter().position(|f| f.handle == handle);

        match pos.and_then(|pos| self.frames.remove(pos)) {
            Some(mut frame) => frame.release(allocator),
            None => Ok(()),
        }
    }

    /// Releases every frame, decoded or not.
    pub fn release_all(&mut self, allocator: &mut dyn Allocator) -> BackendResult<()> {
        let mut result = Ok(());

        for mut frame in self.frames.drain(..) {
            let released = frame.release(allocator);
            if result.is_ok() {
                result = released;
            }
        }

        result
    }

    pub fn contains(&self, handle: FrameMemId) -> bool {
        self.frames.iter().any(|f| f.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames the hardware has not finished yet.
    pub fn num_pending(&self) -> usize {
        self.frames.iter().filter(|f| !f.is_decoded).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::codec::vp9::dpb::ReferenceFrameTable;
    use crate::Resolution;

    fn key_header() -> Header {
        Header {
            width: 64,
            height: 64,
            show_frame: true,
            refresh_frame_flags: 0xff,
            ..Default::default()
        }
    }

    #[test]
    fn add_decode_complete_is_balanced() {
        let mut allocator = DummyAllocator::new(4);
        let mut table = ReferenceFrameTable::default();
        let mut storage = FrameStorage::default();

        table
            .update_ref_frames(FrameMemId(0), &key_header(), &mut allocator)
            .unwrap();
        let before: Vec<u32> = (0..4).map(|i| allocator.ref_count(FrameMemId(i))).collect();

        let hdr = Header {
            frame_type: crate::codec::vp9::parser::FrameType::InterFrame,
            refresh_frame_flags: 0,
            show_frame: true,
            ..key_header()
        };
        let frame = DecoderFrame::new(FrameMemId(1), &hdr, table.snapshot());
        storage.add(frame, &mut allocator).unwrap();

        assert_eq!(allocator.ref_count(FrameMemId(1)), 1);
        assert_eq!(allocator.ref_count(FrameMemId(0)), 16);

        // Not decoded yet: nothing is released.
        storage.complete_frames(&mut allocator).unwrap();
        assert_eq!(storage.len(), 1);

        storage.decode_frame(FrameMemId(1));
        storage.complete_frames(&mut allocator).unwrap();
        assert!(storage.is_empty());

        let after: Vec<u32> = (0..4).map(|i| allocator.ref_count(FrameMemId(i))).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut allocator = DummyAllocator::new(4);
        let mut storage = FrameStorage::default();
        let refs = ReferenceFrameTable::default().snapshot();

        storage
            .add(
                DecoderFrame::new(FrameMemId(2), &key_header(), refs),
                &mut allocator,
            )
            .unwrap();
        assert!(matches!(
            storage.add(
                DecoderFrame::new(FrameMemId(2), &key_header(), refs),
                &mut allocator
            ),
            Err(DecodeError::DuplicateSubmission(FrameMemId(2)))
        ));

        assert_eq!(storage.len(), 1);
        assert_eq!(allocator.ref_count(FrameMemId(2)), 1);
    }

    #[test]
    fn show_existing_holds_shown_slot_only() {
        let mut allocator = DummyAllocator::new(4);
        let mut table = ReferenceFrameTable::default();
        let mut storage = FrameStorage::default();

        table
            .update_ref_frames(FrameMemId(0), &key_header(), &mut allocator)
            .unwrap();

        let hdr = Header {
            show_existing_frame: true,
            frame_to_show_map_idx: 4,
            show_frame: true,
            ..Default::default()
        };
        let frame = DecoderFrame::new(FrameMemId(1), &hdr, table.snapshot());
        assert!(frame.show_existing_frame());
        assert_eq!(
            frame.shown_slot.map(|s| s.resolution),
            Some(Resolution::from((64, 64)))
        );

        storage.add(frame, &mut allocator).unwrap();
        assert_eq!(allocator.ref_count(FrameMemId(0)), 9);
        assert_eq!(allocator.ref_count(FrameMemId(1)), 1);
    }

    #[test]
    fn completion_keeps_order() {
        let mut allocator = DummyAllocator::new(4);
        let mut storage = FrameStorage::default();
        let refs = ReferenceFrameTable::default().snapshot();

        for i in 0..3 {
            storage
                .add(
                    DecoderFrame::new(FrameMemId(i), &key_header(), refs),
                    &mut allocator,
                )
                .unwrap();
        }

        storage.decode_frame(FrameMemId(1));
        storage.decode_frame(FrameMemId(7));
        assert_eq!(storage.num_pending(), 2);

        storage.complete_frames(&mut allocator).unwrap();
        let handles: Vec<_> = storage.frames.iter().map(|f| f.handle).collect();
        assert_eq!(handles, vec![FrameMemId(0), FrameMemId(2)]);
        assert_eq!(allocator.ref_count(FrameMemId(1)), 0);

        storage.release_all(&mut allocator).unwrap();
        assert!(storage.is_empty());
        assert_eq!(allocator.total_references(), 0);
    }

    #[test]
    fn remove_releases_undecoded_frame() {
        let mut allocator = DummyAllocator::new(4);
        let mut table = ReferenceFrameTable::default();
        let mut storage = FrameStorage::default();

        table
            .update_ref_frames(FrameMemId(0), &key_header(), &mut allocator)
            .unwrap();
        storage
            .add(
                DecoderFrame::new(FrameMemId(1), &key_header(), table.snapshot()),
                &mut allocator,
            )
            .unwrap();
        assert_eq!(allocator.ref_count(FrameMemId(0)), 16);

        storage.remove(FrameMemId(1), &mut allocator).unwrap();
        assert!(storage.is_empty());
        assert_eq!(allocator.ref_count(FrameMemId(0)), 8);
        assert_eq!(allocator.ref_count(FrameMemId(1)), 0);

        storage.remove(FrameMemId(3), &mut allocator).unwrap();
    }

    #[test]
    fn failed_add_releases_partial_references() {
        let mut allocator = DummyAllocator::new(2);
        let mut storage = FrameStorage::default();

        let mut refs = ReferenceFrameTable::default().snapshot();
        refs[0] = Some(RefEntry {
            handle: FrameMemId(1),
            resolution: Resolution::from((64, 64)),
        });
        // Unknown to the allocator.
        refs[1] = Some(RefEntry {
            handle: FrameMemId(9),
            resolution: Resolution::from((64, 64)),
        });

        assert!(storage
            .add(
                DecoderFrame::new(FrameMemId(0), &key_header(), refs),
                &mut allocator
            )
            .is_err());
        assert!(storage.is_empty());
        assert_eq!(allocator.total_references(), 0);
    }
}
