// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! The allocator keeps per-handle reference counts and the accelerator records every submission,
//! so tests can check the bookkeeping of the decoder from the outside.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use anyhow::anyhow;

use crate::backend::Accelerator;
use crate::backend::Allocator;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::FrameMemId;
use crate::backend::OutputSurface;
use crate::backend::WaitError;
use crate::decoder::stateless::vp9::picture_params::PictureParameters;

#[derive(Default)]
struct AllocatorState {
    counts: BTreeMap<FrameMemId, u32>,
    increments: BTreeMap<FrameMemId, u32>,
    decrements: BTreeMap<FrameMemId, u32>,
    fail_resolve: bool,
}

/// Allocator with a fixed pool of handles. Clones share the same pool.
#[derive(Clone)]
pub(crate) struct DummyAllocator(Arc<Mutex<AllocatorState>>);

impl DummyAllocator {
    pub fn new(num_handles: u32) -> Self {
        let state = AllocatorState {
            counts: (0..num_handles).map(|i| (FrameMemId(i), 0)).collect(),
            ..Default::default()
        };

        Self(Arc::new(Mutex::new(state)))
    }

    fn state(&self) -> MutexGuard<AllocatorState> {
        self.0.lock().unwrap()
    }

    pub fn ref_count(&self, id: FrameMemId) -> u32 {
        self.state().counts.get(&id).copied().unwrap_or(0)
    }

    pub fn increments(&self, id: FrameMemId) -> u32 {
        self.state().increments.get(&id).copied().unwrap_or(0)
    }

    pub fn decrements(&self, id: FrameMemId) -> u32 {
        self.state().decrements.get(&id).copied().unwrap_or(0)
    }

    /// Sum of all outstanding references.
    pub fn total_references(&self) -> u32 {
        self.state().counts.values().sum()
    }

    pub fn set_fail_resolve(&self, fail: bool) {
        self.state().fail_resolve = fail;
    }
}

impl Allocator for DummyAllocator {
    fn acquire_free_handle(&mut self) -> Option<FrameMemId> {
        self.state()
            .counts
            .iter()
            .find(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
    }

    fn increase_reference(&mut self, id: FrameMemId) -> BackendResult<()> {
        let mut state = self.state();
        let count = state
            .counts
            .get_mut(&id)
            .ok_or(BackendError::UnknownHandle(id))?;
        *count += 1;
        *state.increments.entry(id).or_default() += 1;

        Ok(())
    }

    fn decrease_reference(&mut self, id: FrameMemId) -> BackendResult<()> {
        let mut state = self.state();
        let count = state
            .counts
            .get_mut(&id)
            .ok_or(BackendError::UnknownHandle(id))?;
        if *count == 0 {
            return Err(anyhow!("reference count of {:?} would drop below zero", id).into());
        }
        *count -= 1;
        *state.decrements.entry(id).or_default() += 1;

        Ok(())
    }

    fn resolve_output_surface(&mut self, id: FrameMemId) -> BackendResult<OutputSurface> {
        let state = self.state();
        if state.fail_resolve {
            return Err(anyhow!("no output surface for {:?}", id).into());
        }
        if !state.counts.contains_key(&id) {
            return Err(BackendError::UnknownHandle(id));
        }

        Ok(OutputSurface(u64::from(id.0) + 0x1000))
    }
}

/// A frame sent to the [`DummyAccelerator`].
#[derive(Clone, Debug)]
pub(crate) struct Submission {
    pub target: FrameMemId,
    pub params: PictureParameters,
    /// CRC32 of the compressed frame.
    pub checksum: u32,
}

/// Longest time a held copy waits to be released.
const COPY_GATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds the next copy until the test releases it.
struct CopyGate {
    started: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

#[derive(Default)]
struct AcceleratorState {
    current: Option<FrameMemId>,
    submissions: Vec<Submission>,
    waited: Vec<FrameMemId>,
    copies: Vec<(FrameMemId, FrameMemId)>,
    fail_execute: bool,
    fail_copy: bool,
    wait_error: Option<WaitError>,
    copy_gate: Option<CopyGate>,
}

/// Accelerator that accepts everything and completes instantly. Clones share the same state.
#[derive(Clone, Default)]
pub(crate) struct DummyAccelerator(Arc<Mutex<AcceleratorState>>);

impl DummyAccelerator {
    fn state(&self) -> MutexGuard<AcceleratorState> {
        self.0.lock().unwrap()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn waited(&self) -> Vec<FrameMemId> {
        self.state().waited.clone()
    }

    pub fn set_fail_execute(&self, fail: bool) {
        self.state().fail_execute = fail;
    }

    pub fn set_wait_error(&self, error: Option<WaitError>) {
        self.state().wait_error = error;
    }

    pub fn copies(&self) -> Vec<(FrameMemId, FrameMemId)> {
        self.state().copies.clone()
    }

    pub fn set_fail_copy(&self, fail: bool) {
        self.state().fail_copy = fail;
    }

    /// Makes the next copy block until the returned sender fires. The returned receiver fires
    /// once that copy has started.
    pub fn hold_next_copy(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        self.state().copy_gate = Some(CopyGate {
            started: started_tx,
            release: release_rx,
        });

        (started_rx, release_tx)
    }
}

impl Accelerator for DummyAccelerator {
    fn begin_submission(&self, target: FrameMemId) -> BackendResult<()> {
        let mut state = self.state();
        if let Some(current) = state.current {
            return Err(anyhow!("submission to {:?} still in progress", current).into());
        }
        state.current = Some(target);

        Ok(())
    }

    fn execute(&self, params: &PictureParameters, bitstream: &[u8]) -> BackendResult<()> {
        let mut state = self.state();
        if state.fail_execute {
            return Err(anyhow!("execute failed").into());
        }

        let target = state
            .current
            .ok_or_else(|| anyhow!("execute called outside of a submission"))?;
        state.submissions.push(Submission {
            target,
            params: params.clone(),
            checksum: crc32fast::hash(bitstream),
        });

        Ok(())
    }

    fn end_submission(&self) -> BackendResult<()> {
        self.state()
            .current
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("no submission in progress").into())
    }

    fn wait_for_completion(&self, target: FrameMemId) -> Result<(), WaitError> {
        let mut state = self.state();
        state.waited.push(target);

        match state.wait_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn copy_surface(&self, src: FrameMemId, dst: FrameMemId) -> BackendResult<()> {
        let gate = self.state().copy_gate.take();
        if let Some(gate) = gate {
            let _ = gate.started.send(());
            gate.release
                .recv_timeout(COPY_GATE_TIMEOUT)
                .map_err(|_| anyhow!("copy into {:?} was never released", dst))?;
        }

        let mut state = self.state();
        if state.fail_copy {
            return Err(anyhow!("copy from {:?} to {:?} failed", src, dst).into());
        }
        state.copies.push((src, dst));

        Ok(())
    }
}
