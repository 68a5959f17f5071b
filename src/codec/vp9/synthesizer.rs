// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes VP9 uncompressed frame headers, followed by a dummy payload, so that tests can build
//! streams without carrying binary fixtures.

use crate::bitstream_utils::BitWriter;
use crate::codec::vp9::parser::tile_cols_log2_bounds;
use crate::codec::vp9::parser::BitDepth;
use crate::codec::vp9::parser::SegLvlFeature;
use crate::codec::vp9::parser::SegmentationParams;
use crate::codec::vp9::parser::FRAME_MARKER;
use crate::codec::vp9::parser::MAX_MODE_LF_DELTAS;
use crate::codec::vp9::parser::MAX_PROB;
use crate::codec::vp9::parser::MAX_REF_LF_DELTAS;
use crate::codec::vp9::parser::MAX_SEGMENTS;
use crate::codec::vp9::parser::SYNC_CODE;

#[derive(Clone, Debug)]
pub(crate) enum FrameKind {
    Key,
    IntraOnly {
        refresh_frame_flags: u8,
    },
    Inter {
        refresh_frame_flags: u8,
        ref_frame_idx: [u8; 3],
        /// Reference (0..3) whose size is reused, or `None` for an explicit size.
        size_from_ref: Option<usize>,
    },
    ShowExisting(u8),
}

#[derive(Clone, Debug)]
pub(crate) struct SynthFrame {
    pub kind: FrameKind,
    pub profile: u8,
    pub bit_depth: BitDepth,
    pub subsampling: (bool, bool),
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    pub width: u32,
    pub height: u32,
    pub render_size: Option<(u32, u32)>,
    /// 2-bit literal, `None` for a switchable filter.
    pub interpolation_filter: Option<u8>,
    pub lf_level: u8,
    pub lf_sharpness: u8,
    pub lf_delta_enabled: bool,
    pub lf_delta_update: Option<(
        [Option<i8>; MAX_REF_LF_DELTAS],
        [Option<i8>; MAX_MODE_LF_DELTAS],
    )>,
    pub base_q_idx: u8,
    /// y_dc, uv_dc and uv_ac deltas.
    pub delta_q: [i8; 3],
    pub segmentation: Option<SegmentationParams>,
    pub tile_cols_log2: u8,
    pub tile_rows_log2: u8,
    pub first_partition_size: u16,
    pub payload_size: usize,
}

impl Default for SynthFrame {
    fn default() -> Self {
        Self {
            kind: FrameKind::Key,
            profile: 0,
            bit_depth: BitDepth::Depth8,
            subsampling: (true, true),
            show_frame: true,
            error_resilient_mode: false,
            width: 64,
            height: 64,
            render_size: None,
            interpolation_filter: None,
            lf_level: 10,
            lf_sharpness: 0,
            lf_delta_enabled: true,
            lf_delta_update: None,
            base_q_idx: 40,
            delta_q: [0; 3],
            segmentation: None,
            tile_cols_log2: 0,
            tile_rows_log2: 0,
            first_partition_size: 16,
            payload_size: 32,
        }
    }
}

impl SynthFrame {
    fn write_color_config(&self, w: &mut BitWriter) {
        if self.profile >= 2 {
            w.write_bit(self.bit_depth == BitDepth::Depth12);
        }

        // Unknown color space, studio swing.
        w.write_bits(3, 0);
        w.write_bit(false);

        if self.profile == 1 || self.profile == 3 {
            w.write_bit(self.subsampling.0);
            w.write_bit(self.subsampling.1);
            w.write_bit(false);
        }
    }

    fn write_frame_size(&self, w: &mut BitWriter) {
        w.write_bits(16, self.width - 1);
        w.write_bits(16, self.height - 1);
    }

    fn write_render_size(&self, w: &mut BitWriter) {
        match self.render_size {
            Some((width, height)) => {
                w.write_bit(true);
                w.write_bits(16, width - 1);
                w.write_bits(16, height - 1);
            }
            None => w.write_bit(false),
        }
    }

    fn write_prob(w: &mut BitWriter, prob: u8) {
        if prob == MAX_PROB {
            w.write_bit(false);
        } else {
            w.write_bit(true);
            w.write_bits(8, prob.into());
        }
    }

    fn write_segmentation(&self, w: &mut BitWriter) {
        let Some(seg) = &self.segmentation else {
            w.write_bit(false);
            return;
        };

        w.write_bit(seg.enabled);
        if !seg.enabled {
            return;
        }

        w.write_bit(seg.update_map);
        if seg.update_map {
            for prob in seg.tree_probs {
                Self::write_prob(w, prob);
            }

            w.write_bit(seg.temporal_update);
            if seg.temporal_update {
                for prob in seg.pred_probs {
                    Self::write_prob(w, prob);
                }
            }
        }

        w.write_bit(seg.update_data);
        if seg.update_data {
            w.write_bit(seg.abs_or_delta_update);

            for segment_id in 0..MAX_SEGMENTS {
                for feature in SegLvlFeature::ALL {
                    let enabled = seg.feature_enabled[segment_id][feature as usize];
                    w.write_bit(enabled);

                    if enabled {
                        let data = i32::from(seg.feature_data[segment_id][feature as usize]);
                        w.write_bits(feature.data_bits(), data.unsigned_abs());
                        if feature.is_signed() {
                            w.write_bit(data < 0);
                        }
                    }
                }
            }
        }
    }

    fn write_tile_info(&self, w: &mut BitWriter) {
        let (min_log2, max_log2) = tile_cols_log2_bounds(self.width);

        let mut cols_log2 = min_log2;
        while cols_log2 < max_log2 {
            let increment = cols_log2 < self.tile_cols_log2;
            w.write_bit(increment);
            if !increment {
                break;
            }
            cols_log2 += 1;
        }

        w.write_bit(self.tile_rows_log2 > 0);
        if self.tile_rows_log2 > 0 {
            w.write_bit(self.tile_rows_log2 > 1);
        }
    }

    fn write_header(&self, w: &mut BitWriter) {
        w.write_bits(2, FRAME_MARKER);
        w.write_bit(self.profile & 1 == 1);
        w.write_bit(self.profile & 2 == 2);
        if self.profile == 3 {
            w.write_bit(false);
        }

        if let FrameKind::ShowExisting(idx) = self.kind {
            w.write_bit(true);
            w.write_bits(3, idx.into());
            return;
        }
        w.write_bit(false);

        let is_key = matches!(self.kind, FrameKind::Key);
        w.write_bit(!is_key);
        w.write_bit(self.show_frame);
        w.write_bit(self.error_resilient_mode);

        match &self.kind {
            FrameKind::Key => {
                w.write_bits(24, SYNC_CODE);
                self.write_color_config(w);
                self.write_frame_size(w);
                self.write_render_size(w);
            }
            FrameKind::IntraOnly {
                refresh_frame_flags,
            } => {
                if !self.show_frame {
                    w.write_bit(true);
                }
                if !self.error_resilient_mode {
                    w.write_bits(2, 0);
                }
                w.write_bits(24, SYNC_CODE);
                if self.profile > 0 {
                    self.write_color_config(w);
                }
                w.write_bits(8, (*refresh_frame_flags).into());
                self.write_frame_size(w);
                self.write_render_size(w);
            }
            FrameKind::Inter {
                refresh_frame_flags,
                ref_frame_idx,
                size_from_ref,
            } => {
                if !self.show_frame {
                    w.write_bit(false);
                }
                if !self.error_resilient_mode {
                    w.write_bits(2, 0);
                }
                w.write_bits(8, (*refresh_frame_flags).into());
                for idx in ref_frame_idx {
                    w.write_bits(3, (*idx).into());
                    w.write_bit(false);
                }

                match size_from_ref {
                    Some(found) => {
                        for _ in 0..*found {
                            w.write_bit(false);
                        }
                        w.write_bit(true);
                    }
                    None => {
                        for _ in 0..3 {
                            w.write_bit(false);
                        }
                        self.write_frame_size(w);
                    }
                }
                self.write_render_size(w);

                // allow_high_precision_mv
                w.write_bit(false);
                match self.interpolation_filter {
                    Some(literal) => {
                        w.write_bit(false);
                        w.write_bits(2, literal.into());
                    }
                    None => w.write_bit(true),
                }
            }
            FrameKind::ShowExisting(_) => unreachable!(),
        }

        if !self.error_resilient_mode {
            // refresh_frame_context, frame_parallel_decoding_mode
            w.write_bit(true);
            w.write_bit(false);
        }
        // frame_context_idx
        w.write_bits(2, 0);

        w.write_bits(6, self.lf_level.into());
        w.write_bits(3, self.lf_sharpness.into());
        w.write_bit(self.lf_delta_enabled);
        if self.lf_delta_enabled {
            match &self.lf_delta_update {
                Some((ref_deltas, mode_deltas)) => {
                    w.write_bit(true);
                    for delta in ref_deltas.iter().chain(mode_deltas.iter()) {
                        w.write_bit(delta.is_some());
                        if let Some(delta) = delta {
                            w.write_signed(6, (*delta).into());
                        }
                    }
                }
                None => w.write_bit(false),
            }
        }

        w.write_bits(8, self.base_q_idx.into());
        for delta in self.delta_q {
            w.write_bit(delta != 0);
            if delta != 0 {
                w.write_signed(4, delta.into());
            }
        }

        self.write_segmentation(w);
        self.write_tile_info(w);

        w.write_bits(16, self.first_partition_size.into());
    }

    /// Serializes the frame and returns it with the number of header bits written.
    pub fn to_bytes_with_header_bits(&self) -> (Vec<u8>, u64) {
        let mut w = BitWriter::default();
        self.write_header(&mut w);

        let header_bits = w.bits_written();
        let mut bytes = w.finish();
        if !matches!(self.kind, FrameKind::ShowExisting(_)) {
            bytes.extend((0..self.payload_size).map(|i| i as u8));
        }

        (bytes, header_bits)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_with_header_bits().0
    }
}

/// Packs `frames` into a superframe with a 2-byte size index.
pub(crate) fn superframe(frames: &[Vec<u8>]) -> Vec<u8> {
    const BYTES_PER_SIZE: u8 = 2;

    let marker = 0xc0 | ((BYTES_PER_SIZE - 1) << 3) | (frames.len() as u8 - 1);

    let mut data: Vec<u8> = frames.iter().flatten().copied().collect();
    data.push(marker);
    for frame in frames {
        data.extend_from_slice(&(frame.len() as u16).to_le_bytes());
    }
    data.push(marker);

    data
}
