// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame parameters handed to the [`Accelerator`](crate::backend::Accelerator).

use crate::backend::FrameMemId;
use crate::codec::vp9::parser::BitDepth;
use crate::codec::vp9::parser::FrameType;
use crate::codec::vp9::parser::Header;
use crate::codec::vp9::parser::InterpolationFilter;
use crate::codec::vp9::parser::Profile;
use crate::codec::vp9::parser::SegLvlFeature;
use crate::codec::vp9::parser::ALTREF_FRAME;
use crate::codec::vp9::parser::GOLDEN_FRAME;
use crate::codec::vp9::parser::LAST_FRAME;
use crate::codec::vp9::parser::MAX_MODE_LF_DELTAS;
use crate::codec::vp9::parser::MAX_PROB;
use crate::codec::vp9::parser::MAX_REF_FRAMES;
use crate::codec::vp9::parser::MAX_SEGMENTS;
use crate::codec::vp9::parser::NUM_REF_FRAMES;
use crate::codec::vp9::parser::PREDICTION_PROBS;
use crate::codec::vp9::parser::SEG_TREE_PROBS;

/// Frame-level flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFields {
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    pub intra_only: bool,
    pub allow_high_precision_mv: bool,
    pub mcomp_filter_type: InterpolationFilter,
    pub frame_parallel_decoding_mode: bool,
    pub reset_frame_context: u8,
    pub refresh_frame_context: bool,
    pub frame_context_idx: u8,
    pub segmentation_enabled: bool,
    pub segmentation_temporal_update: bool,
    pub segmentation_update_map: bool,
    pub last_ref_frame: u8,
    pub last_ref_frame_sign_bias: bool,
    pub golden_ref_frame: u8,
    pub golden_ref_frame_sign_bias: bool,
    pub alt_ref_frame: u8,
    pub alt_ref_frame_sign_bias: bool,
    pub lossless_flag: bool,
}

/// Parameters of one segment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentParameters {
    pub reference_frame_enabled: bool,
    pub reference_frame: u8,
    pub reference_skip_enabled: bool,
    /// Loop filter level per reference frame and mode.
    pub filter_level: [[u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES],
    pub luma_ac_quant_scale: i16,
    pub luma_dc_quant_scale: i16,
    pub chroma_ac_quant_scale: i16,
    pub chroma_dc_quant_scale: i16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParameters {
    pub frame_width: u32,
    pub frame_height: u32,
    pub reference_frames: [Option<FrameMemId>; NUM_REF_FRAMES],
    pub pic_fields: PicFields,
    pub filter_level: u8,
    pub sharpness_level: u8,
    pub log2_tile_rows: u8,
    pub log2_tile_columns: u8,
    pub frame_header_length_in_bytes: u16,
    pub first_partition_size: u16,
    pub mb_segment_tree_probs: [u8; SEG_TREE_PROBS],
    pub segment_pred_probs: [u8; PREDICTION_PROBS],
    pub profile: Profile,
    pub bit_depth: BitDepth,
    /// Size of the whole compressed frame.
    pub slice_data_size: usize,
    pub segments: [SegmentParameters; MAX_SEGMENTS],
}

impl PictureParameters {
    pub fn new(hdr: &Header, reference_frames: [Option<FrameMemId>; NUM_REF_FRAMES]) -> Self {
        let seg = &hdr.seg;

        let pic_fields = PicFields {
            subsampling_x: hdr.subsampling_x,
            subsampling_y: hdr.subsampling_y,
            frame_type: hdr.frame_type,
            show_frame: hdr.show_frame,
            error_resilient_mode: hdr.error_resilient_mode,
            intra_only: hdr.intra_only,
            allow_high_precision_mv: hdr.allow_high_precision_mv,
            mcomp_filter_type: hdr.interpolation_filter,
            frame_parallel_decoding_mode: hdr.frame_parallel_decoding_mode,
            reset_frame_context: hdr.reset_frame_context,
            refresh_frame_context: hdr.refresh_frame_context,
            frame_context_idx: hdr.frame_context_idx,
            segmentation_enabled: seg.enabled,
            segmentation_temporal_update: seg.temporal_update,
            segmentation_update_map: seg.update_map,
            last_ref_frame: hdr.ref_frame_idx[LAST_FRAME - 1],
            last_ref_frame_sign_bias: hdr.ref_frame_sign_bias[LAST_FRAME],
            golden_ref_frame: hdr.ref_frame_idx[GOLDEN_FRAME - 1],
            golden_ref_frame_sign_bias: hdr.ref_frame_sign_bias[GOLDEN_FRAME],
            alt_ref_frame: hdr.ref_frame_idx[ALTREF_FRAME - 1],
            alt_ref_frame_sign_bias: hdr.ref_frame_sign_bias[ALTREF_FRAME],
            lossless_flag: hdr.lossless,
        };

        let segment_pred_probs = if seg.temporal_update {
            seg.pred_probs
        } else {
            [MAX_PROB; PREDICTION_PROBS]
        };

        Self {
            frame_width: hdr.width,
            frame_height: hdr.height,
            reference_frames,
            pic_fields,
            filter_level: hdr.lf.level,
            sharpness_level: hdr.lf.sharpness,
            log2_tile_rows: hdr.tile_rows_log2,
            log2_tile_columns: hdr.tile_cols_log2,
            frame_header_length_in_bytes: hdr.uncompressed_header_size_in_bytes,
            first_partition_size: hdr.first_partition_size,
            mb_segment_tree_probs: seg.tree_probs,
            segment_pred_probs,
            profile: hdr.profile,
            bit_depth: hdr.bit_depth,
            slice_data_size: hdr.frame_data_size,
            segments: build_segment_params(hdr),
        }
    }
}

fn build_segment_params(hdr: &Header) -> [SegmentParameters; MAX_SEGMENTS] {
    let seg = &hdr.seg;
    let quant_factors = hdr
        .dequant
        .as_ref()
        .map(|dequant| dequant.segment_factors(seg, hdr.quant.base_q_idx));

    let mut params = [SegmentParameters::default(); MAX_SEGMENTS];

    for (segment_id, param) in params.iter_mut().enumerate() {
        param.reference_frame_enabled = seg.is_feature_active(segment_id, SegLvlFeature::RefFrame);
        param.reference_frame = seg.feature_data(segment_id, SegLvlFeature::RefFrame) as u8;
        param.reference_skip_enabled = seg.is_feature_active(segment_id, SegLvlFeature::Skip);
        param.filter_level = hdr.lf_levels[segment_id];

        // Left at zero when no table exists for the bit depth.
        if let Some(factors) = &quant_factors {
            let ([luma_dc, luma_ac], [chroma_dc, chroma_ac]) = factors[segment_id];
            param.luma_dc_quant_scale = luma_dc;
            param.luma_ac_quant_scale = luma_ac;
            param.chroma_dc_quant_scale = chroma_dc;
            param.chroma_ac_quant_scale = chroma_ac;
        }
    }

    params
}
