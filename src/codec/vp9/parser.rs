// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser for the VP9 uncompressed frame header.
//!
//! [`Parser::parse_frame`] never mutates the parser: the persistent state (loop filter deltas,
//! segmentation, color configuration, dequantizer and reference sizes) is carried forward into
//! the returned [`Header`] and only written back by [`Parser::commit`] once the frame has actually
//! been submitted. A frame that has to be retried is therefore parsed against the exact same
//! state.

use enumn::N;
use log::debug;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::BitReaderError;
use crate::codec::vp9::lookups::Dequantizer;
use crate::Resolution;

pub const REFS_PER_FRAME: usize = 3;

pub const MAX_REF_LF_DELTAS: usize = 4;
pub const MAX_MODE_LF_DELTAS: usize = 2;

pub const INTRA_FRAME: usize = 0;
pub const LAST_FRAME: usize = 1;
pub const GOLDEN_FRAME: usize = 2;
pub const ALTREF_FRAME: usize = 3;
pub const MAX_REF_FRAMES: usize = 4;

pub const MAX_SEGMENTS: usize = 8;
pub const SEG_TREE_PROBS: usize = MAX_SEGMENTS - 1;
pub const PREDICTION_PROBS: usize = 3;
pub const SEG_LVL_MAX: usize = 4;

pub const MAX_LOOP_FILTER: i32 = 63;
pub const MAX_PROB: u8 = 255;

/// The number of reference frame slots.
pub const NUM_REF_FRAMES: usize = 8;

pub const FRAME_MARKER: u32 = 0x02;
pub const SYNC_CODE: u32 = 0x498342;

pub const MIN_TILE_WIDTH_B64: u32 = 4;
pub const MAX_TILE_WIDTH_B64: u32 = 64;

/// Error returned when a frame header cannot be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame header is truncated: {0}")]
    Truncated(#[from] BitReaderError),
    #[error("malformed frame header: {0}")]
    Malformed(String),
    #[error("unsupported frame header: {0}")]
    Unsupported(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum InterpolationFilter {
    #[default]
    EightTap = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum ReferenceFrameType {
    Intra = 0,
    Last = 1,
    Golden = 2,
    AltRef = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
    Profile3 = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum BitDepth {
    #[default]
    Depth8 = 8,
    Depth10 = 10,
    Depth12 = 12,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum ColorSpace {
    #[default]
    Unknown = 0,
    Bt601 = 1,
    Bt709 = 2,
    Smpte170 = 3,
    Smpte240 = 4,
    Bt2020 = 5,
    Reserved2 = 6,
    CsSrgb = 7,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum ColorRange {
    #[default]
    StudioSwing = 0,
    FullSwing = 1,
}

/// Per-segment features, in bitstream order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum SegLvlFeature {
    AltQ = 0,
    AltLf = 1,
    RefFrame = 2,
    Skip = 3,
}

impl SegLvlFeature {
    pub const ALL: [SegLvlFeature; SEG_LVL_MAX] = [
        SegLvlFeature::AltQ,
        SegLvlFeature::AltLf,
        SegLvlFeature::RefFrame,
        SegLvlFeature::Skip,
    ];

    const DATA_MAX: [i16; SEG_LVL_MAX] = [255, 63, 3, 0];
    const SIGNED: [bool; SEG_LVL_MAX] = [true, true, false, false];

    /// Largest magnitude the feature data may take.
    pub fn data_max(self) -> i16 {
        Self::DATA_MAX[self as usize]
    }

    /// Whether the feature data is followed by a sign bit.
    pub fn is_signed(self) -> bool {
        Self::SIGNED[self as usize]
    }

    /// Number of bits used to code the feature magnitude.
    pub fn data_bits(self) -> u8 {
        (u16::BITS - (self.data_max() as u16).leading_zeros()) as u8
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// Indicates the loop filter strength.
    pub level: u8,
    /// Indicates the sharpness level.
    pub sharpness: u8,
    /// If set, the filter level depends on the mode and reference frame used to predict a block.
    pub delta_enabled: bool,
    /// If set, the header carries updates for the mode and reference deltas.
    pub delta_update: bool,
    pub update_ref_delta: [bool; MAX_REF_LF_DELTAS],
    /// Filter level adjustment per reference frame. Keeps its previous value when not updated.
    pub ref_deltas: [i8; MAX_REF_LF_DELTAS],
    pub update_mode_delta: [bool; MAX_MODE_LF_DELTAS],
    /// Filter level adjustment per mode. Keeps its previous value when not updated.
    pub mode_deltas: [i8; MAX_MODE_LF_DELTAS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizationParams {
    /// Base frame qindex, used for Y AC coefficients and as the base for the other quantizers.
    pub base_q_idx: u8,
    pub delta_q_y_dc: i8,
    pub delta_q_uv_dc: i8,
    pub delta_q_uv_ac: i8,
}

impl QuantizationParams {
    fn deltas(&self) -> [i8; 3] {
        [self.delta_q_y_dc, self.delta_q_uv_dc, self.delta_q_uv_ac]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentationParams {
    /// If set, this frame makes use of the segmentation tool.
    pub enabled: bool,
    /// If set, the segmentation map is updated while decoding this frame.
    pub update_map: bool,
    /// Probabilities used when decoding segment_id.
    pub tree_probs: [u8; SEG_TREE_PROBS],
    /// Probabilities used when decoding seg_id_predicted.
    pub pred_probs: [u8; PREDICTION_PROBS],
    /// If set, map updates are coded relative to the existing map.
    pub temporal_update: bool,
    /// If set, new per-segment parameters follow.
    pub update_data: bool,
    /// If set, feature data are the actual values rather than adjustments.
    pub abs_or_delta_update: bool,
    pub feature_enabled: [[bool; SEG_LVL_MAX]; MAX_SEGMENTS],
    pub feature_data: [[i16; SEG_LVL_MAX]; MAX_SEGMENTS],
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            enabled: false,
            update_map: false,
            tree_probs: [MAX_PROB; SEG_TREE_PROBS],
            pred_probs: [MAX_PROB; PREDICTION_PROBS],
            temporal_update: false,
            update_data: false,
            abs_or_delta_update: false,
            feature_enabled: Default::default(),
            feature_data: Default::default(),
        }
    }
}

impl SegmentationParams {
    pub fn is_feature_active(&self, segment_id: usize, feature: SegLvlFeature) -> bool {
        self.enabled && self.feature_enabled[segment_id][feature as usize]
    }

    pub fn feature_data(&self, segment_id: usize, feature: SegLvlFeature) -> i16 {
        self.feature_data[segment_id][feature as usize]
    }

    fn clear_features(&mut self) {
        self.feature_enabled = Default::default();
        self.feature_data = Default::default();
    }
}

/// A VP9 frame header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub profile: Profile,
    pub bit_depth: BitDepth,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    /// Indicates the frame indexed by `frame_to_show_map_idx` is to be displayed again.
    pub show_existing_frame: bool,
    /// Slot of the frame to display. Only meaningful if `show_existing_frame` is set.
    pub frame_to_show_map_idx: u8,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    pub width: u32,
    pub height: u32,
    pub render_and_frame_size_different: bool,
    pub render_width: u32,
    pub render_height: u32,
    pub intra_only: bool,
    pub reset_frame_context: u8,
    /// Bitmask of the reference slots this frame replaces once decoded.
    pub refresh_frame_flags: u8,
    /// Reference slots used for LAST, GOLDEN and ALTREF.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [bool; MAX_REF_FRAMES],
    pub allow_high_precision_mv: bool,
    pub interpolation_filter: InterpolationFilter,
    pub refresh_frame_context: bool,
    pub frame_parallel_decoding_mode: bool,
    pub frame_context_idx: u8,
    pub lf: LoopFilterParams,
    pub quant: QuantizationParams,
    pub seg: SegmentationParams,
    pub tile_cols_log2: u8,
    pub tile_rows_log2: u8,
    /// Set when the frame is coded with the lossless 4x4 transform.
    pub lossless: bool,
    /// Size of the compressed header in bytes.
    pub first_partition_size: u16,
    /// Size of the uncompressed header in bytes.
    pub uncompressed_header_size_in_bytes: u16,
    /// Size of the whole frame, headers included.
    pub frame_data_size: usize,
    /// Loop filter level per segment, reference frame and mode.
    pub lf_levels: [[[u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES]; MAX_SEGMENTS],
    /// Dequantization factors for the current quantizer deltas, if available for the bit depth.
    pub dequant: Option<Dequantizer>,
}

impl Header {
    pub fn is_intra(&self) -> bool {
        self.frame_type == FrameType::KeyFrame || self.intra_only
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }
}

/// Stream parameters carried by a key frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub profile: Profile,
    pub bit_depth: BitDepth,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,
}

fn calc_min_log2_tile_cols(sb64_cols: u32) -> u8 {
    let mut min_log2 = 0;

    while (MAX_TILE_WIDTH_B64 << min_log2) < sb64_cols {
        min_log2 += 1;
    }

    min_log2
}

fn calc_max_log2_tile_cols(sb64_cols: u32) -> u8 {
    let mut max_log2 = 1;

    while (sb64_cols >> max_log2) >= MIN_TILE_WIDTH_B64 {
        max_log2 += 1;
    }

    max_log2 - 1
}

/// Returns the `(min, max)` log2 tile column bounds for a frame `width` pixels wide.
pub(crate) fn tile_cols_log2_bounds(width: u32) -> (u8, u8) {
    let mi_cols = (width + 7) >> 3;
    let sb64_cols = (mi_cols + 7) >> 3;

    (
        calc_min_log2_tile_cols(sb64_cols),
        calc_max_log2_tile_cols(sb64_cols),
    )
}

/// A VP9 frame header parser.
#[derive(Clone, Debug, Default)]
pub struct Parser {
    bit_depth: BitDepth,
    subsampling_x: bool,
    subsampling_y: bool,
    color_space: ColorSpace,
    color_range: ColorRange,

    lf: LoopFilterParams,
    seg: SegmentationParams,

    /// Deltas and bit depth the current dequantizer was built for. `None` until the first frame
    /// is committed.
    dequant_key: Option<([i8; 3], BitDepth)>,
    dequant: Option<Dequantizer>,

    reference_frame_sz: [Resolution; NUM_REF_FRAMES],
}

impl Parser {
    fn read_signed_8(r: &mut BitReader, nbits: u8) -> ParseResult<i8> {
        let value = r.read_bits::<i8>(nbits)?;

        if r.read_bit()? {
            Ok(-value)
        } else {
            Ok(value)
        }
    }

    fn parse_frame_marker(r: &mut BitReader) -> ParseResult<()> {
        let marker = r.read_bits::<u32>(2)?;

        if marker != FRAME_MARKER {
            return Err(ParseError::Malformed(format!(
                "expected frame marker {}, found {}",
                FRAME_MARKER, marker
            )));
        }

        Ok(())
    }

    fn parse_profile(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let low = r.read_bits::<u32>(1)?;
        let high = r.read_bits::<u32>(1)?;

        let mut profile = (high << 1) | low;

        if profile == 3 {
            profile += r.read_bits::<u32>(1)?;
        }

        hdr.profile = Profile::n(profile)
            .ok_or_else(|| ParseError::Unsupported(format!("invalid profile {}", profile)))?;

        Ok(())
    }

    fn parse_frame_sync_code(r: &mut BitReader) -> ParseResult<()> {
        let sync_code = r.read_bits::<u32>(24)?;

        if sync_code != SYNC_CODE {
            return Err(ParseError::Malformed(format!(
                "expected sync code {:#x}, found {:#x}",
                SYNC_CODE, sync_code
            )));
        }

        Ok(())
    }

    fn parse_reserved_zero(r: &mut BitReader) -> ParseResult<()> {
        if r.read_bit()? {
            return Err(ParseError::Unsupported("reserved bit set".into()));
        }

        Ok(())
    }

    fn parse_color_config(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let high_profile = matches!(hdr.profile, Profile::Profile1 | Profile::Profile3);

        hdr.bit_depth = if matches!(hdr.profile, Profile::Profile2 | Profile::Profile3) {
            if r.read_bit()? {
                BitDepth::Depth12
            } else {
                BitDepth::Depth10
            }
        } else {
            BitDepth::Depth8
        };

        let color_space = r.read_bits::<u32>(3)?;
        hdr.color_space = ColorSpace::n(color_space).ok_or_else(|| {
            ParseError::Malformed(format!("invalid color space {}", color_space))
        })?;

        if hdr.color_space != ColorSpace::CsSrgb {
            hdr.color_range = if r.read_bit()? {
                ColorRange::FullSwing
            } else {
                ColorRange::StudioSwing
            };

            if high_profile {
                hdr.subsampling_x = r.read_bit()?;
                hdr.subsampling_y = r.read_bit()?;

                if hdr.subsampling_x && hdr.subsampling_y {
                    return Err(ParseError::Unsupported(format!(
                        "4:2:0 color not supported in {:?}",
                        hdr.profile
                    )));
                }

                Self::parse_reserved_zero(r)?;
            } else {
                hdr.subsampling_x = true;
                hdr.subsampling_y = true;
            }
        } else {
            hdr.color_range = ColorRange::FullSwing;

            if !high_profile {
                return Err(ParseError::Unsupported(format!(
                    "4:4:4 color not supported in {:?}",
                    hdr.profile
                )));
            }

            hdr.subsampling_x = false;
            hdr.subsampling_y = false;
            Self::parse_reserved_zero(r)?;
        }

        Ok(())
    }

    fn parse_frame_size(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        hdr.width = r.read_bits::<u32>(16)? + 1;
        hdr.height = r.read_bits::<u32>(16)? + 1;
        Ok(())
    }

    fn parse_render_size(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        hdr.render_and_frame_size_different = r.read_bit()?;
        if hdr.render_and_frame_size_different {
            hdr.render_width = r.read_bits::<u32>(16)? + 1;
            hdr.render_height = r.read_bits::<u32>(16)? + 1;
        } else {
            hdr.render_width = hdr.width;
            hdr.render_height = hdr.height;
        }

        Ok(())
    }

    fn parse_frame_size_with_refs(&self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let mut found_ref = false;

        for i in 0..REFS_PER_FRAME {
            found_ref = r.read_bit()?;

            if found_ref {
                let idx = usize::from(hdr.ref_frame_idx[i]);
                let size = self.reference_frame_sz[idx];

                if size.width == 0 || size.height == 0 {
                    return Err(ParseError::Malformed(format!(
                        "reference slot {} has no valid size",
                        idx
                    )));
                }

                hdr.width = size.width;
                hdr.height = size.height;
                break;
            }
        }

        if !found_ref {
            Self::parse_frame_size(r, hdr)?;
        }

        Self::parse_render_size(r, hdr)
    }

    fn read_interpolation_filter(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        const LITERAL_TO_TYPE: [InterpolationFilter; 4] = [
            InterpolationFilter::EightTapSmooth,
            InterpolationFilter::EightTap,
            InterpolationFilter::EightTapSharp,
            InterpolationFilter::Bilinear,
        ];

        if r.read_bit()? {
            hdr.interpolation_filter = InterpolationFilter::Switchable;
        } else {
            let literal = r.read_bits::<usize>(2)?;
            hdr.interpolation_filter = LITERAL_TO_TYPE[literal];
        }

        Ok(())
    }

    fn setup_past_independence(hdr: &mut Header) {
        hdr.seg.clear_features();
        hdr.seg.abs_or_delta_update = false;

        hdr.lf.delta_enabled = true;
        hdr.lf.ref_deltas[ReferenceFrameType::Intra as usize] = 1;
        hdr.lf.ref_deltas[ReferenceFrameType::Last as usize] = 0;
        hdr.lf.ref_deltas[ReferenceFrameType::Golden as usize] = -1;
        hdr.lf.ref_deltas[ReferenceFrameType::AltRef as usize] = -1;
        hdr.lf.mode_deltas = Default::default();

        hdr.ref_frame_sign_bias = Default::default();
    }

    fn parse_loop_filter_params(r: &mut BitReader, lf: &mut LoopFilterParams) -> ParseResult<()> {
        lf.level = r.read_bits::<u8>(6)?;
        lf.sharpness = r.read_bits::<u8>(3)?;
        lf.delta_enabled = r.read_bit()?;
        lf.delta_update = false;
        lf.update_ref_delta = Default::default();
        lf.update_mode_delta = Default::default();

        if lf.delta_enabled {
            lf.delta_update = r.read_bit()?;
            if lf.delta_update {
                for i in 0..MAX_REF_LF_DELTAS {
                    lf.update_ref_delta[i] = r.read_bit()?;
                    if lf.update_ref_delta[i] {
                        lf.ref_deltas[i] = Self::read_signed_8(r, 6)?;
                    }
                }

                for i in 0..MAX_MODE_LF_DELTAS {
                    lf.update_mode_delta[i] = r.read_bit()?;
                    if lf.update_mode_delta[i] {
                        lf.mode_deltas[i] = Self::read_signed_8(r, 6)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn read_delta_q(r: &mut BitReader) -> ParseResult<i8> {
        if r.read_bit()? {
            Self::read_signed_8(r, 4)
        } else {
            Ok(0)
        }
    }

    fn parse_quantization_params(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let quant = &mut hdr.quant;

        quant.base_q_idx = r.read_bits::<u8>(8)?;
        quant.delta_q_y_dc = Self::read_delta_q(r)?;
        quant.delta_q_uv_dc = Self::read_delta_q(r)?;
        quant.delta_q_uv_ac = Self::read_delta_q(r)?;

        hdr.lossless = quant.base_q_idx == 0 && quant.deltas() == [0; 3];

        Ok(())
    }

    fn read_prob(r: &mut BitReader) -> ParseResult<u8> {
        if r.read_bit()? {
            Ok(r.read_bits::<u8>(8)?)
        } else {
            Ok(MAX_PROB)
        }
    }

    fn parse_segmentation_params(r: &mut BitReader, seg: &mut SegmentationParams) -> ParseResult<()> {
        seg.update_map = false;
        seg.update_data = false;

        seg.enabled = r.read_bit()?;

        if !seg.enabled {
            return Ok(());
        }

        seg.update_map = r.read_bit()?;

        if seg.update_map {
            for prob in seg.tree_probs.iter_mut() {
                *prob = Self::read_prob(r)?;
            }

            seg.temporal_update = r.read_bit()?;

            for prob in seg.pred_probs.iter_mut() {
                *prob = if seg.temporal_update {
                    Self::read_prob(r)?
                } else {
                    MAX_PROB
                };
            }
        }

        seg.update_data = r.read_bit()?;

        if seg.update_data {
            seg.abs_or_delta_update = r.read_bit()?;
            seg.clear_features();

            for segment_id in 0..MAX_SEGMENTS {
                for feature in SegLvlFeature::ALL {
                    let j = feature as usize;

                    seg.feature_enabled[segment_id][j] = r.read_bit()?;
                    if !seg.feature_enabled[segment_id][j] {
                        continue;
                    }

                    let mut data = r
                        .read_bits::<i16>(feature.data_bits())?
                        .min(feature.data_max());

                    if feature.is_signed() && r.read_bit()? {
                        data = -data;
                    }

                    seg.feature_data[segment_id][j] = data;
                }
            }
        }

        Ok(())
    }

    fn parse_tile_info(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let (min_log2_tile_cols, max_log2_tile_cols) = tile_cols_log2_bounds(hdr.width);

        hdr.tile_cols_log2 = min_log2_tile_cols;

        while hdr.tile_cols_log2 < max_log2_tile_cols {
            if r.read_bit()? {
                hdr.tile_cols_log2 += 1;
            } else {
                break;
            }
        }

        hdr.tile_rows_log2 = r.read_bits::<u8>(1)?;

        if hdr.tile_rows_log2 > 0 {
            hdr.tile_rows_log2 += r.read_bits::<u8>(1)?;
        }

        Ok(())
    }

    /// Fills `hdr.lf_levels` from the loop filter and segmentation parameters.
    fn compute_lf_levels(hdr: &mut Header) {
        hdr.lf_levels = Default::default();

        let level = i32::from(hdr.lf.level);
        if level == 0 {
            return;
        }

        let scale = 1 << (level >> 5);

        for (segment_id, seg_levels) in hdr.lf_levels.iter_mut().enumerate() {
            let mut seg_level = level;

            if hdr.seg.is_feature_active(segment_id, SegLvlFeature::AltLf) {
                let data = i32::from(hdr.seg.feature_data(segment_id, SegLvlFeature::AltLf));
                seg_level = if hdr.seg.abs_or_delta_update {
                    data
                } else {
                    level + data
                };
                seg_level = seg_level.clamp(0, MAX_LOOP_FILTER);
            }

            *seg_levels = [[seg_level as u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES];

            if !hdr.lf.delta_enabled {
                continue;
            }

            let intra_level = seg_level + i32::from(hdr.lf.ref_deltas[INTRA_FRAME]) * scale;
            seg_levels[INTRA_FRAME][0] = intra_level.clamp(0, MAX_LOOP_FILTER) as u8;

            for reference in LAST_FRAME..MAX_REF_FRAMES {
                for mode in 0..MAX_MODE_LF_DELTAS {
                    let inter_level = seg_level
                        + i32::from(hdr.lf.ref_deltas[reference]) * scale
                        + i32::from(hdr.lf.mode_deltas[mode]) * scale;
                    seg_levels[reference][mode] = inter_level.clamp(0, MAX_LOOP_FILTER) as u8;
                }
            }
        }
    }

    fn parse_frame_header(&self, data: &[u8]) -> ParseResult<Header> {
        let mut r = BitReader::new(data);
        let mut hdr = Header {
            frame_data_size: data.len(),
            ..Default::default()
        };

        Self::parse_frame_marker(&mut r)?;
        Self::parse_profile(&mut r, &mut hdr)?;

        hdr.show_existing_frame = r.read_bit()?;

        if hdr.show_existing_frame {
            hdr.frame_to_show_map_idx = r.read_bits::<u8>(3)?;
            let size = self.reference_frame_sz[usize::from(hdr.frame_to_show_map_idx)];
            hdr.width = size.width;
            hdr.height = size.height;
            hdr.render_width = size.width;
            hdr.render_height = size.height;
            hdr.show_frame = true;
            hdr.uncompressed_header_size_in_bytes = r.bytes_decoded() as u16;
            return Ok(hdr);
        }

        hdr.frame_type = if r.read_bit()? {
            FrameType::InterFrame
        } else {
            FrameType::KeyFrame
        };

        hdr.show_frame = r.read_bit()?;
        hdr.error_resilient_mode = r.read_bit()?;

        hdr.lf = self.lf.clone();
        hdr.seg = self.seg.clone();

        if hdr.frame_type == FrameType::KeyFrame {
            Self::parse_frame_sync_code(&mut r)?;
            Self::parse_color_config(&mut r, &mut hdr)?;
            Self::parse_frame_size(&mut r, &mut hdr)?;
            Self::parse_render_size(&mut r, &mut hdr)?;
            hdr.refresh_frame_flags = 0xff;
        } else {
            if !hdr.show_frame {
                hdr.intra_only = r.read_bit()?;
            }

            if !hdr.error_resilient_mode {
                hdr.reset_frame_context = r.read_bits::<u8>(2)?;
            }

            if hdr.intra_only {
                Self::parse_frame_sync_code(&mut r)?;

                if hdr.profile != Profile::Profile0 {
                    Self::parse_color_config(&mut r, &mut hdr)?;
                } else {
                    hdr.color_space = ColorSpace::Bt601;
                    hdr.subsampling_x = true;
                    hdr.subsampling_y = true;
                    hdr.bit_depth = BitDepth::Depth8;
                }

                hdr.refresh_frame_flags = r.read_bits::<u8>(8)?;
                Self::parse_frame_size(&mut r, &mut hdr)?;
                Self::parse_render_size(&mut r, &mut hdr)?;
            } else {
                // Inter frames inherit the color configuration of the stream.
                hdr.color_space = self.color_space;
                hdr.color_range = self.color_range;
                hdr.subsampling_x = self.subsampling_x;
                hdr.subsampling_y = self.subsampling_y;
                hdr.bit_depth = self.bit_depth;

                hdr.refresh_frame_flags = r.read_bits::<u8>(8)?;

                for i in 0..REFS_PER_FRAME {
                    hdr.ref_frame_idx[i] = r.read_bits::<u8>(3)?;
                    hdr.ref_frame_sign_bias[LAST_FRAME + i] = r.read_bit()?;
                }

                self.parse_frame_size_with_refs(&mut r, &mut hdr)?;
                hdr.allow_high_precision_mv = r.read_bit()?;
                Self::read_interpolation_filter(&mut r, &mut hdr)?;
            }
        }

        if !hdr.error_resilient_mode {
            hdr.refresh_frame_context = r.read_bit()?;
            hdr.frame_parallel_decoding_mode = r.read_bit()?;
        } else {
            hdr.refresh_frame_context = false;
            hdr.frame_parallel_decoding_mode = true;
        }

        hdr.frame_context_idx = r.read_bits::<u8>(2)?;

        if hdr.is_intra() || hdr.error_resilient_mode {
            Self::setup_past_independence(&mut hdr);
        }

        Self::parse_loop_filter_params(&mut r, &mut hdr.lf)?;
        Self::parse_quantization_params(&mut r, &mut hdr)?;
        Self::parse_segmentation_params(&mut r, &mut hdr.seg)?;
        Self::parse_tile_info(&mut r, &mut hdr)?;

        hdr.first_partition_size = r.read_bits::<u16>(16)?;
        if hdr.first_partition_size == 0 {
            return Err(ParseError::Unsupported(
                "compressed header size is zero".into(),
            ));
        }

        hdr.uncompressed_header_size_in_bytes = r.bytes_decoded() as u16;

        let dequant_key = (hdr.quant.deltas(), hdr.bit_depth);
        hdr.dequant = if self.dequant_key != Some(dequant_key) {
            debug!("Rebuilding dequantizer for {:?}", dequant_key);
            Dequantizer::new(&hdr.quant, hdr.bit_depth)
        } else {
            self.dequant.clone()
        };

        Self::compute_lf_levels(&mut hdr);

        Ok(hdr)
    }

    /// Parses a single VP9 frame. The parser state is left untouched; call [`Parser::commit`]
    /// once the frame is accepted for decoding.
    pub fn parse_frame(&self, data: &[u8]) -> ParseResult<Header> {
        self.parse_frame_header(data)
    }

    /// Carries the persistent state of `hdr` over to the frames that follow it.
    pub fn commit(&mut self, hdr: &Header) {
        if hdr.show_existing_frame {
            return;
        }

        self.bit_depth = hdr.bit_depth;
        self.subsampling_x = hdr.subsampling_x;
        self.subsampling_y = hdr.subsampling_y;
        self.color_space = hdr.color_space;
        self.color_range = hdr.color_range;

        self.lf = hdr.lf.clone();
        self.seg = hdr.seg.clone();

        self.dequant_key = Some((hdr.quant.deltas(), hdr.bit_depth));
        self.dequant = hdr.dequant.clone();

        for (i, size) in self.reference_frame_sz.iter_mut().enumerate() {
            if hdr.refresh_frame_flags & (1 << i) != 0 {
                *size = hdr.resolution();
            }
        }
    }

    /// Size recorded for reference slot `idx`.
    pub fn reference_size(&self, idx: usize) -> Resolution {
        self.reference_frame_sz[idx]
    }

    /// Reads the stream parameters from `data` if it holds a key frame, without any prior state.
    pub fn parse_stream_info(data: &[u8]) -> ParseResult<Option<StreamInfo>> {
        let hdr = Parser::default().parse_frame_header(data)?;

        if hdr.show_existing_frame || hdr.frame_type != FrameType::KeyFrame {
            return Ok(None);
        }

        Ok(Some(StreamInfo {
            profile: hdr.profile,
            bit_depth: hdr.bit_depth,
            subsampling_x: hdr.subsampling_x,
            subsampling_y: hdr.subsampling_y,
            color_space: hdr.color_space,
            color_range: hdr.color_range,
            coded_resolution: hdr.resolution(),
            display_resolution: Resolution::from((hdr.render_width, hdr.render_height)),
        }))
    }
}
