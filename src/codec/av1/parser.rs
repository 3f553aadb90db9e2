// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sequence header, frame header and tile group parsing, plus the [`Parser`]
//! driver that threads a [`DecodeState`] through a whole stream.

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;

use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;
use crate::codec::av1::helpers;
use crate::codec::av1::metadata::parse_metadata;
use crate::codec::av1::metadata::MetadataObu;
use crate::codec::av1::obu::next_obu;
use crate::codec::av1::obu::Obu;
use crate::codec::av1::obu::ObuHeader;
use crate::codec::av1::obu::ObuType;
use crate::codec::av1::reader::Reader;
use crate::codec::av1::state::DecodeState;
use crate::codec::av1::state::ReferenceFrameInfo;
use crate::codec::av1::tile_list::parse_tile_list;
use crate::codec::av1::tile_list::TileListObu;

pub const TOTAL_REFS_PER_FRAME: usize = 8;
pub const NUM_REF_FRAMES: usize = 8;
pub const REFS_PER_FRAME: usize = 7;
pub const MAX_SEGMENTS: usize = 8;
pub const SEG_LVL_ALT_Q: usize = 0;
pub const SEG_LVL_REF_FRAME: usize = 5;
pub const SEG_LVL_MAX: usize = 8;
pub const MAX_TILE_COLS: usize = 64;
pub const MAX_TILE_ROWS: usize = 64;
pub const CDEF_MAX: usize = 1 << 3;
pub const MAX_NUM_PLANES: usize = 3;
pub const MAX_NUM_Y_POINTS: usize = 16;
pub const MAX_NUM_CB_POINTS: usize = 16;
pub const MAX_NUM_CR_POINTS: usize = 16;
pub const MAX_NUM_POS_LUMA: usize = 25;
pub const MAX_NUM_SPATIAL_LAYERS: usize = 4;
pub const MAX_NUM_TEMPORAL_LAYERS: usize = 8;
pub const MAX_NUM_OPERATING_POINTS: usize = MAX_NUM_SPATIAL_LAYERS * MAX_NUM_TEMPORAL_LAYERS;
pub const SELECT_SCREEN_CONTENT_TOOLS: u32 = 2;
pub const SELECT_INTEGER_MV: u32 = 2;
pub const PRIMARY_REF_NONE: u32 = 7;
pub const SUPERRES_DENOM_BITS: u32 = 3;
pub const SUPERRES_DENOM_MIN: u32 = 9;
pub const SUPERRES_NUM: u32 = 8;
pub const MAX_TILE_WIDTH: u32 = 4096;
pub const MAX_TILE_HEIGHT: u32 = 2304;
pub const MAX_TILE_AREA: u32 = MAX_TILE_WIDTH * MAX_TILE_HEIGHT;
pub const RESTORATION_TILESIZE_MAX: u16 = 256;
pub const WARPEDMODEL_PREC_BITS: u32 = 16;
pub const WARP_PARAM_REDUCE_BITS: u32 = 6;
pub const GM_ABS_ALPHA_BITS: u32 = 12;
pub const GM_ALPHA_PREC_BITS: u32 = 15;
pub const GM_ABS_TRANS_ONLY_BITS: u32 = 9;
pub const GM_TRANS_ONLY_PREC_BITS: u32 = 3;
pub const GM_ABS_TRANS_BITS: u32 = 12;
pub const GM_TRANS_PREC_BITS: u32 = 6;

const ALL_FRAMES: u32 = (1 << NUM_REF_FRAMES) - 1;

/// Loop filter reference deltas installed by setup_past_independence() and
/// whenever the loop filter syntax is skipped. Indexed by reference frame,
/// INTRA_FRAME first.
pub const DEFAULT_LOOP_FILTER_REF_DELTAS: [i8; TOTAL_REFS_PER_FRAME] = [1, 0, 0, 0, 0, -1, -1, -1];

// Segmentation_Feature_Bits. See 5.9.14
pub const FEATURE_BITS: [u32; SEG_LVL_MAX] = [8, 6, 6, 6, 6, 3, 0, 0];
// Segmentation_Feature_Signed. See 5.9.14
pub const FEATURE_SIGNED: [bool; SEG_LVL_MAX] = [true, true, true, true, true, false, false, false];
// Segmentation_Feature_Max. See 5.9.14
pub const FEATURE_MAX: [i32; SEG_LVL_MAX] = [255, 63, 63, 63, 63, 7, 0, 0];

pub enum ParsedObu<'a> {
    /// The OBU belongs to the selected operating point and should be
    /// processed.
    Process(Obu<'a>),
    /// The OBU is outside of the selected operating point. The u32 is the
    /// number of bytes to skip to reach the next OBU.
    Drop(u32),
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatingPoint {
    /// Level of the operating point, as seq_level_idx.
    pub seq_level_idx: u32,
    /// Tier of the operating point. Only coded for levels above 3.3.
    pub seq_tier: u32,
    /// operating_point_idc: bits 0-7 flag the temporal layers, bits 8-11 the
    /// spatial layers included in this operating point. 0 means every layer.
    pub idc: u32,
    pub decoder_model_present_for_this_op: bool,
    /// Delay, in 1/90000 seconds, between the first bit arriving in the
    /// smoothing buffer and the removal of the first frame.
    pub decoder_buffer_delay: u32,
    /// Together with `decoder_buffer_delay`, the arrival time of the first
    /// bit, in 1/90000 seconds.
    pub encoder_buffer_delay: u32,
    /// Whether the smoothing buffer runs in low-delay mode for this
    /// operating point.
    pub low_delay_mode_flag: bool,
    pub initial_display_delay_present_for_this_op: bool,
    /// Frames to buffer, minus 1, before displaying the first one.
    pub initial_display_delay_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    /// Time units of a `time_scale` Hz clock per display tick.
    pub num_units_in_display_tick: u32,
    /// Time units per second.
    pub time_scale: u32,
    /// Set when pictures are spaced by a constant number of ticks.
    pub equal_picture_interval: bool,
    /// Ticks between two consecutive pictures, minus 1.
    pub num_ticks_per_picture_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderModelInfo {
    /// Length in bits, minus 1, of the decoder/encoder buffer delays.
    pub buffer_delay_length_minus_1: u32,
    /// Time units of the decoding clock per tick.
    pub num_units_in_decoding_tick: u32,
    /// Length in bits, minus 1, of buffer_removal_time.
    pub buffer_removal_time_length_minus_1: u32,
    /// Length in bits, minus 1, of frame_presentation_time.
    pub frame_presentation_time_length_minus_1: u32,
}

/// Color primaries as defined by ISO/IEC 23091-4/ITU-T H.273. See 6.4.2
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    GenericFilm = 8,
    Bt2020 = 9,
    Xyz = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferCharacteristics {
    Reserved0 = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Bt470m = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Linear = 8,
    Log100 = 9,
    Log100Sqrt10 = 10,
    Iec61966 = 11,
    Bt1361 = 12,
    Srgb = 13,
    Bt202010Bit = 14,
    Bt202012Bit = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    Hlg = 18,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixCoefficients {
    Identity = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Fcc = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Ycgco = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    Ictcp = 14,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

/// BitDepth. The discriminant is the number of bits per sample.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum BitDepth {
    #[default]
    Depth8 = 8,
    Depth10 = 10,
    Depth12 = 12,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorConfig {
    /// With `twelve_bit` and seq_profile, selects the bit depth.
    pub high_bitdepth: bool,
    /// Only coded for profile 2 high bit depth streams.
    pub twelve_bit: bool,
    /// Set when the stream has no U and V planes.
    pub mono_chrome: bool,
    pub color_description_present_flag: bool,
    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,
    /// Full swing when set, studio swing otherwise.
    pub color_range: bool,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    /// Only coded for 4:2:0 streams.
    pub chroma_sample_position: ChromaSamplePosition,
    /// Whether U and V may use different delta quantizers.
    pub separate_uv_delta_q: bool,

    /* CamelCase variables */
    pub bit_depth: BitDepth,
    pub num_planes: u32,
}

/// The parsed sequence_header_obu(). See 5.5
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeaderObu {
    pub seq_profile: Profile,
    /// The coded video sequence holds a single frame.
    pub still_picture: bool,
    /// Syntax elements a still picture does not need are left out.
    pub reduced_still_picture_header: bool,
    pub frame_width_bits_minus_1: u32,
    pub frame_height_bits_minus_1: u32,
    pub max_frame_width_minus_1: u32,
    pub max_frame_height_minus_1: u32,
    /// Whether frames carry frame ids.
    pub frame_id_numbers_present_flag: bool,
    pub delta_frame_id_length_minus_2: u32,
    pub additional_frame_id_length_minus_1: u32,
    /// 128x128 superblocks when set, 64x64 otherwise.
    pub use_128x128_superblock: bool,
    pub enable_filter_intra: bool,
    pub enable_intra_edge_filter: bool,
    pub enable_interintra_compound: bool,
    pub enable_masked_compound: bool,
    pub enable_warped_motion: bool,
    /// Whether order hints, and every tool built on them, are in use.
    pub enable_order_hint: bool,
    pub enable_dual_filter: bool,
    pub enable_jnt_comp: bool,
    pub enable_ref_frame_mvs: bool,
    pub seq_choose_screen_content_tools: bool,
    /// SELECT_SCREEN_CONTENT_TOOLS when frames code
    /// allow_screen_content_tools themselves, else its value.
    pub seq_force_screen_content_tools: u32,
    pub seq_choose_integer_mv: bool,
    /// SELECT_INTEGER_MV when frames code force_integer_mv themselves, else
    /// its value.
    pub seq_force_integer_mv: u32,
    /// Only meaningful when `enable_order_hint` is set.
    pub order_hint_bits_minus_1: u32,
    /// OrderHintBits. 0 when order hints are disabled.
    pub order_hint_bits: u32,
    pub enable_superres: bool,
    pub enable_cdef: bool,
    pub enable_restoration: bool,
    pub film_grain_params_present: bool,
    pub operating_points_cnt_minus_1: u32,
    pub operating_points: [OperatingPoint; MAX_NUM_OPERATING_POINTS],
    pub decoder_model_info_present_flag: bool,
    pub decoder_model_info: DecoderModelInfo,
    pub initial_display_delay_present_flag: bool,
    pub timing_info_present_flag: bool,
    pub timing_info: TimingInfo,
    pub color_config: ColorConfig,
}

impl SequenceHeaderObu {
    /// idLen, the number of bits of a frame id.
    pub fn frame_id_length(&self) -> u32 {
        self.additional_frame_id_length_minus_1 + self.delta_frame_id_length_minus_2 + 3
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterpolationFilter {
    #[default]
    EightTap = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameRestorationType {
    #[default]
    None = 0,
    Wiener = 1,
    Sgrproj = 2,
    Switchable = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReferenceFrameType {
    #[default]
    Intra = 0,
    Last = 1,
    Last2 = 2,
    Last3 = 3,
    Golden = 4,
    BwdRef = 5,
    AltRef2 = 6,
    AltRef = 7,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpModelType {
    #[default]
    Identity = 0,
    Translation = 1,
    RotZoom = 2,
    Affine = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxMode {
    #[default]
    Only4x4 = 0,
    Largest = 1,
    Select = 2,
}

/// The parsed frame_header_obu(), or uncompressed_header(). See 5.9
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeaderObu {
    /// The header of the OBU this frame header was read from, either a
    /// FRAME_HEADER or a FRAME OBU.
    pub obu_header: Option<ObuHeader>,
    /// Set when this header only shows the frame in slot
    /// `frame_to_show_map_idx`.
    pub show_existing_frame: bool,
    pub frame_to_show_map_idx: u32,
    /// Only coded when the decoder model uses variable picture intervals.
    pub frame_presentation_time: u32,
    /// Frame id of the frame shown by show_existing_frame.
    pub display_frame_id: u32,
    pub frame_type: FrameType,
    /// Whether the frame is output right after being decoded.
    pub show_frame: bool,
    /// Whether the frame may be output later through show_existing_frame.
    pub showable_frame: bool,
    pub error_resilient_mode: bool,
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: u32,
    pub force_integer_mv: u32,
    pub current_frame_id: u32,
    /// Whether the frame size is coded in the frame header instead of taken
    /// from the sequence header.
    pub frame_size_override_flag: bool,
    pub order_hint: u32,
    /// Slot, as an index into `ref_frame_idx`, that seeds the frame state.
    /// PRIMARY_REF_NONE when nothing is inherited.
    pub primary_ref_frame: u32,
    pub buffer_removal_time_present_flag: bool,
    /// Removal time per operating point, in decoding clock ticks.
    pub buffer_removal_time: [u32; MAX_NUM_OPERATING_POINTS],
    /// Bit i set means reference slot i is replaced by this frame.
    pub refresh_frame_flags: u32,
    /// Expected order hint of every slot. Only coded in error resilient mode.
    pub ref_order_hint: [u32; NUM_REF_FRAMES],
    pub allow_intrabc: bool,
    /// Set when only LAST and GOLDEN are coded and the other references are
    /// derived with set_frame_refs().
    pub frame_refs_short_signaling: bool,
    pub last_frame_idx: u8,
    pub gold_frame_idx: u8,
    /// Slot used by each of LAST_FRAME..ALTREF_FRAME.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub allow_high_precision_mv: bool,
    pub is_motion_mode_switchable: bool,
    pub use_ref_frame_mvs: bool,
    pub disable_frame_end_update_cdf: bool,
    pub allow_warped_motion: bool,
    pub reduced_tx_set: bool,
    pub render_and_frame_size_different: bool,
    pub use_superres: bool,
    pub is_filter_switchable: bool,
    pub interpolation_filter: InterpolationFilter,
    pub loop_filter_params: LoopFilterParams,
    pub quantization_params: QuantizationParams,
    pub segmentation_params: SegmentationParams,
    pub tile_info: TileInfo,
    pub cdef_params: CdefParams,
    pub loop_restoration_params: LoopRestorationParams,
    pub skip_mode_present: bool,
    /// Whether blocks may pick between single and compound prediction.
    pub reference_select: bool,
    pub global_motion_params: GlobalMotionParams,
    pub film_grain_params: FilmGrainParams,

    /* CamelCase variables */
    pub superres_denom: u32,
    pub frame_is_intra: bool,
    pub order_hints: [u32; NUM_REF_FRAMES],
    pub ref_frame_sign_bias: [bool; NUM_REF_FRAMES],
    pub coded_lossless: bool,
    pub all_lossless: bool,
    pub lossless_array: [bool; MAX_SEGMENTS],
    pub seg_qm_level: [[u32; MAX_SEGMENTS]; 3],
    pub upscaled_width: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub tx_mode: TxMode,
    pub skip_mode_frame: [u32; 2],
    pub mi_cols: u32,
    pub mi_rows: u32,
    /// Bit position where the frame header ends, after byte alignment.
    pub frame_header_end_pos: u64,
    /// Length of the frame header in bytes.
    pub header_bytes: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// Filter strength for vertical luma edges, horizontal luma edges, U and
    /// V, in that order.
    pub loop_filter_level: [u8; 4],
    pub loop_filter_sharpness: u8,
    /// Whether the filter level depends on the prediction mode and reference
    /// frame.
    pub loop_filter_delta_enabled: bool,
    pub loop_filter_delta_update: bool,
    /// Filter level adjustment per reference frame. Kept from the primary
    /// reference frame when not coded.
    pub loop_filter_ref_deltas: [i8; TOTAL_REFS_PER_FRAME],
    /// Filter level adjustment per prediction mode.
    pub loop_filter_mode_deltas: [i8; 2],
    pub delta_lf_present: bool,
    pub delta_lf_res: u32,
    pub delta_lf_multi: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizationParams {
    /// Base quantizer index, used for Y AC and as the base for the others.
    pub base_q_idx: u32,
    pub diff_uv_delta: bool,
    pub using_qmatrix: bool,
    pub qm_y: u32,
    pub qm_u: u32,
    pub qm_v: u32,
    pub delta_q_present: bool,
    pub delta_q_res: u32,
    /// Same as DeltaQYDc
    pub delta_q_y_dc: i32,
    /// Same as DeltaQUDc
    pub delta_q_u_dc: i32,
    /// Same as DeltaQUAc
    pub delta_q_u_ac: i32,
    /// Same as DeltaQVDc
    pub delta_q_v_dc: i32,
    /// Same as DeltaQVAc
    pub delta_q_v_ac: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub segmentation_enabled: bool,
    pub segmentation_update_map: bool,
    pub segmentation_temporal_update: bool,
    /// Whether new feature values are coded. When not set they are kept from
    /// the primary reference frame.
    pub segmentation_update_data: bool,
    pub feature_enabled: [[bool; SEG_LVL_MAX]; MAX_SEGMENTS],
    pub feature_data: [[i16; SEG_LVL_MAX]; MAX_SEGMENTS],
    /// Same as SegIdPreSkip
    pub seg_id_pre_skip: u32,
    /// Same as LastActiveSegId
    pub last_active_seg_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileInfo {
    /// Set when every tile has the same size, except for the ones at the
    /// right and bottom edges.
    pub uniform_tile_spacing_flag: bool,
    /// Tile widths in superblocks, minus 1. Only coded for non uniform
    /// spacing but always filled in.
    pub width_in_sbs_minus_1: [u32; MAX_TILE_COLS],
    /// Tile heights in superblocks, minus 1.
    pub height_in_sbs_minus_1: [u32; MAX_TILE_ROWS],
    /// The tile whose CDFs are carried over to the next frames.
    pub context_update_tile_id: u32,
    /// Same as MiColStarts. `tile_cols + 1` entries are valid.
    pub mi_col_starts: [u32; MAX_TILE_COLS + 1],
    /// Same as MiRowStarts. `tile_rows + 1` entries are valid.
    pub mi_row_starts: [u32; MAX_TILE_ROWS + 1],
    pub tile_cols_log2: u32,
    pub tile_cols: u32,
    pub tile_rows_log2: u32,
    pub tile_rows: u32,
    /// Same as TileSizeBytes: the width of each tile size field in a tile
    /// group.
    pub tile_size_bytes: u32,
}

impl Default for TileInfo {
    fn default() -> Self {
        Self {
            uniform_tile_spacing_flag: false,
            width_in_sbs_minus_1: [0; MAX_TILE_COLS],
            height_in_sbs_minus_1: [0; MAX_TILE_ROWS],
            context_update_tile_id: 0,
            mi_col_starts: [0; MAX_TILE_COLS + 1],
            mi_row_starts: [0; MAX_TILE_ROWS + 1],
            tile_cols_log2: 0,
            tile_cols: 0,
            tile_rows_log2: 0,
            tile_rows: 0,
            tile_size_bytes: 0,
        }
    }
}

impl TileInfo {
    pub fn num_tiles(&self) -> u32 {
        self.tile_cols * self.tile_rows
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CdefParams {
    /// Same as CdefDamping.
    pub cdef_damping: u32,
    pub cdef_bits: u32,
    pub cdef_y_pri_strength: [u32; CDEF_MAX],
    /// Secondary strength, with the coded value 3 already mapped to 4.
    pub cdef_y_sec_strength: [u32; CDEF_MAX],
    pub cdef_uv_pri_strength: [u32; CDEF_MAX],
    pub cdef_uv_sec_strength: [u32; CDEF_MAX],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopRestorationParams {
    pub lr_unit_shift: u8,
    pub lr_uv_shift: u8,
    /// Same as FrameRestorationType.
    pub frame_restoration_type: [FrameRestorationType; MAX_NUM_PLANES],
    /// Same as LoopRestorationSize.
    pub loop_restoration_size: [u16; MAX_NUM_PLANES],
    /// Same as UsesLr.
    pub uses_lr: bool,
    /// Same as usesChromaLr.
    pub uses_chroma_lr: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalMotionParams {
    pub is_global: [bool; NUM_REF_FRAMES],
    pub is_rot_zoom: [bool; NUM_REF_FRAMES],
    pub is_translation: [bool; NUM_REF_FRAMES],
    /// Warp parameters per reference frame, in WARPEDMODEL_PREC_BITS fixed
    /// point.
    pub gm_params: [[i32; 6]; NUM_REF_FRAMES],
    /// Output of the setup shear process for `gm_params`. See 7.11.3.6
    pub warp_valid: [bool; NUM_REF_FRAMES],
    /// Same as GmType.
    pub gm_type: [WarpModelType; NUM_REF_FRAMES],
}

impl GlobalMotionParams {
    /// Identity motion for every reference frame.
    pub fn identity() -> Self {
        let mut gm = Self::default();

        for ref_frame in ReferenceFrameType::Last as usize..=ReferenceFrameType::AltRef as usize {
            gm.gm_type[ref_frame] = WarpModelType::Identity;
            gm.gm_params[ref_frame] = identity_warp_params();
            gm.warp_valid[ref_frame] = true;
        }

        gm
    }
}

fn identity_warp_params() -> [i32; 6] {
    let mut params = [0; 6];
    for (i, param) in params.iter_mut().enumerate() {
        if i % 3 == 2 {
            *param = 1 << WARPEDMODEL_PREC_BITS;
        }
    }
    params
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainParams {
    /// Whether grain is added to this frame. Every other field is zero when
    /// not set.
    pub apply_grain: bool,
    /// Seed of the grain pseudo-random generator.
    pub grain_seed: u16,
    /// When not set, the parameters come from the slot
    /// `film_grain_params_ref_idx`.
    pub update_grain: bool,
    pub film_grain_params_ref_idx: u8,
    pub num_y_points: u8,
    pub point_y_value: [u8; MAX_NUM_Y_POINTS],
    pub point_y_scaling: [u8; MAX_NUM_Y_POINTS],
    pub chroma_scaling_from_luma: bool,
    pub num_cb_points: u8,
    pub point_cb_value: [u8; MAX_NUM_CB_POINTS],
    pub point_cb_scaling: [u8; MAX_NUM_CB_POINTS],
    pub num_cr_points: u8,
    pub point_cr_value: [u8; MAX_NUM_CR_POINTS],
    pub point_cr_scaling: [u8; MAX_NUM_CR_POINTS],
    pub grain_scaling_minus_8: u8,
    pub ar_coeff_lag: u32,
    pub ar_coeffs_y_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeffs_cb_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeffs_cr_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeff_shift_minus_6: u8,
    pub grain_scale_shift: u8,
    pub cb_mult: u8,
    pub cb_luma_mult: u8,
    pub cb_offset: u16,
    pub cr_mult: u8,
    pub cr_luma_mult: u8,
    pub cr_offset: u16,
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tile {
    /// Same as TileNum.
    pub tile_num: u32,
    /// Offset of the tile data from the start of the tile group.
    pub tile_offset: usize,
    /// Same as TileSize.
    pub tile_size: usize,
    pub tile_row: u32,
    pub tile_col: u32,
    // Same as MiRowStart.
    pub mi_row_start: u32,
    // Same as MiRowEnd.
    pub mi_row_end: u32,
    // Same as MiColStart.
    pub mi_col_start: u32,
    // Same as MiColEnd.
    pub mi_col_end: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileGroupObu<'a> {
    /// The tile group bytes. Tile offsets are relative to them.
    pub data: &'a [u8],
    /// Whether tg_start and tg_end are coded. When not, the tile group holds
    /// every tile of the frame.
    pub tile_start_and_end_present_flag: bool,
    /// Index of the first tile in this tile group.
    pub tg_start: u32,
    /// Index of the last tile in this tile group.
    pub tg_end: u32,
    /// The tiles from `tg_start` to `tg_end`.
    pub tiles: Vec<Tile>,
}

impl<'a> TileGroupObu<'a> {
    /// The coded bytes of `tile`.
    pub fn tile_data(&self, tile: &Tile) -> &'a [u8] {
        self.data
            .get(tile.tile_offset..tile.tile_offset + tile.tile_size)
            .unwrap_or_default()
    }

    /// Whether this tile group ends with the last tile of the frame.
    pub fn is_last_in_frame(&self, tile_info: &TileInfo) -> bool {
        self.tg_end + 1 == tile_info.num_tiles()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameObu<'a> {
    pub header: FrameHeaderObu,
    pub tile_group: TileGroupObu<'a>,
}

/// Parses a sequence header OBU payload. See 5.5
pub fn parse_sequence_header(data: &[u8]) -> ParseResult<SequenceHeaderObu> {
    let mut r = Reader::new(data);
    let mut s = SequenceHeaderObu::default();

    let profile = r.read_bits(3)?;
    s.seq_profile = Profile::n(profile).ok_or(ParseError::invalid("seq_profile", profile))?;
    s.still_picture = r.read_bit()?;
    s.reduced_still_picture_header = r.read_bit()?;

    if s.reduced_still_picture_header {
        s.timing_info_present_flag = false;
        s.decoder_model_info_present_flag = false;
        s.initial_display_delay_present_flag = false;
        s.operating_points_cnt_minus_1 = 0;
        s.operating_points[0].idc = 0;
        s.operating_points[0].seq_level_idx = r.read_bits(5)?;
        s.operating_points[0].seq_tier = 0;
        s.operating_points[0].decoder_model_present_for_this_op = false;
        s.operating_points[0].initial_display_delay_present_for_this_op = false;
    } else {
        s.timing_info_present_flag = r.read_bit()?;
        if s.timing_info_present_flag {
            parse_timing_info(&mut s.timing_info, &mut r)?;
            s.decoder_model_info_present_flag = r.read_bit()?;
            if s.decoder_model_info_present_flag {
                parse_decoder_model_info(&mut s.decoder_model_info, &mut r)?;
            }
        }

        s.initial_display_delay_present_flag = r.read_bit()?;
        s.operating_points_cnt_minus_1 = r.read_bits(5)?;

        let buffer_delay_length = s.decoder_model_info.buffer_delay_length_minus_1 + 1;
        for op in s
            .operating_points
            .iter_mut()
            .take(s.operating_points_cnt_minus_1 as usize + 1)
        {
            op.idc = r.read_bits(12)?;
            op.seq_level_idx = r.read_bits(5)?;
            op.seq_tier = if op.seq_level_idx > 7 {
                u32::from(r.read_bit()?)
            } else {
                0
            };

            if s.decoder_model_info_present_flag {
                op.decoder_model_present_for_this_op = r.read_bit()?;
                if op.decoder_model_present_for_this_op {
                    op.decoder_buffer_delay = r.read_bits(buffer_delay_length)?;
                    op.encoder_buffer_delay = r.read_bits(buffer_delay_length)?;
                    op.low_delay_mode_flag = r.read_bit()?;
                }
            }

            if s.initial_display_delay_present_flag {
                op.initial_display_delay_present_for_this_op = r.read_bit()?;
                if op.initial_display_delay_present_for_this_op {
                    op.initial_display_delay_minus_1 = r.read_bits(4)?;
                }
            }
        }
    }

    s.frame_width_bits_minus_1 = r.read_bits(4)?;
    s.frame_height_bits_minus_1 = r.read_bits(4)?;
    s.max_frame_width_minus_1 = r.read_bits(s.frame_width_bits_minus_1 + 1)?;
    s.max_frame_height_minus_1 = r.read_bits(s.frame_height_bits_minus_1 + 1)?;

    if !s.reduced_still_picture_header {
        s.frame_id_numbers_present_flag = r.read_bit()?;
    }

    if s.frame_id_numbers_present_flag {
        s.delta_frame_id_length_minus_2 = r.read_bits(4)?;
        s.additional_frame_id_length_minus_1 = r.read_bits(3)?;
        let frame_id_length = s.frame_id_length();
        if frame_id_length > 16 {
            return Err(ParseError::invalid("frame_id_length", frame_id_length));
        }
    }

    s.use_128x128_superblock = r.read_bit()?;
    s.enable_filter_intra = r.read_bit()?;
    s.enable_intra_edge_filter = r.read_bit()?;

    if s.reduced_still_picture_header {
        s.seq_force_screen_content_tools = SELECT_SCREEN_CONTENT_TOOLS;
        s.seq_force_integer_mv = SELECT_INTEGER_MV;
    } else {
        s.enable_interintra_compound = r.read_bit()?;
        s.enable_masked_compound = r.read_bit()?;
        s.enable_warped_motion = r.read_bit()?;
        s.enable_dual_filter = r.read_bit()?;
        s.enable_order_hint = r.read_bit()?;
        if s.enable_order_hint {
            s.enable_jnt_comp = r.read_bit()?;
            s.enable_ref_frame_mvs = r.read_bit()?;
        }

        s.seq_choose_screen_content_tools = r.read_bit()?;
        s.seq_force_screen_content_tools = if s.seq_choose_screen_content_tools {
            SELECT_SCREEN_CONTENT_TOOLS
        } else {
            u32::from(r.read_bit()?)
        };

        s.seq_force_integer_mv = SELECT_INTEGER_MV;
        if s.seq_force_screen_content_tools > 0 {
            s.seq_choose_integer_mv = r.read_bit()?;
            if !s.seq_choose_integer_mv {
                s.seq_force_integer_mv = u32::from(r.read_bit()?);
            }
        }

        if s.enable_order_hint {
            s.order_hint_bits_minus_1 = r.read_bits(3)?;
            s.order_hint_bits = s.order_hint_bits_minus_1 + 1;
        }
    }

    s.enable_superres = r.read_bit()?;
    s.enable_cdef = r.read_bit()?;
    s.enable_restoration = r.read_bit()?;

    parse_color_config(&mut s.color_config, s.seq_profile, &mut r)?;

    s.film_grain_params_present = r.read_bit()?;

    log::debug!(
        "Sequence header: profile {:?}, level {}, {}x{} max, {:?}, order hint bits {}",
        s.seq_profile,
        s.operating_points[0].seq_level_idx,
        s.max_frame_width_minus_1 + 1,
        s.max_frame_height_minus_1 + 1,
        s.color_config.bit_depth,
        s.order_hint_bits
    );

    Ok(s)
}

fn parse_timing_info(ti: &mut TimingInfo, r: &mut Reader) -> ParseResult<()> {
    ti.num_units_in_display_tick = r.read_bits(32)?;
    ti.time_scale = r.read_bits(32)?;
    ti.equal_picture_interval = r.read_bit()?;
    if ti.equal_picture_interval {
        ti.num_ticks_per_picture_minus_1 = r.read_uvlc()?;
    }
    Ok(())
}

fn parse_decoder_model_info(dmi: &mut DecoderModelInfo, r: &mut Reader) -> ParseResult<()> {
    dmi.buffer_delay_length_minus_1 = r.read_bits(5)?;
    dmi.num_units_in_decoding_tick = r.read_bits(32)?;
    dmi.buffer_removal_time_length_minus_1 = r.read_bits(5)?;
    dmi.frame_presentation_time_length_minus_1 = r.read_bits(5)?;
    Ok(())
}

// 5.5.2
fn parse_color_config(cc: &mut ColorConfig, profile: Profile, r: &mut Reader) -> ParseResult<()> {
    cc.high_bitdepth = r.read_bit()?;
    if profile == Profile::Profile2 && cc.high_bitdepth {
        cc.twelve_bit = r.read_bit()?;
        cc.bit_depth = if cc.twelve_bit {
            BitDepth::Depth12
        } else {
            BitDepth::Depth10
        };
    } else {
        cc.bit_depth = if cc.high_bitdepth {
            BitDepth::Depth10
        } else {
            BitDepth::Depth8
        };
    }

    cc.mono_chrome = if profile == Profile::Profile1 {
        false
    } else {
        r.read_bit()?
    };
    cc.num_planes = if cc.mono_chrome { 1 } else { 3 };

    cc.color_description_present_flag = r.read_bit()?;
    if cc.color_description_present_flag {
        let cp = r.read_bits(8)?;
        cc.color_primaries =
            ColorPrimaries::n(cp).ok_or(ParseError::invalid("color_primaries", cp))?;
        let tc = r.read_bits(8)?;
        cc.transfer_characteristics = TransferCharacteristics::n(tc)
            .ok_or(ParseError::invalid("transfer_characteristics", tc))?;
        let mc = r.read_bits(8)?;
        cc.matrix_coefficients =
            MatrixCoefficients::n(mc).ok_or(ParseError::invalid("matrix_coefficients", mc))?;
    } else {
        cc.color_primaries = ColorPrimaries::Unspecified;
        cc.transfer_characteristics = TransferCharacteristics::Unspecified;
        cc.matrix_coefficients = MatrixCoefficients::Unspecified;
    }

    if cc.mono_chrome {
        cc.color_range = r.read_bit()?;
        cc.subsampling_x = true;
        cc.subsampling_y = true;
        cc.chroma_sample_position = ChromaSamplePosition::Unknown;
        cc.separate_uv_delta_q = false;
        return Ok(());
    }

    if cc.color_primaries == ColorPrimaries::Bt709
        && cc.transfer_characteristics == TransferCharacteristics::Srgb
        && cc.matrix_coefficients == MatrixCoefficients::Identity
    {
        cc.color_range = true;
        cc.subsampling_x = false;
        cc.subsampling_y = false;
    } else {
        cc.color_range = r.read_bit()?;
        match profile {
            Profile::Profile0 => {
                cc.subsampling_x = true;
                cc.subsampling_y = true;
            }
            Profile::Profile1 => {
                cc.subsampling_x = false;
                cc.subsampling_y = false;
            }
            Profile::Profile2 => {
                if cc.bit_depth == BitDepth::Depth12 {
                    cc.subsampling_x = r.read_bit()?;
                    cc.subsampling_y = if cc.subsampling_x {
                        r.read_bit()?
                    } else {
                        false
                    };
                } else {
                    cc.subsampling_x = true;
                    cc.subsampling_y = false;
                }
            }
        }

        if cc.subsampling_x && cc.subsampling_y {
            let csp = r.read_bits(2)?;
            cc.chroma_sample_position = ChromaSamplePosition::n(csp)
                .ok_or(ParseError::invalid("chroma_sample_position", csp))?;
        }
    }

    cc.separate_uv_delta_q = r.read_bit()?;
    Ok(())
}

/// Parses a frame header. `data` is the payload of a FRAME_HEADER,
/// REDUNDANT_FRAME_HEADER or FRAME OBU and `obu_header` the header of that
/// OBU.
///
/// Once a frame header has been seen, further frame headers of the same
/// frame are copies of it and no bits are read. A header that shows an
/// existing frame ends the frame right away. `state` is only modified if the
/// header parses successfully.
pub fn parse_frame_header(
    data: &[u8],
    seq: &SequenceHeaderObu,
    state: &mut DecodeState,
    obu_header: &ObuHeader,
) -> ParseResult<FrameHeaderObu> {
    if state.seen_frame_header {
        // frame_header_copy()
        if !state.prev_filled {
            return Err(ParseError::MissingPreviousHeader);
        }

        log::debug!("Copying the previous frame header");
        return Ok(state.prev_frame_header.clone());
    }

    let mut next = state.clone();
    next.seen_frame_header = true;

    let mut r = Reader::new(data);
    let mut fh = FrameHeaderObu {
        obu_header: Some(obu_header.clone()),
        ..Default::default()
    };

    parse_uncompressed_header(&mut r, seq, &mut next, &mut fh)?;

    r.byte_alignment();
    fh.frame_header_end_pos = r.position();
    fh.header_bytes = (fh.frame_header_end_pos / 8) as usize;

    if fh.show_existing_frame {
        if fh.frame_type == FrameType::KeyFrame {
            next.load_reference_frame(&mut fh)?;
            next.update_reference_frames(&fh, seq)?;
        }

        next.seen_frame_header = false;
        next.prev_filled = false;
    } else {
        next.update_reference_frames(&fh, seq)?;
        next.prev_frame_header = fh.clone();
        next.prev_filled = true;
    }

    next.is_first_frame = false;
    *state = next;

    log::debug!(
        "Frame header: {:?}, show_frame {}, show_existing_frame {}, {}x{}, order hint {}, refresh {:#04x}",
        fh.frame_type,
        fh.show_frame,
        fh.show_existing_frame,
        fh.upscaled_width,
        fh.frame_height,
        fh.order_hint,
        fh.refresh_frame_flags
    );

    Ok(fh)
}

// 5.9.2
fn parse_uncompressed_header(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &mut DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    let id_len = if seq.frame_id_numbers_present_flag {
        seq.frame_id_length()
    } else {
        0
    };

    if seq.reduced_still_picture_header {
        fh.show_existing_frame = false;
        fh.frame_type = FrameType::KeyFrame;
        fh.frame_is_intra = true;
        fh.show_frame = true;
        fh.showable_frame = false;
        fh.error_resilient_mode = true;
    } else {
        fh.show_existing_frame = r.read_bit()?;
        if fh.show_existing_frame {
            let is_frame_obu = fh
                .obu_header
                .as_ref()
                .is_some_and(|h| h.obu_type == ObuType::Frame);
            if is_frame_obu {
                return Err(ParseError::Conformance(
                    "show_existing_frame inside an OBU_FRAME",
                ));
            }

            return parse_show_existing_frame(r, seq, state, fh, id_len);
        }

        let frame_type = r.read_bits(2)?;
        fh.frame_type = FrameType::n(frame_type).ok_or(ParseError::invalid("frame_type", frame_type))?;
        fh.frame_is_intra = matches!(
            fh.frame_type,
            FrameType::IntraOnlyFrame | FrameType::KeyFrame
        );

        fh.show_frame = r.read_bit()?;
        if fh.show_frame
            && seq.decoder_model_info_present_flag
            && !seq.timing_info.equal_picture_interval
        {
            fh.frame_presentation_time = read_temporal_point_info(r, seq)?;
        }

        fh.showable_frame = if fh.show_frame {
            fh.frame_type != FrameType::KeyFrame
        } else {
            r.read_bit()?
        };

        fh.error_resilient_mode = if fh.frame_type == FrameType::SwitchFrame
            || (fh.frame_type == FrameType::KeyFrame && fh.show_frame)
        {
            true
        } else {
            r.read_bit()?
        };
    }

    if fh.frame_type == FrameType::KeyFrame && fh.show_frame {
        for rf in state.ref_info.iter_mut() {
            rf.ref_valid = false;
            rf.ref_order_hint = 0;
        }
        for i in 0..REFS_PER_FRAME {
            fh.order_hints[ReferenceFrameType::Last as usize + i] = 0;
        }
    }

    fh.disable_cdf_update = r.read_bit()?;
    fh.allow_screen_content_tools =
        if seq.seq_force_screen_content_tools == SELECT_SCREEN_CONTENT_TOOLS {
            u32::from(r.read_bit()?)
        } else {
            seq.seq_force_screen_content_tools
        };

    fh.force_integer_mv = if fh.allow_screen_content_tools > 0 {
        if seq.seq_force_integer_mv == SELECT_INTEGER_MV {
            u32::from(r.read_bit()?)
        } else {
            seq.seq_force_integer_mv
        }
    } else {
        0
    };

    if fh.frame_is_intra {
        fh.force_integer_mv = 1;
    }

    if seq.frame_id_numbers_present_flag {
        parse_current_frame_id(r, seq, state, fh, id_len)?;
    } else {
        state.prev_frame_id = 0;
        state.current_frame_id = 0;
        fh.current_frame_id = 0;
    }

    fh.frame_size_override_flag = if fh.frame_type == FrameType::SwitchFrame {
        true
    } else if seq.reduced_still_picture_header {
        false
    } else {
        r.read_bit()?
    };

    fh.order_hint = r.read_bits(seq.order_hint_bits)?;

    fh.primary_ref_frame = if fh.frame_is_intra || fh.error_resilient_mode {
        PRIMARY_REF_NONE
    } else {
        r.read_bits(3)?
    };

    if seq.decoder_model_info_present_flag {
        fh.buffer_removal_time_present_flag = r.read_bit()?;
        if fh.buffer_removal_time_present_flag {
            parse_buffer_removal_times(r, seq, fh)?;
        }
    }

    fh.allow_high_precision_mv = false;
    fh.use_ref_frame_mvs = false;
    fh.allow_intrabc = false;

    fh.refresh_frame_flags = if fh.frame_type == FrameType::SwitchFrame
        || (fh.frame_type == FrameType::KeyFrame && fh.show_frame)
    {
        ALL_FRAMES
    } else {
        r.read_bits(8)?
    };

    if fh.frame_type == FrameType::IntraOnlyFrame && fh.refresh_frame_flags == ALL_FRAMES {
        return Err(ParseError::Conformance(
            "intra-only frames cannot refresh every reference slot",
        ));
    }

    if (!fh.frame_is_intra || fh.refresh_frame_flags != ALL_FRAMES)
        && fh.error_resilient_mode
        && seq.enable_order_hint
    {
        for (i, rf) in state.ref_info.iter_mut().enumerate() {
            fh.ref_order_hint[i] = r.read_bits(seq.order_hint_bits)?;
            if fh.ref_order_hint[i] != rf.ref_order_hint || !rf.ref_valid {
                *rf = ReferenceFrameInfo {
                    ref_order_hint: fh.ref_order_hint[i],
                    ..Default::default()
                };
            }
        }
    }

    if fh.frame_is_intra {
        parse_frame_size(r, seq, fh)?;
        parse_render_size(r, fh)?;
        if fh.allow_screen_content_tools > 0 && fh.upscaled_width == fh.frame_width {
            fh.allow_intrabc = r.read_bit()?;
        }
    } else {
        parse_inter_frame_refs(r, seq, state, fh, id_len)?;
    }

    fh.disable_frame_end_update_cdf = if seq.reduced_still_picture_header || fh.disable_cdf_update
    {
        true
    } else {
        r.read_bit()?
    };

    let prev_gm_params = if fh.primary_ref_frame == PRIMARY_REF_NONE {
        setup_past_independence(fh);
        GlobalMotionParams::identity().gm_params
    } else {
        load_previous(state, fh)?
    };

    parse_tile_info(r, seq, fh)?;
    parse_quantization_params(r, &mut fh.quantization_params, &seq.color_config)?;
    parse_segmentation_params(r, fh)?;
    parse_delta_q_params(r, &mut fh.quantization_params)?;
    parse_delta_lf_params(
        r,
        &mut fh.loop_filter_params,
        fh.quantization_params.delta_q_present,
        fh.allow_intrabc,
    )?;

    compute_lossless(fh);

    parse_loop_filter_params(r, fh, seq.color_config.num_planes)?;
    parse_cdef_params(r, fh, seq)?;
    parse_loop_restoration_params(r, fh, seq)?;
    read_tx_mode(r, fh)?;

    fh.reference_select = if fh.frame_is_intra {
        false
    } else {
        r.read_bit()?
    };

    parse_skip_mode_params(r, seq, state, fh)?;

    fh.allow_warped_motion =
        if fh.frame_is_intra || fh.error_resilient_mode || !seq.enable_warped_motion {
            false
        } else {
            r.read_bit()?
        };

    fh.reduced_tx_set = r.read_bit()?;
    parse_global_motion_params(r, fh, &prev_gm_params)?;
    parse_film_grain_params(r, seq, state, fh)?;

    Ok(())
}

fn read_temporal_point_info(r: &mut Reader, seq: &SequenceHeaderObu) -> ParseResult<u32> {
    r.read_bits(
        seq.decoder_model_info
            .frame_presentation_time_length_minus_1
            + 1,
    )
}

fn parse_show_existing_frame(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
    id_len: u32,
) -> ParseResult<()> {
    fh.frame_to_show_map_idx = r.read_bits(3)?;

    if seq.decoder_model_info_present_flag && !seq.timing_info.equal_picture_interval {
        fh.frame_presentation_time = read_temporal_point_info(r, seq)?;
    }

    let slot = fh.frame_to_show_map_idx as usize;
    let rf = &state.ref_info[slot];

    fh.refresh_frame_flags = 0;
    if seq.frame_id_numbers_present_flag {
        fh.display_frame_id = r.read_bits(id_len)?;
        if !rf.ref_valid {
            return Err(ParseError::InvalidReference(slot));
        }
        if rf.ref_frame_id != fh.display_frame_id {
            return Err(ParseError::FrameIdMismatch {
                expected: rf.ref_frame_id,
                actual: fh.display_frame_id,
            });
        }
    }

    if !rf.showable_frame {
        return Err(ParseError::Conformance(
            "show_existing_frame of a frame that is not showable",
        ));
    }

    fh.frame_type = rf.ref_frame_type;
    fh.frame_is_intra = matches!(
        fh.frame_type,
        FrameType::IntraOnlyFrame | FrameType::KeyFrame
    );
    fh.show_frame = true;
    // A shown key frame can only be shown once.
    fh.showable_frame = fh.frame_type != FrameType::KeyFrame;
    fh.upscaled_width = rf.ref_upscaled_width;
    fh.frame_width = rf.ref_frame_width;
    fh.frame_height = rf.ref_frame_height;
    fh.render_width = rf.ref_render_width;
    fh.render_height = rf.ref_render_height;
    fh.mi_cols = rf.ref_mi_cols;
    fh.mi_rows = rf.ref_mi_rows;
    fh.order_hint = rf.ref_order_hint;

    if fh.frame_type == FrameType::KeyFrame {
        fh.refresh_frame_flags = ALL_FRAMES;
    }

    if seq.film_grain_params_present {
        // load_grain_params()
        fh.film_grain_params = rf.film_grain_params.clone();
    }

    Ok(())
}

fn parse_current_frame_id(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &mut DecodeState,
    fh: &mut FrameHeaderObu,
    id_len: u32,
) -> ParseResult<()> {
    state.prev_frame_id = state.current_frame_id;
    state.current_frame_id = r.read_bits(id_len)?;
    fh.current_frame_id = state.current_frame_id;

    let have_prev_frame_id =
        !(state.is_first_frame || (fh.frame_type == FrameType::KeyFrame && fh.show_frame));

    if have_prev_frame_id {
        let id_space = 1u32 << id_len;
        let diff_frame_id = (state.current_frame_id + id_space - state.prev_frame_id) % id_space;

        if diff_frame_id == 0 || diff_frame_id >= (id_space >> 1) {
            return Err(ParseError::Conformance(
                "current_frame_id does not advance from the previous frame id",
            ));
        }
    }

    // mark_ref_frames(idLen)
    let diff_len = seq.delta_frame_id_length_minus_2 + 2;
    let shifted_diff_len = 1u32 << diff_len;
    let shifted_id_len = 1u32 << id_len;
    let current = state.current_frame_id;

    for rf in state.ref_info.iter_mut() {
        let stale = if current > shifted_diff_len {
            rf.ref_frame_id > current || rf.ref_frame_id < current - shifted_diff_len
        } else {
            rf.ref_frame_id > current
                && rf.ref_frame_id < shifted_id_len + current - shifted_diff_len
        };

        if stale {
            rf.ref_valid = false;
        }
    }

    Ok(())
}

fn parse_buffer_removal_times(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    let (temporal_id, spatial_id) = fh
        .obu_header
        .as_ref()
        .map_or((0, 0), |h| (h.temporal_id, h.spatial_id));
    let n = seq.decoder_model_info.buffer_removal_time_length_minus_1 + 1;

    for (op_num, op) in seq
        .operating_points
        .iter()
        .enumerate()
        .take(seq.operating_points_cnt_minus_1 as usize + 1)
    {
        if !op.decoder_model_present_for_this_op {
            continue;
        }

        let in_temporal_layer = (op.idc >> temporal_id) & 1 != 0;
        let in_spatial_layer = (op.idc >> (spatial_id + 8)) & 1 != 0;

        if op.idc == 0 || (in_temporal_layer && in_spatial_layer) {
            fh.buffer_removal_time[op_num] = r.read_bits(n)?;
        }
    }

    Ok(())
}

// The inter frame branch of 5.9.2: reference selection, frame size and the
// motion vector tools.
fn parse_inter_frame_refs(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
    id_len: u32,
) -> ParseResult<()> {
    fh.frame_refs_short_signaling = false;
    if seq.enable_order_hint {
        fh.frame_refs_short_signaling = r.read_bit()?;
        if fh.frame_refs_short_signaling {
            fh.last_frame_idx = r.read_bits(3)? as u8;
            fh.gold_frame_idx = r.read_bits(3)? as u8;
            set_frame_refs(seq, state, fh)?;
        }
    }

    for i in 0..REFS_PER_FRAME {
        if !fh.frame_refs_short_signaling {
            fh.ref_frame_idx[i] = r.read_bits(3)? as u8;
        }

        let rf = state.reference(fh.ref_frame_idx[i] as usize)?;

        if seq.frame_id_numbers_present_flag {
            let delta_frame_id = r.read_bits(seq.delta_frame_id_length_minus_2 + 2)? + 1;
            let shifted_id_len = 1u32 << id_len;
            let expected =
                (state.current_frame_id + shifted_id_len - delta_frame_id) % shifted_id_len;
            let actual = rf.ref_frame_id;

            if expected != actual {
                return Err(ParseError::FrameIdMismatch { expected, actual });
            }
        }
    }

    if fh.frame_size_override_flag && !fh.error_resilient_mode {
        frame_size_with_refs(r, seq, state, fh)?;
    } else {
        parse_frame_size(r, seq, fh)?;
        parse_render_size(r, fh)?;
    }

    fh.allow_high_precision_mv = if fh.force_integer_mv > 0 {
        false
    } else {
        r.read_bit()?
    };

    // read_interpolation_filter()
    fh.is_filter_switchable = r.read_bit()?;
    fh.interpolation_filter = if fh.is_filter_switchable {
        InterpolationFilter::Switchable
    } else {
        let filter = r.read_bits(2)?;
        InterpolationFilter::n(filter).ok_or(ParseError::invalid("interpolation_filter", filter))?
    };

    fh.is_motion_mode_switchable = r.read_bit()?;

    fh.use_ref_frame_mvs = if fh.error_resilient_mode || !seq.enable_ref_frame_mvs {
        false
    } else {
        r.read_bit()?
    };

    for i in 0..REFS_PER_FRAME {
        let ref_frame = ReferenceFrameType::Last as usize + i;
        let hint = state.ref_info[fh.ref_frame_idx[i] as usize].ref_order_hint;
        fh.order_hints[ref_frame] = hint;

        fh.ref_frame_sign_bias[ref_frame] = seq.enable_order_hint
            && helpers::get_relative_dist(
                seq.enable_order_hint,
                seq.order_hint_bits,
                hint as i32,
                fh.order_hint as i32,
            ) > 0;
    }

    Ok(())
}

/// Implements 7.8: derives the reference slots not coded when
/// frame_refs_short_signaling is set.
fn set_frame_refs(
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    const LAST: usize = ReferenceFrameType::Last as usize;

    let mut ref_frame_idx: [Option<usize>; REFS_PER_FRAME] = [None; REFS_PER_FRAME];
    let last_frame_idx = usize::from(fh.last_frame_idx);
    let gold_frame_idx = usize::from(fh.gold_frame_idx);

    ref_frame_idx[0] = Some(last_frame_idx);
    ref_frame_idx[ReferenceFrameType::Golden as usize - LAST] = Some(gold_frame_idx);

    let mut used_frame = [false; NUM_REF_FRAMES];
    used_frame[last_frame_idx] = true;
    used_frame[gold_frame_idx] = true;

    let cur_frame_hint = 1i32 << seq.order_hint_bits_minus_1;
    let mut shifted_order_hints = [0i32; NUM_REF_FRAMES];
    for (shifted, rf) in shifted_order_hints.iter_mut().zip(state.ref_info.iter()) {
        *shifted = cur_frame_hint
            + helpers::get_relative_dist(
                seq.enable_order_hint,
                seq.order_hint_bits,
                rf.ref_order_hint as i32,
                fh.order_hint as i32,
            );
    }

    if shifted_order_hints[last_frame_idx] >= cur_frame_hint {
        return Err(ParseError::Conformance(
            "LAST_FRAME must precede the current frame",
        ));
    }

    if shifted_order_hints[gold_frame_idx] >= cur_frame_hint {
        return Err(ParseError::Conformance(
            "GOLDEN_FRAME must precede the current frame",
        ));
    }

    let found = helpers::find_latest_backward(&shifted_order_hints, &used_frame, cur_frame_hint);
    assign_ref(&mut ref_frame_idx, &mut used_frame, ReferenceFrameType::AltRef, found);

    let found = helpers::find_earliest_backward(&shifted_order_hints, &used_frame, cur_frame_hint);
    assign_ref(&mut ref_frame_idx, &mut used_frame, ReferenceFrameType::BwdRef, found);

    let found = helpers::find_earliest_backward(&shifted_order_hints, &used_frame, cur_frame_hint);
    assign_ref(&mut ref_frame_idx, &mut used_frame, ReferenceFrameType::AltRef2, found);

    const REF_FRAME_LIST: [ReferenceFrameType; REFS_PER_FRAME - 2] = [
        ReferenceFrameType::Last2,
        ReferenceFrameType::Last3,
        ReferenceFrameType::BwdRef,
        ReferenceFrameType::AltRef2,
        ReferenceFrameType::AltRef,
    ];

    for ref_frame in REF_FRAME_LIST {
        if ref_frame_idx[ref_frame as usize - LAST].is_none() {
            let found =
                helpers::find_latest_forward(&shifted_order_hints, &used_frame, cur_frame_hint);
            assign_ref(&mut ref_frame_idx, &mut used_frame, ref_frame, found);
        }
    }

    let earliest = helpers::find_earliest(&shifted_order_hints).map_or(0, |(slot, _)| slot);

    for (dest, src) in fh.ref_frame_idx.iter_mut().zip(ref_frame_idx) {
        *dest = src.unwrap_or(earliest) as u8;
    }

    Ok(())
}

fn assign_ref(
    ref_frame_idx: &mut [Option<usize>; REFS_PER_FRAME],
    used_frame: &mut [bool; NUM_REF_FRAMES],
    ref_frame: ReferenceFrameType,
    found: Option<(usize, i32)>,
) {
    if let Some((slot, _)) = found {
        ref_frame_idx[ref_frame as usize - ReferenceFrameType::Last as usize] = Some(slot);
        used_frame[slot] = true;
    }
}

// 5.9.5
fn parse_frame_size(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    if fh.frame_size_override_flag {
        fh.frame_width = r.read_bits(seq.frame_width_bits_minus_1 + 1)? + 1;
        fh.frame_height = r.read_bits(seq.frame_height_bits_minus_1 + 1)? + 1;
    } else {
        fh.frame_width = seq.max_frame_width_minus_1 + 1;
        fh.frame_height = seq.max_frame_height_minus_1 + 1;
    }

    parse_superres_params(r, seq, fh)?;
    compute_image_size(fh);

    Ok(())
}

// 5.9.6
fn parse_render_size(r: &mut Reader, fh: &mut FrameHeaderObu) -> ParseResult<()> {
    fh.render_and_frame_size_different = r.read_bit()?;
    if fh.render_and_frame_size_different {
        fh.render_width = r.read_bits(16)? + 1;
        fh.render_height = r.read_bits(16)? + 1;
    } else {
        fh.render_width = fh.upscaled_width;
        fh.render_height = fh.frame_height;
    }

    Ok(())
}

// 5.9.7
fn frame_size_with_refs(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    let mut found_ref = false;

    for i in 0..REFS_PER_FRAME {
        found_ref = r.read_bit()?;

        if found_ref {
            let rf = state.reference(fh.ref_frame_idx[i] as usize)?;
            fh.upscaled_width = rf.ref_upscaled_width;
            fh.frame_width = fh.upscaled_width;
            fh.frame_height = rf.ref_frame_height;
            fh.render_width = rf.ref_render_width;
            fh.render_height = rf.ref_render_height;
            break;
        }
    }

    if found_ref {
        parse_superres_params(r, seq, fh)?;
        compute_image_size(fh);
    } else {
        parse_frame_size(r, seq, fh)?;
        parse_render_size(r, fh)?;
    }

    Ok(())
}

// 5.9.8
fn parse_superres_params(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    fh.use_superres = seq.enable_superres && r.read_bit()?;

    fh.superres_denom = if fh.use_superres {
        r.read_bits(SUPERRES_DENOM_BITS)? + SUPERRES_DENOM_MIN
    } else {
        SUPERRES_NUM
    };

    fh.upscaled_width = fh.frame_width;
    fh.frame_width = ((u64::from(fh.upscaled_width) * u64::from(SUPERRES_NUM)
        + u64::from(fh.superres_denom / 2))
        / u64::from(fh.superres_denom)) as u32;

    Ok(())
}

// 5.9.9
fn compute_image_size(fh: &mut FrameHeaderObu) {
    fh.mi_cols = 2 * ((fh.frame_width + 7) >> 3);
    fh.mi_rows = 2 * ((fh.frame_height + 7) >> 3);
}

fn setup_past_independence(fh: &mut FrameHeaderObu) {
    fh.segmentation_params.feature_enabled = Default::default();
    fh.segmentation_params.feature_data = Default::default();

    fh.loop_filter_params.loop_filter_delta_enabled = true;
    fh.loop_filter_params.loop_filter_ref_deltas = DEFAULT_LOOP_FILTER_REF_DELTAS;
    fh.loop_filter_params.loop_filter_mode_deltas = [0; 2];
}

/// Implements load_previous(): seeds the loop filter deltas and the
/// segmentation features from the primary reference frame and returns its
/// global motion parameters, PrevGmParams.
fn load_previous(
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<[[i32; 6]; NUM_REF_FRAMES]> {
    let prev_frame = fh.ref_frame_idx[fh.primary_ref_frame as usize] as usize;
    let rf = &state.ref_info[prev_frame];

    if !rf.ref_valid {
        return Err(ParseError::InvalidReference(prev_frame));
    }

    fh.loop_filter_params.loop_filter_ref_deltas = rf.loop_filter_ref_deltas;
    fh.loop_filter_params.loop_filter_mode_deltas = rf.loop_filter_mode_deltas;
    fh.segmentation_params.feature_enabled = rf.segmentation_params.feature_enabled;
    fh.segmentation_params.feature_data = rf.segmentation_params.feature_data;

    Ok(rf.global_motion_params.gm_params)
}

// 5.9.15
fn parse_tile_info(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    let mi_cols = fh.mi_cols;
    let mi_rows = fh.mi_rows;
    let ti = &mut fh.tile_info;

    let (sb_cols, sb_rows, sb_shift) = if seq.use_128x128_superblock {
        ((mi_cols + 31) >> 5, (mi_rows + 31) >> 5, 5)
    } else {
        ((mi_cols + 15) >> 4, (mi_rows + 15) >> 4, 4)
    };
    let sb_size = sb_shift + 2;

    let max_tile_width_sb = MAX_TILE_WIDTH >> sb_size;
    let mut max_tile_area_sb = MAX_TILE_AREA >> (2 * sb_size);

    let min_log2_tile_cols = helpers::tile_log2(max_tile_width_sb, sb_cols);
    let max_log2_tile_cols = helpers::tile_log2(1, sb_cols.min(MAX_TILE_COLS as u32));
    let max_log2_tile_rows = helpers::tile_log2(1, sb_rows.min(MAX_TILE_ROWS as u32));
    let min_log2_tiles = min_log2_tile_cols.max(helpers::tile_log2(max_tile_area_sb, sb_rows * sb_cols));

    ti.uniform_tile_spacing_flag = r.read_bit()?;

    if ti.uniform_tile_spacing_flag {
        ti.tile_cols_log2 = min_log2_tile_cols;
        while ti.tile_cols_log2 < max_log2_tile_cols {
            if !r.read_bit()? {
                break;
            }
            ti.tile_cols_log2 += 1;
        }

        let tile_width_sb = (sb_cols + (1 << ti.tile_cols_log2) - 1) >> ti.tile_cols_log2;
        ti.tile_cols = uniform_tile_starts(
            &mut ti.mi_col_starts,
            &mut ti.width_in_sbs_minus_1,
            sb_cols,
            tile_width_sb,
            sb_shift,
            mi_cols,
        )?;

        let min_log2_tile_rows = min_log2_tiles.saturating_sub(ti.tile_cols_log2);
        ti.tile_rows_log2 = min_log2_tile_rows;
        while ti.tile_rows_log2 < max_log2_tile_rows {
            if !r.read_bit()? {
                break;
            }
            ti.tile_rows_log2 += 1;
        }

        let tile_height_sb = (sb_rows + (1 << ti.tile_rows_log2) - 1) >> ti.tile_rows_log2;
        ti.tile_rows = uniform_tile_starts(
            &mut ti.mi_row_starts,
            &mut ti.height_in_sbs_minus_1,
            sb_rows,
            tile_height_sb,
            sb_shift,
            mi_rows,
        )?;
    } else {
        let mut widest_tile_sb = 0;
        let mut start_sb = 0;
        let mut i = 0;

        while start_sb < sb_cols {
            if i >= MAX_TILE_COLS {
                return Err(ParseError::invalid("tile_cols", i as u32 + 1));
            }

            ti.mi_col_starts[i] = start_sb << sb_shift;
            let max_width = (sb_cols - start_sb).min(max_tile_width_sb);
            ti.width_in_sbs_minus_1[i] = r.read_ns(max_width)?;

            let size_sb = ti.width_in_sbs_minus_1[i] + 1;
            widest_tile_sb = widest_tile_sb.max(size_sb);
            start_sb += size_sb;
            i += 1;
        }

        ti.mi_col_starts[i] = mi_cols;
        ti.tile_cols = i as u32;
        ti.tile_cols_log2 = helpers::tile_log2(1, ti.tile_cols);

        max_tile_area_sb = if min_log2_tiles > 0 {
            (sb_rows * sb_cols) >> (min_log2_tiles + 1)
        } else {
            sb_rows * sb_cols
        };

        let max_tile_height_sb = (max_tile_area_sb / widest_tile_sb.max(1)).max(1);
        let mut start_sb = 0;
        let mut i = 0;

        while start_sb < sb_rows {
            if i >= MAX_TILE_ROWS {
                return Err(ParseError::invalid("tile_rows", i as u32 + 1));
            }

            ti.mi_row_starts[i] = start_sb << sb_shift;
            let max_height = (sb_rows - start_sb).min(max_tile_height_sb);
            ti.height_in_sbs_minus_1[i] = r.read_ns(max_height)?;

            start_sb += ti.height_in_sbs_minus_1[i] + 1;
            i += 1;
        }

        ti.mi_row_starts[i] = mi_rows;
        ti.tile_rows = i as u32;
        ti.tile_rows_log2 = helpers::tile_log2(1, ti.tile_rows);
    }

    if ti.tile_cols_log2 > 0 || ti.tile_rows_log2 > 0 {
        ti.context_update_tile_id = r.read_bits(ti.tile_rows_log2 + ti.tile_cols_log2)?;
        if ti.context_update_tile_id >= ti.num_tiles() {
            return Err(ParseError::invalid(
                "context_update_tile_id",
                ti.context_update_tile_id,
            ));
        }

        ti.tile_size_bytes = r.read_bits(2)? + 1;
    } else {
        ti.context_update_tile_id = 0;
        ti.tile_size_bytes = 4;
    }

    log::trace!(
        "Tile info: {}x{} tiles, {} bytes per tile size",
        ti.tile_cols,
        ti.tile_rows,
        ti.tile_size_bytes
    );

    Ok(())
}

/// Fills the start positions of uniformly spaced tiles along one dimension,
/// returning the number of tiles.
fn uniform_tile_starts<const N: usize, const M: usize>(
    mi_starts: &mut [u32; N],
    size_in_sbs_minus_1: &mut [u32; M],
    sb_count: u32,
    tile_size_sb: u32,
    sb_shift: u32,
    mi_count: u32,
) -> ParseResult<u32> {
    let tile_size_sb = tile_size_sb.max(1);
    let mut i = 0;
    let mut start_sb = 0;

    while start_sb < sb_count {
        if i >= M {
            return Err(ParseError::invalid("tile count", i as u32 + 1));
        }

        mi_starts[i] = start_sb << sb_shift;
        size_in_sbs_minus_1[i] = tile_size_sb.min(sb_count - start_sb) - 1;
        i += 1;
        start_sb += tile_size_sb;
    }

    mi_starts[i] = mi_count;
    Ok(i as u32)
}

// 5.9.12
fn parse_quantization_params(
    r: &mut Reader,
    q: &mut QuantizationParams,
    cc: &ColorConfig,
) -> ParseResult<()> {
    q.base_q_idx = r.read_bits(8)?;
    q.delta_q_y_dc = r.read_delta_q()?;

    if cc.num_planes > 1 {
        q.diff_uv_delta = cc.separate_uv_delta_q && r.read_bit()?;

        q.delta_q_u_dc = r.read_delta_q()?;
        q.delta_q_u_ac = r.read_delta_q()?;
        if q.diff_uv_delta {
            q.delta_q_v_dc = r.read_delta_q()?;
            q.delta_q_v_ac = r.read_delta_q()?;
        } else {
            q.delta_q_v_dc = q.delta_q_u_dc;
            q.delta_q_v_ac = q.delta_q_u_ac;
        }
    } else {
        q.diff_uv_delta = false;
        q.delta_q_u_dc = 0;
        q.delta_q_u_ac = 0;
        q.delta_q_v_dc = 0;
        q.delta_q_v_ac = 0;
    }

    q.using_qmatrix = r.read_bit()?;
    if q.using_qmatrix {
        q.qm_y = r.read_bits(4)?;
        q.qm_u = r.read_bits(4)?;
        q.qm_v = if cc.separate_uv_delta_q {
            r.read_bits(4)?
        } else {
            q.qm_u
        };
    }

    Ok(())
}

// 5.9.14
fn parse_segmentation_params(r: &mut Reader, fh: &mut FrameHeaderObu) -> ParseResult<()> {
    let s = &mut fh.segmentation_params;

    s.segmentation_enabled = r.read_bit()?;
    if s.segmentation_enabled {
        if fh.primary_ref_frame == PRIMARY_REF_NONE {
            s.segmentation_update_map = true;
            s.segmentation_temporal_update = false;
            s.segmentation_update_data = true;
        } else {
            s.segmentation_update_map = r.read_bit()?;
            s.segmentation_temporal_update = s.segmentation_update_map && r.read_bit()?;
            s.segmentation_update_data = r.read_bit()?;
        }

        // Otherwise the features loaded by load_previous() stay.
        if s.segmentation_update_data {
            for i in 0..MAX_SEGMENTS {
                for j in 0..SEG_LVL_MAX {
                    let feature_enabled = r.read_bit()?;
                    s.feature_enabled[i][j] = feature_enabled;

                    let mut clipped_value = 0;
                    if feature_enabled {
                        let bits_to_read = FEATURE_BITS[j];
                        let limit = FEATURE_MAX[j];

                        clipped_value = if FEATURE_SIGNED[j] {
                            helpers::clip3(-limit, limit, r.read_su(1 + bits_to_read)?)
                        } else {
                            helpers::clip3(0, limit, r.read_bits(bits_to_read)? as i32)
                        };
                    }

                    s.feature_data[i][j] = clipped_value as i16;
                }
            }
        }
    } else {
        s.feature_enabled = Default::default();
        s.feature_data = Default::default();
    }

    s.seg_id_pre_skip = 0;
    s.last_active_seg_id = 0;
    for i in 0..MAX_SEGMENTS {
        for j in 0..SEG_LVL_MAX {
            if s.feature_enabled[i][j] {
                s.last_active_seg_id = i as u32;
                if j >= SEG_LVL_REF_FRAME {
                    s.seg_id_pre_skip = 1;
                }
            }
        }
    }

    Ok(())
}

// 5.9.17
fn parse_delta_q_params(r: &mut Reader, q: &mut QuantizationParams) -> ParseResult<()> {
    q.delta_q_res = 0;
    q.delta_q_present = q.base_q_idx > 0 && r.read_bit()?;
    if q.delta_q_present {
        q.delta_q_res = r.read_bits(2)?;
    }

    Ok(())
}

// 5.9.18
fn parse_delta_lf_params(
    r: &mut Reader,
    lf: &mut LoopFilterParams,
    delta_q_present: bool,
    allow_intrabc: bool,
) -> ParseResult<()> {
    lf.delta_lf_present = false;
    lf.delta_lf_res = 0;
    lf.delta_lf_multi = 0;

    if delta_q_present {
        lf.delta_lf_present = !allow_intrabc && r.read_bit()?;
        if lf.delta_lf_present {
            lf.delta_lf_res = r.read_bits(2)?;
            lf.delta_lf_multi = r.read_bits(1)?;
        }
    }

    Ok(())
}

/// get_qindex(1, segment_id) from 7.12.2: the quantizer index of a segment,
/// ignoring the block level delta.
fn get_qindex(fh: &FrameHeaderObu, segment_id: usize) -> i32 {
    let seg = &fh.segmentation_params;
    let base_q_idx = fh.quantization_params.base_q_idx as i32;

    if seg.segmentation_enabled && seg.feature_enabled[segment_id][SEG_LVL_ALT_Q] {
        let data = i32::from(seg.feature_data[segment_id][SEG_LVL_ALT_Q]);
        helpers::clip3(0, 255, base_q_idx + data)
    } else {
        base_q_idx
    }
}

fn compute_lossless(fh: &mut FrameHeaderObu) {
    fh.coded_lossless = true;

    for segment_id in 0..MAX_SEGMENTS {
        let qindex = get_qindex(fh, segment_id);
        let q = &fh.quantization_params;

        let lossless = qindex == 0
            && q.delta_q_y_dc == 0
            && q.delta_q_u_ac == 0
            && q.delta_q_u_dc == 0
            && q.delta_q_v_ac == 0
            && q.delta_q_v_dc == 0;

        fh.lossless_array[segment_id] = lossless;
        if !lossless {
            fh.coded_lossless = false;
        }

        if q.using_qmatrix {
            let levels = if lossless {
                [15, 15, 15]
            } else {
                [q.qm_y, q.qm_u, q.qm_v]
            };

            for (plane, level) in levels.into_iter().enumerate() {
                fh.seg_qm_level[plane][segment_id] = level;
            }
        }
    }

    fh.all_lossless = fh.coded_lossless && fh.frame_width == fh.upscaled_width;
}

// 5.9.11
fn parse_loop_filter_params(
    r: &mut Reader,
    fh: &mut FrameHeaderObu,
    num_planes: u32,
) -> ParseResult<()> {
    let lf = &mut fh.loop_filter_params;

    if fh.coded_lossless || fh.allow_intrabc {
        lf.loop_filter_level[0] = 0;
        lf.loop_filter_level[1] = 0;
        lf.loop_filter_ref_deltas = DEFAULT_LOOP_FILTER_REF_DELTAS;
        lf.loop_filter_mode_deltas = [0; 2];
        return Ok(());
    }

    lf.loop_filter_level[0] = r.read_bits(6)? as u8;
    lf.loop_filter_level[1] = r.read_bits(6)? as u8;
    if num_planes > 1 && (lf.loop_filter_level[0] > 0 || lf.loop_filter_level[1] > 0) {
        lf.loop_filter_level[2] = r.read_bits(6)? as u8;
        lf.loop_filter_level[3] = r.read_bits(6)? as u8;
    }

    lf.loop_filter_sharpness = r.read_bits(3)? as u8;
    lf.loop_filter_delta_enabled = r.read_bit()?;
    if lf.loop_filter_delta_enabled {
        lf.loop_filter_delta_update = r.read_bit()?;
        if lf.loop_filter_delta_update {
            for delta in lf.loop_filter_ref_deltas.iter_mut() {
                if r.read_bit()? {
                    *delta = r.read_su(7)? as i8;
                }
            }

            for delta in lf.loop_filter_mode_deltas.iter_mut() {
                if r.read_bit()? {
                    *delta = r.read_su(7)? as i8;
                }
            }
        }
    }

    Ok(())
}

// 5.9.19
fn parse_cdef_params(
    r: &mut Reader,
    fh: &mut FrameHeaderObu,
    seq: &SequenceHeaderObu,
) -> ParseResult<()> {
    let cdef = &mut fh.cdef_params;

    if fh.coded_lossless || fh.allow_intrabc || !seq.enable_cdef {
        cdef.cdef_bits = 0;
        cdef.cdef_y_pri_strength[0] = 0;
        cdef.cdef_y_sec_strength[0] = 0;
        cdef.cdef_uv_pri_strength[0] = 0;
        cdef.cdef_uv_sec_strength[0] = 0;
        cdef.cdef_damping = 3;
        return Ok(());
    }

    cdef.cdef_damping = r.read_bits(2)? + 3;
    cdef.cdef_bits = r.read_bits(2)?;

    let read_sec_strength = |r: &mut Reader| -> ParseResult<u32> {
        let strength = r.read_bits(2)?;
        Ok(if strength == 3 { 4 } else { strength })
    };

    for i in 0..(1usize << cdef.cdef_bits) {
        cdef.cdef_y_pri_strength[i] = r.read_bits(4)?;
        cdef.cdef_y_sec_strength[i] = read_sec_strength(r)?;
        if seq.color_config.num_planes > 1 {
            cdef.cdef_uv_pri_strength[i] = r.read_bits(4)?;
            cdef.cdef_uv_sec_strength[i] = read_sec_strength(r)?;
        }
    }

    Ok(())
}

// 5.9.20
fn parse_loop_restoration_params(
    r: &mut Reader,
    fh: &mut FrameHeaderObu,
    seq: &SequenceHeaderObu,
) -> ParseResult<()> {
    let lr = &mut fh.loop_restoration_params;

    if fh.all_lossless || fh.allow_intrabc || !seq.enable_restoration {
        lr.frame_restoration_type = [FrameRestorationType::None; MAX_NUM_PLANES];
        lr.uses_lr = false;
        return Ok(());
    }

    const REMAP_LR_TYPE: [FrameRestorationType; 4] = [
        FrameRestorationType::None,
        FrameRestorationType::Switchable,
        FrameRestorationType::Wiener,
        FrameRestorationType::Sgrproj,
    ];

    lr.uses_lr = false;
    lr.uses_chroma_lr = false;

    for i in 0..seq.color_config.num_planes as usize {
        let lr_type = r.read_bits(2)?;
        lr.frame_restoration_type[i] = REMAP_LR_TYPE[lr_type as usize];
        if lr.frame_restoration_type[i] != FrameRestorationType::None {
            lr.uses_lr = true;
            if i > 0 {
                lr.uses_chroma_lr = true;
            }
        }
    }

    if lr.uses_lr {
        if seq.use_128x128_superblock {
            lr.lr_unit_shift = r.read_bits(1)? as u8 + 1;
        } else {
            lr.lr_unit_shift = r.read_bits(1)? as u8;
            if lr.lr_unit_shift > 0 {
                lr.lr_unit_shift += r.read_bits(1)? as u8;
            }
        }

        lr.loop_restoration_size[0] = RESTORATION_TILESIZE_MAX >> (2 - lr.lr_unit_shift);

        let cc = &seq.color_config;
        lr.lr_uv_shift = if cc.subsampling_x && cc.subsampling_y && lr.uses_chroma_lr {
            r.read_bits(1)? as u8
        } else {
            0
        };

        lr.loop_restoration_size[1] = lr.loop_restoration_size[0] >> lr.lr_uv_shift;
        lr.loop_restoration_size[2] = lr.loop_restoration_size[0] >> lr.lr_uv_shift;
    }

    Ok(())
}

// 5.9.21
fn read_tx_mode(r: &mut Reader, fh: &mut FrameHeaderObu) -> ParseResult<()> {
    fh.tx_mode = if fh.coded_lossless {
        TxMode::Only4x4
    } else if r.read_bit()? {
        TxMode::Select
    } else {
        TxMode::Largest
    };

    Ok(())
}

// 5.9.22
fn parse_skip_mode_params(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    let dist = |a: u32, b: u32| {
        helpers::get_relative_dist(seq.enable_order_hint, seq.order_hint_bits, a as i32, b as i32)
    };

    let mut skip_mode_allowed = false;

    if !fh.frame_is_intra && fh.reference_select && seq.enable_order_hint {
        let ref_hints: Vec<u32> = fh
            .ref_frame_idx
            .iter()
            .map(|&idx| state.ref_info[idx as usize].ref_order_hint)
            .collect();

        let mut forward: Option<(usize, u32)> = None;
        let mut backward: Option<(usize, u32)> = None;

        for (i, &ref_hint) in ref_hints.iter().enumerate() {
            if dist(ref_hint, fh.order_hint) < 0 {
                if forward.map_or(true, |(_, hint)| dist(ref_hint, hint) > 0) {
                    forward = Some((i, ref_hint));
                }
            } else if dist(ref_hint, fh.order_hint) > 0
                && backward.map_or(true, |(_, hint)| dist(ref_hint, hint) < 0)
            {
                backward = Some((i, ref_hint));
            }
        }

        let pair = match (forward, backward) {
            (None, _) => None,
            (Some((forward_idx, _)), Some((backward_idx, _))) => Some((forward_idx, backward_idx)),
            (Some((forward_idx, forward_hint)), None) => {
                let mut second_forward: Option<(usize, u32)> = None;

                for (i, &ref_hint) in ref_hints.iter().enumerate() {
                    if dist(ref_hint, forward_hint) < 0
                        && second_forward.map_or(true, |(_, hint)| dist(ref_hint, hint) > 0)
                    {
                        second_forward = Some((i, ref_hint));
                    }
                }

                second_forward.map(|(second_idx, _)| (forward_idx, second_idx))
            }
        };

        if let Some((a, b)) = pair {
            skip_mode_allowed = true;
            fh.skip_mode_frame[0] = ReferenceFrameType::Last as u32 + a.min(b) as u32;
            fh.skip_mode_frame[1] = ReferenceFrameType::Last as u32 + a.max(b) as u32;
        }
    }

    fh.skip_mode_present = skip_mode_allowed && r.read_bit()?;

    Ok(())
}

// 5.9.25
fn read_global_param(
    r: &mut Reader,
    gm_type: WarpModelType,
    idx: usize,
    allow_high_precision_mv: bool,
    prev_gm_params: &[i32; 6],
) -> ParseResult<i32> {
    let mut abs_bits = GM_ABS_ALPHA_BITS;
    let mut prec_bits = GM_ALPHA_PREC_BITS;

    if idx < 2 {
        if gm_type == WarpModelType::Translation {
            let low_precision = u32::from(!allow_high_precision_mv);
            abs_bits = GM_ABS_TRANS_ONLY_BITS - low_precision;
            prec_bits = GM_TRANS_ONLY_PREC_BITS - low_precision;
        } else {
            abs_bits = GM_ABS_TRANS_BITS;
            prec_bits = GM_TRANS_PREC_BITS;
        }
    }

    let prec_diff = WARPEDMODEL_PREC_BITS - prec_bits;
    let (round, sub) = if idx % 3 == 2 {
        (1 << WARPEDMODEL_PREC_BITS, 1 << prec_bits)
    } else {
        (0, 0)
    };

    let mx = 1i32 << abs_bits;
    let reference = (prev_gm_params[idx] >> prec_diff) - sub;
    let value = r.decode_signed_subexp_with_ref(-mx, mx + 1, reference)?;

    Ok((value << prec_diff) + round)
}

// 5.9.24
fn parse_global_motion_params(
    r: &mut Reader,
    fh: &mut FrameHeaderObu,
    prev_gm_params: &[[i32; 6]; NUM_REF_FRAMES],
) -> ParseResult<()> {
    fh.global_motion_params = GlobalMotionParams::identity();

    if fh.frame_is_intra {
        return Ok(());
    }

    let allow_high_precision_mv = fh.allow_high_precision_mv;
    let gm = &mut fh.global_motion_params;

    for ref_frame in ReferenceFrameType::Last as usize..=ReferenceFrameType::AltRef as usize {
        gm.is_global[ref_frame] = r.read_bit()?;

        let gm_type = if gm.is_global[ref_frame] {
            gm.is_rot_zoom[ref_frame] = r.read_bit()?;
            if gm.is_rot_zoom[ref_frame] {
                WarpModelType::RotZoom
            } else {
                gm.is_translation[ref_frame] = r.read_bit()?;
                if gm.is_translation[ref_frame] {
                    WarpModelType::Translation
                } else {
                    WarpModelType::Affine
                }
            }
        } else {
            WarpModelType::Identity
        };

        gm.gm_type[ref_frame] = gm_type;
        let prev = &prev_gm_params[ref_frame];
        let params = &mut gm.gm_params[ref_frame];

        if gm_type >= WarpModelType::RotZoom {
            params[2] = read_global_param(r, gm_type, 2, allow_high_precision_mv, prev)?;
            params[3] = read_global_param(r, gm_type, 3, allow_high_precision_mv, prev)?;

            if gm_type == WarpModelType::Affine {
                params[4] = read_global_param(r, gm_type, 4, allow_high_precision_mv, prev)?;
                params[5] = read_global_param(r, gm_type, 5, allow_high_precision_mv, prev)?;
            } else {
                params[4] = -params[3];
                params[5] = params[2];
            }
        }

        if gm_type >= WarpModelType::Translation {
            params[0] = read_global_param(r, gm_type, 0, allow_high_precision_mv, prev)?;
            params[1] = read_global_param(r, gm_type, 1, allow_high_precision_mv, prev)?;
        }

        gm.warp_valid[ref_frame] = helpers::setup_shear(params);
    }

    Ok(())
}

// 5.9.30
fn parse_film_grain_params(
    r: &mut Reader,
    seq: &SequenceHeaderObu,
    state: &DecodeState,
    fh: &mut FrameHeaderObu,
) -> ParseResult<()> {
    if !seq.film_grain_params_present || (!fh.show_frame && !fh.showable_frame) {
        fh.film_grain_params = Default::default();
        return Ok(());
    }

    let fg = &mut fh.film_grain_params;

    fg.apply_grain = r.read_bit()?;
    if !fg.apply_grain {
        *fg = Default::default();
        return Ok(());
    }

    fg.grain_seed = r.read_bits(16)? as u16;
    fg.update_grain = if fh.frame_type == FrameType::InterFrame {
        r.read_bit()?
    } else {
        true
    };

    if !fg.update_grain {
        let ref_idx = r.read_bits(3)? as u8;
        let slot = usize::from(ref_idx);

        if !fh.ref_frame_idx.contains(&ref_idx) || !state.ref_info[slot].ref_valid {
            return Err(ParseError::InvalidReference(slot));
        }

        // load_grain_params()
        let grain_seed = fg.grain_seed;
        *fg = state.ref_info[slot].film_grain_params.clone();
        fg.grain_seed = grain_seed;
        fg.film_grain_params_ref_idx = ref_idx;
        fg.update_grain = false;
        return Ok(());
    }

    fg.num_y_points = r.read_bits(4)? as u8;
    if fg.num_y_points > 14 {
        return Err(ParseError::invalid("num_y_points", u32::from(fg.num_y_points)));
    }

    read_scaling_points(
        r,
        fg.num_y_points,
        &mut fg.point_y_value,
        &mut fg.point_y_scaling,
        "point_y_value",
    )?;

    let cc = &seq.color_config;
    fg.chroma_scaling_from_luma = !cc.mono_chrome && r.read_bit()?;

    if cc.mono_chrome
        || fg.chroma_scaling_from_luma
        || (cc.subsampling_x && cc.subsampling_y && fg.num_y_points == 0)
    {
        fg.num_cb_points = 0;
        fg.num_cr_points = 0;
    } else {
        fg.num_cb_points = r.read_bits(4)? as u8;
        if fg.num_cb_points > 10 {
            return Err(ParseError::invalid("num_cb_points", u32::from(fg.num_cb_points)));
        }
        read_scaling_points(
            r,
            fg.num_cb_points,
            &mut fg.point_cb_value,
            &mut fg.point_cb_scaling,
            "point_cb_value",
        )?;

        fg.num_cr_points = r.read_bits(4)? as u8;
        if fg.num_cr_points > 10 {
            return Err(ParseError::invalid("num_cr_points", u32::from(fg.num_cr_points)));
        }
        read_scaling_points(
            r,
            fg.num_cr_points,
            &mut fg.point_cr_value,
            &mut fg.point_cr_scaling,
            "point_cr_value",
        )?;
    }

    fg.grain_scaling_minus_8 = r.read_bits(2)? as u8;
    fg.ar_coeff_lag = r.read_bits(2)?;

    let num_pos_luma = (2 * fg.ar_coeff_lag * (fg.ar_coeff_lag + 1)) as usize;
    let num_pos_chroma = if fg.num_y_points > 0 {
        for coeff in fg.ar_coeffs_y_plus_128.iter_mut().take(num_pos_luma) {
            *coeff = r.read_bits(8)? as u8;
        }
        num_pos_luma + 1
    } else {
        num_pos_luma
    };

    if fg.chroma_scaling_from_luma || fg.num_cb_points > 0 {
        for coeff in fg.ar_coeffs_cb_plus_128.iter_mut().take(num_pos_chroma) {
            *coeff = r.read_bits(8)? as u8;
        }
    }

    if fg.chroma_scaling_from_luma || fg.num_cr_points > 0 {
        for coeff in fg.ar_coeffs_cr_plus_128.iter_mut().take(num_pos_chroma) {
            *coeff = r.read_bits(8)? as u8;
        }
    }

    fg.ar_coeff_shift_minus_6 = r.read_bits(2)? as u8;
    fg.grain_scale_shift = r.read_bits(2)? as u8;

    if fg.num_cb_points > 0 {
        fg.cb_mult = r.read_bits(8)? as u8;
        fg.cb_luma_mult = r.read_bits(8)? as u8;
        fg.cb_offset = r.read_bits(9)? as u16;
    }

    if fg.num_cr_points > 0 {
        fg.cr_mult = r.read_bits(8)? as u8;
        fg.cr_luma_mult = r.read_bits(8)? as u8;
        fg.cr_offset = r.read_bits(9)? as u16;
    }

    fg.overlap_flag = r.read_bit()?;
    fg.clip_to_restricted_range = r.read_bit()?;

    Ok(())
}

/// Reads `num_points` (value, scaling) pairs of a film grain scaling
/// function. Values must be increasing.
fn read_scaling_points(
    r: &mut Reader,
    num_points: u8,
    values: &mut [u8],
    scalings: &mut [u8],
    name: &'static str,
) -> ParseResult<()> {
    for i in 0..usize::from(num_points) {
        values[i] = r.read_bits(8)? as u8;
        if i > 0 && values[i - 1] >= values[i] {
            return Err(ParseError::invalid(name, u32::from(values[i])));
        }
        scalings[i] = r.read_bits(8)? as u8;
    }

    Ok(())
}

/// Parses the tile group in `data` for the frame described by `fh`. See 5.11.1
///
/// The last tile of the group takes every byte left, and must have at least
/// one. This does not touch the decoding state: once a group
/// [`TileGroupObu::is_last_in_frame`], the caller ends the frame by clearing
/// [`DecodeState::seen_frame_header`], as [`Parser::parse_tile_group_obu`]
/// and [`parse_frame`] do.
pub fn parse_tile_group<'a>(data: &'a [u8], fh: &FrameHeaderObu) -> ParseResult<TileGroupObu<'a>> {
    let ti = &fh.tile_info;
    let num_tiles = ti.num_tiles();
    if num_tiles == 0 {
        return Err(ParseError::invalid("num_tiles", 0));
    }

    let mut tg = TileGroupObu {
        data,
        ..Default::default()
    };

    let mut r = Reader::new(data);

    if num_tiles > 1 {
        tg.tile_start_and_end_present_flag = r.read_bit()?;
    }

    if num_tiles == 1 || !tg.tile_start_and_end_present_flag {
        tg.tg_start = 0;
        tg.tg_end = num_tiles - 1;
    } else {
        let tile_bits = ti.tile_cols_log2 + ti.tile_rows_log2;
        tg.tg_start = r.read_bits(tile_bits)?;
        tg.tg_end = r.read_bits(tile_bits)?;

        if tg.tg_end < tg.tg_start || tg.tg_end >= num_tiles {
            return Err(ParseError::invalid("tg_end", tg.tg_end));
        }
    }

    r.byte_alignment();

    let mut pos = (r.position() / 8) as usize;
    let tile_size_bytes = ti.tile_size_bytes as usize;
    if num_tiles > 1 && !(1..=4).contains(&tile_size_bytes) {
        return Err(ParseError::invalid("tile_size_bytes", ti.tile_size_bytes));
    }

    for tile_num in tg.tg_start..=tg.tg_end {
        let tile_row = tile_num / ti.tile_cols;
        let tile_col = tile_num % ti.tile_cols;
        let available = data.len().saturating_sub(pos);

        let tile_size = if tile_num == tg.tg_end {
            if available == 0 {
                return Err(ParseError::TruncatedTileData { size: 1, available });
            }

            available
        } else {
            let size_field = data
                .get(pos..pos + tile_size_bytes)
                .ok_or(ParseError::TruncatedTileData {
                    size: tile_size_bytes,
                    available,
                })?;
            pos += tile_size_bytes;

            // le(TileSizeBytes) + 1
            let tile_size = LittleEndian::read_uint(size_field, tile_size_bytes) as usize + 1;
            let available = data.len() - pos;
            if tile_size > available {
                return Err(ParseError::TruncatedTileData {
                    size: tile_size,
                    available,
                });
            }

            tile_size
        };

        let tile = Tile {
            tile_num,
            tile_offset: pos,
            tile_size,
            tile_row,
            tile_col,
            mi_row_start: ti.mi_row_starts[tile_row as usize],
            mi_row_end: ti.mi_row_starts[tile_row as usize + 1],
            mi_col_start: ti.mi_col_starts[tile_col as usize],
            mi_col_end: ti.mi_col_starts[tile_col as usize + 1],
        };

        log::trace!(
            "Tile {} ({}, {}): {} bytes at offset {}",
            tile_num,
            tile_row,
            tile_col,
            tile_size,
            pos
        );

        tg.tiles.push(tile);
        pos += tile_size;
    }

    Ok(tg)
}

/// Parses a FRAME OBU payload: a frame header followed by a tile group.
///
/// The header and the tile group are parsed against a copy of `state`, which
/// only replaces `state` once both succeeded.
pub fn parse_frame<'a>(
    data: &'a [u8],
    seq: &SequenceHeaderObu,
    state: &mut DecodeState,
    obu_header: &ObuHeader,
) -> ParseResult<FrameObu<'a>> {
    let mut next = state.clone();

    let header = parse_frame_header(data, seq, &mut next, obu_header)?;
    let tile_group_data = data.get(header.header_bytes..).unwrap_or_default();
    let tile_group = parse_tile_group(tile_group_data, &header)?;

    if tile_group.is_last_in_frame(&header.tile_info) {
        next.seen_frame_header = false;
    }

    *state = next;

    Ok(FrameObu { header, tile_group })
}

/// Drives the OBU parsers over a stream, keeping the active sequence header
/// and the decoding state between calls.
#[derive(Debug, Default)]
pub struct Parser {
    operating_point: u32,
    /// operating_point_idc of the selected operating point.
    operating_point_idc: u32,
    state: DecodeState,

    /// The last SequenceHeaderObu parsed.
    pub sequence_header: Option<Rc<SequenceHeaderObu>>,
}

impl Parser {
    /// Delimits the OBU at the start of `data`.
    ///
    /// OBUs outside of the selected operating point come back as
    /// [`ParsedObu::Drop`], as per drop_obu() in the AV1 specification.
    pub fn parse_obu<'a>(&mut self, data: &'a [u8]) -> anyhow::Result<ParsedObu<'a>> {
        if data.is_empty() {
            return Err(anyhow!("Empty data"));
        }

        let obu = next_obu(data, 0)?;
        let header = &obu.header;

        log::debug!(
            "Identified OBU type {:?}, data size: {}, obu_size: {}",
            header.obu_type,
            obu.len(),
            obu.size
        );

        if header.obu_type != ObuType::SequenceHeader
            && header.obu_type != ObuType::TemporalDelimiter
            && self.operating_point_idc != 0
            && header.extension_flag
        {
            let in_temporal_layer = ((self.operating_point_idc >> header.temporal_id) & 1) != 0;
            let in_spatial_layer =
                ((self.operating_point_idc >> (header.spatial_id + 8)) & 1) != 0;

            if !in_temporal_layer || !in_spatial_layer {
                log::debug!("Dropping obu as per drop_obu() in the AV1 specification");
                let len = u32::try_from(obu.len()).context("OBU too large")?;
                return Ok(ParsedObu::Drop(len));
            }
        }

        Ok(ParsedObu::Process(obu))
    }

    /// Selects an operating point. Only call this after the Sequence OBU for
    /// which the operating point should apply has been parsed.
    pub fn choose_operating_point(&mut self, operating_point: u32) -> anyhow::Result<()> {
        let seq = self.sequence()?;

        if operating_point > seq.operating_points_cnt_minus_1 {
            return Err(anyhow!(
                "Invalid operating point {} (max {})",
                operating_point,
                seq.operating_points_cnt_minus_1
            ));
        }

        let idc = seq.operating_points[operating_point as usize].idc;
        self.operating_point_idc = idc;
        self.operating_point = operating_point;
        Ok(())
    }

    pub fn operating_point(&self) -> u32 {
        self.operating_point
    }

    /// The decoding state carried between frames.
    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    pub fn parse_temporal_delimiter_obu(&mut self, obu: &Obu) -> anyhow::Result<()> {
        expect_obu_type(obu, &[ObuType::TemporalDelimiter])?;

        self.state.seen_frame_header = false;
        Ok(())
    }

    pub fn parse_sequence_header_obu(
        &mut self,
        obu: &Obu,
    ) -> anyhow::Result<Rc<SequenceHeaderObu>> {
        expect_obu_type(obu, &[ObuType::SequenceHeader])?;

        let seq = parse_sequence_header(obu.as_ref()).context("Parsing sequence header")?;
        let rc = Rc::new(seq);
        self.sequence_header = Some(rc.clone());

        // The client selects the operating point through external means, 0
        // until then.
        self.choose_operating_point(0)?;

        Ok(rc)
    }

    pub fn parse_frame_header_obu(&mut self, obu: &Obu) -> anyhow::Result<FrameHeaderObu> {
        expect_obu_type(
            obu,
            &[
                ObuType::FrameHeader,
                ObuType::RedundantFrameHeader,
                ObuType::Frame,
            ],
        )?;

        let seq = self.sequence()?.clone();
        let fh = parse_frame_header(obu.as_ref(), &seq, &mut self.state, &obu.header)
            .context("Parsing frame header")?;

        Ok(fh)
    }

    /// Parses a tile group OBU of the frame whose header was parsed last.
    pub fn parse_tile_group_obu<'a>(&mut self, obu: &'a Obu) -> anyhow::Result<TileGroupObu<'a>> {
        expect_obu_type(obu, &[ObuType::TileGroup])?;

        if !self.state.prev_filled {
            return Err(ParseError::MissingPreviousHeader.into());
        }

        let fh = &self.state.prev_frame_header;
        let tg = parse_tile_group(obu.as_ref(), fh).context("Parsing tile group")?;

        if tg.is_last_in_frame(&fh.tile_info) {
            self.state.seen_frame_header = false;
        }

        Ok(tg)
    }

    pub fn parse_frame_obu<'a>(&mut self, obu: &'a Obu) -> anyhow::Result<FrameObu<'a>> {
        expect_obu_type(obu, &[ObuType::Frame])?;

        let seq = self.sequence()?.clone();
        let frame = parse_frame(obu.as_ref(), &seq, &mut self.state, &obu.header)
            .context("Parsing frame")?;

        Ok(frame)
    }

    pub fn parse_metadata_obu<'a>(&self, obu: &'a Obu) -> anyhow::Result<MetadataObu<'a>> {
        expect_obu_type(obu, &[ObuType::Metadata])?;

        Ok(parse_metadata(obu.as_ref()).context("Parsing metadata")?)
    }

    pub fn parse_tile_list_obu<'a>(&self, obu: &'a Obu) -> anyhow::Result<TileListObu<'a>> {
        expect_obu_type(obu, &[ObuType::TileList])?;

        Ok(parse_tile_list(obu.as_ref()).context("Parsing tile list")?)
    }

    /// The highest spatial layer of the selected operating point, or `None`
    /// when the stream has no scalability information.
    pub fn highest_operating_point(&self) -> Option<u32> {
        if self.operating_point_idc == 0 {
            None
        } else {
            Some(helpers::floor_log2(self.operating_point_idc >> 8))
        }
    }

    fn sequence(&self) -> anyhow::Result<&Rc<SequenceHeaderObu>> {
        self.sequence_header
            .as_ref()
            .ok_or_else(|| ParseError::MissingSequenceHeader.into())
    }
}

fn expect_obu_type(obu: &Obu, expected: &[ObuType]) -> anyhow::Result<()> {
    if expected.contains(&obu.header.obu_type) {
        Ok(())
    } else {
        Err(anyhow!(
            "Expected one of {:?}, got {:?}",
            expected,
            obu.header.obu_type
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::av1::writer::encapsulate_obu;
    use crate::codec::av1::writer::ObuWriter;

    /// A sequence header OBU from a 3840x2160 8-bit 4:2:0 stream.
    const SEQUENCE_HEADER_OBU: [u8; 17] = [
        0x0a, 0x0f, 0x00, 0x00, 0x00, 0x6a, 0xef, 0xbf, 0xe1, 0xbc, 0x02, 0x19, 0x90, 0x10, 0x10,
        0x10, 0x40,
    ];

    const TILE_DATA: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

    fn obu_header(obu_type: ObuType) -> ObuHeader {
        ObuHeader {
            obu_type,
            extension_flag: false,
            has_size_field: true,
            temporal_id: 0,
            spatial_id: 0,
        }
    }

    fn sequence_header() -> SequenceHeaderObu {
        parse_sequence_header(&SEQUENCE_HEADER_OBU[2..]).unwrap()
    }

    fn pad<W: std::io::Write>(w: &mut ObuWriter<W>) {
        while !w.aligned() {
            w.write_bit(false).unwrap();
        }
    }

    /// Uniform spacing, a single tile.
    fn write_single_tile<W: std::io::Write>(w: &mut ObuWriter<W>) {
        w.write_bit(true).unwrap();
        w.write_bit(false).unwrap();
        w.write_bit(false).unwrap();
    }

    /// A key frame header for `sequence_header()`.
    fn key_frame(show_frame: bool, refresh_frame_flags: u32, order_hint: u32) -> Vec<u8> {
        let mut buf = vec![];
        {
            let mut w = ObuWriter::new(&mut buf);
            w.write_bit(false).unwrap(); // show_existing_frame
            w.write_f(2, FrameType::KeyFrame as u32).unwrap();
            w.write_bit(show_frame).unwrap();
            if !show_frame {
                w.write_bit(true).unwrap(); // showable_frame
                w.write_bit(false).unwrap(); // error_resilient_mode
            }
            w.write_bit(false).unwrap(); // disable_cdf_update
            w.write_bit(false).unwrap(); // frame_size_override_flag
            w.write_f(7, order_hint).unwrap();
            if !show_frame {
                w.write_f(8, refresh_frame_flags).unwrap();
            }
            write_intra_frame_tail(&mut w);
        }
        buf
    }

    /// A shown, error resilient intra-only frame header, coding
    /// `ref_order_hint` for every slot.
    fn intra_only_frame(
        order_hint: u32,
        refresh_frame_flags: u32,
        ref_order_hint: [u32; NUM_REF_FRAMES],
    ) -> Vec<u8> {
        let mut buf = vec![];
        {
            let mut w = ObuWriter::new(&mut buf);
            w.write_bit(false).unwrap(); // show_existing_frame
            w.write_f(2, FrameType::IntraOnlyFrame as u32).unwrap();
            w.write_bit(true).unwrap(); // show_frame
            w.write_bit(true).unwrap(); // error_resilient_mode
            w.write_bit(false).unwrap(); // disable_cdf_update
            w.write_bit(false).unwrap(); // frame_size_override_flag
            w.write_f(7, order_hint).unwrap();
            w.write_f(8, refresh_frame_flags).unwrap();
            for hint in ref_order_hint {
                w.write_f(7, hint).unwrap();
            }
            write_intra_frame_tail(&mut w);
        }
        buf
    }

    /// Everything after the reference signaling of an intra frame: no render
    /// size, a single tile and fixed quantizer and filter settings.
    fn write_intra_frame_tail<W: std::io::Write>(w: &mut ObuWriter<W>) {
        w.write_bit(false).unwrap(); // render_and_frame_size_different
        w.write_bit(false).unwrap(); // disable_frame_end_update_cdf
        write_single_tile(w);

        // base_q_idx, no delta q, no qmatrix.
        w.write_f(8, 100u32).unwrap();
        w.write_f(4, 0u32).unwrap();
        w.write_bit(false).unwrap(); // segmentation_enabled
        w.write_bit(false).unwrap(); // delta_q_present

        for level in [10u32, 12, 5, 6] {
            w.write_f(6, level).unwrap();
        }
        w.write_f(3, 0u32).unwrap(); // loop_filter_sharpness
        w.write_bit(true).unwrap(); // loop_filter_delta_enabled
        w.write_bit(false).unwrap(); // loop_filter_delta_update

        w.write_f(2, 1u32).unwrap(); // cdef_damping_minus_3
        w.write_f(2, 0u32).unwrap(); // cdef_bits
        w.write_f(4, 7u32).unwrap();
        w.write_f(2, 3u32).unwrap();
        w.write_f(4, 2u32).unwrap();
        w.write_f(2, 1u32).unwrap();

        w.write_f(6, 0u32).unwrap(); // lr_type for the 3 planes
        w.write_bit(true).unwrap(); // tx_mode_select
        w.write_bit(false).unwrap(); // reduced_tx_set
        pad(w);
    }

    /// A shown inter frame header predicting from slots 0 to 6. Callers pick
    /// reference order hints for which skip mode is not allowed.
    struct InterFrame {
        order_hint: u32,
        refresh_frame_flags: u32,
        /// Codes error_resilient_mode, with this value for every
        /// ref_order_hint.
        error_resilient_hint: Option<u32>,
        /// Sets the LAST_FRAME loop filter ref delta to 2.
        update_last_delta: bool,
        /// Codes a translation global motion for LAST_FRAME, relative to
        /// identity parameters.
        translation_for_last: bool,
    }

    impl InterFrame {
        fn new(order_hint: u32, refresh_frame_flags: u32) -> Self {
            Self {
                order_hint,
                refresh_frame_flags,
                error_resilient_hint: None,
                update_last_delta: true,
                translation_for_last: true,
            }
        }

        fn build(&self) -> Vec<u8> {
            let mut buf = vec![];
            {
                let mut w = ObuWriter::new(&mut buf);
                w.write_bit(false).unwrap(); // show_existing_frame
                w.write_f(2, FrameType::InterFrame as u32).unwrap();
                w.write_bit(true).unwrap(); // show_frame
                w.write_bit(self.error_resilient_hint.is_some()).unwrap();
                w.write_bit(false).unwrap(); // disable_cdf_update
                w.write_bit(false).unwrap(); // frame_size_override_flag
                w.write_f(7, self.order_hint).unwrap();
                if self.error_resilient_hint.is_none() {
                    w.write_f(3, 0u32).unwrap(); // primary_ref_frame
                }
                w.write_f(8, self.refresh_frame_flags).unwrap();
                if let Some(hint) = self.error_resilient_hint {
                    for _ in 0..NUM_REF_FRAMES {
                        w.write_f(7, hint).unwrap();
                    }
                }
                w.write_bit(false).unwrap(); // frame_refs_short_signaling
                for i in 0..REFS_PER_FRAME as u32 {
                    w.write_f(3, i).unwrap();
                }
                w.write_bit(false).unwrap(); // render_and_frame_size_different
                w.write_bit(true).unwrap(); // allow_high_precision_mv
                w.write_bit(true).unwrap(); // is_filter_switchable
                w.write_bit(false).unwrap(); // is_motion_mode_switchable
                w.write_bit(false).unwrap(); // disable_frame_end_update_cdf
                write_single_tile(&mut w);

                w.write_f(8, 120u32).unwrap();
                w.write_f(4, 0u32).unwrap();
                w.write_bit(false).unwrap(); // segmentation_enabled
                w.write_bit(false).unwrap(); // delta_q_present

                for level in [8u32, 8, 4, 4] {
                    w.write_f(6, level).unwrap();
                }
                w.write_f(3, 0u32).unwrap();
                w.write_bit(true).unwrap(); // loop_filter_delta_enabled
                w.write_bit(self.update_last_delta).unwrap();
                if self.update_last_delta {
                    for i in 0..TOTAL_REFS_PER_FRAME {
                        let update = i == ReferenceFrameType::Last as usize;
                        w.write_bit(update).unwrap();
                        if update {
                            w.write_su(7, 2).unwrap();
                        }
                    }
                    w.write_bit(false).unwrap();
                    w.write_bit(false).unwrap();
                }

                w.write_f(16, 0u32).unwrap(); // cdef
                w.write_f(6, 0u32).unwrap(); // lr_type for the 3 planes
                w.write_bit(false).unwrap(); // tx_mode_select
                w.write_bit(true).unwrap(); // reference_select
                w.write_bit(false).unwrap(); // reduced_tx_set

                // LAST_FRAME: is_global, !is_rot_zoom, is_translation, then
                // subexp codes 4 and 0 for the two translation parameters.
                w.write_bit(self.translation_for_last).unwrap();
                if self.translation_for_last {
                    w.write_bit(false).unwrap();
                    w.write_bit(true).unwrap();
                    w.write_f(4, 0b0100u32).unwrap();
                    w.write_f(4, 0b0000u32).unwrap();
                }
                for _ in ReferenceFrameType::Last2 as usize..=ReferenceFrameType::AltRef as usize {
                    w.write_bit(false).unwrap();
                }
                pad(&mut w);
            }
            buf
        }
    }

    /// An inter frame predicting from slots 0 to 6, with a translation
    /// global motion for LAST_FRAME.
    fn inter_frame(order_hint: u32, refresh_frame_flags: u32) -> Vec<u8> {
        InterFrame::new(order_hint, refresh_frame_flags).build()
    }

    fn with_tile_data(mut header: Vec<u8>) -> Vec<u8> {
        header.extend_from_slice(&TILE_DATA);
        header
    }

    #[test]
    fn parse_sequence_header_real_stream() {
        let seq = sequence_header();

        assert_eq!(seq.seq_profile, Profile::Profile0);
        assert!(!seq.still_picture);
        assert!(!seq.reduced_still_picture_header);
        assert!(!seq.timing_info_present_flag);
        assert_eq!(seq.operating_points_cnt_minus_1, 0);
        assert_eq!(seq.operating_points[0].idc, 0);
        assert_eq!(seq.operating_points[0].seq_level_idx, 13);
        assert_eq!(seq.operating_points[0].seq_tier, 0);
        assert_eq!(seq.frame_width_bits_minus_1, 11);
        assert_eq!(seq.frame_height_bits_minus_1, 11);
        assert_eq!(seq.max_frame_width_minus_1, 3839);
        assert_eq!(seq.max_frame_height_minus_1, 2159);
        assert!(!seq.frame_id_numbers_present_flag);
        assert!(!seq.use_128x128_superblock);
        assert!(seq.enable_order_hint);
        assert!(!seq.enable_jnt_comp);
        assert!(!seq.enable_ref_frame_mvs);
        assert_eq!(seq.seq_force_screen_content_tools, 0);
        assert_eq!(seq.seq_force_integer_mv, SELECT_INTEGER_MV);
        assert_eq!(seq.order_hint_bits, 7);
        assert!(!seq.enable_superres);
        assert!(seq.enable_cdef);
        assert!(seq.enable_restoration);
        assert!(!seq.film_grain_params_present);

        let cc = &seq.color_config;
        assert_eq!(cc.bit_depth, BitDepth::Depth8);
        assert!(!cc.mono_chrome);
        assert_eq!(cc.num_planes, 3);
        assert_eq!(cc.color_primaries, ColorPrimaries::Bt709);
        assert_eq!(cc.transfer_characteristics, TransferCharacteristics::Bt709);
        assert_eq!(cc.matrix_coefficients, MatrixCoefficients::Bt709);
        assert!(!cc.color_range);
        assert!(cc.subsampling_x);
        assert!(cc.subsampling_y);
        assert_eq!(cc.chroma_sample_position, ChromaSamplePosition::Unknown);
        assert!(!cc.separate_uv_delta_q);
    }

    #[test]
    fn parse_sequence_header_truncated() {
        assert_eq!(
            parse_sequence_header(&SEQUENCE_HEADER_OBU[2..8]),
            Err(ParseError::BufferUnderrun)
        );
    }

    #[test]
    fn parse_key_frame() {
        let seq = sequence_header();
        let mut state = DecodeState::new();
        let data = with_tile_data(key_frame(true, ALL_FRAMES, 0));

        let frame = parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        let fh = &frame.header;

        assert_eq!(fh.frame_type, FrameType::KeyFrame);
        assert!(fh.show_frame);
        assert!(!fh.showable_frame);
        assert!(fh.error_resilient_mode);
        assert!(fh.frame_is_intra);
        assert_eq!(fh.force_integer_mv, 1);
        assert_eq!(fh.primary_ref_frame, PRIMARY_REF_NONE);
        assert_eq!(fh.refresh_frame_flags, ALL_FRAMES);
        assert_eq!((fh.frame_width, fh.frame_height), (3840, 2160));
        assert_eq!(fh.upscaled_width, 3840);
        assert_eq!((fh.render_width, fh.render_height), (3840, 2160));
        assert_eq!((fh.mi_cols, fh.mi_rows), (960, 540));

        assert_eq!(fh.tile_info.tile_cols, 1);
        assert_eq!(fh.tile_info.tile_rows, 1);
        assert_eq!(fh.tile_info.mi_col_starts[..2], [0, 960]);
        assert_eq!(fh.tile_info.mi_row_starts[..2], [0, 540]);
        assert_eq!(fh.tile_info.tile_size_bytes, 4);

        assert_eq!(fh.quantization_params.base_q_idx, 100);
        assert!(!fh.coded_lossless);
        assert!(!fh.all_lossless);
        assert_eq!(fh.loop_filter_params.loop_filter_level, [10, 12, 5, 6]);
        assert!(fh.loop_filter_params.loop_filter_delta_enabled);
        assert_eq!(
            fh.loop_filter_params.loop_filter_ref_deltas,
            DEFAULT_LOOP_FILTER_REF_DELTAS
        );
        assert_eq!(fh.cdef_params.cdef_damping, 4);
        assert_eq!(fh.cdef_params.cdef_y_pri_strength[0], 7);
        assert_eq!(fh.cdef_params.cdef_y_sec_strength[0], 4);
        assert_eq!(fh.cdef_params.cdef_uv_pri_strength[0], 2);
        assert_eq!(fh.cdef_params.cdef_uv_sec_strength[0], 1);
        assert!(!fh.loop_restoration_params.uses_lr);
        assert_eq!(fh.tx_mode, TxMode::Select);
        assert!(!fh.reference_select);
        assert!(!fh.skip_mode_present);
        assert_eq!(fh.global_motion_params, GlobalMotionParams::identity());

        assert_eq!(frame.tile_group.tiles.len(), 1);
        let tile = &frame.tile_group.tiles[0];
        assert_eq!(frame.tile_group.tile_data(tile), &TILE_DATA);
        assert_eq!(fh.header_bytes + tile.tile_offset + tile.tile_size, data.len());

        assert!(!state.is_first_frame);
        assert!(!state.seen_frame_header);
        for rf in &state.ref_info {
            assert!(rf.ref_valid);
            assert_eq!(rf.ref_frame_type, FrameType::KeyFrame);
            assert_eq!(rf.ref_upscaled_width, 3840);
            assert_eq!(rf.ref_order_hint, 0);
        }
    }

    #[test]
    fn parse_inter_frame() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        let key = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        parse_frame(&key, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();

        let data = inter_frame(1, 0b0000_0001);
        let fh =
            parse_frame_header(&data, &seq, &mut state, &obu_header(ObuType::FrameHeader)).unwrap();

        assert_eq!(fh.frame_type, FrameType::InterFrame);
        assert!(fh.show_frame);
        assert!(fh.showable_frame);
        assert!(!fh.frame_is_intra);
        assert_eq!(fh.order_hint, 1);
        assert_eq!(fh.primary_ref_frame, 0);
        assert_eq!(fh.ref_frame_idx, [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!((fh.frame_width, fh.frame_height), (3840, 2160));
        assert!(fh.allow_high_precision_mv);
        assert_eq!(fh.interpolation_filter, InterpolationFilter::Switchable);
        assert!(!fh.use_ref_frame_mvs);
        assert_eq!(fh.order_hints[ReferenceFrameType::Last as usize], 0);
        assert!(fh.ref_frame_sign_bias.iter().all(|&bias| !bias));
        assert_eq!(fh.quantization_params.base_q_idx, 120);
        assert_eq!(fh.loop_filter_params.loop_filter_ref_deltas, [1, 2, 0, 0, 0, -1, -1, -1]);
        assert_eq!(fh.tx_mode, TxMode::Largest);
        assert!(fh.reference_select);
        // Every reference precedes the frame, and they share one order hint.
        assert!(!fh.skip_mode_present);

        let gm = &fh.global_motion_params;
        let last = ReferenceFrameType::Last as usize;
        assert_eq!(gm.gm_type[last], WarpModelType::Translation);
        assert_eq!(gm.gm_params[last], [2 << 13, 0, 1 << 16, 0, 0, 1 << 16]);
        for ref_frame in last + 1..NUM_REF_FRAMES {
            assert_eq!(gm.gm_type[ref_frame], WarpModelType::Identity);
        }

        assert!(state.seen_frame_header);
        assert!(state.prev_filled);
        assert_eq!(state.ref_info[0].ref_order_hint, 1);
        assert_eq!(state.ref_info[0].ref_frame_type, FrameType::InterFrame);
        assert_eq!(state.ref_info[0].loop_filter_ref_deltas[1], 2);
        assert_eq!(state.ref_info[1].ref_order_hint, 0);

        // A redundant frame header is a copy of the first one.
        let copy = parse_frame_header(
            &[],
            &seq,
            &mut state,
            &obu_header(ObuType::RedundantFrameHeader),
        )
        .unwrap();
        assert_eq!(copy, fh);

        let tg = parse_tile_group(&TILE_DATA, &state.prev_frame_header).unwrap();
        assert_eq!((tg.tg_start, tg.tg_end), (0, 0));
        assert!(tg.is_last_in_frame(&fh.tile_info));
    }

    #[test]
    fn inter_frame_needs_valid_primary_reference() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        let data = inter_frame(1, 0b0000_0001);
        assert_eq!(
            parse_frame_header(&data, &seq, &mut state, &obu_header(ObuType::FrameHeader)),
            Err(ParseError::InvalidReference(0))
        );

        // The state is left untouched.
        assert!(state.is_first_frame);
        assert!(!state.seen_frame_header);
        assert!(state.ref_info.iter().all(|rf| !rf.ref_valid));
    }

    #[test]
    fn missing_previous_header() {
        let seq = sequence_header();
        let mut state = DecodeState::new();
        state.seen_frame_header = true;

        assert_eq!(
            parse_frame_header(&[0x00], &seq, &mut state, &obu_header(ObuType::FrameHeader)),
            Err(ParseError::MissingPreviousHeader)
        );
    }

    #[test]
    fn show_existing_frame() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        let key = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        parse_frame(&key, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        let inter = with_tile_data(inter_frame(1, 0b0000_0001));
        parse_frame(&inter, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        assert!(!state.seen_frame_header);

        // show_existing_frame, frame_to_show_map_idx = 0
        let fh =
            parse_frame_header(&[0x80], &seq, &mut state, &obu_header(ObuType::FrameHeader))
                .unwrap();
        assert!(fh.show_existing_frame);
        assert_eq!(fh.frame_to_show_map_idx, 0);
        assert_eq!(fh.header_bytes, 1);
        assert_eq!(fh.frame_type, FrameType::InterFrame);
        assert!(fh.show_frame);
        assert_eq!(fh.refresh_frame_flags, 0);
        assert_eq!(fh.order_hint, 1);
        assert_eq!(fh.upscaled_width, 3840);
        assert!(!state.seen_frame_header);
        assert!(!state.prev_filled);

        // Slot 2 holds the shown key frame, which is not showable.
        assert!(matches!(
            parse_frame_header(&[0xa0], &seq, &mut state, &obu_header(ObuType::FrameHeader)),
            Err(ParseError::Conformance(_))
        ));
    }

    #[test]
    fn show_existing_key_frame_refreshes_every_slot() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        let key = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        parse_frame(&key, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        let hidden_key = with_tile_data(key_frame(false, 0b0000_0100, 5));
        let frame =
            parse_frame(&hidden_key, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        assert!(!frame.header.show_frame);
        assert!(frame.header.showable_frame);
        assert!(!frame.header.error_resilient_mode);
        assert_eq!(state.ref_info[2].ref_order_hint, 5);
        assert_eq!(state.ref_info[3].ref_order_hint, 0);

        let fh =
            parse_frame_header(&[0xa0], &seq, &mut state, &obu_header(ObuType::FrameHeader))
                .unwrap();
        assert_eq!(fh.frame_to_show_map_idx, 2);
        assert_eq!(fh.frame_type, FrameType::KeyFrame);
        assert!(!fh.showable_frame);
        assert_eq!(fh.refresh_frame_flags, ALL_FRAMES);
        assert_eq!(fh.order_hint, 5);

        for rf in &state.ref_info {
            assert!(rf.ref_valid);
            assert_eq!(rf.ref_order_hint, 5);
            assert!(!rf.showable_frame);
        }
    }

    #[test]
    fn show_existing_frame_inside_frame_obu() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        assert!(matches!(
            parse_frame_header(&[0x80], &seq, &mut state, &obu_header(ObuType::Frame)),
            Err(ParseError::Conformance(_))
        ));
    }

    fn two_tile_header() -> FrameHeaderObu {
        let mut fh = FrameHeaderObu::default();
        let ti = &mut fh.tile_info;
        ti.tile_cols = 2;
        ti.tile_rows = 1;
        ti.tile_cols_log2 = 1;
        ti.tile_size_bytes = 2;
        ti.mi_col_starts[..3].copy_from_slice(&[0, 16, 32]);
        ti.mi_row_starts[..2].copy_from_slice(&[0, 16]);
        fh
    }

    #[test]
    fn tile_group_sizes() {
        let fh = two_tile_header();
        let data = [0xa0, 0x02, 0x00, 1, 2, 3, 4, 5];

        let tg = parse_tile_group(&data, &fh).unwrap();
        assert!(tg.tile_start_and_end_present_flag);
        assert_eq!((tg.tg_start, tg.tg_end), (0, 1));
        assert_eq!(tg.tiles.len(), 2);

        assert_eq!((tg.tiles[0].tile_offset, tg.tiles[0].tile_size), (3, 3));
        assert_eq!(tg.tile_data(&tg.tiles[0]), &[1, 2, 3]);
        assert_eq!((tg.tiles[0].mi_col_start, tg.tiles[0].mi_col_end), (0, 16));

        assert_eq!((tg.tiles[1].tile_offset, tg.tiles[1].tile_size), (6, 2));
        assert_eq!(tg.tiles[1].tile_col, 1);
        assert_eq!((tg.tiles[1].mi_col_start, tg.tiles[1].mi_col_end), (16, 32));
        assert_eq!((tg.tiles[1].mi_row_start, tg.tiles[1].mi_row_end), (0, 16));
        assert!(tg.is_last_in_frame(&fh.tile_info));
    }

    #[test]
    fn tile_group_truncated() {
        let fh = two_tile_header();

        assert_eq!(
            parse_tile_group(&[0xa0, 0x09, 0x00, 1, 2], &fh),
            Err(ParseError::TruncatedTileData {
                size: 10,
                available: 2
            })
        );
        assert_eq!(
            parse_tile_group(&[0xa0, 0x01], &fh),
            Err(ParseError::TruncatedTileData {
                size: 2,
                available: 1
            })
        );
        // tg_end before tg_start.
        assert_eq!(
            parse_tile_group(&[0xc0, 0x00, 0x00, 1], &fh),
            Err(ParseError::InvalidValue {
                name: "tg_end",
                value: 0
            })
        );

        let mut fh = fh;
        fh.tile_info.tile_size_bytes = 0;
        assert_eq!(
            parse_tile_group(&[0xa0, 0x02, 0x00, 1], &fh),
            Err(ParseError::InvalidValue {
                name: "tile_size_bytes",
                value: 0
            })
        );
    }

    #[test]
    fn parser_walks_stream() {
        let mut stream = vec![0x12, 0x00];
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU);
        let frame = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        stream.extend(encapsulate_obu(&obu_header(ObuType::Frame), &frame).unwrap());

        let mut parser = Parser::default();
        let mut data = &stream[..];
        let mut seen = vec![];

        while !data.is_empty() {
            let ParsedObu::Process(obu) = parser.parse_obu(data).unwrap() else {
                panic!("nothing should be dropped");
            };

            match obu.obu_type() {
                ObuType::TemporalDelimiter => parser.parse_temporal_delimiter_obu(&obu).unwrap(),
                ObuType::SequenceHeader => {
                    let seq = parser.parse_sequence_header_obu(&obu).unwrap();
                    assert_eq!(seq.max_frame_width_minus_1, 3839);
                }
                ObuType::Frame => {
                    let frame = parser.parse_frame_obu(&obu).unwrap();
                    assert_eq!(frame.header.frame_type, FrameType::KeyFrame);
                    assert_eq!(frame.tile_group.tile_data(&frame.tile_group.tiles[0]), &TILE_DATA);
                }
                other => panic!("unexpected OBU {:?}", other),
            }

            seen.push(obu.obu_type());
            data = &data[obu.len()..];
        }

        assert_eq!(
            seen,
            vec![
                ObuType::TemporalDelimiter,
                ObuType::SequenceHeader,
                ObuType::Frame
            ]
        );
        assert_eq!(parser.operating_point(), 0);
        assert!(parser.state().ref_info.iter().all(|rf| rf.ref_valid));
    }

    #[test]
    fn parser_needs_sequence_header() {
        let mut parser = Parser::default();
        let frame = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        let data = encapsulate_obu(&obu_header(ObuType::Frame), &frame).unwrap();

        let ParsedObu::Process(obu) = parser.parse_obu(&data).unwrap() else {
            panic!("nothing should be dropped");
        };
        assert!(parser.parse_frame_obu(&obu).is_err());
        assert!(parser.choose_operating_point(0).is_err());
    }

    #[test]
    fn parser_drops_other_layers() {
        let mut parser = Parser::default();
        parser.operating_point_idc = 0x301;
        assert_eq!(parser.highest_operating_point(), Some(1));

        let header = ObuHeader {
            obu_type: ObuType::TileGroup,
            extension_flag: true,
            has_size_field: true,
            temporal_id: 1,
            spatial_id: 0,
        };
        let data = encapsulate_obu(&header, &[0x00; 3]).unwrap();

        assert!(matches!(parser.parse_obu(&data).unwrap(), ParsedObu::Drop(6)));

        let header = ObuHeader {
            temporal_id: 0,
            spatial_id: 1,
            ..header
        };
        let data = encapsulate_obu(&header, &[0x00; 3]).unwrap();
        assert!(matches!(parser.parse_obu(&data).unwrap(), ParsedObu::Process(_)));
    }

    #[test]
    fn empty_last_tile() {
        let fh = two_tile_header();

        // The first tile takes every byte, nothing is left for the second.
        assert_eq!(
            parse_tile_group(&[0xa0, 0x00, 0x00, 1], &fh),
            Err(ParseError::TruncatedTileData {
                size: 1,
                available: 0
            })
        );

        let mut fh = FrameHeaderObu::default();
        fh.tile_info.tile_cols = 1;
        fh.tile_info.tile_rows = 1;
        assert_eq!(
            parse_tile_group(&[], &fh),
            Err(ParseError::TruncatedTileData {
                size: 1,
                available: 0
            })
        );
    }

    #[test]
    fn failed_frame_keeps_state() {
        let seq = sequence_header();
        let mut state = DecodeState::new();

        // The header is fine, but the tile group has no data.
        let data = key_frame(true, ALL_FRAMES, 0);
        assert_eq!(
            parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap_err(),
            ParseError::TruncatedTileData {
                size: 1,
                available: 0
            }
        );
        assert_eq!(state, DecodeState::new());

        let data = with_tile_data(key_frame(true, ALL_FRAMES, 9));
        let frame = parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        assert_eq!(frame.header.order_hint, 9);
        assert_eq!(frame.tile_group.tile_data(&frame.tile_group.tiles[0]), &TILE_DATA);
        assert!(!state.seen_frame_header);
        assert!(state.ref_info.iter().all(|rf| rf.ref_valid && rf.ref_order_hint == 9));

        let before = state.clone();
        let data = inter_frame(10, ALL_FRAMES);
        assert!(parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).is_err());
        assert_eq!(state, before);
    }

    /// Parses a key frame, then an error resilient intra-only frame whose
    /// order hint for slot 5 disagrees with the key frame.
    fn state_with_invalid_slot_5(seq: &SequenceHeaderObu) -> (DecodeState, FrameHeaderObu) {
        let mut state = DecodeState::new();
        let key = with_tile_data(key_frame(true, ALL_FRAMES, 0));
        parse_frame(&key, seq, &mut state, &obu_header(ObuType::Frame)).unwrap();

        let mut ref_order_hint = [0; NUM_REF_FRAMES];
        ref_order_hint[5] = 9;
        let data = with_tile_data(intra_only_frame(20, 0b0000_0001, ref_order_hint));
        let fh = parse_frame(&data, seq, &mut state, &obu_header(ObuType::Frame))
            .unwrap()
            .header;

        (state, fh)
    }

    #[test]
    fn error_resilient_frame_invalidates_slots() {
        let seq = sequence_header();
        let (state, fh) = state_with_invalid_slot_5(&seq);

        assert_eq!(fh.frame_type, FrameType::IntraOnlyFrame);
        assert!(fh.frame_is_intra);
        assert!(fh.error_resilient_mode);
        assert!(fh.showable_frame);
        assert_eq!(fh.primary_ref_frame, PRIMARY_REF_NONE);
        assert_eq!(fh.refresh_frame_flags, 0b0000_0001);
        assert_eq!(fh.ref_order_hint, [0, 0, 0, 0, 0, 9, 0, 0]);
        assert_eq!((fh.frame_width, fh.frame_height), (3840, 2160));

        assert!(state.ref_info[0].ref_valid);
        assert_eq!(state.ref_info[0].ref_frame_type, FrameType::IntraOnlyFrame);
        assert_eq!(state.ref_info[0].ref_order_hint, 20);

        assert!(!state.ref_info[5].ref_valid);
        assert_eq!(state.ref_info[5].ref_order_hint, 9);

        for slot in [1, 2, 3, 4, 6, 7] {
            assert!(state.ref_info[slot].ref_valid);
            assert_eq!(state.ref_info[slot].ref_frame_type, FrameType::KeyFrame);
        }
    }

    #[test]
    fn inter_frame_needs_valid_references() {
        let seq = sequence_header();
        let (mut state, _) = state_with_invalid_slot_5(&seq);
        let before = state.clone();

        // ref_frame_idx[5] points at the invalidated slot.
        let data = with_tile_data(inter_frame(21, 0b0000_0001));
        assert_eq!(
            parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap_err(),
            ParseError::InvalidReference(5)
        );
        assert_eq!(state, before);
    }

    #[test]
    fn primary_reference_or_past_independence() {
        let seq = sequence_header();
        let mut state = DecodeState::new();
        for data in [key_frame(true, ALL_FRAMES, 0), inter_frame(1, ALL_FRAMES)] {
            let data = with_tile_data(data);
            parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame)).unwrap();
        }

        let last = ReferenceFrameType::Last as usize;
        assert_eq!(
            state.ref_info[0].global_motion_params.gm_type[last],
            WarpModelType::Translation
        );

        // Loop filter deltas are inherited from the primary reference.
        let data = with_tile_data(
            InterFrame {
                update_last_delta: false,
                translation_for_last: false,
                ..InterFrame::new(2, 0)
            }
            .build(),
        );
        let fh = parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame))
            .unwrap()
            .header;
        assert_eq!(fh.primary_ref_frame, 0);
        assert_eq!(fh.loop_filter_params.loop_filter_ref_deltas, [1, 2, 0, 0, 0, -1, -1, -1]);
        assert_eq!(fh.global_motion_params.gm_type[last], WarpModelType::Identity);

        // error_resilient_mode starts from the defaults instead.
        let data = with_tile_data(
            InterFrame {
                error_resilient_hint: Some(1),
                update_last_delta: false,
                ..InterFrame::new(2, 0)
            }
            .build(),
        );
        let fh = parse_frame(&data, &seq, &mut state, &obu_header(ObuType::Frame))
            .unwrap()
            .header;
        assert!(fh.error_resilient_mode);
        assert_eq!(fh.primary_ref_frame, PRIMARY_REF_NONE);
        assert_eq!(fh.ref_order_hint, [1; NUM_REF_FRAMES]);
        assert_eq!(
            fh.loop_filter_params.loop_filter_ref_deltas,
            DEFAULT_LOOP_FILTER_REF_DELTAS
        );
        assert_eq!(fh.loop_filter_params.loop_filter_mode_deltas, [0, 0]);
        // Coded against identity parameters, not the stored translation.
        assert_eq!(
            fh.global_motion_params.gm_params[last],
            [2 << 13, 0, 1 << 16, 0, 0, 1 << 16]
        );
        assert!(state.ref_info.iter().all(|rf| rf.ref_valid));
    }

    fn bits(write: impl FnOnce(&mut ObuWriter<&mut Vec<u8>>)) -> Vec<u8> {
        let mut buf = vec![];
        {
            let mut w = ObuWriter::new(&mut buf);
            write(&mut w);
            pad(&mut w);
        }
        buf
    }

    fn state_with_order_hints(order_hints: [u32; NUM_REF_FRAMES]) -> DecodeState {
        let mut state = DecodeState::new();
        for (rf, ref_order_hint) in state.ref_info.iter_mut().zip(order_hints) {
            *rf = ReferenceFrameInfo {
                ref_valid: true,
                ref_order_hint,
                ..Default::default()
            };
        }
        state
    }

    #[test]
    fn short_signaling_refs() {
        let seq = sequence_header();

        let state = state_with_order_hints([9, 8, 12, 11, 7, 14, 6, 13]);
        let mut fh = FrameHeaderObu {
            order_hint: 10,
            last_frame_idx: 0,
            gold_frame_idx: 4,
            ..Default::default()
        };
        set_frame_refs(&seq, &state, &mut fh).unwrap();
        // LAST, LAST2, LAST3, GOLDEN, BWDREF, ALTREF2, ALTREF
        assert_eq!(fh.ref_frame_idx, [0, 1, 6, 4, 3, 2, 5]);

        // Only one past frame is left for LAST2, LAST3 takes the earliest.
        let state = state_with_order_hints([9, 8, 11, 12, 13, 14, 15, 5]);
        fh.gold_frame_idx = 1;
        set_frame_refs(&seq, &state, &mut fh).unwrap();
        assert_eq!(fh.ref_frame_idx, [0, 7, 7, 1, 2, 3, 6]);

        // Order hints wrap at 1 << 7.
        let state = state_with_order_hints([1, 127, 5, 126, 3, 4, 125, 0]);
        fh.order_hint = 2;
        set_frame_refs(&seq, &state, &mut fh).unwrap();
        assert_eq!(fh.ref_frame_idx, [0, 7, 3, 1, 4, 5, 2]);

        fh.gold_frame_idx = 2;
        assert!(matches!(
            set_frame_refs(&seq, &state, &mut fh),
            Err(ParseError::Conformance(_))
        ));
    }

    fn sequence_header_with_frame_ids() -> SequenceHeaderObu {
        let mut seq = sequence_header();
        seq.frame_id_numbers_present_flag = true;
        seq.delta_frame_id_length_minus_2 = 2;
        seq.additional_frame_id_length_minus_1 = 3;
        seq
    }

    fn state_with_frame_ids(frame_ids: [u32; NUM_REF_FRAMES]) -> DecodeState {
        let mut state = DecodeState::new();
        for (rf, ref_frame_id) in state.ref_info.iter_mut().zip(frame_ids) {
            *rf = ReferenceFrameInfo {
                ref_valid: true,
                ref_frame_id,
                ..Default::default()
            };
        }
        state
    }

    #[test]
    fn frame_id_marks_stale_references() {
        let seq = sequence_header_with_frame_ids();
        assert_eq!(seq.frame_id_length(), 8);
        let mut fh = FrameHeaderObu {
            frame_type: FrameType::InterFrame,
            ..Default::default()
        };

        let mut state = state_with_frame_ids([39, 24, 23, 41, 30, 30, 30, 30]);
        state.is_first_frame = false;
        state.current_frame_id = 30;

        let data = bits(|w| {
            w.write_f(8, 40u32).unwrap();
        });
        parse_current_frame_id(&mut Reader::new(&data), &seq, &mut state, &mut fh, 8).unwrap();
        assert_eq!(fh.current_frame_id, 40);
        assert_eq!((state.prev_frame_id, state.current_frame_id), (30, 40));
        let valid: Vec<bool> = state.ref_info.iter().map(|rf| rf.ref_valid).collect();
        assert_eq!(valid, [true, true, false, false, true, true, true, true]);

        // Frame ids wrap at 1 << 8.
        let mut state = state_with_frame_ids([250, 3, 100, 5, 240, 244, 245, 6]);
        state.is_first_frame = false;
        state.current_frame_id = 250;

        let data = bits(|w| {
            w.write_f(8, 5u32).unwrap();
        });
        parse_current_frame_id(&mut Reader::new(&data), &seq, &mut state, &mut fh, 8).unwrap();
        let valid: Vec<bool> = state.ref_info.iter().map(|rf| rf.ref_valid).collect();
        assert_eq!(valid, [true, true, false, true, false, false, true, false]);

        // The same id again does not advance.
        assert!(matches!(
            parse_current_frame_id(&mut Reader::new(&data), &seq, &mut state, &mut fh, 8),
            Err(ParseError::Conformance(_))
        ));
    }

    #[test]
    fn delta_frame_id_mismatch() {
        let seq = sequence_header_with_frame_ids();
        let mut state = state_with_frame_ids([18, 17, 16, 15, 14, 13, 12, 11]);
        state.current_frame_id = 20;
        let mut fh = FrameHeaderObu::default();

        let data = bits(|w| {
            w.write_bit(false).unwrap(); // frame_refs_short_signaling
            w.write_f(3, 0u32).unwrap();
            w.write_f(4, 1u32).unwrap(); // delta_frame_id_minus_1, matches slot 0
            w.write_f(3, 1u32).unwrap();
            w.write_f(4, 0u32).unwrap();
        });

        assert_eq!(
            parse_inter_frame_refs(&mut Reader::new(&data), &seq, &state, &mut fh, 8),
            Err(ParseError::FrameIdMismatch {
                expected: 19,
                actual: 17
            })
        );
    }

    #[test]
    fn superres_frame_width() {
        let mut seq = sequence_header();
        seq.enable_superres = true;
        let mut fh = FrameHeaderObu::default();

        let data = bits(|w| {
            w.write_bit(true).unwrap(); // use_superres
            w.write_f(3, 0u32).unwrap(); // coded_denom
            w.write_bit(false).unwrap(); // render_and_frame_size_different
        });
        let mut r = Reader::new(&data);
        parse_frame_size(&mut r, &seq, &mut fh).unwrap();
        parse_render_size(&mut r, &mut fh).unwrap();

        assert!(fh.use_superres);
        assert_eq!(fh.superres_denom, 9);
        assert_eq!(fh.upscaled_width, 3840);
        assert_eq!((fh.frame_width, fh.frame_height), (3413, 2160));
        assert_eq!((fh.mi_cols, fh.mi_rows), (854, 540));
        assert_eq!((fh.render_width, fh.render_height), (3840, 2160));

        let data = bits(|w| {
            w.write_bit(false).unwrap();
            w.write_bit(false).unwrap();
        });
        let mut r = Reader::new(&data);
        parse_frame_size(&mut r, &seq, &mut fh).unwrap();
        assert!(!fh.use_superres);
        assert_eq!(fh.superres_denom, SUPERRES_NUM);
        assert_eq!((fh.frame_width, fh.upscaled_width), (3840, 3840));
    }

    #[test]
    fn uniform_tile_info() {
        let seq = sequence_header();
        let mut fh = FrameHeaderObu {
            mi_cols: 960,
            mi_rows: 540,
            ..Default::default()
        };

        let data = bits(|w| {
            w.write_bit(true).unwrap(); // uniform_tile_spacing_flag
            for increment in [true, true, false] {
                w.write_bit(increment).unwrap();
            }
            for increment in [true, false] {
                w.write_bit(increment).unwrap();
            }
            w.write_f(3, 5u32).unwrap(); // context_update_tile_id
            w.write_f(2, 1u32).unwrap(); // tile_size_bytes_minus_1
        });
        parse_tile_info(&mut Reader::new(&data), &seq, &mut fh).unwrap();

        let ti = &fh.tile_info;
        assert!(ti.uniform_tile_spacing_flag);
        assert_eq!((ti.tile_cols, ti.tile_cols_log2), (4, 2));
        assert_eq!((ti.tile_rows, ti.tile_rows_log2), (2, 1));
        assert_eq!(ti.mi_col_starts[..5], [0, 240, 480, 720, 960]);
        assert_eq!(ti.mi_row_starts[..3], [0, 272, 540]);
        assert_eq!(ti.width_in_sbs_minus_1[..4], [14; 4]);
        assert_eq!(ti.height_in_sbs_minus_1[..2], [16, 16]);
        assert_eq!(ti.context_update_tile_id, 5);
        assert_eq!(ti.tile_size_bytes, 2);
    }

    #[test]
    fn explicit_tile_info() {
        let seq = sequence_header();
        let mut fh = FrameHeaderObu {
            mi_cols: 64,
            mi_rows: 32,
            ..Default::default()
        };

        let data = bits(|w| {
            w.write_bit(false).unwrap(); // uniform_tile_spacing_flag
            w.write_ns(4, 0).unwrap(); // width_in_sbs_minus_1
            w.write_ns(3, 2).unwrap();
            w.write_ns(2, 0).unwrap(); // height_in_sbs_minus_1
            w.write_ns(1, 0).unwrap();
            w.write_f(2, 3u32).unwrap(); // context_update_tile_id
            w.write_f(2, 3u32).unwrap(); // tile_size_bytes_minus_1
        });
        parse_tile_info(&mut Reader::new(&data), &seq, &mut fh).unwrap();

        let ti = &fh.tile_info;
        assert!(!ti.uniform_tile_spacing_flag);
        assert_eq!((ti.tile_cols, ti.tile_cols_log2), (2, 1));
        assert_eq!((ti.tile_rows, ti.tile_rows_log2), (2, 1));
        assert_eq!(ti.mi_col_starts[..3], [0, 16, 64]);
        assert_eq!(ti.mi_row_starts[..3], [0, 16, 32]);
        assert_eq!(ti.width_in_sbs_minus_1[..2], [0, 2]);
        assert_eq!(ti.height_in_sbs_minus_1[..2], [0, 0]);
        assert_eq!(ti.context_update_tile_id, 3);
        assert_eq!(ti.tile_size_bytes, 4);
    }

    #[test]
    fn lossless_segments() {
        let seq = sequence_header();
        let mut fh = FrameHeaderObu {
            primary_ref_frame: PRIMARY_REF_NONE,
            ..Default::default()
        };
        fh.loop_filter_params.loop_filter_level = [9; 4];
        fh.loop_filter_params.loop_filter_ref_deltas = [3; TOTAL_REFS_PER_FRAME];
        fh.loop_filter_params.loop_filter_mode_deltas = [3; 2];

        let data = bits(|w| {
            w.write_f(8, 10u32).unwrap(); // base_q_idx
            w.write_f(4, 0u32).unwrap(); // no delta q, no qmatrix
            w.write_bit(true).unwrap(); // segmentation_enabled
            for _ in 0..MAX_SEGMENTS {
                // SEG_LVL_ALT_Q takes every segment down to qindex 0.
                w.write_bit(true).unwrap();
                w.write_su(9, -10).unwrap();
                for _ in SEG_LVL_ALT_Q + 1..SEG_LVL_MAX {
                    w.write_bit(false).unwrap();
                }
            }
            w.write_bit(false).unwrap(); // delta_q_present
        });

        let mut r = Reader::new(&data);
        parse_quantization_params(&mut r, &mut fh.quantization_params, &seq.color_config).unwrap();
        parse_segmentation_params(&mut r, &mut fh).unwrap();
        parse_delta_q_params(&mut r, &mut fh.quantization_params).unwrap();
        let delta_q_present = fh.quantization_params.delta_q_present;
        parse_delta_lf_params(&mut r, &mut fh.loop_filter_params, delta_q_present, false).unwrap();
        compute_lossless(&mut fh);
        parse_loop_filter_params(&mut r, &mut fh, 3).unwrap();
        parse_cdef_params(&mut r, &mut fh, &seq).unwrap();
        read_tx_mode(&mut r, &mut fh).unwrap();
        // Nothing is read after delta_q_present.
        assert_eq!(r.position(), 150);

        let seg = &fh.segmentation_params;
        assert!(seg.segmentation_update_data);
        assert!(seg.feature_enabled.iter().all(|f| f[SEG_LVL_ALT_Q]));
        assert!(seg.feature_data.iter().all(|d| d[SEG_LVL_ALT_Q] == -10));
        assert_eq!(seg.last_active_seg_id, 7);
        assert_eq!(seg.seg_id_pre_skip, 0);

        assert!(fh.lossless_array.iter().all(|&lossless| lossless));
        assert!(fh.coded_lossless);
        assert_eq!(fh.loop_filter_params.loop_filter_level[..2], [0, 0]);
        assert_eq!(
            fh.loop_filter_params.loop_filter_ref_deltas,
            DEFAULT_LOOP_FILTER_REF_DELTAS
        );
        assert_eq!(fh.loop_filter_params.loop_filter_mode_deltas, [0, 0]);
        assert_eq!(fh.cdef_params.cdef_damping, 3);
        assert_eq!(fh.tx_mode, TxMode::Only4x4);
    }

    #[test]
    fn film_grain_update_and_load() {
        let mut seq = sequence_header();
        seq.film_grain_params_present = true;
        let mut state = DecodeState::new();

        let mut key = FrameHeaderObu {
            frame_type: FrameType::KeyFrame,
            show_frame: true,
            ..Default::default()
        };
        let data = bits(|w| {
            w.write_bit(true).unwrap(); // apply_grain
            w.write_f(16, 0x1234u32).unwrap();
            w.write_f(4, 2u32).unwrap(); // num_y_points
            for (value, scaling) in [(16u32, 32u32), (128, 64)] {
                w.write_f(8, value).unwrap();
                w.write_f(8, scaling).unwrap();
            }
            w.write_bit(false).unwrap(); // chroma_scaling_from_luma
            w.write_f(4, 1u32).unwrap(); // num_cb_points
            w.write_f(8, 64u32).unwrap();
            w.write_f(8, 40u32).unwrap();
            w.write_f(4, 0u32).unwrap(); // num_cr_points
            w.write_f(2, 1u32).unwrap(); // grain_scaling_minus_8
            w.write_f(2, 1u32).unwrap(); // ar_coeff_lag
            for coeff in [130u32, 126, 128, 129] {
                w.write_f(8, coeff).unwrap();
            }
            for coeff in 120u32..125 {
                w.write_f(8, coeff).unwrap();
            }
            w.write_f(2, 2u32).unwrap(); // ar_coeff_shift_minus_6
            w.write_f(2, 0u32).unwrap(); // grain_scale_shift
            w.write_f(8, 128u32).unwrap(); // cb_mult
            w.write_f(8, 192u32).unwrap(); // cb_luma_mult
            w.write_f(9, 256u32).unwrap(); // cb_offset
            w.write_bit(true).unwrap(); // overlap_flag
            w.write_bit(false).unwrap(); // clip_to_restricted_range
        });
        parse_film_grain_params(&mut Reader::new(&data), &seq, &state, &mut key).unwrap();

        let fg = &key.film_grain_params;
        assert!(fg.apply_grain);
        assert!(fg.update_grain);
        assert_eq!(fg.grain_seed, 0x1234);
        assert_eq!(fg.num_y_points, 2);
        assert_eq!(fg.point_y_value[..2], [16, 128]);
        assert_eq!(fg.point_y_scaling[..2], [32, 64]);
        assert_eq!(fg.num_cb_points, 1);
        assert_eq!((fg.point_cb_value[0], fg.point_cb_scaling[0]), (64, 40));
        assert_eq!(fg.num_cr_points, 0);
        assert_eq!(fg.grain_scaling_minus_8, 1);
        assert_eq!(fg.ar_coeffs_y_plus_128[..4], [130, 126, 128, 129]);
        assert_eq!(fg.ar_coeffs_cb_plus_128[..5], [120, 121, 122, 123, 124]);
        assert_eq!(fg.ar_coeffs_cr_plus_128[..5], [0; 5]);
        assert_eq!(fg.ar_coeff_shift_minus_6, 2);
        assert_eq!((fg.cb_mult, fg.cb_luma_mult, fg.cb_offset), (128, 192, 256));
        assert!(fg.overlap_flag);
        assert!(!fg.clip_to_restricted_range);

        state.ref_info[3] = ReferenceFrameInfo {
            ref_valid: true,
            film_grain_params: key.film_grain_params.clone(),
            ..Default::default()
        };

        let mut inter = FrameHeaderObu {
            frame_type: FrameType::InterFrame,
            show_frame: true,
            ref_frame_idx: [3, 0, 1, 2, 4, 5, 6],
            ..Default::default()
        };
        let load = |film_grain_params_ref_idx: u32| {
            bits(move |w| {
                w.write_bit(true).unwrap(); // apply_grain
                w.write_f(16, 0xbeefu32).unwrap();
                w.write_bit(false).unwrap(); // update_grain
                w.write_f(3, film_grain_params_ref_idx).unwrap();
            })
        };

        // The stored parameters come with the newly coded seed.
        parse_film_grain_params(&mut Reader::new(&load(3)), &seq, &state, &mut inter).unwrap();
        assert_eq!(
            inter.film_grain_params,
            FilmGrainParams {
                grain_seed: 0xbeef,
                update_grain: false,
                film_grain_params_ref_idx: 3,
                ..key.film_grain_params.clone()
            }
        );

        // Slot 7 is not a reference of the frame, slot 0 holds nothing.
        for slot in [7, 0] {
            assert_eq!(
                parse_film_grain_params(&mut Reader::new(&load(slot)), &seq, &state, &mut inter),
                Err(ParseError::InvalidReference(slot as usize))
            );
        }

        let data = bits(|w| {
            w.write_bit(false).unwrap();
        });
        parse_film_grain_params(&mut Reader::new(&data), &seq, &state, &mut inter).unwrap();
        assert_eq!(inter.film_grain_params, FilmGrainParams::default());
    }

    #[test]
    fn parser_ends_frame_after_last_tile_group() {
        let mut stream = SEQUENCE_HEADER_OBU.to_vec();
        let key = key_frame(true, ALL_FRAMES, 0);
        stream.extend(encapsulate_obu(&obu_header(ObuType::FrameHeader), &key).unwrap());
        stream.extend(encapsulate_obu(&obu_header(ObuType::TileGroup), &TILE_DATA).unwrap());
        let inter = inter_frame(1, 0b0000_0001);
        stream.extend(encapsulate_obu(&obu_header(ObuType::FrameHeader), &inter).unwrap());

        let mut parser = Parser::default();
        let mut data = &stream[..];
        let mut order_hints = vec![];

        while !data.is_empty() {
            let ParsedObu::Process(obu) = parser.parse_obu(data).unwrap() else {
                panic!("nothing should be dropped");
            };

            match obu.obu_type() {
                ObuType::SequenceHeader => {
                    parser.parse_sequence_header_obu(&obu).unwrap();
                }
                ObuType::FrameHeader => {
                    // A new frame, not a copy of the previous header.
                    assert!(!parser.state().seen_frame_header);
                    let fh = parser.parse_frame_header_obu(&obu).unwrap();
                    order_hints.push(fh.order_hint);
                }
                ObuType::TileGroup => {
                    let tg = parser.parse_tile_group_obu(&obu).unwrap();
                    assert_eq!(tg.tile_data(&tg.tiles[0]), &TILE_DATA);
                    assert!(!parser.state().seen_frame_header);
                }
                other => panic!("unexpected OBU {:?}", other),
            }

            data = &data[obu.len()..];
        }

        assert_eq!(order_hints, [0, 1]);
        assert!(parser.state().seen_frame_header);
    }
}
