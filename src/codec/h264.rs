// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 syntax consumed by the decoding core.

use std::sync::Arc;

use enumn::N;

use crate::codec::DpbCapacity;
use crate::codec::DPB_MAX_SIZE;
use crate::ChromaFormat;
use crate::Resolution;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    P = 0,
    B = 1,
    #[default]
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_b(self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_intra(self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// One scaling list as signalled in a parameter set, in zig-zag order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalingList<const N: usize> {
    /// Not transmitted, inferred with fall-back rule A.
    #[default]
    NotPresent,
    /// `useDefaultScalingMatrixFlag` was set.
    UseDefault,
    Explicit([u8; N]),
}

/// The scaling matrix of a parameter set. `None` in a parameter set means no matrix was
/// signalled at that level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalingMatrix {
    pub lists_4x4: [ScalingList<16>; 6],
    pub lists_8x8: [ScalingList<64>; 2],
}

/// A H.264 Sequence Parameter Set, reduced to the elements the core needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: Level,
    pub chroma_format: ChromaFormat,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub scaling_matrix: Option<ScalingMatrix>,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    /// `max_dec_frame_buffering` from the VUI bitstream restrictions, if present.
    pub max_dec_frame_buffering: Option<u32>,
    /// `max_num_reorder_frames` from the VUI bitstream restrictions, if present.
    pub max_num_reorder_frames: Option<u32>,
}

impl Sps {
    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    pub fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1) * 16 * (2 - self.frame_mbs_only_flag as u32)
    }

    pub fn coded_resolution(&self) -> Resolution {
        Resolution::from((self.width(), self.height()))
    }

    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Level with the level 1b special case of A.3.1 and A.3.2 resolved.
    fn effective_level(&self) -> Level {
        if matches!(self.level_idc, Level::L1_1)
            && (self.profile_idc == Profile::Baseline as u8
                || self.profile_idc == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            Level::L1B
        } else {
            self.level_idc
        }
    }

    pub fn max_dpb_frames(&self) -> usize {
        // Table A.1
        let max_dpb_mbs = match self.effective_level() {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let width_mb = self.width() / 16;
        let height_mb = self.height() / 16;
        let frame_mbs = std::cmp::max(1, width_mb * height_mb);

        let max_dpb_frames = std::cmp::min(max_dpb_mbs / frame_mbs, DPB_MAX_SIZE as u32) as usize;
        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if let Some(max_dec_frame_buffering) = self.max_dec_frame_buffering {
            max_dpb_frames = std::cmp::max(1, max_dec_frame_buffering as usize);
        }

        std::cmp::min(max_dpb_frames, DPB_MAX_SIZE)
    }

    pub fn max_num_order_frames(&self) -> usize {
        if let Some(max_num_reorder_frames) = self.max_num_reorder_frames {
            return max_num_reorder_frames as usize;
        }

        let intra_only = matches!(self.profile_idc, 44 | 86 | 100 | 110 | 122 | 244)
            && self.constraint_set3_flag;
        if intra_only {
            0
        } else {
            self.max_dpb_frames()
        }
    }

    pub fn dpb_capacity(&self) -> DpbCapacity {
        let max_num_pics = self.max_dpb_frames();

        DpbCapacity {
            max_num_pics,
            max_num_refs: std::cmp::max(1, self.max_num_ref_frames as usize).min(max_num_pics),
            max_num_reorder: self.max_num_order_frames().min(max_num_pics),
        }
    }
}

/// A H.264 Picture Parameter Set, reduced to the elements the core needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub scaling_matrix: Option<ScalingMatrix>,
    pub second_chroma_qp_index_offset: i8,
}

/// Explicit weighted prediction parameters of a slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0: Vec<i16>,
    pub luma_offset_l0: Vec<i16>,
    pub chroma_weight_l0: Vec<[i16; 2]>,
    pub chroma_offset_l0: Vec<[i16; 2]>,
    pub luma_weight_l1: Vec<i16>,
    pub luma_offset_l1: Vec<i16>,
    pub chroma_weight_l1: Vec<[i16; 2]>,
    pub chroma_offset_l1: Vec<[i16; 2]>,
}

/// Picture-level parameters of a H.264 picture.
#[derive(Clone, Debug, Default)]
pub struct PictureParams {
    pub sps: Arc<Sps>,
    pub pps: Arc<Pps>,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub nal_ref_idc: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

/// A H.264 slice header, reduced to the elements the core needs.
///
/// Reference picture lists are given as picture order counts, after the parser applied the
/// list modifications.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    /// Size of the slice header in bits, i.e. the bit offset of the slice data.
    pub header_bit_size: usize,
    /// Number of emulation prevention bytes within the slice header.
    pub n_emulation_prevention_bytes: usize,
    pub pred_weight_table: Option<PredWeightTable>,
    pub ref_pic_list0: Vec<i32>,
    pub ref_pic_list1: Vec<i32>,
}

impl SliceHeader {
    /// Bit offset of the first macroblock within the NAL payload, once emulation prevention
    /// bytes are accounted for.
    pub fn slice_data_bit_offset(&self) -> usize {
        self.header_bit_size + 8 * self.n_emulation_prevention_bytes
    }
}
