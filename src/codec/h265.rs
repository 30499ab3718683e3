// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 syntax consumed by the decoding core.

use std::sync::Arc;

use enumn::N;

use crate::codec::DpbCapacity;
use crate::codec::DPB_MAX_SIZE;
use crate::ChromaFormat;
use crate::Resolution;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Main = 1,
    Main10 = 2,
    MainStill = 3,
    RangeExtensions = 4,
}

/// `general_level_idc` values, i.e. 30 times the level number.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    #[default]
    L1 = 30,
    L2 = 60,
    L2_1 = 63,
    L3 = 90,
    L3_1 = 93,
    L4 = 120,
    L4_1 = 123,
    L5 = 150,
    L5_1 = 153,
    L5_2 = 156,
    L6 = 180,
    L6_1 = 183,
    L6_2 = 186,
}

impl Level {
    /// MaxLumaPs of Table A.8.
    pub fn max_luma_ps(self) -> u64 {
        match self {
            Level::L1 => 36864,
            Level::L2 => 122880,
            Level::L2_1 => 245760,
            Level::L3 => 552960,
            Level::L3_1 => 983040,
            Level::L4 | Level::L4_1 => 2228224,
            Level::L5 | Level::L5_1 | Level::L5_2 => 8912896,
            Level::L6 | Level::L6_1 | Level::L6_2 => 35651584,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

/// Scaling lists as signalled in a parameter set, in coded (up-right diagonal) order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub lists_4x4: [[u8; 16]; 6],
    pub lists_8x8: [[u8; 64]; 6],
    pub lists_16x16: [[u8; 64]; 6],
    /// Only matrixId 0 and 3 exist for 32x32, stored at index 0 and 1.
    pub lists_32x32: [[u8; 64]; 2],
    pub dc_16x16: [u8; 6],
    pub dc_32x32: [u8; 2],
}

/// A H.265 Sequence Parameter Set, reduced to the elements the core needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub general_profile_idc: u8,
    pub general_level_idc: Level,
    pub chroma_format: ChromaFormat,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    /// `sps_max_dec_pic_buffering_minus1` of the highest temporal layer.
    pub max_dec_pic_buffering_minus1: u8,
    /// `sps_max_num_reorder_pics` of the highest temporal layer.
    pub max_num_reorder_pics: u8,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub log2_diff_max_min_luma_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub scaling_lists: Option<ScalingLists>,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
}

impl Sps {
    pub fn coded_resolution(&self) -> Resolution {
        Resolution::from((
            u32::from(self.pic_width_in_luma_samples),
            u32::from(self.pic_height_in_luma_samples),
        ))
    }

    /// MaxDpbSize as derived in A.4.2.
    pub fn max_dpb_size_for_level(&self) -> usize {
        const MAX_DPB_PIC_BUF: u64 = 6;

        let max_luma_ps = self.general_level_idc.max_luma_ps();
        let pic_size = self.coded_resolution().num_samples();

        let size = if pic_size <= (max_luma_ps >> 2) {
            4 * MAX_DPB_PIC_BUF
        } else if pic_size <= (max_luma_ps >> 1) {
            2 * MAX_DPB_PIC_BUF
        } else if pic_size <= ((3 * max_luma_ps) >> 2) {
            (4 * MAX_DPB_PIC_BUF) / 3
        } else {
            MAX_DPB_PIC_BUF
        };

        std::cmp::min(size as usize, DPB_MAX_SIZE)
    }

    /// Number of pictures the DPB must be able to hold: the signalled buffering, bounded by
    /// what the level allows for this picture size.
    pub fn max_dpb_size(&self) -> usize {
        let signalled = usize::from(self.max_dec_pic_buffering_minus1) + 1;
        std::cmp::min(signalled, self.max_dpb_size_for_level())
    }

    pub fn dpb_capacity(&self) -> DpbCapacity {
        let max_num_pics = self.max_dpb_size();

        DpbCapacity {
            max_num_pics,
            // The current picture occupies a slot of the DPB while being decoded.
            max_num_refs: std::cmp::max(1, max_num_pics.saturating_sub(1)),
            max_num_reorder: usize::from(self.max_num_reorder_pics).min(max_num_pics),
        }
    }
}

/// A H.265 Picture Parameter Set, reduced to the elements the core needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub column_width_minus1: Vec<u16>,
    pub row_height_minus1: Vec<u16>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_lists: Option<ScalingLists>,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
}

/// Reference picture set of the current picture, as picture order counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicSet {
    pub st_curr_before: Vec<i32>,
    pub st_curr_after: Vec<i32>,
    pub st_foll: Vec<i32>,
    pub lt_curr: Vec<i32>,
    pub lt_foll: Vec<i32>,
}

impl RefPicSet {
    /// Every picture order count the set keeps as reference.
    pub fn all(&self) -> impl Iterator<Item = i32> + '_ {
        self.st_curr_before
            .iter()
            .chain(&self.st_curr_after)
            .chain(&self.st_foll)
            .chain(&self.lt_curr)
            .chain(&self.lt_foll)
            .copied()
    }
}

/// Picture-level parameters of a H.265 picture.
#[derive(Clone, Debug, Default)]
pub struct PictureParams {
    pub sps: Arc<Sps>,
    pub pps: Arc<Pps>,
    pub pic_order_cnt: i32,
    pub irap_pic: bool,
    pub idr_pic: bool,
    pub intra_pic: bool,
    pub rps: RefPicSet,
    /// Bits used by `short_term_ref_pic_set()` in the slice header, 0 if the SPS set was used.
    pub st_rps_bits: u32,
}

/// Explicit weighted prediction parameters of a slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub delta_luma_weight_l0: Vec<i8>,
    pub luma_offset_l0: Vec<i8>,
    pub delta_chroma_weight_l0: Vec<[i8; 2]>,
    pub chroma_offset_l0: Vec<[i8; 2]>,
    pub delta_luma_weight_l1: Vec<i8>,
    pub luma_offset_l1: Vec<i8>,
    pub delta_chroma_weight_l1: Vec<[i8; 2]>,
    pub chroma_offset_l1: Vec<[i8; 2]>,
}

/// A H.265 slice segment header, reduced to the elements the core needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub slice_type: SliceType,
    pub colour_plane_id: u8,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub temporal_mvp_enabled_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
    pub max_num_merge_cand: u8,
    pub qp_delta: i8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u16,
    /// Size of the slice segment header in bytes, i.e. the offset of the slice data.
    pub header_size: u32,
    pub num_emulation_prevention_bytes: u16,
    pub pred_weight_table: Option<PredWeightTable>,
    pub ref_pic_list0: Vec<i32>,
    pub ref_pic_list1: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps(level: Level, w: u16, h: u16, buffering_minus1: u8) -> Sps {
        Sps {
            general_level_idc: level,
            pic_width_in_luma_samples: w,
            pic_height_in_luma_samples: h,
            max_dec_pic_buffering_minus1: buffering_minus1,
            ..Default::default()
        }
    }

    #[test]
    fn max_dpb_size_by_picture_size() {
        // 1920x1080 at level 4.1: 2073600 > 3/4 * 2228224, so MaxDpbSize = 6.
        assert_eq!(sps(Level::L4_1, 1920, 1080, 5).max_dpb_size_for_level(), 6);
        // 1280x720 at level 4.1: 921600 <= 2228224 / 2, so 12.
        assert_eq!(sps(Level::L4_1, 1280, 720, 5).max_dpb_size_for_level(), 12);
        // 416x240 at level 5: fits four times, 24 clamped to 16.
        assert_eq!(sps(Level::L5, 416, 240, 5).max_dpb_size_for_level(), 16);
    }

    #[test]
    fn signalled_buffering_is_used() {
        let capacity = sps(Level::L4_1, 1920, 1080, 4).dpb_capacity();
        assert_eq!(capacity.max_num_pics, 5);
        assert_eq!(capacity.max_num_refs, 4);
    }

    #[test]
    fn signalled_buffering_is_bounded_by_level() {
        assert_eq!(sps(Level::L4_1, 1920, 1080, 9).max_dpb_size(), 6);
    }

    #[test]
    fn rps_iterates_all_sets() {
        let rps = RefPicSet {
            st_curr_before: vec![4],
            st_curr_after: vec![12],
            lt_curr: vec![0],
            ..Default::default()
        };
        assert_eq!(rps.all().collect::<Vec<_>>(), vec![4, 12, 0]);
    }
}
