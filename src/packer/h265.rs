// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 command buffers.

use crate::accel::Accelerator;
use crate::accel::BufferType;
use crate::accel::SurfaceId;
use crate::accel::VA_INVALID_SURFACE;
use crate::codec::h265::PictureParams;
use crate::codec::h265::PredWeightTable;
use crate::codec::h265::RefPicSet;
use crate::codec::h265::ScalingLists;
use crate::codec::h265::SliceHeader;
use crate::codec::h265::SliceType;
use crate::codec::PictureParams as CodecPictureParams;
use crate::codec::SliceSyntax;
use crate::frame::Field;
use crate::frame::Reference;
use crate::packer::layout::narrow;
use crate::packer::layout::BitField;
use crate::packer::layout::LayoutWriter;
use crate::packer::layout::VA_PADDING_LOW;
use crate::packer::layout::VA_PADDING_MEDIUM;
use crate::packer::Continuation;
use crate::packer::FrameContext;
use crate::packer::PackError;
use crate::packer::PackResult;
use crate::packer::Packer;
use crate::packer::PackerBase;
use crate::packer::PackerCaps;
use crate::packer::RefPicture;
use crate::packer::SliceChunk;
use crate::packer::SliceDataWriter;
use crate::Codec;

pub const VA_PICTURE_HEVC_INVALID: u32 = 0x01;
pub const VA_PICTURE_HEVC_FIELD_PIC: u32 = 0x02;
pub const VA_PICTURE_HEVC_BOTTOM_FIELD: u32 = 0x04;
pub const VA_PICTURE_HEVC_LONG_TERM_REFERENCE: u32 = 0x08;
pub const VA_PICTURE_HEVC_RPS_ST_CURR_BEFORE: u32 = 0x10;
pub const VA_PICTURE_HEVC_RPS_ST_CURR_AFTER: u32 = 0x20;
pub const VA_PICTURE_HEVC_RPS_LT_CURR: u32 = 0x40;

pub const PICTURE_HEVC_SIZE: usize = 28;
pub const PICTURE_PARAMETER_SIZE: usize = 604;
pub const SLICE_PARAMETER_SIZE: usize = 264;
pub const IQ_MATRIX_SIZE: usize = 1016;

pub const MAX_REFERENCE_FRAMES: usize = 15;
const MAX_TILE_COLUMNS: usize = 19;
const MAX_TILE_ROWS: usize = 21;

/// Prepended to the slice data, the accelerator expects whole NAL units.
pub const START_CODE: [u8; 3] = [0, 0, 1];

/// Raster scan positions of the up-right diagonal scan of a `size`x`size` block (6.5.3).
const fn up_right_diagonal<const N: usize>(size: isize) -> [usize; N] {
    let mut scan = [0; N];
    let mut i = 0;
    let mut x: isize = 0;
    let mut y: isize = 0;

    while i < N {
        while y >= 0 {
            if x < size && y < size {
                scan[i] = (y * size + x) as usize;
                i += 1;
            }
            y -= 1;
            x += 1;
        }
        y = x;
        x = 0;
    }

    scan
}

const DIAGONAL_8X8: [usize; 64] = up_right_diagonal::<64>(8);

const fn diagonal_from_raster(raster: &[u8; 64]) -> [u8; 64] {
    let mut list = [0; 64];
    let mut i = 0;
    while i < 64 {
        list[i] = raster[DIAGONAL_8X8[i]];
        i += 1;
    }
    list
}

/// Table 7-6, intra default in raster order.
const DEFAULT_INTRA_RASTER: [u8; 64] = [
    16, 16, 16, 16, 17, 18, 21, 24, //
    16, 16, 16, 16, 17, 19, 22, 25, //
    16, 16, 17, 18, 20, 22, 25, 29, //
    16, 16, 18, 21, 24, 27, 31, 36, //
    17, 17, 20, 24, 30, 35, 41, 47, //
    18, 19, 22, 27, 35, 44, 54, 65, //
    21, 22, 25, 31, 41, 54, 70, 88, //
    24, 25, 29, 36, 47, 65, 88, 115,
];

/// Table 7-6, inter default in raster order.
const DEFAULT_INTER_RASTER: [u8; 64] = [
    16, 16, 16, 16, 17, 18, 20, 24, //
    16, 16, 16, 17, 18, 20, 24, 25, //
    16, 16, 17, 18, 20, 24, 25, 28, //
    16, 17, 18, 20, 24, 25, 28, 33, //
    17, 18, 20, 24, 25, 28, 33, 41, //
    18, 20, 24, 25, 28, 33, 41, 54, //
    20, 24, 25, 28, 33, 41, 54, 71, //
    24, 25, 28, 33, 41, 54, 71, 91,
];

const DEFAULT_INTRA: [u8; 64] = diagonal_from_raster(&DEFAULT_INTRA_RASTER);
const DEFAULT_INTER: [u8; 64] = diagonal_from_raster(&DEFAULT_INTER_RASTER);

/// Scaling lists used when scaling is enabled but none is signalled.
fn default_scaling_lists() -> ScalingLists {
    let sized = [
        DEFAULT_INTRA,
        DEFAULT_INTRA,
        DEFAULT_INTRA,
        DEFAULT_INTER,
        DEFAULT_INTER,
        DEFAULT_INTER,
    ];

    ScalingLists {
        lists_4x4: [[16; 16]; 6],
        lists_8x8: sized,
        lists_16x16: sized,
        lists_32x32: [DEFAULT_INTRA, DEFAULT_INTER],
        dc_16x16: [16; 6],
        dc_32x32: [16; 2],
    }
}

/// `VAPictureHEVC`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaPictureHevc {
    pub picture_id: SurfaceId,
    pub pic_order_cnt: i32,
    pub flags: u32,
}

impl VaPictureHevc {
    pub fn invalid() -> Self {
        Self {
            picture_id: VA_INVALID_SURFACE,
            pic_order_cnt: 0,
            flags: VA_PICTURE_HEVC_INVALID,
        }
    }

    fn write(&self, w: &mut LayoutWriter) {
        w.u32(self.picture_id)
            .i32(self.pic_order_cnt)
            .u32(self.flags)
            .reserved(VA_PADDING_LOW);
    }
}

fn fill_va_hevc_pic(pic: &RefPicture, surface: SurfaceId, rps: &RefPicSet) -> VaPictureHevc {
    let mut flags = 0;

    if matches!(pic.reference, Reference::LongTerm) {
        flags |= VA_PICTURE_HEVC_LONG_TERM_REFERENCE;
    }

    match pic.field {
        Field::Frame => (),
        Field::Top => flags |= VA_PICTURE_HEVC_FIELD_PIC,
        Field::Bottom => flags |= VA_PICTURE_HEVC_FIELD_PIC | VA_PICTURE_HEVC_BOTTOM_FIELD,
    }

    if rps.st_curr_before.contains(&pic.poc) {
        flags |= VA_PICTURE_HEVC_RPS_ST_CURR_BEFORE;
    } else if rps.st_curr_after.contains(&pic.poc) {
        flags |= VA_PICTURE_HEVC_RPS_ST_CURR_AFTER;
    } else if rps.lt_curr.contains(&pic.poc) {
        flags |= VA_PICTURE_HEVC_RPS_LT_CURR;
    }

    VaPictureHevc {
        picture_id: surface,
        pic_order_cnt: pic.poc,
        flags,
    }
}

/// The references of the picture, in the order of `ReferenceFrames`.
fn reference_frames<'a>(frame: &'a FrameContext) -> PackResult<Vec<&'a RefPicture>> {
    let refs: Vec<_> = frame
        .refs
        .iter()
        .filter(|r| r.mem != frame.target)
        .collect();

    if refs.len() > MAX_REFERENCE_FRAMES {
        return Err(PackError::TooManyReferences {
            count: refs.len(),
            max: MAX_REFERENCE_FRAMES,
        });
    }

    Ok(refs)
}

fn write_padded<T: Copy>(values: &[T], len: usize, pad: T, mut write: impl FnMut(T)) {
    values.iter().take(len).for_each(|v| write(*v));
    (values.len()..len).for_each(|_| write(pad));
}

fn build_pic_param(
    accel: &Accelerator,
    frame: &FrameContext,
    params: &PictureParams,
) -> PackResult<Vec<u8>> {
    let sps = &params.sps;
    let pps = &params.pps;

    let curr_pic = VaPictureHevc {
        picture_id: accel.surface_id(frame.target)?,
        pic_order_cnt: params.pic_order_cnt,
        flags: 0,
    };

    let mut va_refs = Vec::new();
    for pic in reference_frames(frame)? {
        va_refs.push(fill_va_hevc_pic(pic, accel.surface_id(pic.mem)?, &params.rps));
    }

    if pps.column_width_minus1.len() > MAX_TILE_COLUMNS {
        return Err(PackError::FieldOutOfRange {
            field: "num_tile_columns_minus1",
            value: pps.column_width_minus1.len() as i64,
        });
    }
    if pps.row_height_minus1.len() > MAX_TILE_ROWS {
        return Err(PackError::FieldOutOfRange {
            field: "num_tile_rows_minus1",
            value: pps.row_height_minus1.len() as i64,
        });
    }

    let pic_fields = BitField::new()
        .push("chroma_format_idc", sps.chroma_format.idc(), 2)?
        .flag(sps.separate_colour_plane_flag)
        .flag(sps.pcm_enabled_flag)
        .flag(sps.scaling_list_enabled_flag)
        .flag(pps.transform_skip_enabled_flag)
        .flag(sps.amp_enabled_flag)
        .flag(sps.strong_intra_smoothing_enabled_flag)
        .flag(pps.sign_data_hiding_enabled_flag)
        .flag(pps.constrained_intra_pred_flag)
        .flag(pps.cu_qp_delta_enabled_flag)
        .flag(pps.weighted_pred_flag)
        .flag(pps.weighted_bipred_flag)
        .flag(pps.transquant_bypass_enabled_flag)
        .flag(pps.tiles_enabled_flag)
        .flag(pps.entropy_coding_sync_enabled_flag)
        .flag(pps.loop_filter_across_slices_enabled_flag)
        .flag(pps.loop_filter_across_tiles_enabled_flag)
        .flag(sps.pcm_loop_filter_disabled_flag)
        // NoPicReorderingFlag
        .flag(sps.max_num_reorder_pics == 0)
        // NoBiPredFlag
        .flag(false)
        .bits();

    let slice_parsing_fields = BitField::new()
        .flag(pps.lists_modification_present_flag)
        .flag(sps.long_term_ref_pics_present_flag)
        .flag(sps.temporal_mvp_enabled_flag)
        .flag(pps.cabac_init_present_flag)
        .flag(pps.output_flag_present_flag)
        .flag(pps.dependent_slice_segments_enabled_flag)
        .flag(pps.slice_chroma_qp_offsets_present_flag)
        .flag(sps.sample_adaptive_offset_enabled_flag)
        .flag(pps.deblocking_filter_override_enabled_flag)
        .flag(pps.pps_deblocking_filter_disabled_flag)
        .flag(pps.slice_segment_header_extension_present_flag)
        .flag(params.irap_pic)
        .flag(params.idr_pic)
        .flag(params.intra_pic)
        .bits();

    let (pcm_luma, pcm_chroma, pcm_min, pcm_diff) = if sps.pcm_enabled_flag {
        (
            sps.pcm_sample_bit_depth_luma_minus1,
            sps.pcm_sample_bit_depth_chroma_minus1,
            sps.log2_min_pcm_luma_coding_block_size_minus3,
            sps.log2_diff_max_min_pcm_luma_coding_block_size,
        )
    } else {
        (0, 0, 0, 0)
    };

    let mut w = LayoutWriter::new();
    curr_pic.write(&mut w);
    for i in 0..MAX_REFERENCE_FRAMES {
        va_refs
            .get(i)
            .copied()
            .unwrap_or_else(VaPictureHevc::invalid)
            .write(&mut w);
    }

    w.u16(sps.pic_width_in_luma_samples)
        .u16(sps.pic_height_in_luma_samples)
        .u32(pic_fields)
        .u8(sps.max_dec_pic_buffering_minus1)
        .u8(sps.bit_depth_luma_minus8)
        .u8(sps.bit_depth_chroma_minus8)
        .u8(pcm_luma)
        .u8(pcm_chroma)
        .u8(sps.log2_min_luma_coding_block_size_minus3)
        .u8(sps.log2_diff_max_min_luma_coding_block_size)
        .u8(sps.log2_min_luma_transform_block_size_minus2)
        .u8(sps.log2_diff_max_min_luma_transform_block_size)
        .u8(pcm_min)
        .u8(pcm_diff)
        .u8(sps.max_transform_hierarchy_depth_intra)
        .u8(sps.max_transform_hierarchy_depth_inter)
        .i8(pps.init_qp_minus26)
        .u8(pps.diff_cu_qp_delta_depth)
        .i8(pps.cb_qp_offset)
        .i8(pps.cr_qp_offset)
        .u8(pps.log2_parallel_merge_level_minus2)
        .u8(pps.num_tile_columns_minus1)
        .u8(pps.num_tile_rows_minus1);

    write_padded(&pps.column_width_minus1, MAX_TILE_COLUMNS, 0, |v| {
        w.u16(v);
    });
    write_padded(&pps.row_height_minus1, MAX_TILE_ROWS, 0, |v| {
        w.u16(v);
    });

    w.u32(slice_parsing_fields)
        .u8(sps.log2_max_pic_order_cnt_lsb_minus4)
        .u8(sps.num_short_term_ref_pic_sets)
        .u8(sps.num_long_term_ref_pics_sps)
        .u8(pps.num_ref_idx_l0_default_active_minus1)
        .u8(pps.num_ref_idx_l1_default_active_minus1)
        .i8(pps.beta_offset_div2)
        .i8(pps.tc_offset_div2)
        .u8(pps.num_extra_slice_header_bits)
        .u32(params.st_rps_bits)
        .reserved(VA_PADDING_MEDIUM);

    w.finish("VAPictureParameterBufferHEVC", 4, PICTURE_PARAMETER_SIZE)
}

fn build_iq_matrix(params: &PictureParams) -> PackResult<Option<Vec<u8>>> {
    if !params.sps.scaling_list_enabled_flag {
        return Ok(None);
    }

    let lists = params
        .pps
        .scaling_lists
        .as_ref()
        .or(params.sps.scaling_lists.as_ref())
        .cloned()
        .unwrap_or_else(default_scaling_lists);

    let mut w = LayoutWriter::new();
    lists.lists_4x4.iter().for_each(|l| {
        w.bytes(l);
    });
    lists.lists_8x8.iter().for_each(|l| {
        w.bytes(l);
    });
    lists.lists_16x16.iter().for_each(|l| {
        w.bytes(l);
    });
    lists.lists_32x32.iter().for_each(|l| {
        w.bytes(l);
    });
    w.bytes(&lists.dc_16x16)
        .bytes(&lists.dc_32x32)
        .reserved(VA_PADDING_LOW);

    w.finish("VAIQMatrixBufferHEVC", 4, IQ_MATRIX_SIZE).map(Some)
}

/// Maps the picture order counts of a reference list to indices into `ReferenceFrames`.
fn ref_pic_list(refs: &[&RefPicture], list: &[i32]) -> PackResult<[u8; MAX_REFERENCE_FRAMES]> {
    if list.len() > MAX_REFERENCE_FRAMES {
        return Err(PackError::TooManyReferences {
            count: list.len(),
            max: MAX_REFERENCE_FRAMES,
        });
    }

    let mut indices = [0xff; MAX_REFERENCE_FRAMES];
    for (index, poc) in indices.iter_mut().zip(list) {
        if let Some(pos) = refs.iter().position(|r| r.poc == *poc) {
            *index = pos as u8;
        }
    }

    Ok(indices)
}

fn write_weights(
    w: &mut LayoutWriter,
    table: Option<(&[i8], &[i8], &[[i8; 2]], &[[i8; 2]])>,
) {
    let (luma_weight, luma_offset, chroma_weight, chroma_offset) =
        table.unwrap_or((&[], &[], &[], &[]));

    let flatten = |values: &[[i8; 2]]| values.iter().flatten().copied().collect::<Vec<_>>();

    write_padded(luma_weight, MAX_REFERENCE_FRAMES, 0, |v| {
        w.i8(v);
    });
    write_padded(luma_offset, MAX_REFERENCE_FRAMES, 0, |v| {
        w.i8(v);
    });
    write_padded(&flatten(chroma_weight), 2 * MAX_REFERENCE_FRAMES, 0, |v| {
        w.i8(v);
    });
    write_padded(&flatten(chroma_offset), 2 * MAX_REFERENCE_FRAMES, 0, |v| {
        w.i8(v);
    });
}

fn build_slice_param(
    frame: &FrameContext,
    params: &PictureParams,
    index: usize,
    hdr: &SliceHeader,
    chunk: &SliceChunk,
) -> PackResult<Vec<u8>> {
    let refs = reference_frames(frame)?;
    let list0 = ref_pic_list(&refs, &hdr.ref_pic_list0)?;
    let list1 = ref_pic_list(&refs, &hdr.ref_pic_list1)?;

    let slice_data_byte_offset = if chunk.is_first() {
        hdr.header_size + START_CODE.len() as u32
    } else {
        0
    };

    let last_slice_of_pic = index + 1 == frame.slices.len() && chunk.is_last();

    let long_slice_flags = BitField::new()
        .flag(last_slice_of_pic)
        .flag(hdr.dependent_slice_segment_flag)
        .push("slice_type", hdr.slice_type as u32, 2)?
        .push("colour_plane_id", u32::from(hdr.colour_plane_id), 2)?
        .flag(hdr.sao_luma_flag)
        .flag(hdr.sao_chroma_flag)
        .flag(hdr.mvd_l1_zero_flag)
        .flag(hdr.cabac_init_flag)
        .flag(hdr.temporal_mvp_enabled_flag)
        .flag(hdr.deblocking_filter_disabled_flag)
        .flag(hdr.collocated_from_l0_flag)
        .flag(hdr.loop_filter_across_slices_enabled_flag)
        .bits();

    let collocated_ref_idx = match hdr.slice_type {
        SliceType::I => 0xff,
        _ => hdr.collocated_ref_idx,
    };

    let five_minus_max_num_merge_cand = 5u8.checked_sub(hdr.max_num_merge_cand).ok_or(
        PackError::FieldOutOfRange {
            field: "max_num_merge_cand",
            value: i64::from(hdr.max_num_merge_cand),
        },
    )?;

    let pps = &params.pps;
    let table = hdr.pred_weight_table.as_ref().filter(|_| {
        (pps.weighted_pred_flag && matches!(hdr.slice_type, SliceType::P))
            || (pps.weighted_bipred_flag && matches!(hdr.slice_type, SliceType::B))
    });
    let default = PredWeightTable::default();
    let denoms = table.unwrap_or(&default);

    let mut w = LayoutWriter::new();
    w.u32(narrow("slice_data_size", chunk.size as i64)?)
        .u32(narrow("slice_data_offset", chunk.buffer_offset as i64)?)
        .u32(chunk.flag)
        .u32(slice_data_byte_offset)
        .u32(hdr.segment_address)
        .bytes(&list0)
        .bytes(&list1)
        .u32(long_slice_flags)
        .u8(collocated_ref_idx)
        .u8(hdr.num_ref_idx_l0_active_minus1)
        .u8(hdr.num_ref_idx_l1_active_minus1)
        .i8(hdr.qp_delta)
        .i8(hdr.cb_qp_offset)
        .i8(hdr.cr_qp_offset)
        .i8(hdr.beta_offset_div2)
        .i8(hdr.tc_offset_div2)
        .u8(denoms.luma_log2_weight_denom)
        .i8(denoms.delta_chroma_log2_weight_denom);

    write_weights(
        &mut w,
        table.map(|t| {
            (
                &t.delta_luma_weight_l0[..],
                &t.luma_offset_l0[..],
                &t.delta_chroma_weight_l0[..],
                &t.chroma_offset_l0[..],
            )
        }),
    );
    write_weights(
        &mut w,
        table
            .filter(|_| matches!(hdr.slice_type, SliceType::B))
            .map(|t| {
                (
                    &t.delta_luma_weight_l1[..],
                    &t.luma_offset_l1[..],
                    &t.delta_chroma_weight_l1[..],
                    &t.chroma_offset_l1[..],
                )
            }),
    );

    w.u8(five_minus_max_num_merge_cand)
        .u16(hdr.num_entry_point_offsets)
        // entry_offset_to_subset_array
        .u16(0)
        .u16(hdr.num_emulation_prevention_bytes)
        .reserved(VA_PADDING_LOW - 2);

    w.finish("VASliceParameterBufferHEVC", 4, SLICE_PARAMETER_SIZE)
}

fn picture_params(frame: &FrameContext) -> PackResult<&PictureParams> {
    match &frame.picture.params {
        CodecPictureParams::H265(params) => Ok(params),
        other => Err(PackError::CodecMismatch(other.codec(), Codec::H265)),
    }
}

fn slice_header(frame: &FrameContext, index: usize) -> PackResult<&SliceHeader> {
    match &frame.slices[index].header {
        SliceSyntax::H265(hdr) => Ok(hdr),
        SliceSyntax::H264(_) => Err(PackError::CodecMismatch(Codec::H264, Codec::H265)),
        SliceSyntax::Vc1(_) => Err(PackError::CodecMismatch(Codec::Vc1, Codec::H265)),
    }
}

pub struct H265Packer {
    base: PackerBase,
}

impl H265Packer {
    pub fn new(caps: PackerCaps) -> Self {
        Self {
            base: PackerBase::new(caps),
        }
    }
}

impl Packer for H265Packer {
    fn codec(&self) -> Codec {
        Codec::H265
    }

    fn pack_picture_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        let bytes = build_pic_param(accel, frame, picture_params(frame)?)?;
        PackerBase::fill(accel, BufferType::PictureParameter, &bytes)?;
        self.base.pack_priority(accel)
    }

    fn pack_quantization_matrices(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        match build_iq_matrix(picture_params(frame)?)? {
            Some(bytes) => PackerBase::fill(accel, BufferType::IqMatrix, &bytes),
            None => Ok(()),
        }
    }

    fn pack_slice_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
        index: usize,
        consumed: &mut usize,
        writer: &mut SliceDataWriter,
    ) -> PackResult<Continuation> {
        let params = picture_params(frame)?;
        let hdr = slice_header(frame, index)?;
        let payload = &frame.slices[index].payload;

        if hdr.header_size as usize > payload.len() {
            return Ok(Continuation::Skip);
        }

        let Some(chunk) = writer.write(accel, index, &START_CODE, payload, consumed)? else {
            return Ok(Continuation::NeedsMoreBuffer);
        };

        let bytes = self.base.slice_parameter(&chunk, || {
            build_slice_param(frame, params, index, hdr, &chunk)
        })?;
        self.base.push_slice_parameter(accel, frame, &bytes)?;

        Ok(chunk.continuation())
    }

    fn pack_processing_info(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        self.base.pack_processing_info(accel, frame)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use byteorder::ByteOrder;
    use byteorder::LittleEndian;

    use super::*;
    use crate::backend::dummy::RecordingAccelerator;
    use crate::codec::h265::Pps;
    use crate::codec::h265::Sps;
    use crate::decoder::PictureHeader;
    use crate::decoder::Slice;
    use crate::memory::FrameAllocator;
    use crate::memory::FrameInfo;
    use crate::memory::SlotTable;
    use crate::packer::FrameSubmission;

    fn params() -> PictureParams {
        PictureParams {
            sps: Arc::new(Sps {
                pic_width_in_luma_samples: 320,
                pic_height_in_luma_samples: 240,
                max_dec_pic_buffering_minus1: 4,
                max_num_reorder_pics: 2,
                ..Default::default()
            }),
            pps: Arc::new(Pps::default()),
            pic_order_cnt: 8,
            rps: RefPicSet {
                st_curr_before: vec![4],
                st_curr_after: vec![12],
                lt_curr: vec![0],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn reference(table: &SlotTable, poc: i32, reference: Reference) -> RefPicture {
        RefPicture {
            mem: table.alloc(&FrameInfo::default()).unwrap(),
            poc,
            frame_num: 0,
            long_term_frame_idx: 0,
            reference,
            field: Field::Frame,
        }
    }

    fn context(table: &SlotTable, slice: SliceHeader, payload: Vec<u8>) -> FrameContext {
        let picture = Arc::new(PictureHeader::new(CodecPictureParams::H265(params()), 8));
        FrameContext {
            target: table.alloc(&FrameInfo::default()).unwrap(),
            slices: vec![Slice::new(
                picture.clone(),
                SliceSyntax::H265(slice),
                payload,
            )],
            picture,
            refs: vec![
                reference(table, 0, Reference::LongTerm),
                reference(table, 4, Reference::ShortTerm),
                reference(table, 12, Reference::ShortTerm),
            ],
        }
    }

    #[test]
    fn diagonal_scan() {
        assert_eq!(&DIAGONAL_8X8[..6], &[0, 8, 1, 16, 9, 2]);
        assert_eq!(DIAGONAL_8X8[63], 63);

        // First entries of Table 7-6.
        assert_eq!(
            &DEFAULT_INTRA[..16],
            &[16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18]
        );
        assert_eq!(DEFAULT_INTRA[63], 115);
        assert_eq!(DEFAULT_INTER[63], 91);
    }

    #[test]
    fn picture_parameters() {
        let table = SlotTable::new(8);
        let accel = Accelerator::new(Box::new(RecordingAccelerator::new()));
        let frame = context(&table, Default::default(), vec![0; 16]);

        let bytes = build_pic_param(&accel, &frame, picture_params(&frame).unwrap()).unwrap();
        assert_eq!(bytes.len(), PICTURE_PARAMETER_SIZE);
        assert_eq!(LittleEndian::read_i32(&bytes[4..]), 8);

        let flags = |i: usize| LittleEndian::read_u32(&bytes[28 + i * PICTURE_HEVC_SIZE + 8..]);
        assert_eq!(
            flags(0),
            VA_PICTURE_HEVC_LONG_TERM_REFERENCE | VA_PICTURE_HEVC_RPS_LT_CURR
        );
        assert_eq!(flags(1), VA_PICTURE_HEVC_RPS_ST_CURR_BEFORE);
        assert_eq!(flags(2), VA_PICTURE_HEVC_RPS_ST_CURR_AFTER);
        assert_eq!(flags(3), VA_PICTURE_HEVC_INVALID);
        assert_eq!(
            LittleEndian::read_u32(&bytes[28 + 14 * PICTURE_HEVC_SIZE..]),
            VA_INVALID_SURFACE
        );

        assert_eq!(LittleEndian::read_u16(&bytes[448..]), 320);
        assert_eq!(LittleEndian::read_u16(&bytes[450..]), 240);
        // chroma_format_idc 1, NoPicReorderingFlag clear.
        assert_eq!(LittleEndian::read_u32(&bytes[452..]), 1);
        assert_eq!(bytes[456], 4);
    }

    #[test]
    fn slice_parameters() {
        let table = SlotTable::new(8);
        let recorder = RecordingAccelerator::new();
        let mut accel = Accelerator::new(Box::new(recorder.clone()));

        let hdr = SliceHeader {
            slice_type: SliceType::B,
            ref_pic_list0: vec![4, 0],
            ref_pic_list1: vec![12, 7],
            collocated_ref_idx: 1,
            max_num_merge_cand: 3,
            header_size: 5,
            ..Default::default()
        };
        let frame = context(&table, hdr, vec![0x26, 0x01, 2, 3, 4, 5, 6]);
        let mut packer = H265Packer::new(PackerCaps::new(Codec::H265));
        FrameSubmission::new(frame, 4096)
            .run(&mut accel, &mut packer)
            .unwrap();

        let submission = &recorder.submissions()[0];
        let params = &submission.buffer(BufferType::SliceParameter).unwrap().data;
        assert_eq!(params.len(), SLICE_PARAMETER_SIZE);

        // The start code counts in the size and the header offset.
        assert_eq!(LittleEndian::read_u32(&params[0..]), 10);
        assert_eq!(LittleEndian::read_u32(&params[12..]), 8);

        assert_eq!(&params[20..23], &[1, 0, 0xff]);
        assert_eq!(&params[35..38], &[2, 0xff, 0xff]);

        let long_slice_flags = LittleEndian::read_u32(&params[52..]);
        assert_eq!(long_slice_flags & 1, 1);
        assert_eq!((long_slice_flags >> 2) & 3, SliceType::B as u32);

        assert_eq!(params[56], 1);
        assert_eq!(params[246], 2);

        let data = &submission.buffer(BufferType::SliceData).unwrap().data;
        assert_eq!(&data[..5], &[0, 0, 1, 0x26, 0x01]);
        assert!(submission.buffer(BufferType::IqMatrix).is_none());
    }

    #[test]
    fn intra_slices_have_no_collocated_picture() {
        let table = SlotTable::new(8);
        let hdr = SliceHeader {
            collocated_ref_idx: 2,
            max_num_merge_cand: 5,
            ..Default::default()
        };
        let frame = context(&table, hdr.clone(), vec![0; 4]);
        let chunk = SliceChunk {
            slice: 0,
            source_offset: 0,
            prefix_len: 3,
            buffer_offset: 0,
            size: 7,
            flag: crate::packer::VA_SLICE_DATA_FLAG_ALL,
        };

        let bytes =
            build_slice_param(&frame, picture_params(&frame).unwrap(), 0, &hdr, &chunk).unwrap();
        assert_eq!(bytes[56], 0xff);
        assert_eq!(bytes[246], 0);
    }

    #[test]
    fn default_scaling_lists_when_enabled() {
        let mut params = params();
        assert!(build_iq_matrix(&params).unwrap().is_none());

        Arc::make_mut(&mut params.sps).scaling_list_enabled_flag = true;
        let bytes = build_iq_matrix(&params).unwrap().unwrap();
        assert_eq!(bytes.len(), IQ_MATRIX_SIZE);
        assert!(bytes[..96].iter().all(|b| *b == 16));
        assert_eq!(&bytes[96..160], &DEFAULT_INTRA);
        assert_eq!(&bytes[96 + 3 * 64..96 + 4 * 64], &DEFAULT_INTER);
        assert_eq!(&bytes[992..1000], &[16; 8]);
    }
}
