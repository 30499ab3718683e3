// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 command buffers.

use crate::accel::Accelerator;
use crate::accel::BufferType;
use crate::accel::SurfaceId;
use crate::accel::VA_INVALID_ID;
use crate::codec::h264::Level;
use crate::codec::h264::PictureParams;
use crate::codec::h264::Pps;
use crate::codec::h264::PredWeightTable;
use crate::codec::h264::ScalingList;
use crate::codec::h264::ScalingMatrix;
use crate::codec::h264::SliceHeader;
use crate::codec::h264::SliceType;
use crate::codec::h264::Sps;
use crate::codec::PictureParams as CodecPictureParams;
use crate::codec::SliceSyntax;
use crate::dpb::marking::MarkingCommand;
use crate::dpb::marking::ReferenceMarking;
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
use crate::ChromaFormat;
use crate::Codec;

pub const VA_PICTURE_H264_INVALID: u32 = 0x01;
pub const VA_PICTURE_H264_TOP_FIELD: u32 = 0x02;
pub const VA_PICTURE_H264_BOTTOM_FIELD: u32 = 0x04;
pub const VA_PICTURE_H264_SHORT_TERM_REFERENCE: u32 = 0x08;
pub const VA_PICTURE_H264_LONG_TERM_REFERENCE: u32 = 0x10;

pub const PICTURE_H264_SIZE: usize = 36;
pub const PICTURE_PARAMETER_SIZE: usize = 672;
pub const SLICE_PARAMETER_SIZE: usize = 3128;
pub const IQ_MATRIX_SIZE: usize = 240;

/// Reference frames of `VAPictureParameterBufferH264`.
pub const MAX_REFERENCE_FRAMES: usize = 16;
/// Entries of each `RefPicList` of `VASliceParameterBufferH264`.
pub const MAX_REF_PIC_LIST: usize = 32;

const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

fn get_raster_from_zigzag<const N: usize>(src: &[u8; N], zigzag: &[usize; N]) -> [u8; N] {
    let mut dst = [0; N];
    for i in 0..N {
        dst[zigzag[i]] = src[i];
    }
    dst
}

/// `VAPictureH264`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaPictureH264 {
    pub picture_id: SurfaceId,
    pub frame_idx: u32,
    pub flags: u32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

impl VaPictureH264 {
    /// Filler for the unused entries of the reference arrays.
    pub fn invalid() -> Self {
        Self {
            picture_id: VA_INVALID_ID,
            frame_idx: 0,
            flags: VA_PICTURE_H264_INVALID,
            top_field_order_cnt: 0,
            bottom_field_order_cnt: 0,
        }
    }

    fn write(&self, w: &mut LayoutWriter) {
        w.u32(self.picture_id)
            .u32(self.frame_idx)
            .u32(self.flags)
            .i32(self.top_field_order_cnt)
            .i32(self.bottom_field_order_cnt)
            .reserved(VA_PADDING_LOW);
    }
}

fn fill_va_h264_pic(pic: &RefPicture, surface: SurfaceId) -> PackResult<VaPictureH264> {
    let mut flags = 0;
    let frame_idx = match pic.reference {
        Reference::LongTerm => {
            flags |= VA_PICTURE_H264_LONG_TERM_REFERENCE;
            pic.long_term_frame_idx
        }
        Reference::ShortTerm => {
            flags |= VA_PICTURE_H264_SHORT_TERM_REFERENCE;
            pic.frame_num
        }
        Reference::None => pic.frame_num,
    };

    let (top_field_order_cnt, bottom_field_order_cnt) = match pic.field {
        Field::Frame => (pic.poc, pic.poc),
        Field::Top => {
            flags |= VA_PICTURE_H264_TOP_FIELD;
            (pic.poc, 0)
        }
        Field::Bottom => {
            flags |= VA_PICTURE_H264_BOTTOM_FIELD;
            (0, pic.poc)
        }
    };

    Ok(VaPictureH264 {
        picture_id: surface,
        frame_idx: narrow("frame_idx", frame_idx)?,
        flags,
        top_field_order_cnt,
        bottom_field_order_cnt,
    })
}

/// Long term frame index the current picture is stored under, if its marking makes it one.
fn current_long_term_frame_idx(marking: &ReferenceMarking) -> Option<i32> {
    match marking {
        ReferenceMarking::Idr {
            long_term: true, ..
        } => Some(0),
        ReferenceMarking::Adaptive(commands) => commands.iter().find_map(|c| match c {
            MarkingCommand::CurrentToLongTerm {
                long_term_frame_idx,
            } => Some(*long_term_frame_idx),
            _ => None,
        }),
        _ => None,
    }
}

fn current_va_pic(
    accel: &Accelerator,
    frame: &FrameContext,
    params: &PictureParams,
) -> PackResult<VaPictureH264> {
    let mut flags = 0;

    let frame_idx = match current_long_term_frame_idx(&frame.picture.marking) {
        Some(idx) => {
            flags |= VA_PICTURE_H264_LONG_TERM_REFERENCE;
            narrow("long_term_frame_idx", idx)?
        }
        None => {
            if params.nal_ref_idc != 0 {
                flags |= VA_PICTURE_H264_SHORT_TERM_REFERENCE;
            }
            u32::from(params.frame_num)
        }
    };

    let (top_field_order_cnt, bottom_field_order_cnt) = match frame.picture.field {
        Field::Frame => (params.top_field_order_cnt, params.bottom_field_order_cnt),
        Field::Top => {
            flags |= VA_PICTURE_H264_TOP_FIELD;
            (params.top_field_order_cnt, 0)
        }
        Field::Bottom => {
            flags |= VA_PICTURE_H264_BOTTOM_FIELD;
            (0, params.bottom_field_order_cnt)
        }
    };

    Ok(VaPictureH264 {
        picture_id: accel.surface_id(frame.target)?,
        frame_idx,
        flags,
        top_field_order_cnt,
        bottom_field_order_cnt,
    })
}

/// Short term references then long term ones, the second field of a pair left out.
fn reference_frames(accel: &Accelerator, frame: &FrameContext) -> PackResult<Vec<VaPictureH264>> {
    let short_term = frame
        .refs
        .iter()
        .filter(|r| matches!(r.reference, Reference::ShortTerm));
    let long_term = frame
        .refs
        .iter()
        .filter(|r| matches!(r.reference, Reference::LongTerm));

    let mut seen = Vec::new();
    let mut va_refs = Vec::new();

    for pic in short_term.chain(long_term) {
        if seen.contains(&pic.mem) {
            continue;
        }
        seen.push(pic.mem);
        va_refs.push(fill_va_h264_pic(pic, accel.surface_id(pic.mem)?)?);
    }

    if va_refs.len() > MAX_REFERENCE_FRAMES {
        return Err(PackError::TooManyReferences {
            count: va_refs.len(),
            max: MAX_REFERENCE_FRAMES,
        });
    }

    Ok(va_refs)
}

fn build_pic_param(
    accel: &Accelerator,
    frame: &FrameContext,
    params: &PictureParams,
) -> PackResult<Vec<u8>> {
    let sps: &Sps = &params.sps;
    let pps: &Pps = &params.pps;

    let curr_pic = current_va_pic(accel, frame, params)?;
    let va_refs = reference_frames(accel, frame)?;

    let interlaced = !sps.frame_mbs_only_flag as u32;
    let picture_height_in_mbs_minus1 = ((sps.pic_height_in_map_units_minus1 + 1) << interlaced) - 1;

    let seq_fields = BitField::new()
        .push("chroma_format_idc", sps.chroma_format.idc(), 2)?
        .flag(sps.separate_colour_plane_flag)
        .flag(sps.gaps_in_frame_num_value_allowed_flag)
        .flag(sps.frame_mbs_only_flag)
        .flag(sps.mb_adaptive_frame_field_flag)
        .flag(sps.direct_8x8_inference_flag)
        // MinLumaBiPredSize8x8
        .flag(sps.level_idc >= Level::L3_1)
        .push(
            "log2_max_frame_num_minus4",
            u32::from(sps.log2_max_frame_num_minus4),
            4,
        )?
        .push("pic_order_cnt_type", u32::from(sps.pic_order_cnt_type), 2)?
        .push(
            "log2_max_pic_order_cnt_lsb_minus4",
            u32::from(sps.log2_max_pic_order_cnt_lsb_minus4),
            4,
        )?
        .flag(sps.delta_pic_order_always_zero_flag)
        .bits();

    let pic_fields = BitField::new()
        .flag(pps.entropy_coding_mode_flag)
        .flag(pps.weighted_pred_flag)
        .push("weighted_bipred_idc", u32::from(pps.weighted_bipred_idc), 2)?
        .flag(pps.transform_8x8_mode_flag)
        .flag(params.field_pic_flag)
        .flag(pps.constrained_intra_pred_flag)
        .flag(pps.bottom_field_pic_order_in_frame_present_flag)
        .flag(pps.deblocking_filter_control_present_flag)
        .flag(pps.redundant_pic_cnt_present_flag)
        .flag(params.nal_ref_idc != 0)
        .bits();

    let mut w = LayoutWriter::new();
    curr_pic.write(&mut w);
    for i in 0..MAX_REFERENCE_FRAMES {
        va_refs
            .get(i)
            .copied()
            .unwrap_or_else(VaPictureH264::invalid)
            .write(&mut w);
    }

    w.u16(narrow("picture_width_in_mbs_minus1", sps.pic_width_in_mbs_minus1)?)
        .u16(narrow(
            "picture_height_in_mbs_minus1",
            picture_height_in_mbs_minus1,
        )?)
        .u8(sps.bit_depth_luma_minus8)
        .u8(sps.bit_depth_chroma_minus8)
        .u8(narrow("num_ref_frames", sps.max_num_ref_frames)?)
        .u32(seq_fields)
        .u8(narrow("num_slice_groups_minus1", pps.num_slice_groups_minus1)?)
        // slice_group_map_type
        .u8(0)
        // slice_group_change_rate_minus1
        .u16(0)
        .i8(pps.pic_init_qp_minus26)
        .i8(pps.pic_init_qs_minus26)
        .i8(pps.chroma_qp_index_offset)
        .i8(pps.second_chroma_qp_index_offset)
        .u32(pic_fields)
        .u16(params.frame_num)
        .reserved(VA_PADDING_MEDIUM);

    w.finish("VAPictureParameterBufferH264", 4, PICTURE_PARAMETER_SIZE)
}

/// Scaling lists in zig-zag order, before conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScalingLists {
    lists_4x4: [[u8; 16]; 6],
    lists_8x8: [[u8; 64]; 2],
}

impl ScalingLists {
    fn flat() -> Self {
        Self {
            lists_4x4: [[16; 16]; 6],
            lists_8x8: [[16; 64]; 2],
        }
    }

    /// Applies Table 7-2: fall-back rule A without `fallback`, rule B with it.
    fn resolve(matrix: &ScalingMatrix, fallback: Option<&ScalingLists>) -> Self {
        let mut lists = Self::flat();

        for i in 0..6 {
            let default = if i < 3 {
                DEFAULT_4X4_INTRA
            } else {
                DEFAULT_4X4_INTER
            };

            lists.lists_4x4[i] = match matrix.lists_4x4[i] {
                ScalingList::Explicit(list) => list,
                ScalingList::UseDefault => default,
                ScalingList::NotPresent => match (i, fallback) {
                    (0 | 3, Some(fallback)) => fallback.lists_4x4[i],
                    (0 | 3, None) => default,
                    _ => lists.lists_4x4[i - 1],
                },
            };
        }

        for i in 0..2 {
            let default = if i == 0 {
                DEFAULT_8X8_INTRA
            } else {
                DEFAULT_8X8_INTER
            };

            lists.lists_8x8[i] = match matrix.lists_8x8[i] {
                ScalingList::Explicit(list) => list,
                ScalingList::UseDefault => default,
                ScalingList::NotPresent => fallback.map_or(default, |f| f.lists_8x8[i]),
            };
        }

        lists
    }

    /// Lists in effect for the picture: the PPS ones over the SPS ones over flat ones.
    fn for_picture(sps: &Sps, pps: &Pps) -> Self {
        let sps_lists = sps
            .scaling_matrix
            .as_ref()
            .map(|matrix| Self::resolve(matrix, None));

        match (&pps.scaling_matrix, sps_lists) {
            (Some(matrix), sps_lists) => Self::resolve(matrix, sps_lists.as_ref()),
            (None, Some(sps_lists)) => sps_lists,
            (None, None) => Self::flat(),
        }
    }
}

fn build_iq_matrix(params: &PictureParams) -> PackResult<Vec<u8>> {
    let lists = ScalingLists::for_picture(&params.sps, &params.pps);

    let mut w = LayoutWriter::new();
    for list in &lists.lists_4x4 {
        w.bytes(&get_raster_from_zigzag(list, &ZIGZAG_4X4));
    }
    for list in &lists.lists_8x8 {
        w.bytes(&get_raster_from_zigzag(list, &ZIGZAG_8X8));
    }
    w.reserved(VA_PADDING_LOW);

    w.finish("VAIQMatrixBufferH264", 4, IQ_MATRIX_SIZE)
}

fn write_ref_pic_list(
    w: &mut LayoutWriter,
    accel: &Accelerator,
    frame: &FrameContext,
    list: &[i32],
) -> PackResult<()> {
    if list.len() > MAX_REF_PIC_LIST {
        return Err(PackError::TooManyReferences {
            count: list.len(),
            max: MAX_REF_PIC_LIST,
        });
    }

    for i in 0..MAX_REF_PIC_LIST {
        let pic = match list.get(i).and_then(|poc| frame.ref_by_poc(*poc)) {
            Some(pic) => fill_va_h264_pic(pic, accel.surface_id(pic.mem)?)?,
            None => VaPictureH264::invalid(),
        };
        pic.write(w);
    }

    Ok(())
}

fn write_padded_i16(w: &mut LayoutWriter, values: &[i16], len: usize) {
    w.i16s(&values[..std::cmp::min(values.len(), len)]);
    (values.len()..len).for_each(|_| {
        w.i16(0);
    });
}

/// Writes the weights of one list, or zeros if `table` is `None`.
fn write_weights(
    w: &mut LayoutWriter,
    table: Option<(&[i16], &[i16], &[[i16; 2]], &[[i16; 2]])>,
    chroma: bool,
) -> PackResult<()> {
    let (luma_weight, luma_offset, chroma_weight, chroma_offset) =
        table.unwrap_or((&[], &[], &[], &[]));

    if luma_weight.len() > MAX_REF_PIC_LIST || chroma_weight.len() > MAX_REF_PIC_LIST {
        return Err(PackError::TooManyReferences {
            count: std::cmp::max(luma_weight.len(), chroma_weight.len()),
            max: MAX_REF_PIC_LIST,
        });
    }

    w.u8(table.is_some() as u8);
    write_padded_i16(w, luma_weight, MAX_REF_PIC_LIST);
    write_padded_i16(w, luma_offset, MAX_REF_PIC_LIST);

    let flatten = |values: &[[i16; 2]]| values.iter().flatten().copied().collect::<Vec<_>>();
    w.u8((table.is_some() && chroma) as u8);
    write_padded_i16(w, &flatten(chroma_weight), 2 * MAX_REF_PIC_LIST);
    write_padded_i16(w, &flatten(chroma_offset), 2 * MAX_REF_PIC_LIST);

    Ok(())
}

fn has_weight_table(pps: &Pps, hdr: &SliceHeader) -> bool {
    (pps.weighted_pred_flag && matches!(hdr.slice_type, SliceType::P | SliceType::Sp))
        || (pps.weighted_bipred_idc == 1 && hdr.slice_type.is_b())
}

fn build_slice_param(
    accel: &Accelerator,
    frame: &FrameContext,
    params: &PictureParams,
    hdr: &SliceHeader,
    chunk: &SliceChunk,
) -> PackResult<Vec<u8>> {
    let slice_data_bit_offset = if chunk.is_first() {
        hdr.slice_data_bit_offset()
    } else {
        0
    };

    let mut w = LayoutWriter::new();
    w.u32(narrow("slice_data_size", chunk.size as i64)?)
        .u32(narrow("slice_data_offset", chunk.buffer_offset as i64)?)
        .u32(chunk.flag)
        .u16(narrow(
            "slice_data_bit_offset",
            slice_data_bit_offset as i64,
        )?)
        .u16(narrow("first_mb_in_slice", hdr.first_mb_in_slice)?)
        .u8(hdr.slice_type as u8)
        .u8(hdr.direct_spatial_mv_pred_flag as u8)
        .u8(hdr.num_ref_idx_l0_active_minus1)
        .u8(hdr.num_ref_idx_l1_active_minus1)
        .u8(hdr.cabac_init_idc)
        .i8(hdr.slice_qp_delta)
        .u8(hdr.disable_deblocking_filter_idc)
        .i8(hdr.slice_alpha_c0_offset_div2)
        .i8(hdr.slice_beta_offset_div2);

    write_ref_pic_list(&mut w, accel, frame, &hdr.ref_pic_list0)?;
    write_ref_pic_list(&mut w, accel, frame, &hdr.ref_pic_list1)?;

    let table = hdr
        .pred_weight_table
        .as_ref()
        .filter(|_| has_weight_table(&params.pps, hdr));
    let default = PredWeightTable::default();
    let denoms = table.unwrap_or(&default);
    let chroma = !matches!(params.sps.chroma_format, ChromaFormat::Monochrome);

    w.u8(denoms.luma_log2_weight_denom)
        .u8(denoms.chroma_log2_weight_denom);

    write_weights(
        &mut w,
        table.map(|t| {
            (
                &t.luma_weight_l0[..],
                &t.luma_offset_l0[..],
                &t.chroma_weight_l0[..],
                &t.chroma_offset_l0[..],
            )
        }),
        chroma,
    )?;
    write_weights(
        &mut w,
        table.filter(|_| hdr.slice_type.is_b()).map(|t| {
            (
                &t.luma_weight_l1[..],
                &t.luma_offset_l1[..],
                &t.chroma_weight_l1[..],
                &t.chroma_offset_l1[..],
            )
        }),
        chroma,
    )?;

    w.reserved(VA_PADDING_LOW);

    w.finish("VASliceParameterBufferH264", 4, SLICE_PARAMETER_SIZE)
}

fn picture_params(frame: &FrameContext) -> PackResult<&PictureParams> {
    match &frame.picture.params {
        CodecPictureParams::H264(params) => Ok(params),
        other => Err(PackError::CodecMismatch(other.codec(), Codec::H264)),
    }
}

fn slice_header(frame: &FrameContext, index: usize) -> PackResult<&SliceHeader> {
    match &frame.slices[index].header {
        SliceSyntax::H264(hdr) => Ok(hdr),
        SliceSyntax::H265(_) => Err(PackError::CodecMismatch(Codec::H265, Codec::H264)),
        SliceSyntax::Vc1(_) => Err(PackError::CodecMismatch(Codec::Vc1, Codec::H264)),
    }
}

pub struct H264Packer {
    base: PackerBase,
}

impl H264Packer {
    pub fn new(caps: PackerCaps) -> Self {
        Self {
            base: PackerBase::new(caps),
        }
    }
}

impl Packer for H264Packer {
    fn codec(&self) -> Codec {
        Codec::H264
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
        let bytes = build_iq_matrix(picture_params(frame)?)?;
        PackerBase::fill(accel, BufferType::IqMatrix, &bytes)
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

        if hdr.slice_data_bit_offset() / 8 > payload.len() {
            return Ok(Continuation::Skip);
        }

        let Some(chunk) = writer.write(accel, index, &[], payload, consumed)? else {
            return Ok(Continuation::NeedsMoreBuffer);
        };

        let bytes = self.base.slice_parameter(&chunk, || {
            build_slice_param(accel, frame, params, hdr, &chunk)
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
    use crate::codec::h264::Profile;
    use crate::decoder::PictureHeader;
    use crate::decoder::Slice;
    use crate::memory::FrameAllocator;
    use crate::memory::FrameInfo;
    use crate::memory::FrameMemId;
    use crate::memory::SlotTable;
    use crate::packer::FrameSubmission;
    use crate::packer::SliceMode;
    use crate::packer::VA_SLICE_DATA_FLAG_ALL;
    use crate::packer::VA_SLICE_DATA_FLAG_BEGIN;
    use crate::packer::VA_SLICE_DATA_FLAG_END;
    use crate::packer::VA_SLICE_DATA_FLAG_MIDDLE;

    fn params(level: Level) -> PictureParams {
        PictureParams {
            sps: Arc::new(Sps {
                profile_idc: Profile::High as u8,
                level_idc: level,
                pic_width_in_mbs_minus1: 19,
                pic_height_in_map_units_minus1: 14,
                frame_mbs_only_flag: true,
                max_num_ref_frames: 4,
                ..Default::default()
            }),
            pps: Default::default(),
            frame_num: 3,
            nal_ref_idc: 1,
            top_field_order_cnt: 6,
            bottom_field_order_cnt: 6,
            ..Default::default()
        }
    }

    fn reference(mem: FrameMemId, poc: i32, reference: Reference) -> RefPicture {
        RefPicture {
            mem,
            poc,
            frame_num: poc / 2,
            long_term_frame_idx: 1,
            reference,
            field: Field::Frame,
        }
    }

    fn context(
        table: &SlotTable,
        params: PictureParams,
        refs: Vec<RefPicture>,
        payloads: &[Vec<u8>],
    ) -> FrameContext {
        let picture = Arc::new(PictureHeader::new(CodecPictureParams::H264(params), 6));
        let slices = payloads
            .iter()
            .map(|p| {
                let hdr = SliceHeader {
                    header_bit_size: 16,
                    ref_pic_list0: refs.iter().map(|r| r.poc).collect(),
                    slice_type: SliceType::P,
                    ..Default::default()
                };
                Slice::new(picture.clone(), SliceSyntax::H264(hdr), p.clone())
            })
            .collect();

        FrameContext {
            target: table.alloc(&FrameInfo::default()).unwrap(),
            picture,
            slices,
            refs,
        }
    }

    #[test]
    fn picture_parameters() {
        let table = SlotTable::new(8);
        let short = table.alloc(&FrameInfo::default()).unwrap();
        let long = table.alloc(&FrameInfo::default()).unwrap();
        let accel = Accelerator::new(Box::new(RecordingAccelerator::new()));

        let frame = context(
            &table,
            params(Level::L4),
            vec![
                reference(long, 0, Reference::LongTerm),
                reference(short, 4, Reference::ShortTerm),
            ],
            &[vec![0; 8]],
        );

        let bytes = build_pic_param(&accel, &frame, picture_params(&frame).unwrap()).unwrap();
        assert_eq!(bytes.len(), PICTURE_PARAMETER_SIZE);

        // CurrPic
        assert_eq!(LittleEndian::read_u32(&bytes[0..]), frame.target.index() as u32);
        assert_eq!(LittleEndian::read_u32(&bytes[4..]), 3);
        assert_eq!(
            LittleEndian::read_u32(&bytes[8..]),
            VA_PICTURE_H264_SHORT_TERM_REFERENCE
        );

        // Short term references come first.
        let ref0 = 36;
        assert_eq!(LittleEndian::read_u32(&bytes[ref0..]), short.index() as u32);
        assert_eq!(
            LittleEndian::read_u32(&bytes[ref0 + 8..]),
            VA_PICTURE_H264_SHORT_TERM_REFERENCE
        );
        let ref1 = ref0 + PICTURE_H264_SIZE;
        assert_eq!(LittleEndian::read_u32(&bytes[ref1 + 4..]), 1);
        assert_eq!(
            LittleEndian::read_u32(&bytes[ref1 + 8..]),
            VA_PICTURE_H264_LONG_TERM_REFERENCE
        );
        let ref2 = ref1 + PICTURE_H264_SIZE;
        assert_eq!(LittleEndian::read_u32(&bytes[ref2..]), VA_INVALID_ID);
        assert_eq!(LittleEndian::read_u32(&bytes[ref2 + 8..]), VA_PICTURE_H264_INVALID);

        assert_eq!(LittleEndian::read_u16(&bytes[612..]), 19);
        assert_eq!(LittleEndian::read_u16(&bytes[614..]), 14);
        assert_eq!(bytes[618], 4);

        let seq_fields = LittleEndian::read_u32(&bytes[620..]);
        // chroma_format_idc 1, frame_mbs_only_flag and MinLumaBiPredSize8x8.
        assert_eq!(seq_fields, 1 | 1 << 4 | 1 << 7);

        let pic_fields = LittleEndian::read_u32(&bytes[632..]);
        assert_eq!(pic_fields, 1 << 10);
        assert_eq!(LittleEndian::read_u16(&bytes[636..]), 3);
    }

    #[test]
    fn low_levels_allow_small_bipred_blocks() {
        let table = SlotTable::new(2);
        let accel = Accelerator::new(Box::new(RecordingAccelerator::new()));
        let frame = context(&table, params(Level::L3), vec![], &[vec![0; 8]]);

        let bytes = build_pic_param(&accel, &frame, picture_params(&frame).unwrap()).unwrap();
        assert_eq!(LittleEndian::read_u32(&bytes[620..]) & 1 << 7, 0);
    }

    #[test]
    fn more_than_16_references() {
        let table = SlotTable::new(20);
        let accel = Accelerator::new(Box::new(RecordingAccelerator::new()));
        let refs = (0..17)
            .map(|i| {
                let mem = table.alloc(&FrameInfo::default()).unwrap();
                reference(mem, 2 * i, Reference::ShortTerm)
            })
            .collect();
        let frame = context(&table, params(Level::L4), refs, &[vec![0; 8]]);

        assert!(matches!(
            build_pic_param(&accel, &frame, picture_params(&frame).unwrap()),
            Err(PackError::TooManyReferences { count: 17, max: 16 })
        ));
    }

    #[test]
    fn flat_scaling_lists_without_matrix() {
        let bytes = build_iq_matrix(&params(Level::L4)).unwrap();
        assert_eq!(bytes.len(), IQ_MATRIX_SIZE);
        assert!(bytes[..224].iter().all(|b| *b == 16));
    }

    #[test]
    fn fall_back_rule_a() {
        let mut params = params(Level::L4);
        let mut matrix = ScalingMatrix::default();
        matrix.lists_4x4[2] = ScalingList::Explicit([1; 16]);
        Arc::make_mut(&mut params.sps).scaling_matrix = Some(matrix);

        let bytes = build_iq_matrix(&params).unwrap();

        // List 0 falls back to the default, list 1 to list 0, list 3 to the default again.
        let intra = get_raster_from_zigzag(&DEFAULT_4X4_INTRA, &ZIGZAG_4X4);
        assert_eq!(&bytes[0..16], &intra);
        assert_eq!(&bytes[16..32], &intra);
        assert_eq!(&bytes[32..48], &[1; 16]);
        assert_eq!(
            &bytes[48..64],
            &get_raster_from_zigzag(&DEFAULT_4X4_INTER, &ZIGZAG_4X4)
        );
        assert_eq!(bytes[96], 6);
    }

    #[test]
    fn zigzag_to_raster() {
        let src: [u8; 16] = core::array::from_fn(|i| i as u8);
        let raster = get_raster_from_zigzag(&src, &ZIGZAG_4X4);
        assert_eq!(raster, [0, 1, 5, 6, 2, 4, 7, 12, 3, 8, 11, 13, 9, 10, 14, 15]);
    }

    #[test]
    fn chopped_slice_data_is_reassembled() {
        let table = SlotTable::new(4);
        let recorder = RecordingAccelerator::new();
        recorder.set_max_buffer_size(BufferType::SliceData, 128);
        let mut accel = Accelerator::new(Box::new(recorder.clone()));

        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let frame = context(&table, params(Level::L4), vec![], &[payload.clone()]);
        let mut packer = H264Packer::new(PackerCaps::new(Codec::H264));

        let mut submission = FrameSubmission::new(frame, 1 << 20);
        submission.run(&mut accel, &mut packer).unwrap();
        assert!(submission.is_done());
        assert_eq!(submission.rounds(), 3);
        assert!(submission.rounds() <= submission.max_rounds());

        let submissions = recorder.submissions();
        assert_eq!(submissions.len(), 3);

        let mut data = Vec::new();
        let mut flags = Vec::new();
        for s in &submissions {
            let params = s.buffer(BufferType::SliceParameter).unwrap();
            assert_eq!(params.data.len(), SLICE_PARAMETER_SIZE);
            assert_eq!(params.num_elements, 1);
            let size = LittleEndian::read_u32(&params.data[0..]) as usize;
            flags.push(LittleEndian::read_u32(&params.data[8..]));

            let slice_data = s.buffer(BufferType::SliceData).unwrap();
            assert_eq!(slice_data.data.len() % 128, 0);
            data.extend_from_slice(&slice_data.data[..size]);

            // The picture parameters go with every round.
            assert!(s.buffer(BufferType::PictureParameter).is_some());
        }

        assert_eq!(
            flags,
            vec![
                VA_SLICE_DATA_FLAG_BEGIN,
                VA_SLICE_DATA_FLAG_MIDDLE,
                VA_SLICE_DATA_FLAG_END
            ]
        );
        assert_eq!(data, payload);
        assert_eq!(recorder.begin_count(), 1);
        assert_eq!(recorder.end_count(), 1);
    }

    #[test]
    fn slices_share_a_round() {
        let table = SlotTable::new(4);
        let recorder = RecordingAccelerator::new();
        let mut accel = Accelerator::new(Box::new(recorder.clone()));

        let frame = context(&table, params(Level::L4), vec![], &[vec![1; 10], vec![2; 20]]);
        let mut packer = H264Packer::new(PackerCaps::new(Codec::H264));
        FrameSubmission::new(frame, 4096)
            .run(&mut accel, &mut packer)
            .unwrap();

        let submissions = recorder.submissions();
        assert_eq!(submissions.len(), 1);
        let params = submissions[0].buffer(BufferType::SliceParameter).unwrap();
        assert_eq!(params.num_elements, 2);
        assert_eq!(params.data.len(), 2 * SLICE_PARAMETER_SIZE);

        let second = &params.data[SLICE_PARAMETER_SIZE..];
        assert_eq!(LittleEndian::read_u32(&second[0..]), 20);
        assert_eq!(LittleEndian::read_u32(&second[4..]), 10);
        assert_eq!(LittleEndian::read_u32(&second[8..]), VA_SLICE_DATA_FLAG_ALL);
        assert_eq!(LittleEndian::read_u16(&second[12..]), 16);
    }

    #[test]
    fn slice_with_header_past_payload_is_skipped() {
        let table = SlotTable::new(4);
        let recorder = RecordingAccelerator::new();
        let mut accel = Accelerator::new(Box::new(recorder.clone()));

        // 16 header bits do not fit in one byte.
        let frame = context(&table, params(Level::L4), vec![], &[vec![1; 1], vec![2; 20]]);
        let mut packer = H264Packer::new(PackerCaps::new(Codec::H264));
        let mut submission = FrameSubmission::new(frame, 4096);
        submission.run(&mut accel, &mut packer).unwrap();

        assert_eq!(submission.skipped_slices(), 1);
        let params = recorder.submissions()[0]
            .buffer(BufferType::SliceParameter)
            .unwrap()
            .clone();
        assert_eq!(params.num_elements, 1);
    }

    #[test]
    fn short_slice_mode_writes_base_parameters() {
        let table = SlotTable::new(4);
        let recorder = RecordingAccelerator::new();
        let mut accel = Accelerator::new(Box::new(recorder.clone()));

        let frame = context(&table, params(Level::L4), vec![], &[vec![1; 10]]);
        let mut caps = PackerCaps::new(Codec::H264);
        caps.slice_mode = SliceMode::Short;
        let mut packer = H264Packer::new(caps);
        FrameSubmission::new(frame, 4096)
            .run(&mut accel, &mut packer)
            .unwrap();

        let params = recorder.submissions()[0]
            .buffer(BufferType::SliceParameter)
            .unwrap()
            .clone();
        assert_eq!(params.data, vec![10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
