// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 command buffers.

use crate::accel::Accelerator;
use crate::accel::BufferType;
use crate::accel::VA_INVALID_SURFACE;
use crate::codec::vc1::FrameCodingMode;
use crate::codec::vc1::PictureParams;
use crate::codec::vc1::PictureType;
use crate::codec::vc1::SliceHeader;
use crate::codec::PictureParams as CodecPictureParams;
use crate::codec::SliceSyntax;
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
use crate::packer::SliceChunk;
use crate::packer::SliceDataWriter;
use crate::Codec;

pub const PICTURE_PARAMETER_SIZE: usize = 104;
pub const SLICE_PARAMETER_SIZE: usize = 36;

fn build_pic_param(
    accel: &Accelerator,
    frame: &FrameContext,
    params: &PictureParams,
) -> PackResult<Vec<u8>> {
    let seq = &params.sequence;
    let ep = &params.entry_point;
    let hdr = &params.header;

    // References come forward first, then backward.
    let (forward, backward) = match hdr.ptype {
        PictureType::I | PictureType::Bi => (None, None),
        PictureType::P | PictureType::Skipped => (frame.refs.first(), None),
        PictureType::B => (frame.refs.first(), frame.refs.get(1)),
    };
    let forward = accel.surface_id_or_invalid(forward.map(|r| r.mem));
    let backward = accel.surface_id_or_invalid(backward.map(|r| r.mem));

    // The accelerator has no skipped type, a skipped picture is an empty P picture.
    let picture_type = match hdr.ptype {
        PictureType::Skipped => PictureType::P,
        ptype => ptype,
    };

    let sequence_fields = BitField::new()
        .flag(seq.pulldown)
        .flag(seq.interlace)
        .flag(seq.tfcntrflag)
        .flag(seq.finterpflag)
        .flag(seq.psf)
        .flag(seq.multires)
        .flag(seq.overlap)
        .flag(seq.syncmarker)
        .flag(seq.rangered)
        .push("max_b_frames", u32::from(seq.max_b_frames), 3)?
        .push("profile", seq.profile as u32, 2)?
        .bits();

    let entrypoint_fields = BitField::new()
        .flag(ep.broken_link)
        .flag(ep.closed_entry)
        .flag(ep.panscan_flag)
        .flag(ep.loopfilter)
        .bits();

    let range_mapping_fields = BitField::new()
        .flag(ep.range_mapy.is_some())
        .push("range_mapy", u32::from(ep.range_mapy.unwrap_or(0)), 3)?
        .flag(ep.range_mapuv.is_some())
        .push("range_mapuv", u32::from(ep.range_mapuv.unwrap_or(0)), 3)?
        .bits();

    let picture_fields = BitField::new()
        .push("picture_type", picture_type as u32, 3)?
        .push("frame_coding_mode", hdr.fcm as u32, 3)?
        .flag(hdr.tff)
        .flag(hdr.is_first_field)
        .flag(hdr.intensity_compensation)
        .bits();

    let reference_fields = BitField::new()
        .flag(hdr.fcm == FrameCodingMode::FieldInterlace)
        .push("refdist", u32::from(hdr.refdist), 5)?
        .flag(hdr.numref)
        .flag(hdr.reffield)
        .bits();

    let mv_fields = BitField::new()
        .push("mvmode", u32::from(hdr.mvmode), 3)?
        .push("mvmode2", u32::from(hdr.mvmode2), 3)?
        .push("mvtab", u32::from(hdr.mvtab), 3)?
        .push("twomvbptab", u32::from(hdr.twomvbptab), 2)?
        .flag(hdr.fourmvswitch)
        .push("fourmvbptab", u32::from(hdr.fourmvbptab), 2)?
        .flag(ep.extended_mv)
        .push("mvrange", u32::from(hdr.mvrange), 2)?
        .flag(ep.extended_dmv)
        .push("dmvrange", u32::from(hdr.dmvrange), 2)?
        .bits();

    let pic_quantizer_fields = BitField::new()
        .push("dquant", u32::from(ep.dquant), 2)?
        .push("quantizer", u32::from(ep.quantizer), 2)?
        .flag(hdr.halfqp)
        .push("pquant", u32::from(hdr.pquant), 5)?
        .flag(hdr.pquantizer)
        .flag(hdr.dquantfrm)
        .push("dqprofile", u32::from(hdr.dqprofile), 2)?
        .push("dqsbedge", u32::from(hdr.dqsbedge), 2)?
        .push("dqdbedge", u32::from(hdr.dqdbedge), 2)?
        .flag(hdr.dqbilevel)
        .push("altpquant", u32::from(hdr.altpquant), 5)?
        .bits();

    let transform_fields = BitField::new()
        .flag(ep.vstransform)
        .flag(hdr.ttmbf)
        .push("ttfrm", u32::from(hdr.ttfrm), 2)?
        .push("transacfrm", u32::from(hdr.transacfrm), 2)?
        .push("transacfrm2", u32::from(hdr.transacfrm2), 2)?
        .flag(hdr.transdctab)
        .bits();

    let mut w = LayoutWriter::new();
    w.u32(forward)
        .u32(backward)
        // inloop_decoded_picture
        .u32(VA_INVALID_SURFACE)
        .u32(sequence_fields)
        .u16(seq.coded_width)
        .u16(seq.coded_height)
        .u32(entrypoint_fields)
        .u8(hdr.condover)
        .u8(ep.fastuvmc as u8)
        .u32(range_mapping_fields)
        .u8(hdr.bfraction)
        .u8(hdr.cbptab)
        .u8(hdr.mbmodetab)
        .u8(hdr.rangeredfrm as u8)
        .u8(hdr.rndctrl as u8)
        // post_processing
        .u8(0)
        .u8(hdr.respic)
        .u8(hdr.lumscale)
        .u8(hdr.lumshift)
        .u32(picture_fields)
        .u32(u32::from(hdr.raw_coding))
        .u32(u32::from(hdr.bitplane_present))
        .u32(reference_fields)
        .u32(mv_fields)
        .u32(pic_quantizer_fields)
        .u32(transform_fields)
        .u8(hdr.lumscale2)
        .u8(hdr.lumshift2)
        .u8(hdr.intcompfield)
        .reserved(VA_PADDING_MEDIUM - 1);

    w.finish("VAPictureParameterBufferVC1", 4, PICTURE_PARAMETER_SIZE)
}

fn build_slice_param(hdr: &SliceHeader, chunk: &SliceChunk) -> PackResult<Vec<u8>> {
    // Continuation chunks start in the middle of the macroblock data.
    let macroblock_offset = if chunk.is_first() {
        hdr.macroblock_offset
    } else {
        0
    };

    let mut w = LayoutWriter::new();
    w.u32(narrow("slice_data_size", chunk.size as i64)?)
        .u32(narrow("slice_data_offset", chunk.buffer_offset as i64)?)
        .u32(chunk.flag)
        .u32(macroblock_offset)
        .u32(hdr.slice_vertical_position)
        .reserved(VA_PADDING_LOW);

    w.finish("VASliceParameterBufferVC1", 4, SLICE_PARAMETER_SIZE)
}

fn picture_params(frame: &FrameContext) -> PackResult<&PictureParams> {
    match &frame.picture.params {
        CodecPictureParams::Vc1(params) => Ok(params),
        other => Err(PackError::CodecMismatch(other.codec(), Codec::Vc1)),
    }
}

fn slice_header(frame: &FrameContext, index: usize) -> PackResult<&SliceHeader> {
    match &frame.slices[index].header {
        SliceSyntax::Vc1(hdr) => Ok(hdr),
        SliceSyntax::H264(_) => Err(PackError::CodecMismatch(Codec::H264, Codec::Vc1)),
        SliceSyntax::H265(_) => Err(PackError::CodecMismatch(Codec::H265, Codec::Vc1)),
    }
}

pub struct Vc1Packer {
    base: PackerBase,
}

impl Vc1Packer {
    pub fn new(caps: PackerCaps) -> Self {
        Self {
            base: PackerBase::new(caps),
        }
    }
}

impl Packer for Vc1Packer {
    fn codec(&self) -> Codec {
        Codec::Vc1
    }

    fn pack_picture_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        let params = picture_params(frame)?;
        let bytes = build_pic_param(accel, frame, params)?;
        PackerBase::fill(accel, BufferType::PictureParameter, &bytes)?;

        if let Some(bitplanes) = &params.bitplanes {
            PackerBase::fill(accel, BufferType::BitPlane, bitplanes)?;
        }

        self.base.pack_priority(accel)
    }

    /// VC-1 has no quantization matrices.
    fn pack_quantization_matrices(
        &mut self,
        _accel: &mut Accelerator,
        _frame: &FrameContext,
    ) -> PackResult<()> {
        Ok(())
    }

    fn pack_slice_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
        index: usize,
        consumed: &mut usize,
        writer: &mut SliceDataWriter,
    ) -> PackResult<Continuation> {
        let hdr = slice_header(frame, index)?;
        let payload = &frame.slices[index].payload;

        if (hdr.macroblock_offset / 8) as usize > payload.len() {
            return Ok(Continuation::Skip);
        }

        let Some(chunk) = writer.write(accel, index, &[], payload, consumed)? else {
            return Ok(Continuation::NeedsMoreBuffer);
        };

        let bytes = self
            .base
            .slice_parameter(&chunk, || build_slice_param(hdr, &chunk))?;
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
