// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 syntax consumed by the decoding core.

use std::sync::Arc;

use bytes::Bytes;
use enumn::N;

use crate::codec::DpbCapacity;
use crate::Resolution;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    #[default]
    Simple = 0,
    Main = 1,
    Advanced = 3,
}

/// Picture type, with the values of the accelerator `picture_type` field.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PictureType {
    #[default]
    I = 0,
    P = 1,
    B = 2,
    Bi = 3,
    /// A P picture without coded data, a repeat of its reference.
    Skipped = 4,
}

impl PictureType {
    pub fn is_reference(self) -> bool {
        matches!(self, PictureType::I | PictureType::P | PictureType::Skipped)
    }
}

/// Frame coding mode (FCM).
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCodingMode {
    #[default]
    Progressive = 0,
    FrameInterlace = 1,
    FieldInterlace = 2,
}

/// Sequence header, including the fields of the simple/main profile sequence layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeader {
    pub profile: Profile,
    pub coded_width: u16,
    pub coded_height: u16,
    pub pulldown: bool,
    pub interlace: bool,
    pub tfcntrflag: bool,
    pub finterpflag: bool,
    pub psf: bool,
    pub multires: bool,
    pub overlap: bool,
    pub syncmarker: bool,
    pub rangered: bool,
    pub max_b_frames: u8,
    pub postprocflag: bool,
}

impl SequenceHeader {
    pub fn coded_resolution(&self) -> Resolution {
        Resolution::from((u32::from(self.coded_width), u32::from(self.coded_height)))
    }

    /// Two anchor pictures plus the B picture being output between them.
    pub fn dpb_capacity(&self) -> DpbCapacity {
        let has_b_frames = self.max_b_frames > 0 || self.profile == Profile::Advanced;

        DpbCapacity {
            max_num_pics: 3,
            max_num_refs: 2,
            max_num_reorder: has_b_frames as usize,
        }
    }
}

/// Advanced profile entry-point header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryPoint {
    pub broken_link: bool,
    pub closed_entry: bool,
    pub panscan_flag: bool,
    pub loopfilter: bool,
    pub fastuvmc: bool,
    pub extended_mv: bool,
    pub dquant: u8,
    pub vstransform: bool,
    pub quantizer: u8,
    pub extended_dmv: bool,
    pub range_mapy: Option<u8>,
    pub range_mapuv: Option<u8>,
}

/// Picture header fields needed to build the picture parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    pub ptype: PictureType,
    pub fcm: FrameCodingMode,
    pub tff: bool,
    pub is_first_field: bool,
    pub rndctrl: bool,
    pub rangeredfrm: bool,
    pub respic: u8,
    pub bfraction: u8,
    pub condover: u8,
    pub cbptab: u8,
    pub mbmodetab: u8,
    pub mvmode: u8,
    pub mvmode2: u8,
    pub mvtab: u8,
    pub twomvbptab: u8,
    pub fourmvswitch: bool,
    pub fourmvbptab: u8,
    pub mvrange: u8,
    pub dmvrange: u8,
    pub intensity_compensation: bool,
    pub lumscale: u8,
    pub lumshift: u8,
    pub lumscale2: u8,
    pub lumshift2: u8,
    pub intcompfield: u8,
    pub pqindex: u8,
    pub pquant: u8,
    pub halfqp: bool,
    pub pquantizer: bool,
    pub dquantfrm: bool,
    pub dqprofile: u8,
    pub dqsbedge: u8,
    pub dqdbedge: u8,
    pub dqbilevel: bool,
    pub altpquant: u8,
    pub ttmbf: bool,
    pub ttfrm: u8,
    pub transacfrm: u8,
    pub transacfrm2: u8,
    pub transdctab: bool,
    pub refdist: u8,
    pub numref: bool,
    pub reffield: bool,
    /// Bit planes coded raw, as the `raw_coding` field expects.
    pub raw_coding: u8,
    /// Bit planes present in the bitplane buffer.
    pub bitplane_present: u8,
}

/// Picture-level parameters of a VC-1 picture.
#[derive(Clone, Debug, Default)]
pub struct PictureParams {
    pub sequence: Arc<SequenceHeader>,
    pub entry_point: Arc<EntryPoint>,
    pub header: PictureHeader,
    /// Bit planes packed two macroblocks per byte, as the accelerator expects them.
    pub bitplanes: Option<Bytes>,
}

/// A VC-1 slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Offset in bits of the first macroblock within the slice payload.
    pub macroblock_offset: u32,
    pub slice_vertical_position: u32,
}
