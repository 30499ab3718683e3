// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed syntax handed over by the bitstream parsers.
//!
//! Parsing itself happens elsewhere. These modules only define the syntax elements the decoding
//! core consumes, and the sequence-level computations (such as the DPB capacity) that derive from
//! them.

pub mod h264;
pub mod h265;
pub mod vc1;

use std::sync::Arc;

use crate::memory::FrameInfo;
use crate::Codec;
use crate::Resolution;

/// Maximum number of pictures a DPB may ever hold, for any codec.
pub const DPB_MAX_SIZE: usize = 16;

/// Limits of the DPB for the active sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpbCapacity {
    /// Maximum number of pictures stored, references and pictures waiting for output alike.
    pub max_num_pics: usize,
    /// Maximum number of pictures marked as reference.
    pub max_num_refs: usize,
    /// Number of pictures that may precede another in decode order and follow it in output
    /// order.
    pub max_num_reorder: usize,
}

/// Sequence-level parameters of the active stream.
#[derive(Clone, Debug)]
pub enum SequenceParams {
    H264(Arc<h264::Sps>),
    H265(Arc<h265::Sps>),
    Vc1(Arc<vc1::SequenceHeader>),
}

impl SequenceParams {
    pub fn codec(&self) -> Codec {
        match self {
            SequenceParams::H264(_) => Codec::H264,
            SequenceParams::H265(_) => Codec::H265,
            SequenceParams::Vc1(_) => Codec::Vc1,
        }
    }

    pub fn coded_resolution(&self) -> Resolution {
        match self {
            SequenceParams::H264(sps) => sps.coded_resolution(),
            SequenceParams::H265(sps) => sps.coded_resolution(),
            SequenceParams::Vc1(seq) => seq.coded_resolution(),
        }
    }

    /// Computes the DPB limits implied by these parameters.
    pub fn dpb_capacity(&self) -> DpbCapacity {
        match self {
            SequenceParams::H264(sps) => sps.dpb_capacity(),
            SequenceParams::H265(sps) => sps.dpb_capacity(),
            SequenceParams::Vc1(seq) => seq.dpb_capacity(),
        }
    }

    /// Description of the memory a decoded frame of this sequence needs.
    pub fn frame_info(&self) -> FrameInfo {
        match self {
            SequenceParams::H264(sps) => FrameInfo::new(
                sps.coded_resolution(),
                sps.bit_depth_luma_minus8 + 8,
                sps.chroma_format,
            ),
            SequenceParams::H265(sps) => FrameInfo::new(
                sps.coded_resolution(),
                sps.bit_depth_luma_minus8 + 8,
                sps.chroma_format,
            ),
            SequenceParams::Vc1(seq) => {
                FrameInfo::new(seq.coded_resolution(), 8, crate::ChromaFormat::Yuv420)
            }
        }
    }
}

/// Picture-level parameters of the picture being decoded.
#[derive(Clone, Debug)]
pub enum PictureParams {
    H264(h264::PictureParams),
    H265(h265::PictureParams),
    Vc1(vc1::PictureParams),
}

impl PictureParams {
    pub fn codec(&self) -> Codec {
        match self {
            PictureParams::H264(_) => Codec::H264,
            PictureParams::H265(_) => Codec::H265,
            PictureParams::Vc1(_) => Codec::Vc1,
        }
    }
}

/// Slice-level syntax of one slice.
#[derive(Clone, Debug)]
pub enum SliceSyntax {
    H264(h264::SliceHeader),
    H265(h265::SliceHeader),
    Vc1(vc1::SliceHeader),
}
