// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame lifecycle, reference management and command packing for hardware accelerated video
//! decoding.
//!
//! The crate sits between a bitstream parser, which hands it parsed syntax and compressed slice
//! payloads, and a fixed-function accelerator reached through the [`accel::VideoAccelerator`]
//! trait. It tracks every coded frame from slice accumulation to display release
//! ([`decoder::task_store`]), maintains the decoded picture buffer ([`dpb`]) and serializes the
//! accelerator command buffers ([`packer`]).

pub mod accel;
pub mod backend;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod dpb;
pub mod frame;
pub mod memory;
pub mod packer;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Width in 16x16 macroblocks, rounded up.
    pub fn width_in_mbs(&self) -> u32 {
        (self.width + 15) / 16
    }

    /// Height in 16x16 macroblocks, rounded up.
    pub fn height_in_mbs(&self) -> u32 {
        (self.height + 15) / 16
    }

    pub fn num_samples(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    /// Value of the `chroma_format_idc` syntax element.
    pub fn idc(self) -> u32 {
        match self {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::Yuv420 => 1,
            ChromaFormat::Yuv422 => 2,
            ChromaFormat::Yuv444 => 3,
        }
    }
}

/// Codec families supported by the packers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Vc1,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" => Ok(Codec::H264),
            "h265" | "H265" | "hevc" => Ok(Codec::H265),
            "vc1" | "VC1" => Ok(Codec::Vc1),
            _ => Err("unrecognized codec. Valid values: h264, h265, vc1"),
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
