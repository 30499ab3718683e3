// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The reconstructed-picture model shared by the DPB, the task store and the packers.

use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;

use crate::memory::FrameMemId;
use crate::memory::FrameRef;

/// Reference status of a decoded picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Picture structure of a decoded picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    pub fn is_field(self) -> bool {
        !matches!(self, Field::Frame)
    }
}

/// Corruption annotations of a frame.
///
/// The bit values match the error flags reported by the decoder's public interface.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Corruption(u32);

impl Corruption {
    pub const NONE: Corruption = Corruption(0);
    /// Slice-level damage, the picture is mostly usable.
    pub const MINOR: Corruption = Corruption(0x1);
    /// The picture could not be decoded properly.
    pub const MAJOR: Corruption = Corruption(0x2);
    /// The picture was predicted from a missing or corrupted reference.
    pub const REFERENCE_FRAME: Corruption = Corruption(0x4);
    /// The DPB state was inconsistent when the picture was marked.
    pub const DPB: Corruption = Corruption(0x8);
    pub const RECOVERY: Corruption = Corruption(0x10);
    pub const SHORT_TERM_STUCK: Corruption = Corruption(0x100);
    /// The accelerator failed while processing the picture.
    pub const DEVICE_FAILURE: Corruption = Corruption(0x8000_0000);

    /// Flags that make every picture predicted from the flagged one unreliable too.
    pub const PROPAGATING: Corruption =
        Corruption(Self::MINOR.0 | Self::MAJOR.0 | Self::REFERENCE_FRAME.0 | Self::DPB.0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Corruption) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Corruption) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Corruption) {
        self.0 |= other.0;
    }

    /// Whether pictures predicted from this one must be flagged as well.
    pub fn propagates(self) -> bool {
        self.intersects(Self::PROPAGATING)
    }
}

impl BitOr for Corruption {
    type Output = Corruption;

    fn bitor(self, rhs: Self) -> Self::Output {
        Corruption(self.0 | rhs.0)
    }
}

impl BitOrAssign for Corruption {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Corruption, &str); 7] = [
            (Corruption::MINOR, "MINOR"),
            (Corruption::MAJOR, "MAJOR"),
            (Corruption::REFERENCE_FRAME, "REFERENCE_FRAME"),
            (Corruption::DPB, "DPB"),
            (Corruption::RECOVERY, "RECOVERY"),
            (Corruption::SHORT_TERM_STUCK, "SHORT_TERM_STUCK"),
            (Corruption::DEVICE_FAILURE, "DEVICE_FAILURE"),
        ];

        if self.is_empty() {
            return write!(f, "Corruption(NONE)");
        }

        let names: Vec<_> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Corruption({})", names.join(" | "))
    }
}

/// Key of a frame stored in a DPB.
///
/// Keys are only meaningful for the DPB that issued them and become stale once the frame is
/// removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// One reconstructed picture.
pub struct DecoderFrame {
    /// Backing memory. Dropping the frame releases the reference it holds.
    pub memory: FrameRef,
    /// Picture order count, i.e. output order.
    pub poc: i32,
    /// Decode-order counter of the task that produced this frame.
    pub frame_counter: u64,
    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,
    pub reference: Reference,
    pub field: Field,
    pub view_id: u16,
    pub corruption: Corruption,
    /// Whether the frame still has to be released for display.
    pub needed_for_output: bool,
    /// Whether the accelerator reported completion for this frame.
    pub decoded: bool,
    /// Frames this one was predicted from.
    pub references: Vec<FrameKey>,

    pub(crate) prev: Option<FrameKey>,
    pub(crate) next: Option<FrameKey>,
}

impl DecoderFrame {
    pub fn new(memory: FrameRef, poc: i32, frame_counter: u64) -> Self {
        Self {
            memory,
            poc,
            frame_counter,
            frame_num: 0,
            frame_num_wrap: 0,
            long_term_frame_idx: 0,
            reference: Reference::None,
            field: Field::Frame,
            view_id: 0,
            corruption: Corruption::NONE,
            needed_for_output: true,
            decoded: false,
            references: Vec::new(),
            prev: None,
            next: None,
        }
    }

    pub fn mem_id(&self) -> FrameMemId {
        self.memory.id()
    }

    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_short_term(&self) -> bool {
        matches!(self.reference, Reference::ShortTerm)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn is_corrupted(&self) -> bool {
        !self.corruption.is_empty()
    }

    /// H.264 picture number of a short term reference frame.
    pub fn pic_num(&self) -> i32 {
        match self.field {
            Field::Frame => self.frame_num_wrap,
            Field::Top | Field::Bottom => 2 * self.frame_num_wrap + 1,
        }
    }

    /// H.264 long term picture number.
    pub fn long_term_pic_num(&self) -> i32 {
        match self.field {
            Field::Frame => self.long_term_frame_idx,
            Field::Top | Field::Bottom => 2 * self.long_term_frame_idx + 1,
        }
    }

    /// Previous frame in DPB order.
    pub fn prev(&self) -> Option<FrameKey> {
        self.prev
    }

    /// Next frame in DPB order.
    pub fn next(&self) -> Option<FrameKey> {
        self.next
    }
}

impl fmt::Debug for DecoderFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderFrame")
            .field("memory", &self.memory.id())
            .field("poc", &self.poc)
            .field("frame_counter", &self.frame_counter)
            .field("frame_num", &self.frame_num)
            .field("reference", &self.reference)
            .field("field", &self.field)
            .field("view_id", &self.view_id)
            .field("corruption", &self.corruption)
            .field("needed_for_output", &self.needed_for_output)
            .field("decoded", &self.decoded)
            .finish()
    }
}

/// A frame released for display, in output order.
///
/// The frame keeps its memory alive through its own reference, independently of the DPB.
#[derive(Debug)]
pub struct DecodedFrame {
    pub memory: FrameRef,
    pub poc: i32,
    pub view_id: u16,
    pub frame_counter: u64,
    pub corruption: Corruption,
}

impl DecodedFrame {
    pub fn mem_id(&self) -> FrameMemId {
        self.memory.id()
    }
}
