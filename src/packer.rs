// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of decoded pictures into accelerator command buffers.
//!
//! A [`Packer`] turns the parsed syntax of one frame into the picture, quantization matrix, slice
//! parameter and slice data buffers of the accelerator, one codec per implementation. The
//! [`FrameSubmission`] driver sequences the calls and splits ("chops") slice data that does not
//! fit into one slice data buffer over as many hardware rounds as needed.

pub mod h264;
pub mod h265;
pub mod layout;
pub mod protected;
pub mod vc1;

use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::accel::AccelError;
use crate::accel::Accelerator;
use crate::accel::BufferType;
use crate::decoder::DecoderStatus;
use crate::decoder::PictureHeader;
use crate::decoder::Slice;
use crate::frame::Field;
use crate::frame::Reference;
use crate::memory::FrameMemId;
use crate::packer::layout::LayoutWriter;
use crate::packer::layout::VA_PADDING_LOW;
use crate::Codec;
use crate::Resolution;

pub const VA_SLICE_DATA_FLAG_ALL: u32 = 0x00;
pub const VA_SLICE_DATA_FLAG_BEGIN: u32 = 0x01;
pub const VA_SLICE_DATA_FLAG_MIDDLE: u32 = 0x02;
pub const VA_SLICE_DATA_FLAG_END: u32 = 0x04;

/// Alignment of the slice data submitted in one round.
pub const SLICE_DATA_ALIGNMENT: usize = 128;

/// `sizeof(VASliceParameterBufferBase)`
pub const SLICE_PARAMETER_BASE_SIZE: usize = 12;
/// `sizeof(VAContextParameterUpdateBuffer)`
pub const CONTEXT_PARAMETER_UPDATE_SIZE: usize = 24;
/// Size of the processing parameters, see [`ProcessingParams`].
pub const PROCESSING_PARAMETER_SIZE: usize = 28;

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Accel(#[from] AccelError),
    #[error("{count} reference frames exceed the maximum of {max}")]
    TooManyReferences { count: usize, max: usize },
    #[error("value {value} of {field} does not fit its accelerator field")]
    FieldOutOfRange { field: &'static str, value: i64 },
    #[error("frame has no slice to submit")]
    MissingSlices,
    #[error("slice data buffer of {0} bytes cannot hold any payload")]
    SliceDataCapacity(usize),
    #[error("{0:?} parameters handed to the {1:?} packer")]
    CodecMismatch(Codec, Codec),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PackError {
    pub fn status(&self) -> DecoderStatus {
        match self {
            PackError::Accel(e) => e.status(),
            PackError::TooManyReferences { .. }
            | PackError::FieldOutOfRange { .. }
            | PackError::MissingSlices
            | PackError::CodecMismatch(..) => DecoderStatus::InvalidParams,
            PackError::SliceDataCapacity(_) => DecoderStatus::AllocationFailed,
            PackError::Unsupported(_) => DecoderStatus::Unsupported,
            PackError::Other(_) => DecoderStatus::DeviceFailed,
        }
    }
}

pub type PackResult<T> = Result<T, PackError>;

/// Hardware generation of the accelerator, which decides the extra buffers it expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccelGeneration {
    #[default]
    Gen9,
    Gen11,
    Gen12,
}

impl AccelGeneration {
    /// Whether the generation takes a context priority with every frame.
    pub fn supports_priority(self) -> bool {
        matches!(self, AccelGeneration::Gen12)
    }
}

impl FromStr for AccelGeneration {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gen9" => Ok(AccelGeneration::Gen9),
            "gen11" => Ok(AccelGeneration::Gen11),
            "gen12" => Ok(AccelGeneration::Gen12),
            _ => Err("unrecognized generation. Valid values: gen9, gen11, gen12"),
        }
    }
}

/// Granularity of the slice parameters handed to the accelerator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceMode {
    /// Full slice parameters, the accelerator does not parse slice headers.
    #[default]
    Long,
    /// Only the location of the slice data, the accelerator parses slice headers itself.
    Short,
}

impl FromStr for SliceMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" | "slice" => Ok(SliceMode::Long),
            "short" | "frame" => Ok(SliceMode::Short),
            _ => Err("unrecognized slice mode. Valid values: long, short"),
        }
    }
}

/// Scheduling priority of the decode context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Value of `context_priority` for an accelerator supporting priorities up to `max`.
    pub fn context_priority(self, max: u16) -> u16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => max / 2,
            Priority::High => max,
        }
    }
}

impl FromStr for Priority {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err("unrecognized priority. Valid values: low, normal, high"),
        }
    }
}

/// Post-processing applied by the accelerator on the decoded picture.
///
/// Serialized as a `ProcPipelineParameter` buffer of [`PROCESSING_PARAMETER_SIZE`] bytes:
///
/// ```text
/// uint32_t surface;
/// uint16_t output_width;
/// uint16_t output_height;
/// uint32_t filter_flags;
/// uint32_t va_reserved[VA_PADDING_LOW];
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessingParams {
    pub output: Resolution,
    pub filter_flags: u32,
}

/// Everything [`create`] needs to pick and configure a packer.
#[derive(Clone, Debug)]
pub struct PackerCaps {
    pub codec: Codec,
    pub generation: AccelGeneration,
    pub protected: bool,
    pub slice_mode: SliceMode,
    pub priority: Priority,
    pub max_priority: u16,
    pub processing: Option<ProcessingParams>,
}

impl PackerCaps {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            generation: Default::default(),
            protected: false,
            slice_mode: Default::default(),
            priority: Default::default(),
            max_priority: 0,
            processing: None,
        }
    }
}

/// Snapshot of a reference frame, taken from the DPB when the frame is submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefPicture {
    pub mem: FrameMemId,
    pub poc: i32,
    pub frame_num: i32,
    pub long_term_frame_idx: i32,
    pub reference: Reference,
    pub field: Field,
}

/// The frame being submitted: its target memory, its syntax and its references.
#[derive(Clone, Debug)]
pub struct FrameContext {
    pub target: FrameMemId,
    pub picture: Arc<PictureHeader>,
    pub slices: Vec<Slice>,
    /// References visible to the picture.
    pub refs: Vec<RefPicture>,
}

impl FrameContext {
    pub fn ref_by_poc(&self, poc: i32) -> Option<&RefPicture> {
        self.refs.iter().find(|r| r.poc == poc)
    }

    pub fn payload_size(&self) -> usize {
        self.slices.iter().map(|s| s.payload.len()).sum()
    }

    /// Value of the field argument of [`Accelerator::begin_frame`].
    fn field_code(&self) -> u32 {
        match self.picture.field {
            Field::Frame => 0,
            Field::Top => 1,
            Field::Bottom => 2,
        }
    }
}

/// Outcome of packing the parameters of one slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// The whole slice has been packed.
    Done,
    /// The slice data buffer is full, the rest of the slice goes into the next round.
    NeedsMoreBuffer,
    /// The slice cannot be submitted and was left out.
    Skip,
}

/// One contiguous part of a slice written into the slice data buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceChunk {
    pub slice: usize,
    /// Offset of the chunk in the slice data, including the prefix if any.
    pub source_offset: usize,
    /// Length of the prefix written before the payload.
    pub prefix_len: usize,
    /// Offset of the chunk in the slice data buffer.
    pub buffer_offset: usize,
    pub size: usize,
    /// One of the `VA_SLICE_DATA_FLAG_*` values.
    pub flag: u32,
}

impl SliceChunk {
    pub fn is_first(&self) -> bool {
        matches!(self.flag, VA_SLICE_DATA_FLAG_ALL | VA_SLICE_DATA_FLAG_BEGIN)
    }

    pub fn is_last(&self) -> bool {
        matches!(self.flag, VA_SLICE_DATA_FLAG_ALL | VA_SLICE_DATA_FLAG_END)
    }

    pub fn continuation(&self) -> Continuation {
        if self.is_last() {
            Continuation::Done
        } else {
            Continuation::NeedsMoreBuffer
        }
    }
}

/// Writer of the slice data buffer of one round.
#[derive(Debug)]
pub struct SliceDataWriter {
    capacity: usize,
    chunks: Vec<SliceChunk>,
}

impl SliceDataWriter {
    /// Creates a writer for a slice data buffer of `capacity` bytes, rounded down to
    /// [`SLICE_DATA_ALIGNMENT`].
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity - capacity % SLICE_DATA_ALIGNMENT,
            chunks: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks written in this round.
    pub fn chunks(&self) -> &[SliceChunk] {
        &self.chunks
    }

    pub fn last_chunk(&self) -> Option<&SliceChunk> {
        self.chunks.last()
    }

    pub fn bytes_written(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Writes as much of `prefix` followed by `payload` as fits, starting at `*consumed` and
    /// advancing it. Returns `None` if the buffer is already full.
    pub fn write(
        &mut self,
        accel: &mut Accelerator,
        slice: usize,
        prefix: &[u8],
        payload: &[u8],
        consumed: &mut usize,
    ) -> PackResult<Option<SliceChunk>> {
        let total = prefix.len() + payload.len();
        let start = *consumed;
        debug_assert!(start <= total);

        let buffer = accel.get_comp_buffer(BufferType::SliceData, self.capacity, 0)?;
        let size = std::cmp::min(total - start, buffer.remaining());
        if size == 0 && total > start {
            return Ok(None);
        }

        let buffer_offset = buffer.data_size();
        let end = start + size;
        if start < prefix.len() {
            buffer.append(&prefix[start..std::cmp::min(end, prefix.len())]);
        }
        if end > prefix.len() {
            let from = start.saturating_sub(prefix.len());
            buffer.append(&payload[from..end - prefix.len()]);
        }

        let flag = match (start == 0, end == total) {
            (true, true) => VA_SLICE_DATA_FLAG_ALL,
            (true, false) => VA_SLICE_DATA_FLAG_BEGIN,
            (false, true) => VA_SLICE_DATA_FLAG_END,
            (false, false) => VA_SLICE_DATA_FLAG_MIDDLE,
        };

        let chunk = SliceChunk {
            slice,
            source_offset: start,
            prefix_len: prefix.len(),
            buffer_offset,
            size,
            flag,
        };

        *consumed = end;
        self.chunks.push(chunk);
        Ok(Some(chunk))
    }

    /// Zero pads the slice data of the round to [`SLICE_DATA_ALIGNMENT`].
    pub fn finish(&mut self, accel: &mut Accelerator) -> PackResult<()> {
        let buffer = accel.get_comp_buffer(BufferType::SliceData, self.capacity, 0)?;
        let size = buffer.data_size();
        let padded = std::cmp::min(crate::align_up(size, SLICE_DATA_ALIGNMENT), buffer.capacity());

        buffer.as_mut_slice()[size..padded].fill(0);
        buffer.set_data_size(padded);
        Ok(())
    }
}

/// Serializes `VASliceParameterBufferBase`.
pub(crate) fn base_slice_parameter(chunk: &SliceChunk) -> PackResult<Vec<u8>> {
    let mut w = LayoutWriter::new();
    w.u32(layout::narrow("slice_data_size", chunk.size as i64)?)
        .u32(layout::narrow("slice_data_offset", chunk.buffer_offset as i64)?)
        .u32(chunk.flag);
    w.finish("VASliceParameterBufferBase", 4, SLICE_PARAMETER_BASE_SIZE)
}

/// Command protocol of one codec.
///
/// The methods are called by [`FrameSubmission`] in this order for every round:
/// `pack_picture_parameters`, `pack_quantization_matrices`, `pack_processing_info`, then
/// `pack_slice_parameters` for each slice until one needs more buffer, then `execute`.
/// `begin_frame` comes before the first round and `end_frame` after the last.
pub trait Packer: Send {
    fn codec(&self) -> Codec;

    fn begin_frame(&mut self, accel: &mut Accelerator, frame: &FrameContext) -> PackResult<()> {
        accel.begin_frame(frame.target, frame.field_code())?;
        Ok(())
    }

    fn pack_picture_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()>;

    fn pack_quantization_matrices(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()>;

    /// Packs slice `index`, resuming its data at `*consumed`.
    fn pack_slice_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
        index: usize,
        consumed: &mut usize,
        writer: &mut SliceDataWriter,
    ) -> PackResult<Continuation>;

    fn pack_processing_info(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()>;

    fn execute(&mut self, accel: &mut Accelerator) -> PackResult<()> {
        accel.execute()?;
        Ok(())
    }

    fn end_frame(&mut self, accel: &mut Accelerator) -> PackResult<()> {
        accel.end_frame()?;
        Ok(())
    }
}

/// Buffers every codec packer emits the same way.
#[derive(Debug)]
pub(crate) struct PackerBase {
    pub caps: PackerCaps,
}

impl PackerBase {
    pub fn new(caps: PackerCaps) -> Self {
        Self { caps }
    }

    /// Fills `ty` with `bytes`.
    pub fn fill(accel: &mut Accelerator, ty: BufferType, bytes: &[u8]) -> PackResult<()> {
        accel.get_comp_buffer(ty, bytes.len(), 0)?.fill(bytes)?;
        Ok(())
    }

    /// Emits the context priority on the generations that take one.
    pub fn pack_priority(&self, accel: &mut Accelerator) -> PackResult<()> {
        if !self.caps.generation.supports_priority() {
            return Ok(());
        }

        let priority = self.caps.priority.context_priority(self.caps.max_priority);

        let mut w = LayoutWriter::new();
        // context_priority_update
        w.u32(1).u32(u32::from(priority)).reserved(VA_PADDING_LOW);
        let bytes = w.finish(
            "VAContextParameterUpdateBuffer",
            4,
            CONTEXT_PARAMETER_UPDATE_SIZE,
        )?;

        Self::fill(accel, BufferType::ContextParameterUpdate, &bytes)
    }

    pub fn pack_processing_info(
        &self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        let Some(processing) = self.caps.processing else {
            return Ok(());
        };

        let surface = accel.surface_id(frame.target)?;

        let mut w = LayoutWriter::new();
        w.u32(surface)
            .u16(layout::narrow("output_width", processing.output.width)?)
            .u16(layout::narrow("output_height", processing.output.height)?)
            .u32(processing.filter_flags)
            .reserved(VA_PADDING_LOW);
        let bytes = w.finish("ProcessingParams", 4, PROCESSING_PARAMETER_SIZE)?;

        Self::fill(accel, BufferType::ProcPipelineParameter, &bytes)
    }

    /// Appends one slice parameter structure to the slice parameter buffer of the round.
    pub fn push_slice_parameter(
        &self,
        accel: &mut Accelerator,
        frame: &FrameContext,
        bytes: &[u8],
    ) -> PackResult<()> {
        let capacity = bytes.len() * frame.slices.len();
        let buffer = accel.get_comp_buffer(BufferType::SliceParameter, capacity, 0)?;

        if buffer.append(bytes) != bytes.len() {
            return Err(PackError::Other(anyhow::anyhow!(
                "slice parameter buffer overflow"
            )));
        }
        buffer.set_num_items(buffer.num_items() + 1);

        Ok(())
    }

    /// Serializes the slice parameters of `chunk`, in the short form if configured so.
    pub fn slice_parameter(
        &self,
        chunk: &SliceChunk,
        long: impl FnOnce() -> PackResult<Vec<u8>>,
    ) -> PackResult<Vec<u8>> {
        match self.caps.slice_mode {
            SliceMode::Long => long(),
            SliceMode::Short => base_slice_parameter(chunk),
        }
    }
}

/// Creates the packer matching `caps`.
pub fn create(caps: &PackerCaps) -> PackResult<Box<dyn Packer>> {
    let inner: Box<dyn Packer> = match caps.codec {
        Codec::H264 => Box::new(h264::H264Packer::new(caps.clone())),
        Codec::H265 => Box::new(h265::H265Packer::new(caps.clone())),
        Codec::Vc1 if caps.protected => {
            return Err(PackError::Unsupported(
                "protected content is not supported for VC1".into(),
            ))
        }
        Codec::Vc1 => Box::new(vc1::Vc1Packer::new(caps.clone())),
    };

    debug!(
        "Created {:?} packer for {:?} (protected: {}, slice mode: {:?})",
        caps.codec, caps.generation, caps.protected, caps.slice_mode
    );

    if caps.protected {
        Ok(Box::new(protected::ProtectedPacker::new(inner)))
    } else {
        Ok(inner)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Begin,
    Pack,
    Execute,
    End,
    Done,
}

/// Submission of one frame, resumable after a busy accelerator.
///
/// A busy result leaves the submission at the step that failed, with its buffers filled, so
/// calling [`FrameSubmission::run`] again retries exactly that step.
#[derive(Debug)]
pub struct FrameSubmission {
    frame: FrameContext,
    stage: Stage,
    /// Slice being packed and how much of its data is already submitted.
    slice: usize,
    consumed: usize,
    capacity: usize,
    rounds: usize,
    skipped: usize,
}

impl FrameSubmission {
    pub fn new(frame: FrameContext, slice_data_capacity: usize) -> Self {
        Self {
            frame,
            stage: Stage::Begin,
            slice: 0,
            consumed: 0,
            capacity: slice_data_capacity,
            rounds: 0,
            skipped: 0,
        }
    }

    pub fn frame(&self) -> &FrameContext {
        &self.frame
    }

    /// Number of hardware rounds executed so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn skipped_slices(&self) -> usize {
        self.skipped
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }

    /// Whether the hardware frame has been begun and not ended yet.
    pub fn is_started(&self) -> bool {
        !matches!(self.stage, Stage::Begin | Stage::Done)
    }

    /// Upper bound on the number of rounds the frame needs.
    pub fn max_rounds(&self) -> usize {
        let usable = std::cmp::max(self.capacity, 1);
        (self.frame.payload_size() + usable - 1) / usable + self.frame.slices.len()
    }

    pub fn run(&mut self, accel: &mut Accelerator, packer: &mut dyn Packer) -> PackResult<()> {
        if packer.codec() != self.frame.picture.params.codec() {
            return Err(PackError::CodecMismatch(
                self.frame.picture.params.codec(),
                packer.codec(),
            ));
        }

        loop {
            match self.stage {
                Stage::Begin => {
                    if self.frame.slices.is_empty() {
                        return Err(PackError::MissingSlices);
                    }

                    let max = accel.max_buffer_size(BufferType::SliceData);
                    self.capacity = std::cmp::min(self.capacity, max);
                    self.capacity -= self.capacity % SLICE_DATA_ALIGNMENT;
                    if self.capacity == 0 {
                        return Err(PackError::SliceDataCapacity(max));
                    }

                    packer.begin_frame(accel, &self.frame)?;
                    self.stage = Stage::Pack;
                }
                Stage::Pack => {
                    self.pack_round(accel, packer)?;
                    self.stage = Stage::Execute;
                }
                Stage::Execute => {
                    packer.execute(accel)?;
                    self.rounds += 1;

                    if self.slice < self.frame.slices.len() {
                        if self.rounds >= self.max_rounds() {
                            return Err(PackError::Other(anyhow::anyhow!(
                                "slice data not submitted after {} rounds",
                                self.rounds
                            )));
                        }

                        debug!(
                            "Slice data chopped, resuming slice {} at byte {}",
                            self.slice, self.consumed
                        );
                        self.stage = Stage::Pack;
                    } else {
                        self.stage = Stage::End;
                    }
                }
                Stage::End => {
                    packer.end_frame(accel)?;
                    self.stage = Stage::Done;
                }
                Stage::Done => return Ok(()),
            }
        }
    }

    fn pack_round(&mut self, accel: &mut Accelerator, packer: &mut dyn Packer) -> PackResult<()> {
        packer.pack_picture_parameters(accel, &self.frame)?;
        packer.pack_quantization_matrices(accel, &self.frame)?;
        packer.pack_processing_info(accel, &self.frame)?;

        let mut writer = SliceDataWriter::new(self.capacity);

        while self.slice < self.frame.slices.len() {
            let continuation = packer.pack_slice_parameters(
                accel,
                &self.frame,
                self.slice,
                &mut self.consumed,
                &mut writer,
            )?;

            match continuation {
                Continuation::Done => {
                    self.slice += 1;
                    self.consumed = 0;
                }
                Continuation::Skip => {
                    warn!("Skipping slice {}: data offset past its payload", self.slice);
                    self.skipped += 1;
                    self.slice += 1;
                    self.consumed = 0;
                }
                Continuation::NeedsMoreBuffer => {
                    if writer.chunks().is_empty() {
                        return Err(PackError::SliceDataCapacity(writer.capacity()));
                    }
                    break;
                }
            }
        }

        writer.finish(accel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::RecordingAccelerator;
    use crate::memory::FrameAllocator;
    use crate::memory::FrameInfo;
    use crate::memory::SlotTable;

    fn accel() -> (Accelerator, FrameMemId) {
        let table = SlotTable::new(2);
        let id = table.alloc(&FrameInfo::default()).unwrap();
        let mut accel = Accelerator::new(Box::new(RecordingAccelerator::new()));
        accel.begin_frame(id, 0).unwrap();
        (accel, id)
    }

    #[test]
    fn chunk_flags() {
        let (mut accel, _) = accel();
        let mut writer = SliceDataWriter::new(256);
        let payload = [7u8; 300];
        let mut consumed = 0;

        let chunk = writer
            .write(&mut accel, 0, &[], &payload, &mut consumed)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.flag, VA_SLICE_DATA_FLAG_BEGIN);
        assert_eq!(chunk.size, 256);
        assert_eq!(consumed, 256);
        assert_eq!(chunk.continuation(), Continuation::NeedsMoreBuffer);

        // Full buffer.
        assert!(writer
            .write(&mut accel, 0, &[], &payload, &mut consumed)
            .unwrap()
            .is_none());

        accel.execute().unwrap();
        let mut writer = SliceDataWriter::new(256);
        let chunk = writer
            .write(&mut accel, 0, &[], &payload, &mut consumed)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.flag, VA_SLICE_DATA_FLAG_END);
        assert_eq!(chunk.size, 44);
        assert!(chunk.is_last());
    }

    #[test]
    fn prefix_is_written_before_payload() {
        let (mut accel, _) = accel();
        let mut writer = SliceDataWriter::new(128);
        let mut consumed = 0;

        let chunk = writer
            .write(&mut accel, 0, &[0, 0, 1], &[0x26, 0x01], &mut consumed)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.flag, VA_SLICE_DATA_FLAG_ALL);
        assert_eq!(chunk.prefix_len, 3);

        writer.finish(&mut accel).unwrap();
        let buffer = accel.comp_buffer(BufferType::SliceData, 0).unwrap();
        assert_eq!(buffer.data_size(), 128);
        assert_eq!(&buffer.data()[..6], &[0, 0, 1, 0x26, 0x01, 0]);
        assert!(buffer.data()[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn capacity_is_aligned_down() {
        assert_eq!(SliceDataWriter::new(300).capacity(), 256);
        assert_eq!(SliceDataWriter::new(100).capacity(), 0);
    }

    #[test]
    fn priority_values() {
        assert_eq!(Priority::Low.context_priority(1024), 0);
        assert_eq!(Priority::Normal.context_priority(1024), 512);
        assert_eq!(Priority::High.context_priority(1024), 1024);
        assert_eq!("high".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("gen12".parse::<AccelGeneration>(), Ok(AccelGeneration::Gen12));
        assert_eq!("short".parse::<SliceMode>(), Ok(SliceMode::Short));
    }

    #[test]
    fn protected_vc1_is_unsupported() {
        let mut caps = PackerCaps::new(Codec::Vc1);
        caps.protected = true;
        assert!(matches!(create(&caps), Err(PackError::Unsupported(_))));

        caps.codec = Codec::H265;
        assert_eq!(create(&caps).unwrap().codec(), Codec::H265);
    }
}
