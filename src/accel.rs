// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware accelerator.
//!
//! [`VideoAccelerator`] is the driver-facing trait, shaped after the VA-API decode entry points
//! (begin/render/end picture plus surface synchronization). [`Accelerator`] wraps a driver into a
//! decode session: it owns the command buffers of the frame being submitted, guards against
//! double begins, and translates driver status codes into [`AccelError`]s and [`TaskStatus`]es.

use std::time::Duration;

use enumn::N;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::decoder::DecoderStatus;
use crate::frame::Corruption;
use crate::memory::FrameMemId;

/// Identifier of a surface on the accelerator side.
pub type SurfaceId = u32;

pub const VA_INVALID_ID: u32 = 0xffff_ffff;
pub const VA_INVALID_SURFACE: SurfaceId = VA_INVALID_ID;

/// Status codes returned by the accelerator driver, with their VA-API values.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum VaStatus {
    Success = 0x00,
    OperationFailed = 0x01,
    AllocationFailed = 0x02,
    InvalidDisplay = 0x03,
    InvalidConfig = 0x04,
    InvalidContext = 0x05,
    InvalidSurface = 0x06,
    InvalidBuffer = 0x07,
    InvalidImage = 0x08,
    InvalidSubpicture = 0x09,
    AttrNotSupported = 0x0a,
    MaxNumExceeded = 0x0b,
    UnsupportedProfile = 0x0c,
    UnsupportedEntrypoint = 0x0d,
    UnsupportedRtFormat = 0x0e,
    UnsupportedBufferType = 0x0f,
    SurfaceBusy = 0x10,
    FlagNotSupported = 0x11,
    InvalidParameter = 0x12,
    ResolutionNotSupported = 0x13,
    Unimplemented = 0x14,
    SurfaceInDisplaying = 0x15,
    InvalidImageFormat = 0x16,
    DecodingError = 0x17,
    EncodingError = 0x18,
    InvalidValue = 0x19,
    UnsupportedFilter = 0x20,
    InvalidFilterChain = 0x21,
    HwBusy = 0x22,
    UnsupportedMemoryType = 0x24,
    NotEnoughBuffer = 0x25,
    Timedout = 0x26,
    Unknown = 0xffff_ffff,
}

impl VaStatus {
    /// Converts a raw driver status, mapping unknown values to [`VaStatus::Unknown`].
    pub fn from_raw(status: u32) -> Self {
        Self::n(status).unwrap_or(VaStatus::Unknown)
    }
}

impl From<VaStatus> for DecoderStatus {
    fn from(status: VaStatus) -> Self {
        match status {
            VaStatus::Success => DecoderStatus::Ok,
            VaStatus::AllocationFailed => DecoderStatus::AllocationFailed,
            VaStatus::UnsupportedProfile
            | VaStatus::UnsupportedEntrypoint
            | VaStatus::UnsupportedRtFormat
            | VaStatus::UnsupportedBufferType
            | VaStatus::FlagNotSupported
            | VaStatus::ResolutionNotSupported => DecoderStatus::Unsupported,
            VaStatus::InvalidDisplay
            | VaStatus::InvalidConfig
            | VaStatus::InvalidContext
            | VaStatus::InvalidSurface
            | VaStatus::InvalidBuffer
            | VaStatus::InvalidImage
            | VaStatus::InvalidSubpicture
            | VaStatus::InvalidParameter => DecoderStatus::InvalidParams,
            VaStatus::DecodingError => DecoderStatus::DeviceFailed,
            // The driver reports a GPU hang this way.
            VaStatus::HwBusy => DecoderStatus::DeviceLost,
            _ => DecoderStatus::DeviceFailed,
        }
    }
}

/// Accelerator buffer types, with their VA-API values.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum BufferType {
    PictureParameter = 0,
    IqMatrix = 1,
    BitPlane = 2,
    SliceParameter = 4,
    SliceData = 5,
    ProcPipelineParameter = 41,
    DecodeStreamout = 56,
    ContextParameterUpdate = 58,
    EncryptionParameter = 60,
}

/// Status of a surface as reported by the driver.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SurfaceStatus {
    Rendering = 1,
    Displaying = 2,
    Ready = 4,
    Skipped = 8,
}

/// Completion status of a submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Done,
    DoneWithError(Corruption),
}

/// A filled buffer handed to the driver on submission.
#[derive(Debug)]
pub struct RenderBuffer<'a> {
    pub ty: BufferType,
    pub index: u32,
    pub data: &'a [u8],
    pub num_elements: u32,
}

/// Driver-side entry points the decoding core relies on.
pub trait VideoAccelerator: Send {
    /// Returns the surface backing the frame memory `id`.
    fn surface_id(&self, id: FrameMemId) -> Option<SurfaceId>;
    /// Starts decoding into `target`.
    fn begin_picture(&mut self, target: SurfaceId) -> Result<(), VaStatus>;
    /// Submits one batch of buffers for the picture in progress.
    fn render_picture(&mut self, buffers: &[RenderBuffer<'_>]) -> Result<(), VaStatus>;
    /// Closes the picture in progress. Decoding may still be running afterwards.
    fn end_picture(&mut self) -> Result<(), VaStatus>;
    /// Blocks until decoding into `surface` has completed or `timeout` elapsed.
    fn sync_surface(&mut self, surface: SurfaceId, timeout: Duration) -> Result<(), VaStatus>;
    fn query_surface_status(&mut self, surface: SurfaceId) -> Result<SurfaceStatus, VaStatus>;
    /// Largest buffer of type `ty` the driver accepts.
    fn max_buffer_size(&self, ty: BufferType) -> usize {
        let _ = ty;
        usize::MAX
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccelError {
    /// Transient condition, the same call may be retried later.
    #[error("accelerator is busy")]
    Busy,
    #[error("accelerator device lost")]
    DeviceLost,
    #[error("no frame in progress")]
    FrameNotBegun,
    #[error("frame {0:?} is still in progress")]
    FrameInProgress(FrameMemId),
    #[error("no surface for frame memory {0:?}")]
    UnknownSurface(FrameMemId),
    #[error("{ty:?} buffer of {requested} bytes exceeds the driver limit of {max}")]
    BufferTooLarge {
        ty: BufferType,
        requested: usize,
        max: usize,
    },
    #[error("accelerator call failed: {0:?}")]
    Va(VaStatus),
}

impl AccelError {
    /// Maps the error to the decoder status enumeration.
    pub fn status(&self) -> DecoderStatus {
        match self {
            AccelError::Busy => DecoderStatus::DeviceFailed,
            AccelError::DeviceLost => DecoderStatus::DeviceLost,
            AccelError::FrameNotBegun | AccelError::FrameInProgress(_) => {
                DecoderStatus::DeviceFailed
            }
            AccelError::UnknownSurface(_) => DecoderStatus::InvalidParams,
            AccelError::BufferTooLarge { .. } => DecoderStatus::AllocationFailed,
            AccelError::Va(status) => DecoderStatus::from(*status),
        }
    }
}

impl From<VaStatus> for AccelError {
    fn from(status: VaStatus) -> Self {
        match status {
            VaStatus::SurfaceBusy => AccelError::Busy,
            VaStatus::HwBusy => AccelError::DeviceLost,
            status => AccelError::Va(status),
        }
    }
}

pub type AccelResult<T> = Result<T, AccelError>;

/// A command buffer of the frame being submitted.
#[derive(Debug)]
pub struct CompBuffer {
    ty: BufferType,
    index: u32,
    data: Vec<u8>,
    data_size: usize,
    num_items: u32,
}

impl CompBuffer {
    fn new(ty: BufferType, index: u32, capacity: usize) -> Self {
        Self {
            ty,
            index,
            data: vec![0; capacity],
            data_size: 0,
            num_items: 0,
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.ty
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes written so far.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn set_data_size(&mut self, size: usize) {
        debug_assert!(size <= self.capacity());
        self.data_size = size.min(self.capacity());
    }

    /// Number of elements for array buffers such as slice parameters.
    pub fn num_items(&self) -> u32 {
        self.num_items
    }

    pub fn set_num_items(&mut self, num_items: u32) {
        self.num_items = num_items;
    }

    /// Bytes left after the valid data.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.data_size
    }

    /// The whole writable region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    /// Copies `bytes` after the valid data.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.remaining());
        let start = self.data_size;
        self.data[start..start + len].copy_from_slice(&bytes[..len]);
        self.data_size += len;
        len
    }

    /// Replaces the content of the buffer with `bytes`.
    pub fn fill(&mut self, bytes: &[u8]) -> AccelResult<()> {
        if bytes.len() > self.capacity() {
            return Err(AccelError::BufferTooLarge {
                ty: self.ty,
                requested: bytes.len(),
                max: self.capacity(),
            });
        }

        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data_size = bytes.len();
        Ok(())
    }

    fn reset(&mut self) {
        self.data_size = 0;
        self.num_items = 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    BeforeBegin,
    BeforeEnd { target: FrameMemId, field: u32 },
}

/// A decode session on top of a [`VideoAccelerator`].
pub struct Accelerator {
    driver: Box<dyn VideoAccelerator>,
    state: FrameState,
    buffers: Vec<CompBuffer>,
    /// Number of times a hardware picture was actually begun.
    begin_count: u64,
}

impl Accelerator {
    pub fn new(driver: Box<dyn VideoAccelerator>) -> Self {
        Self {
            driver,
            state: FrameState::BeforeBegin,
            buffers: Vec::new(),
            begin_count: 0,
        }
    }

    pub fn surface_id(&self, id: FrameMemId) -> AccelResult<SurfaceId> {
        self.driver
            .surface_id(id)
            .ok_or(AccelError::UnknownSurface(id))
    }

    /// Surface of `id`, or the invalid surface sentinel.
    pub fn surface_id_or_invalid(&self, id: Option<FrameMemId>) -> SurfaceId {
        id.and_then(|id| self.driver.surface_id(id))
            .unwrap_or(VA_INVALID_SURFACE)
    }

    pub fn is_frame_begun(&self) -> bool {
        matches!(self.state, FrameState::BeforeEnd { .. })
    }

    pub fn begin_count(&self) -> u64 {
        self.begin_count
    }

    /// Largest buffer of type `ty` the driver accepts.
    pub fn max_buffer_size(&self, ty: BufferType) -> usize {
        self.driver.max_buffer_size(ty)
    }

    /// Binds the hardware context to the memory of `id`.
    ///
    /// Calling this again for the same target before [`Accelerator::end_frame`] is a no-op.
    /// Beginning another target while a frame is in progress is an error.
    pub fn begin_frame(&mut self, id: FrameMemId, field: u32) -> AccelResult<()> {
        match self.state {
            FrameState::BeforeEnd {
                target,
                field: current,
            } if target == id && current == field => return Ok(()),
            FrameState::BeforeEnd { target, .. } => {
                return Err(AccelError::FrameInProgress(target))
            }
            FrameState::BeforeBegin => (),
        }

        let surface = self.surface_id(id)?;
        self.driver.begin_picture(surface).map_err(|status| {
            warn!("begin_picture({}) failed: {:?}", surface, status);
            AccelError::from(status)
        })?;

        debug!("Began frame {:?} (field {}) on surface {}", id, field, surface);
        self.state = FrameState::BeforeEnd { target: id, field };
        self.begin_count += 1;

        Ok(())
    }

    /// Returns the buffer of type `ty` at `index`, creating it with room for `size` bytes.
    pub fn get_comp_buffer(
        &mut self,
        ty: BufferType,
        size: usize,
        index: u32,
    ) -> AccelResult<&mut CompBuffer> {
        if !self.is_frame_begun() {
            return Err(AccelError::FrameNotBegun);
        }

        let max = self.driver.max_buffer_size(ty);
        if size > max {
            return Err(AccelError::BufferTooLarge {
                ty,
                requested: size,
                max,
            });
        }

        let pos = match self
            .buffers
            .iter()
            .position(|b| b.ty == ty && b.index == index)
        {
            Some(pos) if self.buffers[pos].capacity() >= size => pos,
            Some(pos) => {
                self.buffers[pos] = CompBuffer::new(ty, index, size);
                pos
            }
            None => {
                self.buffers.push(CompBuffer::new(ty, index, size));
                self.buffers.len() - 1
            }
        };

        Ok(&mut self.buffers[pos])
    }

    /// Returns an existing buffer, if any.
    pub fn comp_buffer(&self, ty: BufferType, index: u32) -> Option<&CompBuffer> {
        self.buffers
            .iter()
            .find(|b| b.ty == ty && b.index == index)
    }

    /// Submits all filled buffers as one hardware command.
    ///
    /// On success the buffers are recycled for the next round. On [`AccelError::Busy`] they are
    /// kept as they are so the same call can be retried.
    pub fn execute(&mut self) -> AccelResult<()> {
        if !self.is_frame_begun() {
            return Err(AccelError::FrameNotBegun);
        }

        let render: Vec<_> = self
            .buffers
            .iter()
            .filter(|b| b.data_size > 0)
            .map(|b| RenderBuffer {
                ty: b.ty,
                index: b.index,
                data: b.data(),
                num_elements: if b.ty == BufferType::SliceParameter {
                    b.num_items
                } else {
                    1
                },
            })
            .collect();

        debug!("Executing {} buffers", render.len());

        match self.driver.render_picture(&render) {
            Ok(()) => {
                self.buffers.iter_mut().for_each(CompBuffer::reset);
                Ok(())
            }
            Err(status) => {
                let err = AccelError::from(status);
                match err {
                    AccelError::Busy => debug!("Accelerator busy, execute to be retried"),
                    AccelError::DeviceLost => error!("Device lost during execute"),
                    _ => warn!("render_picture failed: {:?}", status),
                }
                Err(err)
            }
        }
    }

    /// Closes the frame in progress and drops its buffers. A no-op if no frame is in progress.
    pub fn end_frame(&mut self) -> AccelResult<()> {
        if !self.is_frame_begun() {
            return Ok(());
        }

        self.state = FrameState::BeforeBegin;
        self.buffers.clear();
        self.driver.end_picture().map_err(AccelError::from)
    }

    /// Blocks until the frame decoded into `id` is complete, or `timeout` elapsed.
    pub fn sync_task(&mut self, id: FrameMemId, timeout: Duration) -> AccelResult<TaskStatus> {
        let surface = self.surface_id(id)?;

        match self.driver.sync_surface(surface, timeout) {
            Ok(()) => Ok(TaskStatus::Done),
            Err(VaStatus::Timedout) => Ok(TaskStatus::Pending),
            Err(VaStatus::DecodingError) | Err(VaStatus::OperationFailed) => {
                warn!("Decode error reported for surface {}", surface);
                Ok(TaskStatus::DoneWithError(Corruption::MAJOR))
            }
            Err(status) => Err(AccelError::from(status)),
        }
    }

    /// Polls the completion status of the frame decoded into `id`.
    pub fn query_task_status(&mut self, id: FrameMemId) -> AccelResult<TaskStatus> {
        let surface = self.surface_id(id)?;

        match self.driver.query_surface_status(surface) {
            Ok(SurfaceStatus::Ready) | Ok(SurfaceStatus::Skipped) => Ok(TaskStatus::Done),
            Ok(SurfaceStatus::Rendering) | Ok(SurfaceStatus::Displaying) => {
                Ok(TaskStatus::Pending)
            }
            Err(VaStatus::DecodingError) => {
                warn!("Decode error reported for surface {}", surface);
                Ok(TaskStatus::DoneWithError(Corruption::MAJOR))
            }
            Err(status) => Err(AccelError::from(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::Fault;
    use crate::backend::dummy::FaultPoint;
    use crate::backend::dummy::RecordingAccelerator;
    use crate::memory::FrameAllocator;
    use crate::memory::FrameInfo;
    use crate::memory::SlotTable;

    fn setup() -> (RecordingAccelerator, Accelerator, FrameMemId) {
        let table = SlotTable::new(4);
        let id = table.alloc(&FrameInfo::default()).unwrap();
        let recorder = RecordingAccelerator::new();
        let accel = Accelerator::new(Box::new(recorder.clone()));
        (recorder, accel, id)
    }

    #[test]
    fn begin_frame_is_idempotent() {
        let (recorder, mut accel, id) = setup();

        accel.begin_frame(id, 0).unwrap();
        accel.begin_frame(id, 0).unwrap();
        assert_eq!(accel.begin_count(), 1);
        assert_eq!(recorder.begin_count(), 1);

        accel.end_frame().unwrap();
        accel.end_frame().unwrap();
        assert_eq!(recorder.end_count(), 1);

        accel.begin_frame(id, 0).unwrap();
        assert_eq!(recorder.begin_count(), 2);
    }

    #[test]
    fn begin_other_target_while_in_progress() {
        let table = SlotTable::new(4);
        let a = table.alloc(&FrameInfo::default()).unwrap();
        let b = table.alloc(&FrameInfo::default()).unwrap();
        let mut accel = Accelerator::new(Box::new(RecordingAccelerator::new()));

        accel.begin_frame(a, 0).unwrap();
        assert_eq!(accel.begin_frame(b, 0), Err(AccelError::FrameInProgress(a)));
    }

    #[test]
    fn buffers_need_a_frame() {
        let (_, mut accel, id) = setup();
        assert!(matches!(
            accel.get_comp_buffer(BufferType::PictureParameter, 16, 0),
            Err(AccelError::FrameNotBegun)
        ));

        accel.begin_frame(id, 0).unwrap();
        let buf = accel
            .get_comp_buffer(BufferType::SliceData, 256, 0)
            .unwrap();
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.append(&[1; 300]), 256);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn busy_execute_keeps_buffers() {
        let (recorder, mut accel, id) = setup();
        recorder.inject(FaultPoint::Execute, Fault::Busy);

        accel.begin_frame(id, 0).unwrap();
        accel
            .get_comp_buffer(BufferType::PictureParameter, 4, 0)
            .unwrap()
            .fill(&[1, 2, 3, 4])
            .unwrap();

        assert_eq!(accel.execute(), Err(AccelError::Busy));
        assert_eq!(
            accel
                .comp_buffer(BufferType::PictureParameter, 0)
                .unwrap()
                .data(),
            &[1, 2, 3, 4]
        );

        accel.execute().unwrap();
        assert_eq!(recorder.submissions().len(), 1);
        assert_eq!(
            accel
                .comp_buffer(BufferType::PictureParameter, 0)
                .unwrap()
                .data_size(),
            0
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            DecoderStatus::from(VaStatus::AllocationFailed),
            DecoderStatus::AllocationFailed
        );
        assert_eq!(
            DecoderStatus::from(VaStatus::UnsupportedRtFormat),
            DecoderStatus::Unsupported
        );
        assert_eq!(
            DecoderStatus::from(VaStatus::InvalidSurface),
            DecoderStatus::InvalidParams
        );
        assert_eq!(
            DecoderStatus::from(VaStatus::DecodingError),
            DecoderStatus::DeviceFailed
        );
        assert_eq!(DecoderStatus::from(VaStatus::HwBusy), DecoderStatus::DeviceLost);
        assert_eq!(VaStatus::from_raw(0x26), VaStatus::Timedout);
        assert_eq!(VaStatus::from_raw(0x1234), VaStatus::Unknown);
        assert_eq!(AccelError::from(VaStatus::SurfaceBusy), AccelError::Busy);
    }

    #[test]
    fn decode_error_is_reported_as_corruption() {
        let (recorder, mut accel, id) = setup();
        recorder.inject(FaultPoint::Sync, Fault::DecodeError);

        accel.begin_frame(id, 0).unwrap();
        accel.execute().unwrap();
        accel.end_frame().unwrap();

        assert_eq!(
            accel.sync_task(id, Duration::from_millis(10)),
            Ok(TaskStatus::DoneWithError(Corruption::MAJOR))
        );
    }

    #[test]
    fn device_lost_on_query() {
        let (recorder, mut accel, id) = setup();
        recorder.inject(FaultPoint::Sync, Fault::DeviceLost);

        accel.begin_frame(id, 0).unwrap();
        accel.execute().unwrap();
        accel.end_frame().unwrap();

        assert_eq!(accel.query_task_status(id), Err(AccelError::DeviceLost));
    }
}
