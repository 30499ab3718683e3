// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy accelerator whose only purpose is to let the decoding core run so
//! we can test it in isolation.
//!
//! Every submission is recorded and can be inspected afterwards, and faults can be injected at
//! the points where a real driver may fail.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use log::debug;

use crate::accel::BufferType;
use crate::accel::RenderBuffer;
use crate::accel::SurfaceId;
use crate::accel::SurfaceStatus;
use crate::accel::VaStatus;
use crate::accel::VideoAccelerator;
use crate::memory::FrameMemId;

/// Driver entry points at which a fault can be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    Begin,
    Execute,
    Sync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Transient busy, the call can be retried.
    Busy,
    /// The frame is decoded with errors.
    DecodeError,
    /// The device stops answering, for good.
    DeviceLost,
    /// Any other driver status.
    Status(VaStatus),
}

impl Fault {
    fn status(self) -> VaStatus {
        match self {
            Fault::Busy => VaStatus::SurfaceBusy,
            Fault::DecodeError => VaStatus::DecodingError,
            Fault::DeviceLost => VaStatus::HwBusy,
            Fault::Status(status) => status,
        }
    }
}

/// A copy of one buffer as it was handed to the driver.
#[derive(Clone, Debug)]
pub struct RecordedBuffer {
    pub ty: BufferType,
    pub index: u32,
    pub data: Vec<u8>,
    pub num_elements: u32,
}

/// One successful `render_picture` call.
#[derive(Clone, Debug)]
pub struct Submission {
    pub surface: SurfaceId,
    pub buffers: Vec<RecordedBuffer>,
}

impl Submission {
    /// Buffers of type `ty`, in submission order.
    pub fn buffers_of(&self, ty: BufferType) -> impl Iterator<Item = &RecordedBuffer> {
        self.buffers.iter().filter(move |b| b.ty == ty)
    }

    /// First buffer of type `ty`.
    pub fn buffer(&self, ty: BufferType) -> Option<&RecordedBuffer> {
        self.buffers_of(ty).next()
    }
}

#[derive(Default)]
struct Recorder {
    faults: VecDeque<(FaultPoint, Fault)>,
    current: Option<SurfaceId>,
    submissions: Vec<Submission>,
    /// Surfaces closed with `end_picture` and not yet synced.
    pending: BTreeMap<SurfaceId, Option<Fault>>,
    max_sizes: BTreeMap<BufferType, usize>,
    hasher: crc32fast::Hasher,
    begin_count: u64,
    end_count: u64,
    lost: bool,
}

impl Recorder {
    fn take_fault(&mut self, point: FaultPoint) -> Option<Fault> {
        let pos = self.faults.iter().position(|(p, _)| *p == point)?;
        self.faults.remove(pos).map(|(_, fault)| fault)
    }

    /// Consumes a fault for `point`, turning a device loss into a permanent condition.
    fn check(&mut self, point: FaultPoint) -> Result<(), VaStatus> {
        if self.lost {
            return Err(VaStatus::HwBusy);
        }

        match self.take_fault(point) {
            Some(Fault::DeviceLost) => {
                self.lost = true;
                Err(VaStatus::HwBusy)
            }
            Some(fault) => Err(fault.status()),
            None => Ok(()),
        }
    }

    fn complete(&mut self, surface: SurfaceId) -> Result<(), VaStatus> {
        if self.lost {
            return Err(VaStatus::HwBusy);
        }

        let injected = self.take_fault(FaultPoint::Sync);
        let recorded = self.pending.remove(&surface).flatten();

        match injected.or(recorded) {
            Some(Fault::DeviceLost) => {
                self.lost = true;
                Err(VaStatus::HwBusy)
            }
            Some(fault) => Err(fault.status()),
            None => Ok(()),
        }
    }
}

/// Software accelerator recording everything it is asked to do.
///
/// Clones share the same recording, so a test can keep one handle while the decoder owns
/// another.
#[derive(Clone, Default)]
pub struct RecordingAccelerator {
    state: Arc<Mutex<Recorder>>,
}

impl RecordingAccelerator {
    pub fn new() -> Self {
        Default::default()
    }

    fn state(&self) -> MutexGuard<'_, Recorder> {
        self.state.lock().unwrap()
    }

    /// Makes the next call reaching `point` fail with `fault`.
    pub fn inject(&self, point: FaultPoint, fault: Fault) {
        self.state().faults.push_back((point, fault));
    }

    /// Limits the size of buffers of type `ty`.
    pub fn set_max_buffer_size(&self, ty: BufferType, size: usize) {
        self.state().max_sizes.insert(ty, size);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn begin_count(&self) -> u64 {
        self.state().begin_count
    }

    pub fn end_count(&self) -> u64 {
        self.state().end_count
    }

    /// CRC32 of every byte submitted so far, in submission order.
    pub fn checksum(&self) -> u32 {
        self.state().hasher.clone().finalize()
    }

    pub fn is_lost(&self) -> bool {
        self.state().lost
    }
}

impl VideoAccelerator for RecordingAccelerator {
    fn surface_id(&self, id: FrameMemId) -> Option<SurfaceId> {
        u32::try_from(id.index()).ok()
    }

    fn begin_picture(&mut self, target: SurfaceId) -> Result<(), VaStatus> {
        let mut state = self.state();
        state.check(FaultPoint::Begin)?;

        if state.current.is_some() {
            return Err(VaStatus::InvalidContext);
        }

        state.current = Some(target);
        state.begin_count += 1;
        Ok(())
    }

    fn render_picture(&mut self, buffers: &[RenderBuffer<'_>]) -> Result<(), VaStatus> {
        let mut state = self.state();
        let surface = state.current.ok_or(VaStatus::InvalidContext)?;

        // A decode error shows up when the surface is synced, not on submission.
        if let Some(pos) = state
            .faults
            .iter()
            .position(|(p, f)| *p == FaultPoint::Execute && *f == Fault::DecodeError)
        {
            state.faults.remove(pos);
            state.pending.insert(surface, Some(Fault::DecodeError));
        } else {
            state.check(FaultPoint::Execute)?;
        }

        for b in buffers {
            if let Some(max) = state.max_sizes.get(&b.ty) {
                if b.data.len() > *max {
                    return Err(VaStatus::InvalidBuffer);
                }
            }
        }

        let recorded: Vec<_> = buffers
            .iter()
            .map(|b| RecordedBuffer {
                ty: b.ty,
                index: b.index,
                data: b.data.to_vec(),
                num_elements: b.num_elements,
            })
            .collect();

        for b in &recorded {
            state.hasher.update(&b.data);
        }

        debug!(
            "Recorded submission of {} buffers for surface {}",
            recorded.len(),
            surface
        );
        state.submissions.push(Submission {
            surface,
            buffers: recorded,
        });

        Ok(())
    }

    fn end_picture(&mut self) -> Result<(), VaStatus> {
        let mut state = self.state();
        let surface = state.current.take().ok_or(VaStatus::InvalidContext)?;
        state.pending.entry(surface).or_insert(None);
        state.end_count += 1;

        if state.lost {
            return Err(VaStatus::HwBusy);
        }

        Ok(())
    }

    fn sync_surface(&mut self, surface: SurfaceId, _timeout: Duration) -> Result<(), VaStatus> {
        self.state().complete(surface)
    }

    fn query_surface_status(&mut self, surface: SurfaceId) -> Result<SurfaceStatus, VaStatus> {
        self.state().complete(surface)?;
        Ok(SurfaceStatus::Ready)
    }

    fn max_buffer_size(&self, ty: BufferType) -> usize {
        self.state()
            .max_sizes
            .get(&ty)
            .copied()
            .unwrap_or(usize::MAX)
    }
}
