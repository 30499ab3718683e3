// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoding session.
//!
//! A [`Decoder`] receives parsed syntax through [`Decoder::decode`], one [`DecodeUnit`] at a time.
//! Slices accumulate in a frame descriptor of the [`task_store`] until the frame is complete, at
//! which point its references are resolved against the DPB of its view, reference marking is
//! applied, and the frame is handed to the packer for submission. Completed frames are released
//! for display in output order and retrieved with [`Decoder::next_frame`].

pub mod task_store;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::accel::AccelError;
use crate::accel::Accelerator;
use crate::accel::TaskStatus;
use crate::accel::VideoAccelerator;
use crate::codec::DpbCapacity;
use crate::codec::PictureParams;
use crate::codec::SequenceParams;
use crate::codec::SliceSyntax;
use crate::config::DecoderConfig;
use crate::decoder::task_store::TaskStore;
use crate::decoder::task_store::TaskStoreError;
use crate::decoder::task_store::TaskStoreStats;
use crate::dpb::marking::ReferenceMarking;
use crate::dpb::Dpb;
use crate::dpb::DpbError;
use crate::frame::Corruption;
use crate::frame::DecodedFrame;
use crate::frame::DecoderFrame;
use crate::frame::Field;
use crate::frame::FrameKey;
use crate::memory::AllocError;
use crate::memory::FrameAllocator;
use crate::memory::FrameMemId;
use crate::memory::FrameRef;
use crate::packer::protected::SliceEncryption;
use crate::packer::FrameContext;
use crate::packer::FrameSubmission;
use crate::packer::PackError;
use crate::packer::Packer;
use crate::packer::RefPicture;
use crate::Codec;

/// Status codes reported to the client of the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderStatus {
    Ok,
    NotEnoughData,
    DeviceFailed,
    /// The accelerator hung or vanished, the session cannot continue.
    DeviceLost,
    Unsupported,
    InvalidParams,
    AllocationFailed,
}

/// Picture-level syntax shared by all the slices of a picture.
#[derive(Clone, Debug)]
pub struct PictureHeader {
    pub params: PictureParams,
    /// Picture order count.
    pub poc: i32,
    pub view_id: u16,
    pub field: Field,
    /// `frame_num` of H.264 pictures, used by reference marking.
    pub frame_num: i32,
    pub marking: ReferenceMarking,
    /// Picture order counts of the pictures this one is predicted from.
    pub references: Vec<i32>,
    /// The picture carries no coded data and repeats its first reference.
    pub skipped: bool,
}

impl PictureHeader {
    pub fn new(params: PictureParams, poc: i32) -> Self {
        Self {
            params,
            poc,
            view_id: 0,
            field: Field::Frame,
            frame_num: 0,
            marking: Default::default(),
            references: Vec::new(),
            skipped: false,
        }
    }
}

/// One slice of a picture, with its compressed payload.
#[derive(Clone, Debug)]
pub struct Slice {
    pub picture: Arc<PictureHeader>,
    pub header: SliceSyntax,
    pub payload: Bytes,
    /// Present if the payload is encrypted.
    pub encryption: Option<SliceEncryption>,
}

impl Slice {
    pub fn new(picture: Arc<PictureHeader>, header: SliceSyntax, payload: impl Into<Bytes>) -> Self {
        Self {
            picture,
            header,
            payload: payload.into(),
            encryption: None,
        }
    }
}

/// Input of [`Decoder::decode`].
#[derive(Clone, Debug)]
pub enum DecodeUnit {
    /// A slice. A slice of another picture than the current one closes the current frame.
    Slice(Slice),
    /// Starts a new picture, closing the current frame. Skipped pictures are complete as is.
    Picture(Arc<PictureHeader>),
    /// Closes the current frame.
    FrameComplete,
    /// Closes the current frame and releases every pending frame.
    EndOfStream,
}

/// Outcome of [`Decoder::decode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The unit was accumulated into the current frame.
    NeedMoreData,
    /// A frame was closed and queued for decoding.
    FrameQueued { frame_counter: u64 },
    /// Every frame has been decoded and released.
    Drained,
}

/// Instructs the decoder on whether it should block on the decode operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl Default for BlockingMode {
    fn default() -> Self {
        Self::Blocking
    }
}

/// A queue where decoded frames wait until they are retrieved by the client.
struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The accelerator is busy. The frame is kept and [`Decoder::submit_pending`] retries it.
    #[error("accelerator busy, submission to be retried")]
    Busy,
    #[error("accelerator device lost")]
    DeviceLost,
    #[error("no sequence parameters set")]
    NoSequence,
    #[error("frame {0} did not complete within the sync timeout")]
    SyncTimeout(u64),
    #[error("{0:?} syntax handed to a {1:?} decoder")]
    CodecMismatch(Codec, Codec),
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Pack(PackError),
    #[error(transparent)]
    TaskStore(TaskStoreError),
    #[error(transparent)]
    Accel(AccelError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PackError> for DecodeError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::Accel(e) => e.into(),
            e => DecodeError::Pack(e),
        }
    }
}

impl From<AccelError> for DecodeError {
    fn from(e: AccelError) -> Self {
        match e {
            AccelError::Busy => DecodeError::Busy,
            AccelError::DeviceLost => DecodeError::DeviceLost,
            e => DecodeError::Accel(e),
        }
    }
}

impl From<TaskStoreError> for DecodeError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::Alloc(e) => DecodeError::Alloc(e),
            e => DecodeError::TaskStore(e),
        }
    }
}

impl DecodeError {
    pub fn status(&self) -> DecoderStatus {
        match self {
            DecodeError::Busy | DecodeError::SyncTimeout(_) => DecoderStatus::DeviceFailed,
            DecodeError::DeviceLost => DecoderStatus::DeviceLost,
            DecodeError::NoSequence => DecoderStatus::NotEnoughData,
            DecodeError::CodecMismatch(..) | DecodeError::Dpb(_) => DecoderStatus::InvalidParams,
            DecodeError::Alloc(_) => DecoderStatus::AllocationFailed,
            DecodeError::Pack(e) => e.status(),
            DecodeError::TaskStore(TaskStoreError::NoFreeDescriptor) => {
                DecoderStatus::AllocationFailed
            }
            DecodeError::TaskStore(TaskStoreError::Incomplete(_)) => DecoderStatus::NotEnoughData,
            DecodeError::TaskStore(_) => DecoderStatus::InvalidParams,
            DecodeError::Accel(e) => e.status(),
            DecodeError::Other(_) => DecoderStatus::DeviceFailed,
        }
    }
}

/// Counters of a decoding session, as returned by [`Decoder::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_submitted: u64,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub frames_output: u64,
    pub corrupted_frames_output: u64,
    pub hardware_rounds: u64,
    pub slices_skipped: u64,
    /// Reference marking failures, over all views.
    pub dpb_errors: u64,
    pub task_store: TaskStoreStats,
}

/// A frame whose submission has not completed yet.
struct PendingFrame {
    index: usize,
    frame_counter: u64,
    view_id: u16,
    key: FrameKey,
    submission: FrameSubmission,
}

/// A frame submitted to the accelerator, waiting for its completion status.
struct InFlight {
    index: usize,
    frame_counter: u64,
    view_id: u16,
    mem: FrameMemId,
    /// Set when the submission failed, the frame completes with these flags without a sync.
    failed: Option<Corruption>,
}

fn ref_picture(frame: &DecoderFrame) -> RefPicture {
    RefPicture {
        mem: frame.mem_id(),
        poc: frame.poc,
        frame_num: frame.frame_num,
        long_term_frame_idx: frame.long_term_frame_idx,
        reference: frame.reference,
        field: frame.field,
    }
}

/// Stores `frame` in `dpb`. Marking failures are not fatal: the frame is stored anyway and
/// flagged, the returned boolean tells whether that happened.
fn store_frame(dpb: &mut Dpb, frame: DecoderFrame, marking: &ReferenceMarking) -> (FrameKey, bool) {
    match dpb.update_reference_marking(frame, marking) {
        Ok(key) => (key, false),
        Err(e) => {
            warn!("{}", e);
            (e.key, true)
        }
    }
}

pub struct Decoder {
    config: DecoderConfig,
    accel: Accelerator,
    packer: Box<dyn Packer>,
    store: Arc<TaskStore>,
    sequence: Option<SequenceParams>,
    capacity: DpbCapacity,
    /// One DPB per view.
    views: BTreeMap<u16, Dpb>,
    /// Descriptor accumulating the slices of the current picture.
    current: Option<usize>,
    pending: Option<PendingFrame>,
    /// Submitted frames, in decode order.
    in_flight: VecDeque<InFlight>,
    ready_queue: ReadyFramesQueue<DecodedFrame>,
    /// Set once the device is lost, every later call fails.
    lost: bool,
    stats: DecoderStats,
}

impl Decoder {
    pub fn new(
        config: DecoderConfig,
        driver: Box<dyn VideoAccelerator>,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;

        let packer = crate::packer::create(&config.packer_caps())?;
        let store = Arc::new(TaskStore::new(allocator, config.pool_size));
        store.set_reorder_delay(config.reorder_delay);

        debug!("Created {:?} decoder: {:?}", config.codec, config);

        Ok(Self {
            config,
            accel: Accelerator::new(driver),
            packer,
            store,
            sequence: None,
            capacity: Default::default(),
            views: BTreeMap::new(),
            current: None,
            pending: None,
            in_flight: VecDeque::new(),
            ready_queue: Default::default(),
            lost: false,
            stats: Default::default(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The task store, shareable with a thread reclaiming frames.
    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn dpb(&self, view_id: u16) -> Option<&Dpb> {
        self.views.get(&view_id)
    }

    /// Number of decoded frames waiting to be retrieved with [`Decoder::next_frame`].
    pub fn num_ready_frames(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            dpb_errors: self.views.values().map(Dpb::num_errors).sum(),
            task_store: self.store.stats(),
            ..self.stats
        }
    }

    fn check_alive(&self) -> Result<(), DecodeError> {
        if self.lost {
            return Err(DecodeError::DeviceLost);
        }

        Ok(())
    }

    fn check_codec(&self, codec: Codec) -> Result<(), DecodeError> {
        if codec != self.config.codec {
            return Err(DecodeError::CodecMismatch(codec, self.config.codec));
        }

        Ok(())
    }

    /// Activates a new sequence.
    ///
    /// The DPB limits are recomputed from `params`. If the coded resolution changes, every frame
    /// of the previous sequence is decoded and released first.
    pub fn set_sequence(&mut self, params: SequenceParams) -> Result<(), DecodeError> {
        self.check_alive()?;
        self.check_codec(params.codec())?;

        let resolution = params.coded_resolution();
        if let Some(previous) = &self.sequence {
            if previous.coded_resolution() != resolution {
                debug!(
                    "Coded resolution changes from {:?} to {:?}, flushing",
                    previous.coded_resolution(),
                    resolution
                );
                self.flush()?;
            }
        }

        let capacity = params.dpb_capacity();
        let max_frame_num = match &params {
            SequenceParams::H264(sps) => sps.max_frame_num(),
            _ => 0,
        };

        debug!("New sequence {:?}, DPB limits {:?}", resolution, capacity);

        for dpb in self.views.values_mut() {
            dpb.set_capacity(capacity);
            dpb.set_max_frame_num(max_frame_num);
        }

        self.capacity = capacity;
        self.sequence = Some(params);

        Ok(())
    }

    /// The DPB of `view_id`, created on first use.
    fn view(&mut self, view_id: u16) -> &mut Dpb {
        let capacity = self.capacity;
        let max_frame_num = match &self.sequence {
            Some(SequenceParams::H264(sps)) => sps.max_frame_num(),
            _ => 0,
        };

        self.views.entry(view_id).or_insert_with(|| {
            let mut dpb = Dpb::new(capacity, view_id);
            dpb.set_max_frame_num(max_frame_num);
            dpb
        })
    }

    /// Feeds one unit of parsed syntax to the decoder.
    ///
    /// On error the unit has not been consumed. After [`DecodeError::Busy`], call
    /// [`Decoder::submit_pending`] until it succeeds, then submit the unit again.
    ///
    /// Once a frame has been queued the unit is consumed: a failure to collect the status of
    /// the frames in flight is only logged, and the next [`Decoder::poll`] reports it again.
    pub fn decode(&mut self, unit: DecodeUnit) -> Result<DecodeStatus, DecodeError> {
        self.check_alive()?;
        self.submit_pending()?;

        let status = match unit {
            DecodeUnit::Slice(slice) => self.decode_slice(slice)?,
            DecodeUnit::Picture(picture) => self.decode_picture(picture)?,
            DecodeUnit::FrameComplete => self.complete_current()?,
            DecodeUnit::EndOfStream => {
                self.flush()?;
                return Ok(DecodeStatus::Drained);
            }
        };

        if let DecodeStatus::FrameQueued { .. } = status {
            if let Err(e) = self.poll(self.config.blocking_mode) {
                warn!("Frames in flight left for the next poll: {}", e);
            }
        }

        Ok(status)
    }

    fn is_current_picture(&self, picture: &Arc<PictureHeader>) -> Result<bool, DecodeError> {
        let Some(index) = self.current else {
            return Ok(false);
        };

        Ok(self.store.with_descriptor(index, |d| {
            d.picture().map_or(true, |p| Arc::ptr_eq(p, picture))
        })?)
    }

    fn decode_slice(&mut self, slice: Slice) -> Result<DecodeStatus, DecodeError> {
        self.check_codec(slice.picture.params.codec())?;

        let mut status = DecodeStatus::NeedMoreData;
        if self.current.is_some() && !self.is_current_picture(&slice.picture)? {
            status = self.complete_current()?;
        }

        let index = match self.current {
            Some(index) => index,
            None => self.start_frame()?,
        };
        self.store.append_slice(index, slice)?;

        Ok(status)
    }

    fn decode_picture(&mut self, picture: Arc<PictureHeader>) -> Result<DecodeStatus, DecodeError> {
        self.check_codec(picture.params.codec())?;

        let mut status = DecodeStatus::NeedMoreData;
        if self.current.is_some() {
            if self.is_current_picture(&picture)? {
                return Ok(status);
            }
            status = self.complete_current()?;
        }

        let index = self.start_frame()?;
        self.store.set_picture(index, Arc::clone(&picture))?;

        if picture.skipped {
            status = self.complete_current()?;
        }

        Ok(status)
    }

    /// Acquires a descriptor for a new frame, waiting for frames in flight if none is free.
    fn start_frame(&mut self) -> Result<usize, DecodeError> {
        let info = self
            .sequence
            .as_ref()
            .ok_or(DecodeError::NoSequence)?
            .frame_info();

        let index = match self.store.acquire_next_free(&info) {
            Err(TaskStoreError::NoFreeDescriptor) => {
                debug!("No free descriptor, waiting for frames in flight");
                self.poll(BlockingMode::Blocking)?;
                self.store.acquire_next_free(&info)?
            }
            res => res?,
        };

        self.current = Some(index);
        Ok(index)
    }

    /// Closes the frame being loaded, if any.
    fn complete_current(&mut self) -> Result<DecodeStatus, DecodeError> {
        let Some(index) = self.current.take() else {
            return Ok(DecodeStatus::NeedMoreData);
        };

        let frame_counter = self.finish_frame(index)?;
        Ok(DecodeStatus::FrameQueued { frame_counter })
    }

    fn finish_frame(&mut self, index: usize) -> Result<u64, DecodeError> {
        if let Err(e) = self.store.mark_ready_to_process(index) {
            warn!("Dropping incomplete frame of descriptor {}: {}", index, e);
            self.store.abort(index)?;
            return Err(e.into());
        }

        let (picture, frame_counter, memory, slices) = self.store.with_descriptor(index, |d| {
            (
                d.picture().cloned(),
                d.frame_counter(),
                d.memory().map(FrameRef::try_clone),
                d.slices().to_vec(),
            )
        })?;
        let picture = picture.ok_or(TaskStoreError::Incomplete(index))?;
        let memory = memory.ok_or(TaskStoreError::Incomplete(index))??;

        if picture.skipped {
            self.finish_skipped(index, frame_counter, picture, memory)?;
        } else {
            self.finish_coded(index, frame_counter, picture, memory, slices)?;
        }

        Ok(frame_counter)
    }

    /// Stores a skipped picture as a repeat of its first reference, without any submission.
    fn finish_skipped(
        &mut self,
        index: usize,
        frame_counter: u64,
        picture: Arc<PictureHeader>,
        memory: FrameRef,
    ) -> Result<(), DecodeError> {
        let dpb = self.view(picture.view_id);

        let repeated = picture
            .references
            .first()
            .and_then(|poc| dpb.find_ref_by_poc(*poc))
            .and_then(|key| dpb.get(key).map(|f| (key, f)));

        let (memory, dependency, mut corruption, references) = match repeated {
            Some((key, frame)) => {
                let corruption = if frame.corruption.propagates() {
                    Corruption::REFERENCE_FRAME
                } else {
                    Corruption::NONE
                };
                (
                    frame.memory.try_clone()?,
                    Some(frame.frame_counter),
                    corruption,
                    vec![key],
                )
            }
            None => {
                warn!(
                    "Skipped picture POC {} has no reference to repeat",
                    picture.poc
                );
                (memory, None, Corruption::REFERENCE_FRAME, vec![])
            }
        };

        let mut frame = DecoderFrame::new(memory, picture.poc, frame_counter);
        frame.frame_num = picture.frame_num;
        frame.field = picture.field;
        frame.corruption = corruption;
        frame.references = references;
        frame.decoded = true;

        let (_, marking_failed) = store_frame(dpb, frame, &picture.marking);
        let output = dpb.output_ready()?;
        self.ready_queue.extend(output);

        if marking_failed {
            corruption |= Corruption::DPB;
        }
        self.store.add_corruption(index, corruption)?;
        self.store.mark_skipped(index, dependency)?;
        self.stats.frames_skipped += 1;

        self.reclaim();
        Ok(())
    }

    /// Resolves the references of a coded picture, stores it in the DPB and submits it.
    fn finish_coded(
        &mut self,
        index: usize,
        frame_counter: u64,
        picture: Arc<PictureHeader>,
        memory: FrameRef,
        slices: Vec<Slice>,
    ) -> Result<(), DecodeError> {
        let codec = self.config.codec;
        let view_id = picture.view_id;
        let dpb = self.view(view_id);

        let resolved = dpb.resolve_references(&picture.references);

        // H.264 describes the whole DPB as it was before the marking of the current picture.
        let refs: Vec<_> = match codec {
            Codec::H264 => dpb
                .iter()
                .filter(|(_, f)| f.is_ref())
                .map(|(_, f)| ref_picture(f))
                .collect(),
            Codec::H265 | Codec::Vc1 => resolved
                .keys
                .iter()
                .filter_map(|key| dpb.get(*key))
                .map(ref_picture)
                .collect(),
        };

        let target = memory.id();
        let mut frame = DecoderFrame::new(memory, picture.poc, frame_counter);
        frame.frame_num = picture.frame_num;
        frame.field = picture.field;
        frame.corruption = resolved.corruption;
        frame.references = resolved.keys;

        let (key, marking_failed) = store_frame(dpb, frame, &picture.marking);

        let mut corruption = resolved.corruption;
        if marking_failed {
            corruption |= Corruption::DPB;
        }
        self.store.add_corruption(index, corruption)?;

        let frame = FrameContext {
            target,
            picture,
            slices,
            refs,
        };

        self.pending = Some(PendingFrame {
            index,
            frame_counter,
            view_id,
            key,
            submission: FrameSubmission::new(frame, self.config.slice_data_capacity),
        });

        self.submit_pending()
    }

    /// Submits the frame left pending by a busy accelerator, if any.
    pub fn submit_pending(&mut self) -> Result<(), DecodeError> {
        self.check_alive()?;

        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };

        match pending
            .submission
            .run(&mut self.accel, self.packer.as_mut())
        {
            Ok(()) => {
                let frame = pending.submission.frame();
                let refs: Vec<_> = frame.refs.iter().map(|r| r.mem).collect();
                self.store.mark_busy(pending.index, &refs)?;

                debug!(
                    "Frame {} submitted in {} rounds",
                    pending.frame_counter,
                    pending.submission.rounds()
                );

                self.stats.frames_submitted += 1;
                self.stats.hardware_rounds += pending.submission.rounds() as u64;
                self.stats.slices_skipped += pending.submission.skipped_slices() as u64;

                self.in_flight.push_back(InFlight {
                    index: pending.index,
                    frame_counter: pending.frame_counter,
                    view_id: pending.view_id,
                    mem: frame.target,
                    failed: None,
                });

                Ok(())
            }
            Err(PackError::Accel(AccelError::Busy)) => {
                debug!(
                    "Accelerator busy, frame {} kept for a retry",
                    pending.frame_counter
                );
                self.pending = Some(pending);
                Err(DecodeError::Busy)
            }
            Err(PackError::Accel(AccelError::Va(status))) => {
                warn!(
                    "Submission of frame {} failed with {:?}, delivering it corrupted",
                    pending.frame_counter, status
                );
                self.fail_frame(pending)
            }
            Err(e) => {
                if let PackError::Accel(AccelError::DeviceLost) = e {
                    error!("Device lost while submitting frame {}", pending.frame_counter);
                    self.lost = true;
                } else {
                    warn!("Submission of frame {} failed: {}", pending.frame_counter, e);
                }

                self.abort_frame(&pending);
                Err(e.into())
            }
        }
    }

    /// Queues a frame the driver refused as completed with a device failure.
    fn fail_frame(&mut self, pending: PendingFrame) -> Result<(), DecodeError> {
        if pending.submission.is_started() {
            if let Err(e) = self.packer.end_frame(&mut self.accel) {
                warn!("Failed to end frame {}: {}", pending.frame_counter, e);
            }
        }

        let frame = pending.submission.frame();
        let refs: Vec<_> = frame.refs.iter().map(|r| r.mem).collect();
        self.store.mark_busy(pending.index, &refs)?;

        self.stats.hardware_rounds += pending.submission.rounds() as u64;
        self.in_flight.push_back(InFlight {
            index: pending.index,
            frame_counter: pending.frame_counter,
            view_id: pending.view_id,
            mem: frame.target,
            failed: Some(Corruption::MAJOR | Corruption::DEVICE_FAILURE),
        });

        Ok(())
    }

    /// Drops a frame whose submission failed for good.
    fn abort_frame(&mut self, pending: &PendingFrame) {
        if pending.submission.is_started() {
            if let Err(e) = self.packer.end_frame(&mut self.accel) {
                warn!("Failed to end aborted frame {}: {}", pending.frame_counter, e);
            }
        }

        if let Some(dpb) = self.views.get_mut(&pending.view_id) {
            dpb.remove(pending.key);
        }

        if let Err(e) = self.store.abort(pending.index) {
            warn!("Failed to abort descriptor {}: {}", pending.index, e);
        }

        self.reclaim();
    }

    /// Collects the completion status of the frames in flight, in decode order.
    ///
    /// In blocking mode every frame in flight is waited for, up to the sync timeout each. Frames
    /// released by the DPB become available through [`Decoder::next_frame`]. Returns the number
    /// of frames completed.
    pub fn poll(&mut self, mode: BlockingMode) -> Result<usize, DecodeError> {
        self.check_alive()?;

        let mut completed = 0;

        while let Some(task) = self.in_flight.front() {
            let status = match (task.failed, mode) {
                (Some(corruption), _) => Ok(TaskStatus::DoneWithError(corruption)),
                (None, BlockingMode::Blocking) => {
                    self.accel.sync_task(task.mem, self.config.sync_timeout)
                }
                (None, BlockingMode::NonBlocking) => self.accel.query_task_status(task.mem),
            };

            let corruption = match status {
                Ok(TaskStatus::Pending) => match mode {
                    BlockingMode::Blocking => {
                        return Err(DecodeError::SyncTimeout(task.frame_counter))
                    }
                    BlockingMode::NonBlocking => break,
                },
                Ok(TaskStatus::Done) => Corruption::NONE,
                Ok(TaskStatus::DoneWithError(corruption)) => {
                    warn!("Frame {} decoded with errors", task.frame_counter);
                    corruption
                }
                Err(AccelError::Busy) => break,
                Err(AccelError::DeviceLost) => {
                    error!("Device lost while waiting for frame {}", task.frame_counter);
                    self.lost = true;
                    return Err(DecodeError::DeviceLost);
                }
                Err(e) => {
                    warn!("No status for frame {}: {}", task.frame_counter, e);
                    Corruption::DEVICE_FAILURE | Corruption::MAJOR
                }
            };

            if let Some(task) = self.in_flight.pop_front() {
                self.complete(task, corruption)?;
                completed += 1;
            }
        }

        self.output()?;
        self.reclaim();

        Ok(completed)
    }

    fn complete(&mut self, task: InFlight, corruption: Corruption) -> Result<(), DecodeError> {
        self.store.mark_ready_to_display(task.index, corruption)?;

        if let Some(dpb) = self.views.get_mut(&task.view_id) {
            dpb.mark_decoded(task.mem, corruption);
        }

        self.stats.frames_decoded += 1;
        Ok(())
    }

    /// Runs the output process of every view.
    fn output(&mut self) -> Result<(), DecodeError> {
        for dpb in self.views.values_mut() {
            let frames = dpb.output_ready()?;
            self.ready_queue.extend(frames);
        }

        Ok(())
    }

    fn reclaim(&mut self) {
        while let Some(frame_counter) = self.store.reclaim_if_in_order() {
            debug!("Frame {} reclaimed", frame_counter);
        }
    }

    /// Returns the next frame in output order, if any.
    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        let frame = (&mut self.ready_queue).next()?;

        self.stats.frames_output += 1;
        if !frame.corruption.is_empty() {
            self.stats.corrupted_frames_output += 1;
        }

        Some(frame)
    }

    /// Decodes every frame received so far and releases all of them for display.
    ///
    /// Reference frames stay in the DPB so decoding can continue afterwards.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        self.check_alive()?;

        match self.complete_current() {
            Err(DecodeError::TaskStore(TaskStoreError::Incomplete(_))) => (),
            res => {
                res?;
            }
        }

        self.submit_pending()?;

        while let Some(frame_counter) = self.in_flight.front().map(|t| t.frame_counter) {
            if self.poll(BlockingMode::Blocking)? == 0 {
                return Err(DecodeError::SyncTimeout(frame_counter));
            }
        }

        for dpb in self.views.values_mut() {
            let frames = dpb.drain()?;
            self.ready_queue.extend(frames);
        }

        self.store.set_draining(true);
        self.reclaim();
        self.store.set_draining(false);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::accel::VaStatus;
    use crate::backend::dummy::Fault;
    use crate::backend::dummy::FaultPoint;
    use crate::backend::dummy::RecordingAccelerator;
    use crate::codec::vc1;
    use crate::codec::vc1::PictureType;
    use crate::memory::SlotTable;

    fn vc1_decoder(recorder: &RecordingAccelerator) -> Decoder {
        let mut decoder = Decoder::new(
            DecoderConfig::new(Codec::Vc1).pool_size(4),
            Box::new(recorder.clone()),
            SlotTable::shared(8),
        )
        .unwrap();

        decoder
            .set_sequence(SequenceParams::Vc1(Arc::new(vc1::SequenceHeader {
                profile: vc1::Profile::Main,
                coded_width: 64,
                coded_height: 64,
                ..Default::default()
            })))
            .unwrap();

        decoder
    }

    fn vc1_picture(ptype: PictureType, poc: i32, references: Vec<i32>) -> Arc<PictureHeader> {
        let params = vc1::PictureParams {
            header: vc1::PictureHeader {
                ptype,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut picture = PictureHeader::new(PictureParams::Vc1(params), poc);
        picture.marking = if ptype.is_reference() {
            ReferenceMarking::SlidingWindow
        } else {
            ReferenceMarking::NonReference
        };
        picture.skipped = ptype == PictureType::Skipped;
        picture.references = references;
        Arc::new(picture)
    }

    fn vc1_slice(picture: &Arc<PictureHeader>) -> DecodeUnit {
        DecodeUnit::Slice(Slice::new(
            Arc::clone(picture),
            SliceSyntax::Vc1(Default::default()),
            vec![0x5a; 64],
        ))
    }

    #[test]
    fn slices_need_a_sequence() {
        let mut decoder = Decoder::new(
            DecoderConfig::new(Codec::Vc1),
            Box::new(RecordingAccelerator::new()),
            SlotTable::shared(8),
        )
        .unwrap();

        let picture = vc1_picture(PictureType::I, 0, vec![]);
        assert!(matches!(
            decoder.decode(vc1_slice(&picture)),
            Err(DecodeError::NoSequence)
        ));
    }

    #[test]
    fn codec_mismatch() {
        let recorder = RecordingAccelerator::new();
        let mut decoder = vc1_decoder(&recorder);

        let picture = Arc::new(PictureHeader::new(
            PictureParams::H265(Default::default()),
            0,
        ));
        let err = decoder.decode(DecodeUnit::Picture(picture)).unwrap_err();
        assert!(matches!(err, DecodeError::CodecMismatch(Codec::H265, Codec::Vc1)));
        assert_eq!(err.status(), DecoderStatus::InvalidParams);
    }

    #[test]
    fn skipped_picture_repeats_its_reference() {
        let recorder = RecordingAccelerator::new();
        let mut decoder = vc1_decoder(&recorder);

        let i = vc1_picture(PictureType::I, 0, vec![]);
        decoder.decode(vc1_slice(&i)).unwrap();
        decoder.decode(DecodeUnit::FrameComplete).unwrap();

        let skipped = vc1_picture(PictureType::Skipped, 1, vec![0]);
        assert_eq!(
            decoder.decode(DecodeUnit::Picture(skipped)).unwrap(),
            DecodeStatus::FrameQueued { frame_counter: 2 }
        );
        decoder.flush().unwrap();

        // Only the intra picture reached the accelerator.
        assert_eq!(recorder.submissions().len(), 1);

        let first = decoder.next_frame().unwrap();
        let second = decoder.next_frame().unwrap();
        assert_eq!((first.poc, second.poc), (0, 1));
        assert_eq!(first.mem_id(), second.mem_id());
        assert!(second.corruption.is_empty());

        let stats = decoder.stats();
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.task_store.free, 4);
    }

    #[test]
    fn device_lost_poisons_the_session() {
        let recorder = RecordingAccelerator::new();
        let mut decoder = vc1_decoder(&recorder);
        recorder.inject(FaultPoint::Execute, Fault::DeviceLost);

        let i = vc1_picture(PictureType::I, 0, vec![]);
        decoder.decode(vc1_slice(&i)).unwrap();
        let err = decoder.decode(DecodeUnit::FrameComplete).unwrap_err();
        assert!(matches!(err, DecodeError::DeviceLost));
        assert_eq!(err.status(), DecoderStatus::DeviceLost);

        // The descriptor was returned to the pool.
        assert_eq!(decoder.task_store().stats().aborted, 1);
        assert!(decoder.dpb(0).unwrap().is_empty());

        let p = vc1_picture(PictureType::P, 1, vec![0]);
        assert!(matches!(
            decoder.decode(vc1_slice(&p)),
            Err(DecodeError::DeviceLost)
        ));
        assert!(matches!(decoder.flush(), Err(DecodeError::DeviceLost)));
    }

    #[test]
    fn decode_error_flags_the_frame() {
        let recorder = RecordingAccelerator::new();
        let mut decoder = vc1_decoder(&recorder);
        recorder.inject(FaultPoint::Execute, Fault::DecodeError);

        let i = vc1_picture(PictureType::I, 0, vec![]);
        decoder.decode(vc1_slice(&i)).unwrap();
        let p = vc1_picture(PictureType::P, 1, vec![0]);
        decoder.decode(vc1_slice(&p)).unwrap();
        decoder.decode(DecodeUnit::EndOfStream).unwrap();

        let i = decoder.next_frame().unwrap();
        assert!(i.corruption.contains(Corruption::MAJOR));
        let p = decoder.next_frame().unwrap();
        assert!(p.corruption.contains(Corruption::REFERENCE_FRAME));
        assert_eq!(decoder.stats().corrupted_frames_output, 2);
    }

    #[test]
    fn sync_timeout_keeps_the_frame_queued() {
        let recorder = RecordingAccelerator::new();
        let mut decoder = vc1_decoder(&recorder);
        recorder.inject(FaultPoint::Sync, Fault::Status(VaStatus::Timedout));

        let i = vc1_picture(PictureType::I, 0, vec![]);
        decoder.decode(vc1_slice(&i)).unwrap();
        assert_eq!(
            decoder.decode(DecodeUnit::FrameComplete).unwrap(),
            DecodeStatus::FrameQueued { frame_counter: 1 }
        );

        // The frame is still in flight, nothing was output and nothing needs resubmitting.
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.task_store().stats().busy, 1);

        assert_eq!(decoder.poll(BlockingMode::Blocking).unwrap(), 1);
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.frame_counter, 1);
        assert!(frame.corruption.is_empty());
        assert_eq!(recorder.submissions().len(), 1);
        assert_eq!(decoder.task_store().stats().free, 4);
    }
}
