// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer.
//!
//! Frames are stored in an arena and chained in insertion order through [`FrameKey`] links, so
//! that removing a frame from the middle of the buffer never moves the others and keys held by
//! later frames stay valid. Reference marking lives in [`marking`].

pub mod marking;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::DpbCapacity;
use crate::frame::Corruption;
use crate::frame::DecodedFrame;
use crate::frame::DecoderFrame;
use crate::frame::FrameKey;
use crate::memory::AllocError;
use crate::memory::FrameMemId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("no short term reference with pic_num {0}")]
    MissingPicNum(i32),
    #[error("no long term reference with long_term_pic_num {0}")]
    MissingLongTermPicNum(i32),
    #[error("no reference with POC {0}")]
    MissingPoc(i32),
    #[error("no short term reference to evict, a long term one was dropped")]
    NoShortTermToEvict,
    #[error("stale frame key {0:?}")]
    StaleKey(FrameKey),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

pub type DpbResult<T> = Result<T, DpbError>;

#[derive(Default)]
struct Slot {
    generation: u32,
    frame: Option<DecoderFrame>,
}

/// Outcome of resolving the references of a picture against the DPB.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolvedReferences {
    /// Keys of the references found, in the order they were asked for.
    pub keys: Vec<FrameKey>,
    /// Picture order counts that are not in the DPB.
    pub missing: Vec<i32>,
    /// Corruption the picture inherits from its references.
    pub corruption: Corruption,
}

/// The decoded picture buffer of one view.
pub struct Dpb {
    slots: Vec<Slot>,
    head: Option<FrameKey>,
    tail: Option<FrameKey>,
    len: usize,
    capacity: DpbCapacity,
    view_id: u16,
    /// `MaxFrameNum` of the active H.264 sequence, 0 when frame numbers are not used.
    max_frame_num: i32,
    /// `MaxLongTermFrameIdx`, `None` standing for "no long-term frame indices".
    max_long_term_frame_idx: Option<i32>,
    num_errors: u64,
}

impl Dpb {
    pub fn new(capacity: DpbCapacity, view_id: u16) -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
            view_id,
            max_frame_num: 0,
            max_long_term_frame_idx: None,
            num_errors: 0,
        }
    }

    pub fn capacity(&self) -> DpbCapacity {
        self.capacity
    }

    /// Applies the limits of a new sequence. Frames already stored are kept.
    pub fn set_capacity(&mut self, capacity: DpbCapacity) {
        debug!("DPB of view {} limits set to {:?}", self.view_id, capacity);
        self.capacity = capacity;
    }

    pub fn set_max_frame_num(&mut self, max_frame_num: i32) {
        self.max_frame_num = max_frame_num;
    }

    pub fn view_id(&self) -> u16 {
        self.view_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of marking errors detected since the DPB was created.
    pub fn num_errors(&self) -> u64 {
        self.num_errors
    }

    /// Number of frames marked as used for reference.
    pub fn num_refs(&self) -> usize {
        self.iter().filter(|(_, f)| f.is_ref()).count()
    }

    /// Number of frames still waiting to be output.
    pub fn num_needed_for_output(&self) -> usize {
        self.iter().filter(|(_, f)| f.needed_for_output).count()
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity.max_num_pics
    }

    pub fn get(&self, key: FrameKey) -> Option<&DecoderFrame> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.frame.as_ref())
    }

    pub fn get_mut(&mut self, key: FrameKey) -> Option<&mut DecoderFrame> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.frame.as_mut())
    }

    fn frame_mut(&mut self, key: FrameKey) -> DpbResult<&mut DecoderFrame> {
        self.get_mut(key).ok_or(DpbError::StaleKey(key))
    }

    /// Appends `frame` at the end of the buffer.
    pub fn insert(&mut self, mut frame: DecoderFrame) -> FrameKey {
        let index = match self.slots.iter().position(|s| s.frame.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let key = FrameKey {
            index: index as u32,
            generation: self.slots[index].generation,
        };

        frame.prev = self.tail;
        frame.next = None;
        frame.view_id = self.view_id;

        if let Some(tail) = self.tail.and_then(|tail| self.get_mut(tail)) {
            tail.next = Some(key);
        } else {
            self.head = Some(key);
        }
        self.tail = Some(key);

        debug!(
            "Stored frame POC {} ({:?}) in the DPB of view {}, {} frames",
            frame.poc,
            frame.reference,
            self.view_id,
            self.len + 1
        );

        self.slots[index].frame = Some(frame);
        self.len += 1;

        key
    }

    /// Unlinks the frame behind `key` and hands it back. Dropping it releases its memory.
    pub fn remove(&mut self, key: FrameKey) -> Option<DecoderFrame> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)?;
        let frame = slot.frame.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        match frame.prev.and_then(|prev| self.get_mut(prev)) {
            Some(prev) => prev.next = frame.next,
            None => self.head = frame.next,
        }

        match frame.next.and_then(|next| self.get_mut(next)) {
            Some(next) => next.prev = frame.prev,
            None => self.tail = frame.prev,
        }

        self.len -= 1;
        debug!("Removed frame POC {} from the DPB of view {}", frame.poc, self.view_id);

        Some(frame)
    }

    /// Iterates over the frames in insertion order. Use `.rev()` for the reverse order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            dpb: self,
            front: self.head,
            back: self.tail,
            remaining: self.len,
        }
    }

    pub fn keys(&self) -> Vec<FrameKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Finds the reference frame with picture order count `poc`.
    pub fn find_ref_by_poc(&self, poc: i32) -> Option<FrameKey> {
        self.iter()
            .find(|(_, f)| f.is_ref() && f.poc == poc)
            .map(|(key, _)| key)
    }

    /// Finds the frame stored in the memory `id`.
    pub fn find_by_mem(&self, id: FrameMemId) -> Option<FrameKey> {
        self.iter()
            .find(|(_, f)| f.mem_id() == id)
            .map(|(key, _)| key)
    }

    /// Removes every frame that is neither a reference nor waiting for output.
    pub fn remove_unused(&mut self) {
        let unused: Vec<_> = self
            .iter()
            .filter(|(_, f)| !f.is_ref() && !f.needed_for_output)
            .map(|(key, _)| key)
            .collect();

        for key in unused {
            self.remove(key);
        }
    }

    /// Maps the picture order counts a picture predicts from to DPB keys.
    ///
    /// A missing reference, or one carrying a propagating corruption, flags the picture with
    /// [`Corruption::REFERENCE_FRAME`].
    pub fn resolve_references(&self, pocs: &[i32]) -> ResolvedReferences {
        let mut resolved = ResolvedReferences::default();

        for &poc in pocs {
            match self.find_ref_by_poc(poc) {
                Some(key) => {
                    if resolved.keys.contains(&key) {
                        continue;
                    }

                    if self.get(key).is_some_and(|f| f.corruption.propagates()) {
                        resolved.corruption |= Corruption::REFERENCE_FRAME;
                    }
                    resolved.keys.push(key);
                }
                None => {
                    warn!("Reference with POC {} is missing from the DPB", poc);
                    resolved.missing.push(poc);
                    resolved.corruption |= Corruption::REFERENCE_FRAME;
                }
            }
        }

        resolved
    }

    /// Records the completion of the frame stored in `id`.
    ///
    /// If the accelerator reported a propagating corruption, every frame that was predicted from
    /// this one, directly or not, is flagged as well.
    pub fn mark_decoded(&mut self, id: FrameMemId, corruption: Corruption) -> Option<FrameKey> {
        let key = self.find_by_mem(id)?;

        let frame = self.get_mut(key)?;
        frame.decoded = true;
        frame.corruption |= corruption;

        if corruption.propagates() {
            self.propagate_corruption(key);
        }

        Some(key)
    }

    /// Flags the frames depending on `key` with [`Corruption::REFERENCE_FRAME`].
    ///
    /// A frame can only reference frames inserted before it, so one forward pass reaches every
    /// dependant.
    pub fn propagate_corruption(&mut self, key: FrameKey) {
        let mut tainted = vec![key];
        let mut cursor = self.get(key).and_then(|f| f.next);

        while let Some(current) = cursor {
            let Some(frame) = self.get_mut(current) else {
                break;
            };

            if frame.references.iter().any(|r| tainted.contains(r)) {
                debug!("Frame POC {} inherits corruption of a reference", frame.poc);
                frame.corruption |= Corruption::REFERENCE_FRAME;
                tainted.push(current);
            }

            cursor = frame.next;
        }
    }

    /// The frame that would be output next: the lowest POC among frames awaiting output.
    fn next_output(&self) -> Option<(FrameKey, &DecoderFrame)> {
        self.iter()
            .filter(|(_, f)| f.needed_for_output)
            .min_by_key(|(_, f)| f.poc)
    }

    /// Releases the frame with the lowest POC for display.
    ///
    /// Returns `None` when nothing awaits output, or when the next frame in output order has not
    /// been decoded yet and `force` is not set.
    pub fn bump(&mut self, force: bool) -> DpbResult<Option<DecodedFrame>> {
        let Some((key, frame)) = self.next_output() else {
            return Ok(None);
        };

        if !frame.decoded && !force {
            debug!("Output blocked on POC {}, not decoded yet", frame.poc);
            return Ok(None);
        }

        if !frame.decoded {
            warn!("Releasing POC {} before its decode completed", frame.poc);
        }

        debug!("Bumping POC {} from the DPB of view {}", frame.poc, self.view_id);

        let poc = frame.poc;
        let frame_counter = frame.frame_counter;
        let corruption = frame.corruption;

        // A reference stays in the DPB, the caller gets its own reference on the memory.
        let memory = if frame.is_ref() {
            let memory = frame.memory.try_clone()?;
            self.frame_mut(key)?.needed_for_output = false;
            memory
        } else {
            self.remove(key).ok_or(DpbError::StaleKey(key))?.memory
        };

        Ok(Some(DecodedFrame {
            memory,
            poc,
            view_id: self.view_id,
            frame_counter,
            corruption,
        }))
    }

    /// Runs the output process: frames are released while more than `max_num_reorder` frames
    /// await output or the buffer is full.
    pub fn output_ready(&mut self) -> DpbResult<Vec<DecodedFrame>> {
        let mut out = Vec::new();

        loop {
            let waiting = self.num_needed_for_output();
            let must_bump =
                waiting > self.capacity.max_num_reorder || (self.is_full() && waiting > 0);
            if !must_bump {
                break;
            }

            match self.bump(false)? {
                Some(frame) => out.push(frame),
                None => break,
            }
        }

        Ok(out)
    }

    /// Releases every frame awaiting output, in POC order.
    pub fn drain(&mut self) -> DpbResult<Vec<DecodedFrame>> {
        debug!("Draining the DPB of view {}", self.view_id);

        let mut out = Vec::new();
        while let Some(frame) = self.bump(true)? {
            out.push(frame);
        }

        Ok(out)
    }

    /// Drops every frame, releasing their memory.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB of view {}", self.view_id);

        for key in self.keys() {
            self.remove(key);
        }
        self.max_long_term_frame_idx = None;
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frames: Vec<_> = self.iter().map(|(_, frame)| frame).collect();

        f.debug_struct("Dpb")
            .field("view_id", &self.view_id)
            .field("capacity", &self.capacity)
            .field("frames", &frames)
            .finish()
    }
}

/// Iterator over the frames of a [`Dpb`], following the links in either direction.
pub struct Iter<'a> {
    dpb: &'a Dpb,
    front: Option<FrameKey>,
    back: Option<FrameKey>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (FrameKey, &'a DecoderFrame);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let key = self.front?;
        let frame = self.dpb.get(key)?;
        self.front = frame.next;
        self.remaining -= 1;

        Some((key, frame))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let key = self.back?;
        let frame = self.dpb.get(key)?;
        self.back = frame.prev;
        self.remaining -= 1;

        Some((key, frame))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {}
