// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A fixed pool of frame descriptors tracking every coded frame from the first slice to display.
//!
//! Descriptors are created once and recycled for the whole session. A descriptor moves through
//!
//! ```text
//! Free -> Loading -> ReadyToProcess -> Busy -> ReadyToDisplay -> Free
//!            |              |
//!            +--------------+-> Skipped -> Free
//! ```
//!
//! and is only returned to `Free` in decode order, once the frames that follow it have been
//! acquired (see [`TaskStore::set_reorder_delay`]). Scans of the pool take the pool lock, each
//! descriptor has its own mutex, and no lock is held across an accelerator call.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use thiserror::Error;

use crate::decoder::PictureHeader;
use crate::decoder::Slice;
use crate::frame::Corruption;
use crate::memory::AllocError;
use crate::memory::FrameAllocator;
use crate::memory::FrameInfo;
use crate::memory::FrameLock;
use crate::memory::FrameMemId;
use crate::memory::FrameRef;

/// Lifecycle state of a [`FrameDescriptor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorState {
    Free,
    /// Slices are being accumulated.
    Loading,
    /// The frame is complete and waits for submission.
    ReadyToProcess,
    /// Submitted to the accelerator.
    Busy,
    /// Decoded, waiting to be reclaimed.
    ReadyToDisplay,
    /// Never submitted, the frame repeats the one it depends on.
    Skipped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("no free frame descriptor")]
    NoFreeDescriptor,
    #[error("descriptor {index} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        index: usize,
        from: DescriptorState,
        to: DescriptorState,
    },
    #[error("descriptor {0} does not hold a complete frame")]
    Incomplete(usize),
    #[error("no descriptor {0}")]
    InvalidIndex(usize),
    #[error("slice belongs to another picture than descriptor {0}")]
    PictureMismatch(usize),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// One in-flight coded frame.
pub struct FrameDescriptor {
    index: usize,
    frame_counter: u64,
    state: DescriptorState,
    picture: Option<Arc<PictureHeader>>,
    slices: Vec<Slice>,
    memory: Option<FrameRef>,
    /// Pin on `memory` while the accelerator may write to it.
    lock: Option<FrameLock>,
    /// References held on the frames this one is predicted from.
    references: Vec<FrameRef>,
    corruption: Corruption,
    /// Frame counter of the frame a skipped frame repeats.
    dependency: Option<u64>,
}

impl FrameDescriptor {
    fn new(index: usize) -> Self {
        Self {
            index,
            frame_counter: 0,
            state: DescriptorState::Free,
            picture: None,
            slices: Vec::new(),
            memory: None,
            lock: None,
            references: Vec::new(),
            corruption: Corruption::NONE,
            dependency: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Decode-order counter, 0 while the descriptor is free.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn picture(&self) -> Option<&Arc<PictureHeader>> {
        self.picture.as_ref()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn memory(&self) -> Option<&FrameRef> {
        self.memory.as_ref()
    }

    pub fn mem_id(&self) -> Option<FrameMemId> {
        self.memory.as_ref().map(FrameRef::id)
    }

    /// Memory ids of the references held while the frame is in flight.
    pub fn reference_ids(&self) -> Vec<FrameMemId> {
        self.references.iter().map(FrameRef::id).collect()
    }

    pub fn corruption(&self) -> Corruption {
        self.corruption
    }

    pub fn dependency(&self) -> Option<u64> {
        self.dependency
    }

    fn transition(
        &mut self,
        allowed: &[DescriptorState],
        to: DescriptorState,
    ) -> TaskStoreResult<()> {
        if !allowed.contains(&self.state) {
            return Err(TaskStoreError::InvalidTransition {
                index: self.index,
                from: self.state,
                to,
            });
        }

        debug!(
            "Descriptor {} (frame {}): {:?} -> {:?}",
            self.index, self.frame_counter, self.state, to
        );
        self.state = to;

        Ok(())
    }

    /// Returns the descriptor to `Free`, releasing everything it holds.
    fn reset(&mut self) {
        self.state = DescriptorState::Free;
        self.frame_counter = 0;
        self.picture = None;
        self.slices.clear();
        self.lock = None;
        self.references.clear();
        self.memory = None;
        self.corruption = Corruption::NONE;
        self.dependency = None;
    }
}

impl fmt::Debug for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("index", &self.index)
            .field("frame_counter", &self.frame_counter)
            .field("state", &self.state)
            .field("num_slices", &self.slices.len())
            .field("memory", &self.mem_id())
            .field("corruption", &self.corruption)
            .field("dependency", &self.dependency)
            .finish()
    }
}

/// Counters of the task store, as returned by [`TaskStore::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStoreStats {
    pub free: usize,
    pub loading: usize,
    pub ready_to_process: usize,
    pub busy: usize,
    pub ready_to_display: usize,
    pub skipped: usize,
    /// Frames acquired since the store was created.
    pub acquired: u64,
    pub reclaimed: u64,
    pub aborted: u64,
}

struct Pool {
    /// Counter given to the next acquired descriptor.
    next_frame_counter: u64,
    /// Counter of the next descriptor to reclaim.
    next_to_reclaim: u64,
    /// Counters of aborted frames not yet skipped over by reclaim.
    aborted: BTreeSet<u64>,
    reorder_delay: u64,
    draining: bool,
    num_reclaimed: u64,
    num_aborted: u64,
}

/// The pool of frame descriptors. `Sync`, meant to be shared through an `Arc`.
pub struct TaskStore {
    allocator: Arc<dyn FrameAllocator>,
    descriptors: Vec<Mutex<FrameDescriptor>>,
    pool: Mutex<Pool>,
}

impl TaskStore {
    pub fn new(allocator: Arc<dyn FrameAllocator>, size: usize) -> Self {
        Self {
            allocator,
            descriptors: (0..size)
                .map(|index| Mutex::new(FrameDescriptor::new(index)))
                .collect(),
            pool: Mutex::new(Pool {
                next_frame_counter: 1,
                next_to_reclaim: 1,
                aborted: BTreeSet::new(),
                reorder_delay: 0,
                draining: false,
                num_reclaimed: 0,
                num_aborted: 0,
            }),
        }
    }

    pub fn allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.allocator
    }

    pub fn size(&self) -> usize {
        self.descriptors.len()
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap()
    }

    fn descriptor(&self, index: usize) -> TaskStoreResult<MutexGuard<'_, FrameDescriptor>> {
        self.descriptors
            .get(index)
            .map(|d| d.lock().unwrap())
            .ok_or(TaskStoreError::InvalidIndex(index))
    }

    /// Runs `f` on descriptor `index`.
    pub fn with_descriptor<T>(
        &self,
        index: usize,
        f: impl FnOnce(&FrameDescriptor) -> T,
    ) -> TaskStoreResult<T> {
        Ok(f(&*self.descriptor(index)?))
    }

    /// Takes a free descriptor, allocates the memory of its frame and assigns it the next frame
    /// counter.
    ///
    /// The descriptor is reserved under the pool lock and the memory allocated after the lock is
    /// released. If the allocation fails the descriptor goes back to free and no counter is
    /// consumed.
    pub fn acquire_next_free(&self, info: &FrameInfo) -> TaskStoreResult<usize> {
        let index = {
            let _pool = self.pool();

            let mut desc = self
                .descriptors
                .iter()
                .map(|d| d.lock().unwrap())
                .find(|d| d.state == DescriptorState::Free)
                .ok_or(TaskStoreError::NoFreeDescriptor)?;

            desc.transition(&[DescriptorState::Free], DescriptorState::Loading)?;
            desc.index
        };

        let memory = match FrameRef::alloc(&self.allocator, info) {
            Ok(memory) => memory,
            Err(e) => {
                debug!("Frame memory allocation failed: {}", e);
                self.descriptor(index)?.reset();
                return Err(e.into());
            }
        };

        let mut pool = self.pool();
        let mut desc = self.descriptor(index)?;
        desc.memory = Some(memory);
        desc.frame_counter = pool.next_frame_counter;
        pool.next_frame_counter += 1;

        Ok(index)
    }

    /// Like [`TaskStore::acquire_next_free`], but waits up to `timeout` for a descriptor to be
    /// reclaimed by another thread.
    pub fn acquire_next_free_blocking(
        &self,
        info: &FrameInfo,
        timeout: Duration,
    ) -> TaskStoreResult<usize> {
        let start = Instant::now();

        loop {
            match self.acquire_next_free(info) {
                Err(TaskStoreError::NoFreeDescriptor) if start.elapsed() < timeout => {
                    std::thread::yield_now()
                }
                res => return res,
            }
        }
    }

    /// Adds `slice` to the frame being loaded in descriptor `index`.
    pub fn append_slice(&self, index: usize, slice: Slice) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;

        if desc.state != DescriptorState::Loading {
            return Err(TaskStoreError::InvalidTransition {
                index,
                from: desc.state,
                to: DescriptorState::Loading,
            });
        }

        match &desc.picture {
            Some(picture) if !Arc::ptr_eq(picture, &slice.picture) => {
                return Err(TaskStoreError::PictureMismatch(index))
            }
            Some(_) => (),
            None => desc.picture = Some(Arc::clone(&slice.picture)),
        }

        desc.slices.push(slice);
        Ok(())
    }

    /// Sets the picture of descriptor `index` without any slice, for pictures that carry no
    /// coded data.
    pub fn set_picture(&self, index: usize, picture: Arc<PictureHeader>) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;

        if desc.state != DescriptorState::Loading {
            return Err(TaskStoreError::InvalidTransition {
                index,
                from: desc.state,
                to: DescriptorState::Loading,
            });
        }

        desc.picture = Some(picture);
        Ok(())
    }

    /// Closes the frame loaded in descriptor `index`.
    ///
    /// A frame is complete once it has a picture and at least one slice, unless the picture is
    /// skipped.
    pub fn mark_ready_to_process(&self, index: usize) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;

        let complete = match &desc.picture {
            Some(picture) => picture.skipped || !desc.slices.is_empty(),
            None => false,
        };

        if desc.state == DescriptorState::Loading && !complete {
            return Err(TaskStoreError::Incomplete(index));
        }

        desc.transition(&[DescriptorState::Loading], DescriptorState::ReadyToProcess)
    }

    /// Records that descriptor `index` was submitted.
    ///
    /// The frame memory is pinned and a reference is taken on every memory in `refs` until the
    /// descriptor is reclaimed.
    pub fn mark_busy(&self, index: usize, refs: &[FrameMemId]) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;

        if desc.state != DescriptorState::ReadyToProcess {
            return Err(TaskStoreError::InvalidTransition {
                index,
                from: desc.state,
                to: DescriptorState::Busy,
            });
        }

        let lock = match &desc.memory {
            Some(memory) => memory.lock()?,
            None => return Err(TaskStoreError::Incomplete(index)),
        };

        let references = refs
            .iter()
            .map(|id| FrameRef::acquire(&self.allocator, *id))
            .collect::<Result<Vec<_>, _>>()?;

        desc.lock = Some(lock);
        desc.references = references;
        desc.transition(&[DescriptorState::ReadyToProcess], DescriptorState::Busy)
    }

    /// Records the completion of descriptor `index`, with the corruption the accelerator
    /// reported.
    pub fn mark_ready_to_display(
        &self,
        index: usize,
        corruption: Corruption,
    ) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;
        desc.transition(&[DescriptorState::Busy], DescriptorState::ReadyToDisplay)?;
        desc.corruption |= corruption;

        Ok(())
    }

    /// Adds `corruption` to the flags of descriptor `index`.
    pub fn add_corruption(&self, index: usize, corruption: Corruption) -> TaskStoreResult<()> {
        self.descriptor(index)?.corruption |= corruption;
        Ok(())
    }

    /// Marks descriptor `index` as skipped. It becomes reclaimable once the frame with counter
    /// `dependency`, if any, is decoded.
    pub fn mark_skipped(&self, index: usize, dependency: Option<u64>) -> TaskStoreResult<()> {
        let mut desc = self.descriptor(index)?;
        desc.transition(
            &[DescriptorState::Loading, DescriptorState::ReadyToProcess],
            DescriptorState::Skipped,
        )?;
        desc.dependency = dependency;

        Ok(())
    }

    /// Returns descriptor `index` to `Free` after a fatal submission failure.
    pub fn abort(&self, index: usize) -> TaskStoreResult<()> {
        let mut pool = self.pool();
        let mut desc = self.descriptor(index)?;

        if desc.state == DescriptorState::Free {
            return Err(TaskStoreError::InvalidTransition {
                index,
                from: desc.state,
                to: DescriptorState::Free,
            });
        }

        debug!(
            "Aborting descriptor {} (frame {}) in state {:?}",
            index, desc.frame_counter, desc.state
        );

        pool.aborted.insert(desc.frame_counter);
        pool.num_aborted += 1;
        desc.reset();

        Ok(())
    }

    /// Whether the frame with counter `counter` no longer blocks a skipped frame.
    fn dependency_resolved(&self, counter: u64, pool: &Pool) -> bool {
        if counter < pool.next_to_reclaim {
            return true;
        }

        self.descriptors
            .iter()
            .map(|d| d.lock().unwrap())
            .find(|d| d.state != DescriptorState::Free && d.frame_counter == counter)
            .map_or(true, |d| d.state == DescriptorState::ReadyToDisplay)
    }

    /// Frees the oldest frame in decode order if it is done and enough frames followed it.
    ///
    /// Returns the counter of the reclaimed frame. Every reference the descriptor held is
    /// released.
    pub fn reclaim_if_in_order(&self) -> Option<u64> {
        let mut pool = self.pool();

        loop {
            let next = pool.next_to_reclaim;
            if !pool.aborted.remove(&next) {
                break;
            }
            pool.next_to_reclaim += 1;
        }

        let counter = pool.next_to_reclaim;
        let later_frames = pool.next_frame_counter.saturating_sub(counter + 1);
        if !pool.draining && later_frames < pool.reorder_delay {
            return None;
        }

        let index = self
            .descriptors
            .iter()
            .map(|d| d.lock().unwrap())
            .find(|d| d.state != DescriptorState::Free && d.frame_counter == counter)
            .map(|d| d.index)?;

        let (state, dependency) = {
            let desc = self.descriptors[index].lock().unwrap();
            (desc.state, desc.dependency)
        };

        let eligible = match state {
            DescriptorState::ReadyToDisplay => true,
            DescriptorState::Skipped => {
                dependency.map_or(true, |dep| self.dependency_resolved(dep, &pool))
            }
            _ => false,
        };

        if !eligible {
            return None;
        }

        let mut desc = self.descriptors[index].lock().unwrap();
        debug!("Reclaiming descriptor {} (frame {})", index, counter);
        desc.reset();

        pool.next_to_reclaim += 1;
        pool.num_reclaimed += 1;

        Some(counter)
    }

    /// Indices of the descriptors in `state`, in decode order.
    pub fn descriptors_in(&self, state: DescriptorState) -> impl Iterator<Item = usize> {
        let _pool = self.pool();

        let mut found: Vec<_> = self
            .descriptors
            .iter()
            .map(|d| d.lock().unwrap())
            .filter(|d| d.state == state)
            .map(|d| (d.frame_counter, d.index))
            .collect();
        found.sort_unstable();

        found.into_iter().map(|(_, index)| index)
    }

    /// Index of the live descriptor with counter `frame_counter`.
    pub fn find_by_counter(&self, frame_counter: u64) -> Option<usize> {
        let _pool = self.pool();

        self.descriptors
            .iter()
            .map(|d| d.lock().unwrap())
            .find(|d| d.state != DescriptorState::Free && d.frame_counter == frame_counter)
            .map(|d| d.index)
    }

    /// Number of later frames that must have been acquired before a frame is reclaimed.
    pub fn set_reorder_delay(&self, delay: u64) {
        self.pool().reorder_delay = delay;
    }

    /// While draining, frames are reclaimed regardless of the reorder delay.
    pub fn set_draining(&self, draining: bool) {
        self.pool().draining = draining;
    }

    pub fn is_draining(&self) -> bool {
        self.pool().draining
    }

    pub fn stats(&self) -> TaskStoreStats {
        let pool = self.pool();
        let mut stats = TaskStoreStats {
            acquired: pool.next_frame_counter - 1,
            reclaimed: pool.num_reclaimed,
            aborted: pool.num_aborted,
            ..Default::default()
        };

        for desc in self.descriptors.iter().map(|d| d.lock().unwrap()) {
            match desc.state {
                DescriptorState::Free => stats.free += 1,
                DescriptorState::Loading => stats.loading += 1,
                DescriptorState::ReadyToProcess => stats.ready_to_process += 1,
                DescriptorState::Busy => stats.busy += 1,
                DescriptorState::ReadyToDisplay => stats.ready_to_display += 1,
                DescriptorState::Skipped => stats.skipped += 1,
            }
        }

        stats
    }
}
