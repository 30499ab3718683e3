// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame memory handles and the reference-counted slot table backing them.
//!
//! The decoding core never owns pixel storage. It only manipulates [`FrameMemId`]s handed out
//! by a [`FrameAllocator`], and expresses its interest in a frame by holding a [`FrameRef`]
//! (reference count) or a [`FrameLock`] (lock count). Both guards release what they hold when
//! dropped, on every exit path.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use log::error;
use thiserror::Error;

use crate::ChromaFormat;
use crate::Resolution;

/// Handle to the backing memory of one decoded frame.
///
/// The handle is `Copy`, but a handle outlives its slot only as a stale value: every operation
/// checks the generation it was issued with and fails with [`AllocError::InvalidId`] once the
/// slot has been recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameMemId {
    index: u32,
    generation: u32,
}

impl FrameMemId {
    /// Value used by the accelerator ABI for "no frame".
    pub const NONE_RAW: i32 = -1;

    /// Index of the slot this handle points to.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Integer form of the handle, as exchanged with the accelerator.
    pub fn raw(self) -> i32 {
        self.index as i32
    }

    /// Integer form of an optional handle, `-1` standing for none.
    pub fn raw_or_none(id: Option<FrameMemId>) -> i32 {
        id.map_or(Self::NONE_RAW, Self::raw)
    }
}

impl fmt::Debug for FrameMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameMemId({}#{})", self.index, self.generation)
    }
}

/// Description of the memory requested for a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub resolution: Resolution,
    pub bit_depth: u8,
    pub chroma_format: ChromaFormat,
}

impl FrameInfo {
    pub fn new(resolution: Resolution, bit_depth: u8, chroma_format: ChromaFormat) -> Self {
        Self {
            resolution,
            bit_depth,
            chroma_format,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("no frame memory available ({0} slots in use)")]
    Exhausted(usize),
    #[error("stale or unknown frame memory id {0:?}")]
    InvalidId(FrameMemId),
    #[error("frame memory {0:?} is not locked")]
    NotLocked(FrameMemId),
    #[error("reference count underflow on {0:?}")]
    Underflow(FrameMemId),
}

pub type AllocResult<T> = Result<T, AllocError>;

/// Interface to the frame memory allocator.
///
/// A freshly allocated id carries one reference, owned by the caller. Memory becomes reusable
/// once both its reference count and its lock count are back to zero.
pub trait FrameAllocator: Send + Sync {
    /// Allocates memory for a frame described by `info`.
    fn alloc(&self, info: &FrameInfo) -> AllocResult<FrameMemId>;
    /// Pins the memory of `id` and returns its description.
    fn lock(&self, id: FrameMemId) -> AllocResult<FrameInfo>;
    /// Releases a pin taken with [`FrameAllocator::lock`].
    fn unlock(&self, id: FrameMemId) -> AllocResult<()>;
    fn increase_reference(&self, id: FrameMemId) -> AllocResult<()>;
    fn decrease_reference(&self, id: FrameMemId) -> AllocResult<()>;
    /// Returns the current reference count of `id`.
    fn ref_count(&self, id: FrameMemId) -> AllocResult<usize>;
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    info: Option<FrameInfo>,
    refs: usize,
    locks: usize,
}

impl Slot {
    fn in_use(&self) -> bool {
        self.info.is_some()
    }
}

/// A fixed-capacity, reference-counted slot table implementing [`FrameAllocator`].
pub struct SlotTable {
    slots: Mutex<Vec<Slot>>,
}

impl SlotTable {
    /// Creates a table able to hold up to `capacity` live frames.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::default()).collect();

        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Convenience constructor returning the table behind the trait object the core uses.
    pub fn shared(capacity: usize) -> Arc<dyn FrameAllocator> {
        Arc::new(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Number of slots currently holding a live frame.
    pub fn num_in_use(&self) -> usize {
        self.slots().iter().filter(|s| s.in_use()).count()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap()
    }

    fn with_slot<T>(
        &self,
        id: FrameMemId,
        f: impl FnOnce(&mut Slot) -> AllocResult<T>,
    ) -> AllocResult<T> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(id.index())
            .filter(|s| s.in_use() && s.generation == id.generation)
            .ok_or(AllocError::InvalidId(id))?;

        let res = f(slot)?;

        if slot.refs == 0 && slot.locks == 0 {
            debug!("Frame memory {:?} released", id);
            slot.info = None;
            slot.generation = slot.generation.wrapping_add(1);
        }

        Ok(res)
    }
}

impl FrameAllocator for SlotTable {
    fn alloc(&self, info: &FrameInfo) -> AllocResult<FrameMemId> {
        let mut slots = self.slots();
        let in_use = slots.len();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.in_use())
            .ok_or(AllocError::Exhausted(in_use))?;

        slot.info = Some(*info);
        slot.refs = 1;
        slot.locks = 0;

        let id = FrameMemId {
            index: index as u32,
            generation: slot.generation,
        };
        debug!("Allocated frame memory {:?} for {:?}", id, info.resolution);

        Ok(id)
    }

    fn lock(&self, id: FrameMemId) -> AllocResult<FrameInfo> {
        self.with_slot(id, |slot| {
            slot.locks += 1;
            slot.info.ok_or(AllocError::InvalidId(id))
        })
    }

    fn unlock(&self, id: FrameMemId) -> AllocResult<()> {
        self.with_slot(id, |slot| {
            slot.locks = slot.locks.checked_sub(1).ok_or(AllocError::NotLocked(id))?;
            Ok(())
        })
    }

    fn increase_reference(&self, id: FrameMemId) -> AllocResult<()> {
        self.with_slot(id, |slot| {
            slot.refs += 1;
            Ok(())
        })
    }

    fn decrease_reference(&self, id: FrameMemId) -> AllocResult<()> {
        self.with_slot(id, |slot| {
            slot.refs = slot.refs.checked_sub(1).ok_or(AllocError::Underflow(id))?;
            Ok(())
        })
    }

    fn ref_count(&self, id: FrameMemId) -> AllocResult<usize> {
        let slots = self.slots();
        slots
            .get(id.index())
            .filter(|s| s.in_use() && s.generation == id.generation)
            .map(|s| s.refs)
            .ok_or(AllocError::InvalidId(id))
    }
}

/// One counted reference on a frame's memory, released when dropped.
pub struct FrameRef {
    allocator: Arc<dyn FrameAllocator>,
    id: FrameMemId,
}

impl FrameRef {
    /// Allocates a new frame. The returned guard owns the initial reference.
    pub fn alloc(allocator: &Arc<dyn FrameAllocator>, info: &FrameInfo) -> AllocResult<Self> {
        let id = allocator.alloc(info)?;

        Ok(Self {
            allocator: Arc::clone(allocator),
            id,
        })
    }

    /// Takes an additional reference on `id`.
    pub fn acquire(allocator: &Arc<dyn FrameAllocator>, id: FrameMemId) -> AllocResult<Self> {
        allocator.increase_reference(id)?;

        Ok(Self {
            allocator: Arc::clone(allocator),
            id,
        })
    }

    pub fn id(&self) -> FrameMemId {
        self.id
    }

    /// Takes a second reference on the same memory.
    pub fn try_clone(&self) -> AllocResult<Self> {
        Self::acquire(&self.allocator, self.id)
    }

    /// Pins the referenced memory for as long as the returned guard lives.
    pub fn lock(&self) -> AllocResult<FrameLock> {
        FrameLock::new(&self.allocator, self.id)
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameRef").field(&self.id).finish()
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.decrease_reference(self.id) {
            error!("Failed to release frame memory {:?}: {}", self.id, e);
        }
    }
}

/// A scoped pin on a frame's memory.
pub struct FrameLock {
    allocator: Arc<dyn FrameAllocator>,
    id: FrameMemId,
    info: FrameInfo,
}

impl FrameLock {
    pub fn new(allocator: &Arc<dyn FrameAllocator>, id: FrameMemId) -> AllocResult<Self> {
        let info = allocator.lock(id)?;

        Ok(Self {
            allocator: Arc::clone(allocator),
            id,
            info,
        })
    }

    pub fn id(&self) -> FrameMemId {
        self.id
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }
}

impl fmt::Debug for FrameLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameLock").field(&self.id).finish()
    }
}

impl Drop for FrameLock {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.unlock(self.id) {
            error!("Failed to unlock frame memory {:?}: {}", self.id, e);
        }
    }
}
