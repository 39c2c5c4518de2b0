//! The object table.
//!
//! A flat table of up to [`MAX_OBJECTS`] slots, each holding one
//! object record.  Slots are recycled through a FIFO free list so
//! that an index is not reused immediately, and every recycling bumps
//! the slot's generation counter; together these make stale-handle
//! use detectable for any realistic workload.
//!
//! The table's reader-writer lock only guards the slot array itself.
//! Message delivery takes the read side plus the target object's own
//! locks; only allocation and release take the write side.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use crate::{Error, Result};
use super::object::Object;
use super::Handle;

/// The maximum number of live objects.
pub const MAX_OBJECTS: usize = 1 << 16;

struct Slot {
    generation: u16,
    object: Option<Arc<Object>>,
}

struct TableInner {
    slots: Vec<Slot>,
    free: VecDeque<u16>,
}

pub(crate) struct ObjectTable {
    inner: RwLock<TableInner>,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        ObjectTable {
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: VecDeque::new(),
            }),
        }
    }

    /// Inserts an object, returning its handle.
    pub(crate) fn allocate(&self, object: Arc<Object>) -> Result<Handle> {
        let mut inner = self.inner.write()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "object table poisoned".into())))?;
        if let Some(index) = inner.free.pop_front() {
            let slot = &mut inner.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            return Ok(Handle::new(index, slot.generation));
        }
        if inner.slots.len() >= MAX_OBJECTS {
            return Err(Error::Memory.into());
        }
        let index = inner.slots.len() as u16;
        inner.slots.push(Slot { generation: 1, object: Some(object) });
        Ok(Handle::new(index, 1))
    }

    /// Resolves a handle to its object.
    ///
    /// Fails with [`Error::NotFound`] if the slot is empty or the
    /// generation does not match, i.e. the handle is stale.
    pub(crate) fn lookup(&self, handle: Handle) -> Result<Arc<Object>> {
        let inner = self.inner.read()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "object table poisoned".into())))?;
        let slot = inner.slots.get(handle.index() as usize)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                format!("object {}", handle))))?;
        if slot.generation != handle.generation() {
            return Err(Error::NotFound(
                format!("stale handle {}", handle)).into());
        }
        slot.object.clone()
            .ok_or_else(|| Error::NotFound(
                format!("object {}", handle)).into())
    }

    /// Empties a slot and queues it for ageing reuse.
    pub(crate) fn release(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.write()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "object table poisoned".into())))?;
        let index = handle.index() as usize;
        let slot = inner.slots.get_mut(index)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                format!("object {}", handle))))?;
        if slot.generation != handle.generation() || slot.object.is_none() {
            return Err(Error::NotFound(
                format!("stale handle {}", handle)).into());
        }
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push_back(handle.index());
        Ok(())
    }

    /// Returns the number of live objects.
    pub(crate) fn live(&self) -> usize {
        let inner = self.inner.read().expect("object table poisoned");
        inner.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// Returns the handles of all live objects.
    pub(crate) fn live_handles(&self) -> Vec<Handle> {
        let inner = self.inner.read().expect("object table poisoned");
        inner.slots.iter().enumerate()
            .filter(|(_, s)| s.object.is_some())
            .map(|(i, s)| Handle::new(i as u16, s.generation))
            .collect()
    }
}
