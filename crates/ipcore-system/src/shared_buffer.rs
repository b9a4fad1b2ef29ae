//! Shared buffers: a fixed-size memory region nameable by handle.
//!
//! Every handle to a region, including duplicates, sees the same bytes.
//! A [`Mapping`] is a bounds-checked window onto part of the region that
//! stays valid after the handle it came from is closed. Mappings are
//! released with [`Mapping::unmap`]; a mapping that is simply dropped is
//! released too, but counted in
//! [`CoreStats::leaked_mappings`](crate::CoreStats).

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ipcore_transport::ControlOp;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::Counters;
use crate::error::{CoreError, Result};
use crate::flags::MapFlags;
use crate::handle::SharedBufferHandle;
use crate::table::Dispatcher;

/// Creation options for a shared buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBufferOptions {
    /// Reserved; must be zero.
    pub flags: u32,
}

/// Options for [`SharedBufferHandle::duplicate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateOptions {
    /// The new handle may only produce read-only mappings.
    pub read_only: bool,
}

/// What a buffer handle can tell about its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SharedBufferInfo {
    pub size: u64,
    pub read_only: bool,
}

/// The memory behind one or more buffer handles.
pub(crate) struct SharedRegion {
    size: usize,
    memory: RwLock<Box<[u8]>>,
    mappings: Mutex<HashSet<u64>>,
    next_mapping: AtomicU64,
}

impl SharedRegion {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            memory: RwLock::new(vec![0; size].into_boxed_slice()),
            mappings: Mutex::new(HashSet::new()),
            next_mapping: AtomicU64::new(1),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn register(&self) -> u64 {
        let id = self.next_mapping.fetch_add(1, Ordering::Relaxed);
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        id
    }

    fn unregister(&self, id: u64) -> bool {
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&memory[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        memory[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// A live window onto a shared buffer.
pub struct Mapping {
    region: Arc<SharedRegion>,
    counters: Arc<Counters>,
    id: u64,
    offset: usize,
    len: usize,
    writable: bool,
    released: bool,
}

impl Mapping {
    /// Offset of this window within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length mappings cannot be created.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_range(&self, pos: usize, len: usize) -> Result<()> {
        match pos.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CoreError::invalid(format!(
                "range {pos}+{len} outside a {}-byte mapping",
                self.len
            ))),
        }
    }

    /// Copy `dst.len()` bytes starting at `pos` (relative to the mapping).
    pub fn read_at(&self, pos: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(pos, dst.len())?;
        self.region.read(self.offset + pos, dst);
        Ok(())
    }

    /// Copy `src` into the mapping at `pos`.
    pub fn write_at(&self, pos: usize, src: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CoreError::precondition("mapping is read-only"));
        }
        self.check_range(pos, src.len())?;
        self.region.write(self.offset + pos, src);
        Ok(())
    }

    /// Snapshot of the whole window.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        self.region.read(self.offset, &mut out);
        out
    }

    /// Release the mapping.
    pub fn unmap(mut self) -> Result<()> {
        if self.release() {
            trace!(mapping = self.id, "unmapped");
            Ok(())
        } else {
            Err(CoreError::invalid(format!(
                "mapping {} is not registered",
                self.id
            )))
        }
    }

    fn release(&mut self) -> bool {
        self.released = true;
        let registered = self.region.unregister(self.id);
        if registered {
            self.counters.mapping_released();
        }
        registered
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.released && self.release() {
            self.counters.mapping_leaked();
            warn!(
                mapping = self.id,
                offset = self.offset,
                len = self.len,
                "mapping dropped without unmap; unmapping it"
            );
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

impl SharedBufferHandle {
    fn region(&self) -> Result<(Arc<SharedRegion>, bool)> {
        match self.core().lookup(self.id())? {
            Dispatcher::SharedBuffer { region, read_only } => Ok((region, read_only)),
            _ => Err(CoreError::InvalidHandle(self.id())),
        }
    }

    pub fn info(&self) -> Result<SharedBufferInfo> {
        let (region, read_only) = self.region()?;
        Ok(SharedBufferInfo {
            size: region.size() as u64,
            read_only,
        })
    }

    /// Create another handle to the same region.
    ///
    /// A duplicate of a read-only handle is always read-only.
    pub fn duplicate(&self, options: Option<&DuplicateOptions>) -> Result<SharedBufferHandle> {
        let core = self.core();
        let id = self.id();
        let wants_read_only = options.is_some_and(|options| options.read_only);

        let duplicate = {
            let mut table = core.table();
            let (region, read_only) = match table.get(id)? {
                Dispatcher::SharedBuffer { region, read_only } => (Arc::clone(region), *read_only),
                _ => return Err(CoreError::InvalidHandle(id)),
            };
            let duplicate = table.insert(Dispatcher::SharedBuffer {
                region,
                read_only: read_only || wants_read_only,
            })?;
            if let Err(err) = core.announce(ControlOp::DuplicateBuffer, &[], &[id, duplicate]) {
                table.remove(duplicate)?;
                return Err(err);
            }
            duplicate
        };

        debug!(handle = %id, duplicate = %duplicate, read_only = wants_read_only, "shared buffer duplicated");
        Ok(SharedBufferHandle::from_untyped(core.wrap(duplicate)))
    }

    /// Map `num_bytes` bytes starting at `offset`.
    pub fn map(&self, offset: u64, num_bytes: u64, flags: MapFlags) -> Result<Mapping> {
        let (region, read_only) = self.region()?;
        let size = region.size() as u64;
        if num_bytes == 0 {
            return Err(CoreError::invalid("cannot map zero bytes"));
        }
        let in_bounds = offset
            .checked_add(num_bytes)
            .is_some_and(|end| end <= size);
        if !in_bounds {
            return Err(CoreError::invalid(format!(
                "range {offset}+{num_bytes} outside a {size}-byte buffer"
            )));
        }
        // Both fit in usize: they are bounded by an allocated size.
        let offset = offset as usize;
        let len = num_bytes as usize;

        let counters = Arc::clone(self.core().counters());
        let id = region.register();
        counters.mapping_created();
        trace!(handle = %self.id(), mapping = id, offset, len, "mapped");
        Ok(Mapping {
            region,
            counters,
            id,
            offset,
            len,
            writable: !read_only && !flags.contains(MapFlags::READ_ONLY),
            released: false,
        })
    }
}
