//! Data pipes: a unidirectional, bounded byte stream.
//!
//! The producer appends bytes and the consumer removes them in FIFO order.
//! There is no framing: two writes of 3 bytes may come out as one read of
//! 6, or as six reads of 1. Every transfer is a whole number of elements.
//!
//! Besides the copying `write_data` / `read_data`, each end supports one
//! outstanding two-phase operation. `begin_write_data` lends the
//! contiguous free span of the ring out as a [`WriteRegion`] and
//! `end_write_data` commits a prefix of it. `begin_read_data` lends the
//! contiguous readable span out as a [`ReadRegion`] and `end_read_data`
//! consumes a prefix of it. A lent span is split off the ring's own
//! allocation, so the caller reads and writes the pipe's bytes in place
//! and the `end_*` calls only move indices. A region dropped without its
//! matching `end_*` call commits nothing and is logged.
//!
//! With a bounded transport every accepted write is announced in one
//! control record, so writes and write regions are capped at what one
//! record can carry.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use ipcore_transport::ControlOp;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::flags::{ReadDataFlags, Signals, SignalsState, WriteDataFlags};
use crate::handle::{ConsumerHandle, ProducerHandle};
use crate::table::Dispatcher;
use crate::waitable::Notifier;

/// Creation options for a data pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPipeOptions {
    /// Size of one element. Every transfer is a multiple of it.
    pub element_bytes: usize,
    /// Total capacity. `0` selects the configured default.
    pub capacity_bytes: usize,
    /// Reserved; must be zero.
    pub flags: u32,
}

impl Default for DataPipeOptions {
    fn default() -> Self {
        Self {
            element_bytes: 1,
            capacity_bytes: 0,
            flags: 0,
        }
    }
}

impl DataPipeOptions {
    /// Validate against `config`, returning `(element_bytes, capacity)`.
    pub(crate) fn resolve(&self, config: &CoreConfig) -> Result<(usize, usize)> {
        if self.flags != 0 {
            return Err(CoreError::invalid(format!(
                "unknown data pipe flags {:#x}",
                self.flags
            )));
        }
        let element = self.element_bytes;
        if element == 0 {
            return Err(CoreError::invalid("element_bytes must be non-zero"));
        }
        let capacity = if self.capacity_bytes == 0 {
            (config.default_data_pipe_capacity / element * element).max(element)
        } else {
            self.capacity_bytes
        };
        if capacity % element != 0 {
            return Err(CoreError::invalid(format!(
                "capacity {capacity} is not a multiple of element size {element}"
            )));
        }
        if capacity > config.max_data_pipe_capacity {
            return Err(CoreError::exhausted(format!(
                "capacity {capacity} exceeds limit of {}",
                config.max_data_pipe_capacity
            )));
        }
        Ok((element, capacity))
    }
}

/// The ring's bytes minus the spans lent to two-phase regions.
///
/// Pieces are sorted by ring offset and all split off one allocation.
/// Adjacent pieces are always merged, so any span that does not touch a
/// lent region lies inside a single piece.
struct Storage {
    pieces: Vec<(usize, BytesMut)>,
}

impl Storage {
    fn new(capacity: usize) -> Self {
        Self {
            pieces: vec![(0, BytesMut::zeroed(capacity))],
        }
    }

    fn piece_at(&self, offset: usize) -> usize {
        self.pieces
            .partition_point(|(start, _)| *start <= offset)
            .saturating_sub(1)
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        let (start, piece) = &self.pieces[self.piece_at(offset)];
        let at = offset - start;
        &piece[at..at + len]
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        let index = self.piece_at(offset);
        let (start, piece) = &mut self.pieces[index];
        let at = offset - *start;
        &mut piece[at..at + len]
    }

    /// Split `[offset, offset + len)` out of its piece.
    fn lend(&mut self, offset: usize, len: usize) -> BytesMut {
        let index = self.piece_at(offset);
        let start = self.pieces[index].0;
        let mut lent = self.pieces[index].1.split_off(offset - start);
        let rest = lent.split_off(len);

        let mut next = index + 1;
        if self.pieces[index].1.is_empty() {
            self.pieces.remove(index);
            next = index;
        }
        if !rest.is_empty() {
            self.pieces.insert(next, (offset + len, rest));
        }
        lent
    }

    /// Put a lent span back and rejoin it with its neighbours.
    fn restore(&mut self, offset: usize, span: BytesMut) {
        if span.is_empty() {
            return;
        }
        let index = self.pieces.partition_point(|(start, _)| *start < offset);
        let end = offset + span.len();
        self.pieces.insert(index, (offset, span));

        if index + 1 < self.pieces.len() && self.pieces[index + 1].0 == end {
            let (_, after) = self.pieces.remove(index + 1);
            self.pieces[index].1.unsplit(after);
        }
        if index > 0 {
            let (start, before) = &self.pieces[index - 1];
            if start + before.len() == offset {
                let (_, joined) = self.pieces.remove(index);
                self.pieces[index - 1].1.unsplit(joined);
            }
        }
    }
}

struct Ring {
    storage: Storage,
    capacity: usize,
    start: usize,
    len: usize,
    producer_open: bool,
    consumer_open: bool,
    write_lease: Option<u64>,
    read_lease: Option<u64>,
    next_lease: u64,
}

impl Ring {
    fn free(&self) -> usize {
        self.capacity - self.len
    }

    fn write_pos(&self) -> usize {
        (self.start + self.len) % self.capacity
    }

    fn contiguous_free(&self) -> usize {
        if self.len == self.capacity {
            return 0;
        }
        let pos = self.write_pos();
        if pos >= self.start {
            self.capacity - pos
        } else {
            self.start - pos
        }
    }

    fn contiguous_readable(&self) -> usize {
        self.len.min(self.capacity - self.start)
    }

    fn push(&mut self, src: &[u8]) {
        let pos = self.write_pos();
        let first = src.len().min(self.capacity - pos);
        self.storage
            .slice_mut(pos, first)
            .copy_from_slice(&src[..first]);
        self.storage
            .slice_mut(0, src.len() - first)
            .copy_from_slice(&src[first..]);
        self.len += src.len();
    }

    fn copy_out(&self, dst: &mut [u8]) {
        let first = dst.len().min(self.capacity - self.start);
        dst[..first].copy_from_slice(self.storage.slice(self.start, first));
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(self.storage.slice(0, rest));
    }

    fn consume(&mut self, n: usize) {
        self.start = (self.start + n) % self.capacity;
        self.len -= n;
    }

    fn lease(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    /// How many bytes a read of `requested` bytes may take right now.
    fn readable(&self, requested: usize, all_or_none: bool) -> Result<usize> {
        if self.read_lease.is_some() {
            return Err(CoreError::precondition("two-phase read in progress"));
        }
        if self.len == 0 {
            return Err(if self.producer_open {
                CoreError::ShouldWait
            } else {
                CoreError::precondition("producer closed and no data remains")
            });
        }
        if all_or_none && requested > self.len {
            return Err(CoreError::out_of_range(format!(
                "requested {requested} bytes, {} buffered",
                self.len
            )));
        }
        Ok(requested.min(self.len))
    }
}

/// Shared state of a data pipe.
pub(crate) struct DataPipe {
    element_bytes: usize,
    ring: Mutex<Ring>,
}

impl DataPipe {
    pub(crate) fn new(element_bytes: usize, capacity: usize) -> Self {
        Self {
            element_bytes,
            ring: Mutex::new(Ring {
                storage: Storage::new(capacity),
                capacity,
                start: 0,
                len: 0,
                producer_open: true,
                consumer_open: true,
                write_lease: None,
                read_lease: None,
                next_lease: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_elements(&self, len: usize) -> Result<()> {
        if len % self.element_bytes != 0 {
            return Err(CoreError::invalid(format!(
                "{len} bytes is not a multiple of element size {}",
                self.element_bytes
            )));
        }
        Ok(())
    }

    fn whole_elements(&self, bytes: usize) -> usize {
        bytes / self.element_bytes * self.element_bytes
    }

    pub(crate) fn producer_signals(&self) -> SignalsState {
        let ring = self.lock();
        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::PEER_CLOSED;
        if ring.consumer_open {
            satisfiable |= Signals::WRITABLE;
            if ring.free() > 0 && ring.write_lease.is_none() {
                satisfied |= Signals::WRITABLE;
            }
        } else {
            satisfied |= Signals::PEER_CLOSED;
        }
        SignalsState::new(satisfied, satisfiable)
    }

    pub(crate) fn consumer_signals(&self) -> SignalsState {
        let ring = self.lock();
        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::PEER_CLOSED;
        if ring.len > 0 && ring.read_lease.is_none() {
            satisfied |= Signals::READABLE;
        }
        if ring.producer_open || ring.len > 0 {
            satisfiable |= Signals::READABLE;
        }
        if !ring.producer_open {
            satisfied |= Signals::PEER_CLOSED;
        }
        SignalsState::new(satisfied, satisfiable)
    }

    pub(crate) fn write_in_progress(&self) -> bool {
        self.lock().write_lease.is_some()
    }

    pub(crate) fn read_in_progress(&self) -> bool {
        self.lock().read_lease.is_some()
    }

    pub(crate) fn close_producer(&self) {
        let mut ring = self.lock();
        ring.producer_open = false;
        ring.write_lease = None;
    }

    pub(crate) fn close_consumer(&self) {
        let mut ring = self.lock();
        ring.consumer_open = false;
        ring.read_lease = None;
        ring.start = 0;
        ring.len = 0;
    }

    fn write(
        &self,
        src: &[u8],
        flags: WriteDataFlags,
        max_chunk: usize,
        announce: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<usize> {
        self.check_elements(src.len())?;
        let mut ring = self.lock();
        if !ring.consumer_open {
            return Err(CoreError::precondition("consumer is closed"));
        }
        if ring.write_lease.is_some() {
            return Err(CoreError::precondition("two-phase write in progress"));
        }
        let room = ring.free().min(self.whole_elements(max_chunk));
        if flags.contains(WriteDataFlags::ALL_OR_NONE) && src.len() > room {
            return Err(CoreError::out_of_range(format!(
                "{} bytes do not fit in {room} writable bytes",
                src.len()
            )));
        }
        let n = src.len().min(room);
        if n == 0 {
            return Ok(0);
        }
        announce(&src[..n])?;
        ring.push(&src[..n]);
        Ok(n)
    }

    /// Lend out the contiguous free span, at most `max_span` bytes.
    fn begin_write(
        &self,
        min_bytes: usize,
        all_or_none: bool,
        max_span: usize,
    ) -> Result<(u64, usize, BytesMut)> {
        self.check_elements(min_bytes)?;
        let mut ring = self.lock();
        if !ring.consumer_open {
            return Err(CoreError::precondition("consumer is closed"));
        }
        if ring.write_lease.is_some() {
            return Err(CoreError::precondition("two-phase write already in progress"));
        }
        if ring.len == 0 {
            ring.start = 0;
        }
        let span = ring.contiguous_free().min(self.whole_elements(max_span));
        if span == 0 {
            return Err(CoreError::ShouldWait);
        }
        if all_or_none && min_bytes > span {
            return Err(CoreError::out_of_range(format!(
                "requested {min_bytes} contiguous bytes, {span} available"
            )));
        }
        let offset = ring.write_pos();
        let lease = ring.lease();
        ring.write_lease = Some(lease);
        let lent = ring.storage.lend(offset, span);
        Ok((lease, offset, lent))
    }

    /// Take the span back and publish its first `n` bytes.
    fn end_write(
        &self,
        lease: u64,
        offset: usize,
        span: BytesMut,
        n: usize,
        announce: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut ring = self.lock();
        let result = if ring.write_lease != Some(lease) {
            Err(CoreError::precondition("no matching two-phase write"))
        } else {
            ring.write_lease = None;
            if !ring.consumer_open {
                Err(CoreError::precondition("consumer is closed"))
            } else if n == 0 {
                Ok(())
            } else {
                announce(&span[..n])
            }
        };
        if result.is_ok() {
            ring.len += n;
        }
        ring.storage.restore(offset, span);
        result
    }

    /// Take the span back without publishing anything.
    fn abort_write(&self, lease: u64, offset: usize, span: BytesMut) -> bool {
        let mut ring = self.lock();
        ring.storage.restore(offset, span);
        if ring.write_lease == Some(lease) {
            ring.write_lease = None;
            true
        } else {
            false
        }
    }

    fn query(&self) -> usize {
        self.lock().len
    }

    fn read(&self, dst: &mut [u8], flags: ReadDataFlags) -> Result<usize> {
        self.check_elements(dst.len())?;
        let mut ring = self.lock();
        let n = ring.readable(dst.len(), flags.contains(ReadDataFlags::ALL_OR_NONE))?;
        ring.copy_out(&mut dst[..n]);
        if !flags.contains(ReadDataFlags::PEEK) {
            ring.consume(n);
        }
        Ok(n)
    }

    fn discard(&self, num_bytes: usize, flags: ReadDataFlags) -> Result<usize> {
        self.check_elements(num_bytes)?;
        let mut ring = self.lock();
        let n = ring.readable(num_bytes, flags.contains(ReadDataFlags::ALL_OR_NONE))?;
        ring.consume(n);
        Ok(n)
    }

    /// Lend out the contiguous readable span.
    fn begin_read(&self) -> Result<(u64, usize, BytesMut)> {
        let mut ring = self.lock();
        if ring.read_lease.is_some() {
            return Err(CoreError::precondition("two-phase read already in progress"));
        }
        let span = ring.readable(usize::MAX, false)?.min(ring.contiguous_readable());
        let offset = ring.start;
        let lease = ring.lease();
        ring.read_lease = Some(lease);
        let lent = ring.storage.lend(offset, span);
        Ok((lease, offset, lent))
    }

    fn end_read(&self, lease: u64, offset: usize, span: BytesMut, n: usize) -> Result<()> {
        let mut ring = self.lock();
        ring.storage.restore(offset, span);
        if ring.read_lease != Some(lease) {
            return Err(CoreError::precondition("no matching two-phase read"));
        }
        ring.read_lease = None;
        ring.consume(n);
        Ok(())
    }

    fn abort_read(&self, lease: u64, offset: usize, span: BytesMut) -> bool {
        let mut ring = self.lock();
        ring.storage.restore(offset, span);
        if ring.read_lease == Some(lease) {
            ring.read_lease = None;
            true
        } else {
            false
        }
    }
}

/// Writable span of the pipe lent out by a two-phase write.
///
/// Fill a prefix and pass the region to
/// [`ProducerHandle::end_write_data`] to commit it.
pub struct WriteRegion {
    pipe: Arc<DataPipe>,
    notifier: Arc<Notifier>,
    lease: u64,
    offset: usize,
    span: BytesMut,
    finished: bool,
}

impl Deref for WriteRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.span
    }
}

impl DerefMut for WriteRegion {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.span
    }
}

impl Drop for WriteRegion {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let len = self.span.len();
        if self.pipe.abort_write(self.lease, self.offset, mem::take(&mut self.span)) {
            warn!(len, "write region dropped without end_write_data, nothing committed");
            self.notifier.notify();
        }
    }
}

impl fmt::Debug for WriteRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRegion")
            .field("lease", &self.lease)
            .field("offset", &self.offset)
            .field("len", &self.span.len())
            .finish()
    }
}

/// Readable span of the pipe lent out by a two-phase read.
///
/// Pass it to [`ConsumerHandle::end_read_data`] with the number of bytes
/// actually consumed.
pub struct ReadRegion {
    pipe: Arc<DataPipe>,
    notifier: Arc<Notifier>,
    lease: u64,
    offset: usize,
    span: BytesMut,
    finished: bool,
}

impl Deref for ReadRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.span
    }
}

impl Drop for ReadRegion {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let len = self.span.len();
        if self.pipe.abort_read(self.lease, self.offset, mem::take(&mut self.span)) {
            warn!(len, "read region dropped without end_read_data, nothing consumed");
            self.notifier.notify();
        }
    }
}

impl fmt::Debug for ReadRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRegion")
            .field("lease", &self.lease)
            .field("offset", &self.offset)
            .field("len", &self.span.len())
            .finish()
    }
}

impl ProducerHandle {
    fn pipe(&self) -> Result<Arc<DataPipe>> {
        match self.core().lookup(self.id())? {
            Dispatcher::Producer(pipe) => Ok(pipe),
            _ => Err(CoreError::InvalidHandle(self.id())),
        }
    }

    /// Copy as much of `bytes` as fits. Returns the number of bytes
    /// written, `0` when the pipe is full.
    pub fn write_data(&self, bytes: &[u8], flags: WriteDataFlags) -> Result<usize> {
        let core = self.core();
        let id = self.id();
        let written = self.pipe()?.write(bytes, flags, core.max_args_len(1), |chunk| {
            core.announce(ControlOp::WriteData, chunk, &[id])
        })?;
        if written > 0 {
            core.notify();
            trace!(handle = %id, written, "data written");
        }
        Ok(written)
    }

    /// Start a two-phase write.
    ///
    /// The region covers the whole contiguous free span, which may be
    /// shorter than `num_bytes`. `ShouldWait` when the pipe is full. With
    /// `ALL_OR_NONE`, a span shorter than `num_bytes` is `OutOfRange`.
    pub fn begin_write_data(&self, num_bytes: usize, flags: WriteDataFlags) -> Result<WriteRegion> {
        let core = self.core();
        let pipe = self.pipe()?;
        let (lease, offset, span) = pipe.begin_write(
            num_bytes,
            flags.contains(WriteDataFlags::ALL_OR_NONE),
            core.max_args_len(1),
        )?;
        core.notify();
        trace!(handle = %self.id(), offset, span = span.len(), "two-phase write started");
        Ok(WriteRegion {
            pipe,
            notifier: Arc::clone(core.notifier()),
            lease,
            offset,
            span,
            finished: false,
        })
    }

    /// Commit the first `num_bytes_written` bytes of `region`.
    ///
    /// An invalid count ends the two-phase write with nothing committed.
    pub fn end_write_data(&self, mut region: WriteRegion, num_bytes_written: usize) -> Result<()> {
        let core = self.core();
        let id = self.id();
        let pipe = self.pipe()?;
        if !Arc::ptr_eq(&pipe, &region.pipe) {
            return Err(CoreError::invalid("region belongs to a different data pipe"));
        }
        region.finished = true;
        let span = mem::take(&mut region.span);
        let len = span.len();

        let result = if num_bytes_written > len {
            pipe.abort_write(region.lease, region.offset, span);
            Err(CoreError::invalid(format!(
                "committed {num_bytes_written} bytes of a {len}-byte region"
            )))
        } else if let Err(err) = pipe.check_elements(num_bytes_written) {
            pipe.abort_write(region.lease, region.offset, span);
            Err(err)
        } else {
            pipe.end_write(region.lease, region.offset, span, num_bytes_written, |chunk| {
                core.announce(ControlOp::WriteData, chunk, &[id])
            })
        };
        core.notify();
        if result.is_ok() {
            trace!(handle = %id, committed = num_bytes_written, "two-phase write ended");
        }
        result
    }
}

impl ConsumerHandle {
    fn pipe(&self) -> Result<Arc<DataPipe>> {
        match self.core().lookup(self.id())? {
            Dispatcher::Consumer(pipe) => Ok(pipe),
            _ => Err(CoreError::InvalidHandle(self.id())),
        }
    }

    /// Copy buffered bytes into `buffer`, returning how many were read.
    ///
    /// `QUERY` returns the buffered byte count and leaves `buffer`
    /// untouched. `DISCARD` drops up to `buffer.len()` bytes without
    /// copying. `PEEK` copies without consuming.
    pub fn read_data(&self, buffer: &mut [u8], flags: ReadDataFlags) -> Result<usize> {
        let pipe = self.pipe()?;
        if flags.contains(ReadDataFlags::QUERY) {
            return Ok(pipe.query());
        }
        if flags.contains(ReadDataFlags::DISCARD) {
            return self.discard_data(buffer.len(), flags);
        }
        let read = pipe.read(buffer, flags)?;
        if !flags.contains(ReadDataFlags::PEEK) {
            self.core().notify();
        }
        trace!(handle = %self.id(), read, "data read");
        Ok(read)
    }

    /// Drop up to `num_bytes` buffered bytes.
    pub fn discard_data(&self, num_bytes: usize, flags: ReadDataFlags) -> Result<usize> {
        let discarded = self.pipe()?.discard(num_bytes, flags)?;
        self.core().notify();
        trace!(handle = %self.id(), discarded, "data discarded");
        Ok(discarded)
    }

    /// Number of bytes currently buffered.
    pub fn available_bytes(&self) -> Result<usize> {
        Ok(self.pipe()?.query())
    }

    /// Start a two-phase read of the contiguous readable span.
    pub fn begin_read_data(&self, flags: ReadDataFlags) -> Result<ReadRegion> {
        if flags.intersects(ReadDataFlags::DISCARD | ReadDataFlags::QUERY | ReadDataFlags::PEEK) {
            return Err(CoreError::invalid(
                "begin_read_data does not accept DISCARD, QUERY or PEEK",
            ));
        }
        let core = self.core();
        let pipe = self.pipe()?;
        let (lease, offset, span) = pipe.begin_read()?;
        core.notify();
        trace!(handle = %self.id(), offset, span = span.len(), "two-phase read started");
        Ok(ReadRegion {
            pipe,
            notifier: Arc::clone(core.notifier()),
            lease,
            offset,
            span,
            finished: false,
        })
    }

    /// Consume the first `num_bytes_read` bytes of `region`.
    ///
    /// An invalid count ends the two-phase read with nothing consumed.
    pub fn end_read_data(&self, mut region: ReadRegion, num_bytes_read: usize) -> Result<()> {
        let core = self.core();
        let pipe = self.pipe()?;
        if !Arc::ptr_eq(&pipe, &region.pipe) {
            return Err(CoreError::invalid("region belongs to a different data pipe"));
        }
        region.finished = true;
        let span = mem::take(&mut region.span);
        let len = span.len();

        let result = if num_bytes_read > len {
            pipe.abort_read(region.lease, region.offset, span);
            Err(CoreError::invalid(format!(
                "consumed {num_bytes_read} bytes of a {len}-byte region"
            )))
        } else if let Err(err) = pipe.check_elements(num_bytes_read) {
            pipe.abort_read(region.lease, region.offset, span);
            Err(err)
        } else {
            pipe.end_read(region.lease, region.offset, span, num_bytes_read)
        };
        core.notify();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    fn pipe_with(core: &Core, element_bytes: usize, capacity_bytes: usize) -> (ProducerHandle, ConsumerHandle) {
        core.create_data_pipe(Some(&DataPipeOptions {
            element_bytes,
            capacity_bytes,
            flags: 0,
        }))
        .unwrap()
    }

    fn close(producer: ProducerHandle, consumer: ConsumerHandle) {
        producer.close().unwrap();
        consumer.close().unwrap();
    }

    #[test]
    fn options_resolve_default_capacity() {
        let config = CoreConfig {
            default_data_pipe_capacity: 100,
            ..CoreConfig::default()
        };
        let options = DataPipeOptions {
            element_bytes: 8,
            ..DataPipeOptions::default()
        };
        assert_eq!(options.resolve(&config).unwrap(), (8, 96));

        let huge = DataPipeOptions {
            element_bytes: 256,
            ..DataPipeOptions::default()
        };
        assert_eq!(huge.resolve(&config).unwrap(), (256, 256));
    }

    #[test]
    fn options_reject_bad_geometry() {
        let config = CoreConfig::default();
        let zero = DataPipeOptions {
            element_bytes: 0,
            ..DataPipeOptions::default()
        };
        assert!(matches!(zero.resolve(&config), Err(CoreError::InvalidArgument(_))));

        let ragged = DataPipeOptions {
            element_bytes: 4,
            capacity_bytes: 10,
            flags: 0,
        };
        assert!(matches!(ragged.resolve(&config), Err(CoreError::InvalidArgument(_))));

        let too_big = DataPipeOptions {
            element_bytes: 1,
            capacity_bytes: config.max_data_pipe_capacity + 1,
            flags: 0,
        };
        assert!(matches!(too_big.resolve(&config), Err(CoreError::ResourceExhausted(_))));
    }

    #[test]
    fn write_is_capped_by_free_space() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);

        assert_eq!(producer.write_data(b"0123456789", WriteDataFlags::NONE).unwrap(), 8);
        assert_eq!(producer.write_data(b"x", WriteDataFlags::NONE).unwrap(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 8);
        assert_eq!(&buf[..8], b"01234567");
        close(producer, consumer);
    }

    #[test]
    fn bytes_survive_wrap_around() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        let mut buf = [0u8; 8];

        producer.write_data(b"abcdef", WriteDataFlags::NONE).unwrap();
        assert_eq!(consumer.read_data(&mut buf[..4], ReadDataFlags::NONE).unwrap(), 4);
        assert_eq!(producer.write_data(b"ghijkl", WriteDataFlags::NONE).unwrap(), 6);

        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 8);
        assert_eq!(&buf, b"efghijkl");
        close(producer, consumer);
    }

    #[test]
    fn partial_elements_are_rejected() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 4, 16);
        assert!(matches!(
            producer.write_data(b"abcde", WriteDataFlags::NONE),
            Err(CoreError::InvalidArgument(_))
        ));
        producer.write_data(b"abcdefgh", WriteDataFlags::NONE).unwrap();
        let mut odd = [0u8; 3];
        assert!(matches!(
            consumer.read_data(&mut odd, ReadDataFlags::NONE),
            Err(CoreError::InvalidArgument(_))
        ));
        close(producer, consumer);
    }

    #[test]
    fn all_or_none_refuses_partial_transfers() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 4);
        assert!(matches!(
            producer.write_data(b"12345", WriteDataFlags::ALL_OR_NONE),
            Err(CoreError::OutOfRange(_))
        ));
        assert_eq!(consumer.available_bytes().unwrap(), 0);

        producer.write_data(b"12", WriteDataFlags::NONE).unwrap();
        let mut buf = [0u8; 3];
        assert!(matches!(
            consumer.read_data(&mut buf, ReadDataFlags::ALL_OR_NONE),
            Err(CoreError::OutOfRange(_))
        ));
        assert_eq!(consumer.available_bytes().unwrap(), 2);
        close(producer, consumer);
    }

    #[test]
    fn peek_query_and_discard() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 16);
        producer.write_data(b"hello world", WriteDataFlags::NONE).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::PEEK).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(consumer.read_data(&mut [], ReadDataFlags::QUERY).unwrap(), 11);

        assert_eq!(consumer.discard_data(6, ReadDataFlags::NONE).unwrap(), 6);
        let mut rest = [0u8; 5];
        assert_eq!(consumer.read_data(&mut rest, ReadDataFlags::DISCARD).unwrap(), 5);
        assert!(matches!(
            consumer.read_data(&mut rest, ReadDataFlags::NONE),
            Err(CoreError::ShouldWait)
        ));
        close(producer, consumer);
    }

    #[test]
    fn producer_close_drains_then_reports_end_of_stream() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 16);
        producer.write_data(b"tail", WriteDataFlags::NONE).unwrap();
        producer.close().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 4);
        assert!(matches!(
            consumer.read_data(&mut buf, ReadDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        consumer.close().unwrap();
    }

    #[test]
    fn consumer_close_fails_writes() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 16);
        producer.write_data(b"dropped", WriteDataFlags::NONE).unwrap();
        consumer.close().unwrap();

        assert!(matches!(
            producer.write_data(b"more", WriteDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        let state = core.signals_state(&producer).unwrap();
        assert!(state.satisfies(Signals::PEER_CLOSED));
        assert!(!state.can_satisfy(Signals::WRITABLE));
        producer.close().unwrap();
    }

    #[test]
    fn two_phase_write_commits_a_prefix() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);

        let mut region = producer.begin_write_data(2, WriteDataFlags::NONE).unwrap();
        assert_eq!(region.len(), 8);
        region[..3].copy_from_slice(b"abc");
        assert!(matches!(
            producer.begin_write_data(1, WriteDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        assert!(matches!(
            producer.write_data(b"x", WriteDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        producer.end_write_data(region, 3).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        close(producer, consumer);
    }

    #[test]
    fn two_phase_write_region_is_contiguous_free_span() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        producer.write_data(b"123456", WriteDataFlags::NONE).unwrap();
        consumer.discard_data(4, ReadDataFlags::NONE).unwrap();

        // Buffered bytes sit at [4, 6); free space is [6, 8) then [0, 4).
        let region = producer.begin_write_data(0, WriteDataFlags::NONE).unwrap();
        assert_eq!(region.len(), 2);
        drop(region);

        // The size is a hint unless the caller insists on it.
        let region = producer.begin_write_data(4, WriteDataFlags::NONE).unwrap();
        assert_eq!(region.len(), 2);
        drop(region);
        assert!(matches!(
            producer.begin_write_data(4, WriteDataFlags::ALL_OR_NONE),
            Err(CoreError::OutOfRange(_))
        ));
        let region = producer
            .begin_write_data(2, WriteDataFlags::ALL_OR_NONE)
            .unwrap();
        producer.end_write_data(region, 0).unwrap();
        close(producer, consumer);
    }

    #[test]
    fn regions_alias_the_ring_storage() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);

        let mut region = producer.begin_write_data(1, WriteDataFlags::NONE).unwrap();
        let written_at = region.as_ptr();
        region[..3].copy_from_slice(b"abc");
        producer.end_write_data(region, 3).unwrap();

        let region = consumer.begin_read_data(ReadDataFlags::NONE).unwrap();
        assert_eq!(region.as_ptr(), written_at);
        assert_eq!(&region[..], b"abc");
        consumer.end_read_data(region, 3).unwrap();
        close(producer, consumer);
    }

    #[test]
    fn copies_work_around_outstanding_regions() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        producer.write_data(b"abcdef", WriteDataFlags::NONE).unwrap();

        let read = consumer.begin_read_data(ReadDataFlags::NONE).unwrap();
        assert_eq!(&read[..], b"abcdef");
        assert_eq!(producer.write_data(b"gh", WriteDataFlags::NONE).unwrap(), 2);
        assert!(matches!(
            producer.begin_write_data(0, WriteDataFlags::NONE),
            Err(CoreError::ShouldWait)
        ));
        consumer.end_read_data(read, 4).unwrap();

        // Readable "efgh" sits at [4, 8); the free span is [0, 4).
        let mut write = producer.begin_write_data(0, WriteDataFlags::NONE).unwrap();
        assert_eq!(write.len(), 4);
        let mut buf = [0u8; 2];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 2);
        assert_eq!(&buf, b"ef");
        write.copy_from_slice(b"ijkl");
        producer.end_write_data(write, 4).unwrap();

        let mut rest = [0u8; 8];
        assert_eq!(consumer.read_data(&mut rest, ReadDataFlags::NONE).unwrap(), 6);
        assert_eq!(&rest[..6], b"ghijkl");
        close(producer, consumer);
    }

    #[test]
    fn storage_rejoins_lent_spans() {
        let mut storage = Storage::new(16);
        let first = storage.lend(4, 4);
        let second = storage.lend(10, 2);
        assert_eq!(storage.pieces.len(), 3);

        storage.slice_mut(8, 2).copy_from_slice(b"xy");
        storage.restore(10, second);
        storage.restore(4, first);
        assert_eq!(storage.pieces.len(), 1);
        assert_eq!(storage.slice(8, 2), b"xy");

        let whole = storage.lend(0, 16);
        assert!(storage.pieces.is_empty());
        storage.restore(0, whole);
        assert_eq!(storage.pieces.len(), 1);
        assert_eq!(storage.slice(0, 16).len(), 16);
    }

    #[test]
    fn oversized_commit_ends_the_two_phase_write() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 4);
        let region = producer.begin_write_data(1, WriteDataFlags::NONE).unwrap();
        assert!(matches!(
            producer.end_write_data(region, 5),
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(consumer.available_bytes().unwrap(), 0);

        // The pair is over, so a fresh one can start.
        let region = producer.begin_write_data(1, WriteDataFlags::NONE).unwrap();
        producer.end_write_data(region, 0).unwrap();
        close(producer, consumer);
    }

    #[test]
    fn full_pipe_two_phase_write_should_wait() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 2);
        producer.write_data(b"xy", WriteDataFlags::NONE).unwrap();
        assert!(matches!(
            producer.begin_write_data(0, WriteDataFlags::NONE),
            Err(CoreError::ShouldWait)
        ));
        close(producer, consumer);
    }

    #[test]
    fn two_phase_read_consumes_a_prefix() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        producer.write_data(b"abcdef", WriteDataFlags::NONE).unwrap();

        let region = consumer.begin_read_data(ReadDataFlags::NONE).unwrap();
        assert_eq!(&region[..], b"abcdef");
        assert!(!core.signals_state(&consumer).unwrap().satisfies(Signals::READABLE));
        assert!(matches!(
            consumer.read_data(&mut [0u8; 1], ReadDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        consumer.end_read_data(region, 2).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(consumer.read_data(&mut buf, ReadDataFlags::NONE).unwrap(), 4);
        assert_eq!(&buf[..4], b"cdef");
        close(producer, consumer);
    }

    #[test]
    fn two_phase_read_on_empty_pipe() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        assert!(matches!(
            consumer.begin_read_data(ReadDataFlags::NONE),
            Err(CoreError::ShouldWait)
        ));
        producer.close().unwrap();
        assert!(matches!(
            consumer.begin_read_data(ReadDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        consumer.close().unwrap();
    }

    #[test]
    fn dropped_read_region_consumes_nothing() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        producer.write_data(b"keep", WriteDataFlags::NONE).unwrap();
        drop(consumer.begin_read_data(ReadDataFlags::NONE).unwrap());
        assert_eq!(consumer.available_bytes().unwrap(), 4);
        assert!(core.signals_state(&consumer).unwrap().satisfies(Signals::READABLE));
        close(producer, consumer);
    }

    #[test]
    fn closing_producer_ends_its_two_phase_write() {
        let core = Core::new();
        let (producer, consumer) = pipe_with(&core, 1, 8);
        let mut region = producer.begin_write_data(1, WriteDataFlags::NONE).unwrap();
        region[0] = b'z';
        producer.close().unwrap();
        drop(region);

        assert!(matches!(
            consumer.read_data(&mut [0u8; 1], ReadDataFlags::NONE),
            Err(CoreError::FailedPrecondition(_))
        ));
        consumer.close().unwrap();
    }
}
