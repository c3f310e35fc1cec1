//! Process-global log facade: lifecycle, writer entry points, dump.
//!
//! At most one context lives per process. Writers resolve it with one
//! atomic load, reach through their thread-local holder for a chunk, and
//! append. The append path makes no syscalls and takes no locks; the
//! only syscall-bearing operations are [`initialize`] (allocate and
//! pre-fault) and [`dump`] (bulk file write).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::chunk::{Chunk, ChunkHeader, PAGE_SIZE, RECORD_ALIGNMENT, RECORD_PREFIX, RECORD_PREFIX_SIZE};
use crate::holder::{ChunkHolder, CURRENT_CHUNK};
use crate::render::BoundedWriter;
use crate::ring::PtrRing;

/// Why `initialize` refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// A context is already installed; `finalize` first.
    AlreadyInitialized,
    /// `chunk_size <= 18`, `total_size < chunk_size`, or `total_size`
    /// is not a multiple of `chunk_size`.
    InvalidGeometry,
    /// The backing buffer could not be allocated.
    AllocationFailed,
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// No context is installed.
    NotInitialized,
    /// The record cannot fit any chunk.
    RecordTooLarge,
    /// The ring was empty on both the initial acquisition and the one
    /// permitted rotation.
    NoFreeChunks,
    /// A `Display` impl failed while rendering a formatted record.
    RenderFailed,
}

/// Why `dump` failed.
#[derive(Debug)]
pub enum DumpError {
    /// No context is installed.
    NotInitialized,
    Io(std::io::Error),
}

impl From<std::io::Error> for DumpError {
    fn from(e: std::io::Error) -> Self {
        DumpError::Io(e)
    }
}

/// The singleton behind the facade: the big buffer and the chunk ring.
///
/// The buffer outlives every chunk pointer held by any thread or by the
/// ring: chunks are carved from it at construction and no handle to
/// them escapes the crate.
pub(crate) struct GlobalContext {
    buf: NonNull<u8>,
    layout: Layout,
    chunk_size: usize,
    total_size: usize,
    ring: PtrRing<ChunkHeader>,
}

// SAFETY: the buffer is shared across threads, but each byte range is
// written only by the thread holding the enclosing chunk, and chunk
// ownership transfers exclusively through the ring.
unsafe impl Send for GlobalContext {}
unsafe impl Sync for GlobalContext {}

impl GlobalContext {
    fn new(total_size: usize, chunk_size: usize) -> Result<Box<Self>, InitError> {
        let layout = Layout::from_size_align(total_size, RECORD_ALIGNMENT)
            .map_err(|_| InitError::InvalidGeometry)?;

        // SAFETY: geometry was validated, so the layout is non-zero.
        let buf = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(InitError::AllocationFailed)?;

        // Touch one byte per page so no writer ever takes the first-fault
        // hit. Volatile keeps the stores from folding into nothing.
        let mut offset = 0;
        while offset < total_size {
            // SAFETY: offset < total_size, inside the allocation.
            unsafe { buf.as_ptr().add(offset).write_volatile(0) };
            offset += PAGE_SIZE;
        }

        let chunk_count = total_size / chunk_size;
        let ctx = Box::new(Self {
            buf,
            layout,
            chunk_size,
            total_size,
            ring: PtrRing::new(chunk_count),
        });

        for i in 0..chunk_count {
            // SAFETY: i * chunk_size < total_size; derived from a
            // non-null base by an in-bounds offset.
            let chunk = unsafe {
                NonNull::new_unchecked(ctx.buf.as_ptr().add(i * chunk_size).cast::<ChunkHeader>())
            };
            let _seeded = ctx.ring.try_enqueue(chunk);
            debug_assert!(_seeded.is_ok(), "exact-capacity ring cannot be full while seeding");
        }

        Ok(ctx)
    }

    #[inline(always)]
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn dequeue_chunk(&self) -> Option<Chunk> {
        let ptr = self.ring.try_dequeue()?;
        // SAFETY: every pointer in the ring was carved from `buf`, which
        // lives as long as `self`.
        Some(unsafe { Chunk::from_raw(ptr) })
    }

    pub(crate) fn enqueue_chunk(&self, chunk: Chunk) {
        // Ring capacity equals the chunk count, so returning an owned
        // chunk cannot find it full.
        let _returned = self.ring.try_enqueue(chunk.as_non_null());
        debug_assert!(_returned.is_ok(), "returning an owned chunk cannot overfill the ring");
    }

    /// Copy the whole buffer out through volatile reads: writers may be
    /// racing into it, and the copy must not be optimized against.
    fn snapshot(&self) -> Vec<u8> {
        const WORD: usize = std::mem::size_of::<usize>();

        let mut image = vec![0u8; self.total_size];
        let src = self.buf.as_ptr();
        let dst = image.as_mut_ptr();
        let words = self.total_size / WORD;

        // SAFETY: both regions are total_size bytes; src is
        // WORD-aligned (the buffer is 16-aligned), dst may not be.
        unsafe {
            for i in 0..words {
                let v = src.add(i * WORD).cast::<usize>().read_volatile();
                dst.add(i * WORD).cast::<usize>().write_unaligned(v);
            }
            for i in words * WORD..self.total_size {
                dst.add(i).write(src.add(i).read_volatile());
            }
        }
        image
    }
}

impl Drop for GlobalContext {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `new`.
        unsafe { dealloc(self.buf.as_ptr(), self.layout) };
    }
}

static GLOBAL_CTX: AtomicPtr<GlobalContext> = AtomicPtr::new(ptr::null_mut());

/// The installed context, if any.
///
/// The reference stays valid until [`finalize`] runs; `finalize`'s
/// contract (no concurrent users) is what makes handing out `'static`
/// here sound.
pub(crate) fn current_context() -> Option<&'static GlobalContext> {
    let ptr = GLOBAL_CTX.load(Ordering::Acquire);
    // SAFETY: non-null means an installed, fully constructed context;
    // see the finalize contract for why it cannot be freed under us.
    unsafe { ptr.as_ref() }
}

/// Set up the process-global log: one `total_size`-byte buffer split
/// into `total_size / chunk_size` chunks, every page pre-faulted, every
/// chunk in the ring.
///
/// Geometry must satisfy `chunk_size > 18`, `total_size >= chunk_size`
/// and `total_size % chunk_size == 0`. Succeeds at most once until a
/// matching [`finalize`]; a concurrent racer loses cleanly.
pub fn initialize(total_size: usize, chunk_size: usize) -> Result<(), InitError> {
    if chunk_size <= RECORD_PREFIX_SIZE + 2
        || total_size < chunk_size
        || total_size % chunk_size != 0
    {
        return Err(InitError::InvalidGeometry);
    }

    let ctx = Box::into_raw(GlobalContext::new(total_size, chunk_size)?);
    match GLOBAL_CTX.compare_exchange(ptr::null_mut(), ctx, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(()),
        Err(_) => {
            // Lost the install race; the fresh context never became
            // visible to anyone.
            // SAFETY: `ctx` came from Box::into_raw two lines up.
            drop(unsafe { Box::from_raw(ctx) });
            Err(InitError::AlreadyInitialized)
        }
    }
}

/// Tear down the process-global log and free the buffer. Idempotent.
/// Also forgets the calling thread's held chunk, which pointed into the
/// freed buffer.
///
/// # Safety
///
/// No other thread may be inside [`write`], [`format_write`] or
/// [`dump`], or exiting with a held chunk, while this runs: they would
/// be reaching into the buffer being freed.
pub unsafe fn finalize() {
    let old = GLOBAL_CTX.swap(ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        // SAFETY: installed pointers only ever come from Box::into_raw
        // in `initialize`, and the caller upholds exclusivity.
        drop(unsafe { Box::from_raw(old) });
    }
    let _ = CURRENT_CHUNK.try_with(ChunkHolder::clear);
}

/// The held chunk if the record fits it, else the one permitted
/// rotation's fresh chunk.
fn acquire_fitting(
    holder: &ChunkHolder,
    ctx: &GlobalContext,
    len: usize,
) -> Result<Chunk, WriteError> {
    let chunk = holder.get(ctx).ok_or(WriteError::NoFreeChunks)?;
    // SAFETY (all three): the holder owns the chunk exclusively and ctx
    // is the context it was carved from.
    if !unsafe { chunk.out_of_space(ctx.chunk_size(), len) } {
        return Ok(chunk);
    }
    let chunk = holder.rotate(ctx).ok_or(WriteError::NoFreeChunks)?;
    if unsafe { chunk.out_of_space(ctx.chunk_size(), len) } {
        // Fits no chunk: the header and the alignment gap eat the
        // front of even a fresh chunk, so its payload budget tops out
        // below chunk_size - 16.
        return Err(WriteError::NoFreeChunks);
    }
    Ok(chunk)
}

/// Stamp the magic prefix: the commit point of a record.
///
/// The fence keeps every payload store above the stamp, at the compiler
/// level and with a store-store barrier on architectures that need one
/// for other cores to agree.
#[inline]
unsafe fn stamp_prefix(prefix: *mut u8) {
    fence(Ordering::Release);
    // SAFETY: caller reserved RECORD_PREFIX_SIZE bytes at `prefix`.
    unsafe { ptr::copy_nonoverlapping(RECORD_PREFIX.as_ptr(), prefix, RECORD_PREFIX_SIZE) };
}

/// Append a raw record.
///
/// On success the record is committed: any later [`dump`], or a core
/// dump of this process, contains the magic prefix followed by exactly
/// these bytes at a 16-byte-aligned offset.
pub fn write(payload: &[u8]) -> Result<(), WriteError> {
    let ctx = current_context().ok_or(WriteError::NotInitialized)?;
    if payload.len() > ctx.chunk_size() - RECORD_PREFIX_SIZE {
        return Err(WriteError::RecordTooLarge);
    }

    CURRENT_CHUNK
        .try_with(|holder| {
            let chunk = acquire_fitting(holder, ctx, payload.len())?;
            // SAFETY: sole owner of `chunk`; the out_of_space check in
            // acquire_fitting bounds every offset below.
            unsafe {
                let start = chunk.fill();
                let prefix = chunk.fill_point();
                ptr::write_bytes(prefix, 0, RECORD_PREFIX_SIZE);
                ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    prefix.add(RECORD_PREFIX_SIZE),
                    payload.len(),
                );
                stamp_prefix(prefix);
                chunk.advance_to(start + RECORD_PREFIX_SIZE + payload.len());
            }
            Ok(())
        })
        // TLS destructor already ran: the thread is exiting, drop the record.
        .unwrap_or(Err(WriteError::NotInitialized))
}

/// Smallest budget worth attempting a render into.
const FORMAT_PROBE_LEN: usize = 2;

enum RenderOutcome {
    Committed,
    Overflow,
}

/// Render `args` at the chunk's fill point with the space that is left.
///
/// # Safety
///
/// Caller is the sole owner of `chunk`, which was carved by `ctx`.
unsafe fn try_render(
    ctx: &GlobalContext,
    chunk: Chunk,
    args: fmt::Arguments<'_>,
) -> Result<RenderOutcome, WriteError> {
    // SAFETY: ownership per the function contract; the region handed to
    // the writer is fill + 16 .. chunk_size, in bounds because
    // acquire_fitting guaranteed at least the probe length.
    unsafe {
        let start = chunk.fill();
        let prefix = chunk.fill_point();
        let budget = chunk.available(ctx.chunk_size()) - RECORD_PREFIX_SIZE;

        ptr::write_bytes(prefix, 0, RECORD_PREFIX_SIZE);

        let region = slice::from_raw_parts_mut(prefix.add(RECORD_PREFIX_SIZE), budget);
        let mut writer = BoundedWriter::new(region);
        if fmt::write(&mut writer, args).is_err() {
            return Err(WriteError::RenderFailed);
        }
        if writer.overflowed() {
            return Ok(RenderOutcome::Overflow);
        }

        let len = writer.intended_len();
        stamp_prefix(prefix);
        chunk.advance_to(start + RECORD_PREFIX_SIZE + len);
        Ok(RenderOutcome::Committed)
    }
}

/// Append a formatted record, rendering straight into the chunk.
///
/// Rendering gets the current chunk's remaining budget; output that
/// would not fit triggers one rotation and a second rendering pass (so
/// `Display` impls may run twice). A record too large for a fresh chunk
/// is dropped. Reentrant appends from inside a `Display` impl land in
/// the same chunk and can clobber the record being rendered; committed
/// records are never affected.
pub fn format_write(args: fmt::Arguments<'_>) -> Result<(), WriteError> {
    let ctx = current_context().ok_or(WriteError::NotInitialized)?;

    CURRENT_CHUNK
        .try_with(|holder| {
            let chunk = acquire_fitting(holder, ctx, FORMAT_PROBE_LEN)?;
            // SAFETY: chunks from the holder are exclusively ours.
            match unsafe { try_render(ctx, chunk, args) }? {
                RenderOutcome::Committed => Ok(()),
                RenderOutcome::Overflow => {
                    let chunk = holder.rotate(ctx).ok_or(WriteError::NoFreeChunks)?;
                    // SAFETY: as above.
                    match unsafe { try_render(ctx, chunk, args) }? {
                        RenderOutcome::Committed => Ok(()),
                        RenderOutcome::Overflow => Err(WriteError::RecordTooLarge),
                    }
                }
            }
        })
        .unwrap_or(Err(WriteError::NotInitialized))
}

/// Append a formatted record to the global log.
///
/// Expands to [`format_write`] over [`core::format_args!`]:
///
/// ```
/// # blackbox::initialize(1 << 16, 1 << 12).unwrap();
/// blackbox::format_write!("{} or {}, {}\n", "love me", "leave me", 99).unwrap();
/// # unsafe { blackbox::finalize() };
/// ```
#[macro_export]
macro_rules! format_write {
    ($($arg:tt)*) => {
        $crate::format_write(::core::format_args!($($arg)*))
    };
}

/// Write the raw buffer image to `path`, truncating anything already
/// there. The file is exactly `total_size` bytes: offline tooling
/// depends on offsets, so an existing file must not leak older content.
///
/// Writers are not quiesced; this is a best-effort snapshot, and the
/// prefix-commit discipline keeps it parseable at any instant.
pub fn dump<P: AsRef<Path>>(path: P) -> Result<(), DumpError> {
    let ctx = current_context().ok_or(DumpError::NotInitialized)?;
    let image = ctx.snapshot();

    let mut file = File::create(path)?;
    file.write_all(&image)?;
    Ok(())
}
