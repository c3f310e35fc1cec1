//! Per-thread chunk ownership.
//!
//! Each thread owns at most one chunk at a time. Acquisition and return
//! both go through the context's ring; a thread that exits holding a
//! chunk hands it back through its TLS destructor, so chunks are never
//! stranded by short-lived threads.

use std::cell::Cell;

use crate::chunk::Chunk;
use crate::log::{current_context, GlobalContext};

pub(crate) struct ChunkHolder {
    chunk: Cell<Option<Chunk>>,
}

impl ChunkHolder {
    pub(crate) const fn new() -> Self {
        Self {
            chunk: Cell::new(None),
        }
    }

    /// The held chunk, or a fresh one dequeued from the ring and reset.
    /// `None` iff the ring is empty.
    pub(crate) fn get(&self, ctx: &GlobalContext) -> Option<Chunk> {
        if let Some(chunk) = self.chunk.get() {
            return Some(chunk);
        }
        let chunk = ctx.dequeue_chunk()?;
        // SAFETY: just dequeued, so this thread is the sole owner.
        unsafe { chunk.reset() };
        self.chunk.set(Some(chunk));
        Some(chunk)
    }

    /// Return the held chunk (if any) to the ring, then acquire a fresh
    /// one exactly as `get` does.
    pub(crate) fn rotate(&self, ctx: &GlobalContext) -> Option<Chunk> {
        if let Some(chunk) = self.chunk.take() {
            ctx.enqueue_chunk(chunk);
        }
        let chunk = ctx.dequeue_chunk()?;
        // SAFETY: just dequeued, so this thread is the sole owner.
        unsafe { chunk.reset() };
        self.chunk.set(Some(chunk));
        Some(chunk)
    }

    /// Forget the held chunk without returning it anywhere. Used when
    /// the context it was carved from is gone.
    pub(crate) fn clear(&self) {
        self.chunk.set(None);
    }
}

impl Drop for ChunkHolder {
    fn drop(&mut self) {
        // Thread exit: hand the chunk back if a context is still
        // installed. If none is, the buffer the chunk pointed into is
        // gone and there is nothing to return.
        if let Some(chunk) = self.chunk.take() {
            if let Some(ctx) = current_context() {
                ctx.enqueue_chunk(chunk);
            }
        }
    }
}

thread_local! {
    pub(crate) static CURRENT_CHUNK: ChunkHolder = const { ChunkHolder::new() };
}
