//! # blackbox
//!
//! An in-memory, crash-survivable log buffer for diagnostic records.
//!
//! One fixed-size allocation, pre-faulted at [`initialize`], is carved
//! into fixed-size chunks that circulate through a bounded lock-free MPMC
//! pointer ring. Each writer thread owns at most one chunk at a time, so
//! appending a record is a small memcpy into thread-private memory: no
//! locks, no allocation, no syscalls on the write path. Threads touch the
//! ring only at chunk boundaries.
//!
//! A record becomes visible to any scan only when its 16-byte magic
//! prefix is stamped over the pre-zeroed prefix slot. Until then the slot
//! is indistinguishable from untouched memory, so a [`dump`] taken at any
//! instant — or a core dump taken at a crash — is always parseable:
//! torn and in-flight records simply do not exist to the scanner.
//!
//! ## What this is not
//!
//! Records from different threads carry no relative order. Nothing is
//! durable until an explicit [`dump`]. There are no timestamps, levels or
//! fields, and no back-pressure: a writer that finds no free chunk drops
//! its record and reports it.
//!
//! ## Example
//!
//! ```
//! blackbox::initialize(1 << 16, 1 << 12).unwrap();
//! blackbox::write(b"reactor started\n").unwrap();
//! blackbox::format_write!("worker {} online\n", 3).unwrap();
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("box.dump");
//! blackbox::dump(&path).unwrap();
//!
//! let image = blackbox::DumpImage::from_file(&path).unwrap();
//! let records: Vec<_> = image.records(1 << 12).unwrap().collect();
//! assert!(records.iter().any(|r| r.payload.starts_with(b"reactor started\n")));
//!
//! // Safety: no other thread is writing.
//! unsafe { blackbox::finalize() };
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod chunk;
mod holder;
pub mod log;
pub mod render;
pub mod ring;
pub mod scan;

pub use crate::chunk::{RECORD_ALIGNMENT, RECORD_PREFIX, RECORD_PREFIX_SIZE};
pub use crate::log::{
    dump, finalize, format_write, initialize, write, DumpError, InitError, WriteError,
};
pub use crate::render::BoundedWriter;
pub use crate::ring::PtrRing;
pub use crate::scan::{DumpImage, ScanError, ScannedRecord};
