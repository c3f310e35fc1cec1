//! Offline dump parsing.
//!
//! A dump (or a core dump) is a raw image of the whole buffer, nothing
//! more. Committed records are found by magic, never by trusting a
//! header: at every 16-byte-aligned offset, a record starts iff the
//! 16-byte window bears the prefix. Its payload runs to the next
//! aligned window bearing the prefix, the next all-zero aligned window,
//! or the end of the enclosing chunk, whichever comes first.
//!
//! Torn records never surface: until the prefix is stamped, their slot
//! is zero, exactly like memory that was never written. Chunks are
//! recycled without wiping, so an image can also carry records from
//! earlier laps of the ring; each of those was committed once and is
//! reported like any other.

use std::fs;
use std::path::Path;

use zerocopy::FromBytes;

use crate::chunk::{
    ChunkHeader, CHUNK_HEADER_SIZE, RECORD_ALIGNMENT, RECORD_PREFIX, RECORD_PREFIX_SIZE,
};

#[derive(Debug)]
pub enum ScanError {
    Io(std::io::Error),
    /// Empty image, zero chunk size, or image length not a multiple of
    /// the chunk size.
    BadGeometry,
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Io(e)
    }
}

/// A committed record found in a dump image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord<'a> {
    /// Offset of the record's prefix within the image.
    pub offset: usize,
    /// Payload bytes. Record lengths are not stored, so a payload may
    /// carry trailing bytes up to its terminating window: alignment
    /// zeros, or residue from an earlier lap of the chunk.
    pub payload: &'a [u8],
}

/// Raw bytes of a dumped buffer.
pub struct DumpImage {
    bytes: Vec<u8>,
}

impl DumpImage {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScanError> {
        Ok(Self {
            bytes: fs::read(path)?,
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Iterate every committed record, given the chunk size the log was
    /// initialized with.
    pub fn records(&self, chunk_size: usize) -> Result<Records<'_>, ScanError> {
        if chunk_size == 0 || self.bytes.is_empty() || self.bytes.len() % chunk_size != 0 {
            return Err(ScanError::BadGeometry);
        }
        Ok(Records {
            image: &self.bytes,
            chunk_size,
            pos: 0,
        })
    }

    /// The fill offset each chunk header recorded at dump time.
    /// Diagnostic only: the record scan never trusts these.
    pub fn chunk_fills(&self, chunk_size: usize) -> Result<Vec<u64>, ScanError> {
        if chunk_size < CHUNK_HEADER_SIZE || self.bytes.is_empty() || self.bytes.len() % chunk_size != 0
        {
            return Err(ScanError::BadGeometry);
        }
        self.bytes
            .chunks_exact(chunk_size)
            .map(|chunk| {
                ChunkHeader::read_from_bytes(&chunk[..CHUNK_HEADER_SIZE])
                    .map(|header| header.fill)
                    .map_err(|_| ScanError::BadGeometry)
            })
            .collect()
    }
}

/// Iterator over the committed records of a [`DumpImage`].
pub struct Records<'a> {
    image: &'a [u8],
    chunk_size: usize,
    /// Cursor over aligned window offsets.
    pos: usize,
}

impl<'a> Records<'a> {
    /// End of the payload that starts at `payload_start`, per the
    /// termination rules, clamped to the chunk that holds the record.
    fn payload_end(&self, payload_start: usize, chunk_end: usize) -> usize {
        let chunk_end = chunk_end.min(self.image.len());
        let mut probe = payload_start;
        while probe + RECORD_PREFIX_SIZE <= chunk_end {
            let window = &self.image[probe..probe + RECORD_PREFIX_SIZE];
            if *window == RECORD_PREFIX || window.iter().all(|&b| b == 0) {
                return probe;
            }
            probe += RECORD_ALIGNMENT;
        }
        chunk_end
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = ScannedRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + RECORD_PREFIX_SIZE <= self.image.len() {
            let start = self.pos;
            self.pos += RECORD_ALIGNMENT;

            if self.image[start..start + RECORD_PREFIX_SIZE] != RECORD_PREFIX {
                continue;
            }

            let payload_start = start + RECORD_PREFIX_SIZE;
            let chunk_end = (start / self.chunk_size + 1) * self.chunk_size;
            let end = self.payload_end(payload_start, chunk_end);

            return Some(ScannedRecord {
                offset: start,
                payload: &self.image[payload_start.min(end)..end],
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build an image: chunks of `chunk_size`, records placed by
    /// (chunk index, offset within chunk, payload).
    fn image(chunk_size: usize, chunks: usize, records: &[(usize, usize, &[u8])]) -> Vec<u8> {
        let mut buf = vec![0u8; chunk_size * chunks];
        for &(chunk, offset, payload) in records {
            let at = chunk * chunk_size + offset;
            buf[at..at + RECORD_PREFIX_SIZE].copy_from_slice(&RECORD_PREFIX);
            buf[at + RECORD_PREFIX_SIZE..at + RECORD_PREFIX_SIZE + payload.len()]
                .copy_from_slice(payload);
        }
        buf
    }

    #[test]
    fn test_single_record() {
        let img = DumpImage::from_bytes(image(128, 2, &[(0, 16, b"hello")]));
        let records: Vec<_> = img.records(128).unwrap().collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 16);
        assert!(records[0].payload.starts_with(b"hello"));
        // Terminated by the all-zero window right after it.
        assert_eq!(records[0].payload.len(), 16);
    }

    #[test]
    fn test_back_to_back_records_terminate_each_other() {
        let img = DumpImage::from_bytes(image(
            128,
            1,
            &[(0, 16, b"first record txt"), (0, 48, b"second")],
        ));
        let records: Vec<_> = img.records(128).unwrap().collect();

        assert_eq!(records.len(), 2);
        // 16 payload bytes exactly: the next window is the second magic.
        assert_eq!(records[0].payload, b"first record txt");
        assert_eq!(records[1].offset, 48);
    }

    #[test]
    fn test_torn_record_is_invisible() {
        // Payload bytes landed but the prefix was never stamped: the
        // slot reads as zeros plus garbage, never as a record.
        let mut buf = image(128, 1, &[(0, 16, b"committed")]);
        buf[48 + RECORD_PREFIX_SIZE..48 + RECORD_PREFIX_SIZE + 4].copy_from_slice(b"torn");

        let img = DumpImage::from_bytes(buf);
        let records: Vec<_> = img.records(128).unwrap().collect();

        assert_eq!(records.len(), 1);
        assert!(records[0].payload.starts_with(b"committed"));
    }

    #[test]
    fn test_payload_clamped_at_chunk_boundary() {
        // A record near the chunk end with non-zero residue after it in
        // the next chunk: the payload must not cross over.
        let mut buf = image(64, 2, &[(0, 32, b"tail")]);
        buf[64..80].copy_from_slice(&[0xAA; 16]);

        let img = DumpImage::from_bytes(buf);
        let records: Vec<_> = img.records(64).unwrap().collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 32);
        // Runs from 48 to the chunk end at 64, no further.
        assert_eq!(records[0].payload.len(), 16);
        assert!(records[0].payload.starts_with(b"tail"));
    }

    #[test]
    fn test_stale_lap_records_still_surface() {
        // A recycled chunk: a fresh record at the front, an old lap's
        // record still intact further in.
        let img = DumpImage::from_bytes(image(
            128,
            1,
            &[(0, 16, b"fresh"), (0, 96, b"stale lap")],
        ));
        let records: Vec<_> = img.records(128).unwrap().collect();

        assert_eq!(records.len(), 2);
        assert!(records[0].payload.starts_with(b"fresh"));
        assert!(records[1].payload.starts_with(b"stale lap"));
    }

    #[test]
    fn test_unaligned_chunk_size_records_on_absolute_boundaries() {
        // chunk_size 33: chunk 1 starts at 33, so its first record slot
        // sits at chunk-relative 15, absolute 48. The scan strides over
        // absolute offsets and must land on it.
        let img = DumpImage::from_bytes(image(33, 2, &[(0, 16, b"a"), (1, 15, b"b")]));
        let records: Vec<_> = img.records(33).unwrap().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 16);
        assert_eq!(records[1].offset, 48);
        assert!(records[0].payload.starts_with(b"a"));
        assert!(records[1].payload.starts_with(b"b"));
    }

    #[test]
    fn test_bad_geometry() {
        let img = DumpImage::from_bytes(vec![0u8; 100]);
        assert!(matches!(img.records(64), Err(ScanError::BadGeometry)));
        assert!(matches!(img.records(0), Err(ScanError::BadGeometry)));

        let empty = DumpImage::from_bytes(Vec::new());
        assert!(matches!(empty.records(64), Err(ScanError::BadGeometry)));
    }

    #[test]
    fn test_chunk_fills_parse() {
        let mut buf = vec![0u8; 256];
        buf[0..8].copy_from_slice(&64u64.to_ne_bytes());
        buf[128..136].copy_from_slice(&16u64.to_ne_bytes());

        let img = DumpImage::from_bytes(buf);
        assert_eq!(img.chunk_fills(128).unwrap(), vec![64, 16]);
    }
}
