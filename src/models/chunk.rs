//! Chunk geometry: how a file is cut into fixed-size pieces.
//!
//! Pure math, no I/O. Both the client splitter and the server's size checks
//! work off these spans.

/// Default piece size (5 MiB). The server may override it at initiate time
/// and the client adopts the server value.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single chunk the server accepts.
pub const MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Largest artifact the server accepts.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// A half-open byte range `[start, end)` at a dense, 0-based `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A span whose bytes have been fingerprinted.
///
/// The bytes themselves are never carried along; digesting and transfer both
/// read the range from the source file on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub digest: String,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks a file of `file_size` bytes splits into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> usize {
    if file_size == 0 || chunk_size == 0 {
        return 0;
    }
    (file_size.div_ceil(chunk_size)) as usize
}

/// Cut `file_size` bytes into `⌈file_size / chunk_size⌉` ordered spans.
///
/// `start = index * chunk_size`; the last span may be shorter.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let n = chunk_count(file_size, chunk_size);
    let mut spans = Vec::with_capacity(n);
    for index in 0..n {
        let start = index as u64 * chunk_size;
        let end = (start + chunk_size).min(file_size);
        spans.push(ChunkSpan { index, start, end });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn single_short_chunk() {
        let spans = plan_chunks(1024, DEFAULT_CHUNK_SIZE);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], ChunkSpan { index: 0, start: 0, end: 1024 });
    }

    #[test]
    fn exact_multiple() {
        let spans = plan_chunks(10 * MIB, 5 * MIB);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].len(), 5 * MIB);
        assert_eq!(spans[1].start, 5 * MIB);
        assert_eq!(spans[1].end, 10 * MIB);
    }

    #[test]
    fn uneven_last_chunk() {
        let spans = plan_chunks(12 * MIB, 5 * MIB);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[2].len(), 2 * MIB);
    }

    #[test]
    fn indices_are_dense_and_contiguous() {
        let spans = plan_chunks(10 * MIB + 1, 3 * MIB);
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.index, i);
            assert_eq!(span.start, i as u64 * 3 * MIB);
        }
        let total: u64 = spans.iter().map(ChunkSpan::len).sum();
        assert_eq!(total, 10 * MIB + 1);
    }

    #[test]
    fn empty_file_has_no_chunks() {
        assert!(plan_chunks(0, DEFAULT_CHUNK_SIZE).is_empty());
        assert_eq!(chunk_count(0, DEFAULT_CHUNK_SIZE), 0);
    }
}
