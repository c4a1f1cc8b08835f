//! The unit of work a graph module consumes: a half-open index range over
//! the expanded batch.

use std::ops::Range;

/// A half-open `[begin, end)` range of slot indices.
///
/// The chunks of one graph run partition `[0, expanded_batch)` exactly
/// once; a chunk is never re-delivered and never overlaps another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    begin: u32,
    end: u32,
}

impl Chunk {
    /// Creates the chunk `[begin, end)`.
    ///
    /// # Panics
    /// Panics if `begin > end`.
    pub fn new(begin: u32, end: u32) -> Self {
        assert!(begin <= end, "chunk begin {} exceeds end {}", begin, end);
        Self { begin, end }
    }

    /// The inclusive lower bound.
    pub fn begin(self) -> u32 {
        self.begin
    }

    /// The exclusive upper bound.
    pub fn end(self) -> u32 {
        self.end
    }

    /// The number of slots covered.
    pub fn len(self) -> u32 {
        self.end - self.begin
    }

    /// Whether the chunk covers no slots.
    pub fn is_empty(self) -> bool {
        self.begin == self.end
    }

    /// The covered slot indices.
    pub fn range(self) -> Range<u32> {
        self.begin..self.end
    }

    /// Splits the chunk into consecutive pieces of at most `width` slots.
    pub fn split(self, width: u32) -> impl Iterator<Item = Chunk> {
        let width = width.max(1);
        let (begin, end) = (self.begin, self.end);
        (begin..end).step_by(width as usize).map(move |piece_begin| {
            let piece_end = (piece_begin + width).min(end);
            Chunk::new(piece_begin, piece_end)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_partitions_exactly() {
        let chunk = Chunk::new(0, 10);
        let pieces: Vec<_> = chunk.split(4).collect();
        assert_eq!(
            pieces,
            vec![Chunk::new(0, 4), Chunk::new(4, 8), Chunk::new(8, 10)]
        );
        let total: u32 = pieces.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn split_wider_than_chunk_is_identity() {
        let chunk = Chunk::new(3, 7);
        let pieces: Vec<_> = chunk.split(16).collect();
        assert_eq!(pieces, vec![chunk]);
    }

    #[test]
    fn empty_chunk_splits_to_nothing() {
        let chunk = Chunk::new(5, 5);
        assert_eq!(chunk.split(2).count(), 0);
        assert!(chunk.is_empty());
    }
}
