//! Densely packed, fixed-length buffers of group elements with zero-copy
//! sub-buffer views.
//!
//! Graph modules of the same phase always touch disjoint slot ranges, so the
//! per-element locks are uncontended in practice; they exist so that a
//! buffer can be shared by reference across the worker pool without any
//! unsafe aliasing.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use super::{CyclicGroup, Int};

/// An error produced by sub-buffer slicing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The requested view does not fit inside the parent buffer.
    #[error("sub-buffer [{offset}, {offset}+{len}) exceeds parent length {parent}")]
    OutOfRange {
        offset: usize,
        len: usize,
        parent: usize,
    },
}

/// A fixed-length ordered sequence of [`Int`], densely packed over shared
/// backing storage.
///
/// [`IntBuffer::get_sub_buffer`] produces O(1) views over the same storage:
/// mutating `sub.get(i)` is observable at `parent.get(offset + i)` and vice
/// versa. The view's lifetime is tied to the shared storage, so it can
/// never outlive its parent's backing allocation.
#[derive(Debug, Clone)]
pub struct IntBuffer {
    storage: Arc<Vec<Mutex<Int>>>,
    offset: usize,
    len: usize,
}

impl IntBuffer {
    /// Allocates a buffer of `len` elements, each initialized to the
    /// group's multiplicative identity.
    pub fn new(group: &CyclicGroup, len: usize) -> Self {
        let storage = (0..len).map(|_| Mutex::new(group.new_int())).collect();
        Self {
            storage: Arc::new(storage),
            offset: 0,
            len,
        }
    }

    /// The number of elements visible through this buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero visible elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks and returns the element at `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`, like slice indexing.
    pub fn get(&self, index: usize) -> MutexGuard<'_, Int> {
        assert!(
            index < self.len,
            "index {} out of bounds for buffer of length {}",
            index,
            self.len
        );
        self.storage[self.offset + index].lock()
    }

    /// A zero-copy view of `[offset, offset + len)` over the same backing
    /// storage.
    pub fn get_sub_buffer(&self, offset: usize, len: usize) -> Result<IntBuffer, BufferError> {
        if offset + len > self.len {
            return Err(BufferError::OutOfRange {
                offset,
                len,
                parent: self.len,
            });
        }
        Ok(IntBuffer {
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            len,
        })
    }

    /// Zeroes every element and invalidates its fingerprint, so that any
    /// subsequent arithmetic on the buffer fails.
    pub fn erase(&self) {
        for index in 0..self.len {
            self.storage[self.offset + index].lock().erase();
        }
    }
}
