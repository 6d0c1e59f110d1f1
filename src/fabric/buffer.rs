//! Element storage shared between a rank's worker threads and the fabric.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Range;
use std::ptr;
use std::sync::Arc;

/// Fixed-length `f64` buffer whose disjoint ranges may be accessed from
/// several threads at once.
///
/// The fabric copies partitions between ranks while worker threads prepare
/// other partitions of the same buffer. Soundness rests on one rule: a range
/// is never written by one thread while any other thread reads or writes an
/// overlapping range. Channels and windows uphold it through their
/// ready/arrived counters (Release on publish, Acquire on observe).
pub struct SharedBuffer {
    cells: Box<[UnsafeCell<f64>]>,
}

// SAFETY: all access goes through the unsafe accessors below, whose callers
// guarantee disjointness of concurrently accessed ranges.
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::from_vec(vec![0.0; len])
    }

    pub fn from_vec(values: Vec<f64>) -> Arc<Self> {
        let cells = values
            .into_iter()
            .map(UnsafeCell::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self { cells })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn base(&self) -> *mut f64 {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    fn check(&self, range: &Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= self.len(),
            "range {:?} out of bounds for buffer of {} elements",
            range,
            self.len()
        );
    }

    /// # Safety
    /// No other thread may write to `range` while the slice is alive.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[f64] {
        self.check(&range);
        std::slice::from_raw_parts(self.base().add(range.start), range.len())
    }

    /// # Safety
    /// No other thread may access `range` while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [f64] {
        self.check(&range);
        std::slice::from_raw_parts_mut(self.base().add(range.start), range.len())
    }

    /// Copies `len` elements from `src[src_offset..]` into `self[dst_offset..]`.
    ///
    /// # Safety
    /// The source range must not be written and the destination range must
    /// not be accessed by any other thread during the copy.
    pub unsafe fn copy_from(&self, dst_offset: usize, src: &SharedBuffer, src_offset: usize, len: usize) {
        self.check(&(dst_offset..dst_offset + len));
        src.check(&(src_offset..src_offset + len));
        ptr::copy(src.base().add(src_offset), self.base().add(dst_offset), len);
    }

    /// Snapshot of the whole buffer.
    ///
    /// # Safety
    /// No thread may write to the buffer during the copy.
    pub unsafe fn to_vec(&self) -> Vec<f64> {
        self.slice(0..self.len()).to_vec()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len()).finish()
    }
}

/// A contiguous window `[offset, offset + len)` into a [`SharedBuffer`].
#[derive(Clone, Debug)]
pub struct BufferSlice {
    buffer: Arc<SharedBuffer>,
    offset: usize,
    len: usize,
}

impl BufferSlice {
    pub fn new(buffer: Arc<SharedBuffer>, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        (end <= buffer.len()).then_some(Self { buffer, offset, len })
    }

    pub fn whole(buffer: Arc<SharedBuffer>) -> Self {
        let len = buffer.len();
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `len` elements starting at `src_at` (relative to `src`) into
    /// this slice at `dst_at`.
    ///
    /// # Safety
    /// Same contract as [`SharedBuffer::copy_from`].
    pub(crate) unsafe fn copy_from(&self, dst_at: usize, src: &BufferSlice, src_at: usize, len: usize) {
        debug_assert!(dst_at + len <= self.len && src_at + len <= src.len);
        self.buffer
            .copy_from(self.offset + dst_at, &src.buffer, src.offset + src_at, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_between_buffers() {
        let src = SharedBuffer::from_vec((0..8).map(f64::from).collect());
        let dst = SharedBuffer::zeroed(8);
        unsafe {
            dst.copy_from(4, &src, 2, 3);
            assert_eq!(dst.to_vec(), vec![0.0, 0.0, 0.0, 0.0, 2.0, 3.0, 4.0, 0.0]);
        }
    }

    #[test]
    fn test_slice_bounds() {
        let buffer = SharedBuffer::zeroed(4);
        assert!(BufferSlice::new(buffer.clone(), 2, 2).is_some());
        assert!(BufferSlice::new(buffer.clone(), 3, 2).is_none());
        assert!(BufferSlice::new(buffer, usize::MAX, 2).is_none());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_access_panics() {
        let buffer = SharedBuffer::zeroed(4);
        unsafe {
            let _ = buffer.slice(2..6);
        }
    }

    #[test]
    fn test_disjoint_writers() {
        let buffer = SharedBuffer::zeroed(64);
        std::thread::scope(|s| {
            for worker in 0..4usize {
                let buffer = &buffer;
                s.spawn(move || {
                    let range = worker * 16..(worker + 1) * 16;
                    // SAFETY: each worker owns a distinct quarter.
                    let part = unsafe { buffer.slice_mut(range) };
                    part.fill(worker as f64);
                });
            }
        });
        let values = unsafe { buffer.to_vec() };
        assert_eq!(values[0], 0.0);
        assert_eq!(values[63], 3.0);
    }
}
