//! The per-size transfer buffer and its partitioning.

use crate::error::BenchError;
use crate::fabric::{BufferSlice, SharedBuffer};
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;

/// Buffer of `total_elements` values split into equal partitions.
///
/// Allocated once per payload size and lent to the strategy for its whole
/// lifetime; the strategy only ever holds `Arc` clones of the storage.
#[derive(Debug)]
pub struct TransferRegion {
    partitions: usize,
    elements_per_partition: usize,
    bytes_per_element: usize,
    buffer: Arc<SharedBuffer>,
}

impl TransferRegion {
    /// Allocates a randomly filled region.
    ///
    /// Fails when `total_elements` is zero or not a multiple of `partitions`.
    pub fn allocate(partitions: usize, total_elements: usize, bytes_per_element: usize) -> Result<Self, BenchError> {
        if partitions == 0 || total_elements == 0 || total_elements % partitions != 0 {
            return Err(BenchError::IndivisiblePayload {
                elements: total_elements,
                partitions,
            });
        }
        let mut rng = rand::thread_rng();
        let values = (0..total_elements).map(|_| rng.gen::<f64>()).collect();
        Ok(Self {
            partitions,
            elements_per_partition: total_elements / partitions,
            bytes_per_element,
            buffer: SharedBuffer::from_vec(values),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions
    }

    pub fn elements_per_partition(&self) -> usize {
        self.elements_per_partition
    }

    pub fn total_elements(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes_per_element(&self) -> usize {
        self.bytes_per_element
    }

    /// Bytes communicated per round.
    pub fn payload_bytes(&self) -> usize {
        self.total_elements() * self.bytes_per_element
    }

    pub fn partition_bytes(&self) -> usize {
        self.elements_per_partition * self.bytes_per_element
    }

    pub fn partition_range(&self, partition: usize) -> Range<usize> {
        let start = partition * self.elements_per_partition;
        start..start + self.elements_per_partition
    }

    pub fn whole(&self) -> BufferSlice {
        BufferSlice::whole(Arc::clone(&self.buffer))
    }

    /// View of one partition, for per-partition requests.
    pub fn partition_slice(&self, partition: usize) -> Option<BufferSlice> {
        let range = self.partition_range(partition);
        BufferSlice::new(Arc::clone(&self.buffer), range.start, range.len())
    }

    /// # Safety
    /// The caller must own `partition` for the lifetime of the slice: no
    /// transfer of it may be in flight and no other worker may touch it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn partition_mut(&self, partition: usize) -> &mut [f64] {
        self.buffer.slice_mut(self.partition_range(partition))
    }

    /// # Safety
    /// No transfer into `partition` may be in flight.
    pub unsafe fn partition(&self, partition: usize) -> &[f64] {
        self.buffer.slice(self.partition_range(partition))
    }

    /// Copy of the whole buffer.
    ///
    /// # Safety
    /// No transfer may be in flight.
    pub unsafe fn snapshot(&self) -> Vec<f64> {
        self.buffer.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_geometry() {
        let region = TransferRegion::allocate(4, 16, 8).unwrap();
        assert_eq!(region.elements_per_partition(), 4);
        assert_eq!(region.payload_bytes(), 128);
        assert_eq!(region.partition_bytes(), 32);
        assert_eq!(region.partition_range(3), 12..16);
        assert_eq!(region.whole().len(), 16);
        let last = region.partition_slice(3).unwrap();
        assert_eq!((last.offset(), last.len()), (12, 4));
        assert!(region.partition_slice(4).is_none());
    }

    #[test]
    fn test_indivisible_payload_rejected() {
        assert!(matches!(
            TransferRegion::allocate(3, 16, 8),
            Err(BenchError::IndivisiblePayload { elements: 16, partitions: 3 })
        ));
        assert!(TransferRegion::allocate(0, 16, 8).is_err());
        assert!(TransferRegion::allocate(4, 0, 8).is_err());
    }
}
