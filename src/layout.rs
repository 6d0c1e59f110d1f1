//! Data-layout hooks applied to each partition inside the timed interval.
//!
//! The orchestrator treats the layout as opaque: it asks for the size of a
//! transfer unit when sizing the region, and calls the transforms per owned
//! partition. `Contiguous` sends the buffer as is; `StridedPack` gathers each
//! partition from a strided user buffer before sending and scatters it back
//! after receiving, so the cost of packing is part of the measurement.

use crate::error::BenchError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Size description of one logical element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUnit {
    /// Buffer elements per logical element.
    pub element_multiplier: usize,
    /// Bytes of user memory backing one logical element.
    pub allocated_bytes: usize,
    /// Bytes sent on the wire for one logical element.
    pub communicated_bytes: usize,
}

pub trait DataLayout: Send + Sync {
    fn name(&self) -> &'static str;

    fn describe_transfer_unit(&self) -> TransferUnit;

    /// Sizes any layout-private storage for a new payload size.
    fn prepare(&mut self, partitions: usize, elements_per_partition: usize);

    fn transform_before_send(&self, round: usize, partition: usize, data: &mut [f64]);

    fn transform_after_receive(&self, round: usize, partition: usize, data: &[f64]);
}

/// Serializable layout selection carried by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutSpec {
    Contiguous,
    StridedPack { block: usize, stride: usize },
}

impl LayoutSpec {
    pub fn build(&self) -> Result<Box<dyn DataLayout>, BenchError> {
        match *self {
            LayoutSpec::Contiguous => Ok(Box::new(Contiguous)),
            LayoutSpec::StridedPack { block, stride } => Ok(Box::new(StridedPack::new(block, stride)?)),
        }
    }
}

impl std::fmt::Display for LayoutSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutSpec::Contiguous => write!(f, "contiguous"),
            LayoutSpec::StridedPack { block, stride } => write!(f, "pack({block}/{stride})"),
        }
    }
}

/// Identity layout: one `f64` per element, nothing to transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct Contiguous;

impl DataLayout for Contiguous {
    fn name(&self) -> &'static str {
        "contiguous"
    }

    fn describe_transfer_unit(&self) -> TransferUnit {
        TransferUnit {
            element_multiplier: 1,
            allocated_bytes: std::mem::size_of::<f64>(),
            communicated_bytes: std::mem::size_of::<f64>(),
        }
    }

    fn prepare(&mut self, _partitions: usize, _elements_per_partition: usize) {}

    fn transform_before_send(&self, _round: usize, _partition: usize, _data: &mut [f64]) {}

    fn transform_after_receive(&self, _round: usize, _partition: usize, _data: &[f64]) {}
}

/// Packs blocks of `block` elements spaced `stride` elements apart.
pub struct StridedPack {
    block: usize,
    stride: usize,
    /// One strided user buffer per partition; only its owning worker locks it.
    user: Vec<Mutex<Vec<f64>>>,
}

impl StridedPack {
    pub fn new(block: usize, stride: usize) -> Result<Self, BenchError> {
        if block == 0 || stride < block {
            return Err(BenchError::InvalidConfig(format!(
                "pack layout needs 0 < block <= stride, got block {block} and stride {stride}"
            )));
        }
        Ok(Self {
            block,
            stride,
            user: Vec::new(),
        })
    }

    fn user_len(&self, elements: usize) -> usize {
        (elements + self.block - 1) / self.block * self.stride
    }
}

impl DataLayout for StridedPack {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn describe_transfer_unit(&self) -> TransferUnit {
        let element = std::mem::size_of::<f64>();
        TransferUnit {
            element_multiplier: 1,
            allocated_bytes: (element * self.stride + self.block - 1) / self.block,
            communicated_bytes: element,
        }
    }

    fn prepare(&mut self, partitions: usize, elements_per_partition: usize) {
        let len = self.user_len(elements_per_partition);
        self.user = (0..partitions)
            .map(|partition| Mutex::new((0..len).map(|i| (partition * len + i) as f64).collect()))
            .collect();
    }

    fn transform_before_send(&self, _round: usize, partition: usize, data: &mut [f64]) {
        let Some(user) = self.user.get(partition) else {
            return;
        };
        let user = user.lock();
        for (index, chunk) in data.chunks_mut(self.block).enumerate() {
            let start = index * self.stride;
            if let Some(source) = user.get(start..start + chunk.len()) {
                chunk.copy_from_slice(source);
            }
        }
    }

    fn transform_after_receive(&self, _round: usize, partition: usize, data: &[f64]) {
        let Some(user) = self.user.get(partition) else {
            return;
        };
        let mut user = user.lock();
        for (index, chunk) in data.chunks(self.block).enumerate() {
            let start = index * self.stride;
            if let Some(target) = user.get_mut(start..start + chunk.len()) {
                target.copy_from_slice(chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_unit_is_one_double() {
        let unit = Contiguous.describe_transfer_unit();
        assert_eq!(unit.element_multiplier, 1);
        assert_eq!(unit.communicated_bytes, 8);
        assert_eq!(unit.allocated_bytes, 8);
    }

    #[test]
    fn test_pack_gathers_strided_blocks() {
        let mut layout = StridedPack::new(2, 3).unwrap();
        layout.prepare(2, 4);
        // Partition 1 user buffer holds 6..12, blocks start at 6 and 9.
        let mut data = vec![0.0; 4];
        layout.transform_before_send(0, 1, &mut data);
        assert_eq!(data, vec![6.0, 7.0, 9.0, 10.0]);
    }

    #[test]
    fn test_pack_scatter_then_gather_restores_data() {
        let mut layout = StridedPack::new(3, 5).unwrap();
        layout.prepare(1, 7);
        let received = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        layout.transform_after_receive(0, 0, &received);
        let mut packed = vec![0.0; 7];
        layout.transform_before_send(1, 0, &mut packed);
        assert_eq!(packed, received);
    }

    #[test]
    fn test_pack_rejects_bad_geometry() {
        assert!(StridedPack::new(0, 4).is_err());
        assert!(StridedPack::new(4, 2).is_err());
        assert_eq!(StridedPack::new(2, 4).unwrap().describe_transfer_unit().allocated_bytes, 16);
    }

    #[test]
    fn test_layout_spec_builds_layouts() {
        assert_eq!(LayoutSpec::Contiguous.build().unwrap().name(), "contiguous");
        let pack = LayoutSpec::StridedPack { block: 4, stride: 8 };
        assert_eq!(pack.build().unwrap().name(), "pack");
        assert_eq!(pack.to_string(), "pack(4/8)");
    }
}
