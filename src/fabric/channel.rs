//! Persistent and partitioned point-to-point channels.
//!
//! A channel pairs one send endpoint with one receive endpoint. Each
//! endpoint counts the rounds it has started; partition `p` of round `e` is
//! copied from the sender's buffer into the receiver's buffer as soon as the
//! sender marked it ready for `e` and the receiver has started `e`. Whichever
//! side observes both conditions first performs the copy, claimed through a
//! compare-exchange so it happens exactly once.

use super::buffer::BufferSlice;
use crate::error::{FabricError, FabricResult};
use crate::sync::{spin_until, AbortHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Send,
    Recv,
}

pub(crate) struct ChannelCore {
    partitions: usize,
    per_partition: usize,
    send_side: OnceLock<BufferSlice>,
    recv_side: OnceLock<BufferSlice>,
    send_epoch: AtomicU64,
    recv_epoch: AtomicU64,
    /// Round for which the sender last marked each partition ready.
    ready: Box<[AtomicU64]>,
    /// Round whose copy has been claimed by some thread.
    claimed: Box<[AtomicU64]>,
    /// Round whose copy has completed.
    arrived: Box<[AtomicU64]>,
}

fn counters(n: usize) -> Box<[AtomicU64]> {
    (0..n).map(|_| AtomicU64::new(0)).collect()
}

impl ChannelCore {
    pub(crate) fn new(partitions: usize, per_partition: usize) -> Self {
        Self {
            partitions,
            per_partition,
            send_side: OnceLock::new(),
            recv_side: OnceLock::new(),
            send_epoch: AtomicU64::new(0),
            recv_epoch: AtomicU64::new(0),
            ready: counters(partitions),
            claimed: counters(partitions),
            arrived: counters(partitions),
        }
    }

    fn side(&self, side: Side) -> &OnceLock<BufferSlice> {
        match side {
            Side::Send => &self.send_side,
            Side::Recv => &self.recv_side,
        }
    }

    pub(crate) fn has_side(&self, side: Side) -> bool {
        self.side(side).get().is_some()
    }

    pub(crate) fn check_shape(&self, partitions: usize, per_partition: usize) -> FabricResult<()> {
        if partitions != self.partitions || per_partition != self.per_partition {
            return Err(FabricError::Mismatch(format!(
                "endpoint expects {}x{} elements, peer posted {}x{}",
                partitions, per_partition, self.partitions, self.per_partition
            )));
        }
        Ok(())
    }

    pub(crate) fn attach(&self, side: Side, slice: BufferSlice) -> FabricResult<()> {
        self.side(side)
            .set(slice)
            .map_err(|_| FabricError::Mismatch(format!("{side:?} endpoint attached twice")))
    }

    fn start(&self, side: Side) -> u64 {
        let epoch = match side {
            Side::Send => &self.send_epoch,
            Side::Recv => &self.recv_epoch,
        };
        epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn mark_ready(&self, partition: usize, epoch: u64) {
        self.ready[partition].store(epoch, Ordering::Release);
    }

    /// Copies `partition` if it is ready and the receiver has started the
    /// matching round.
    fn progress(&self, partition: usize) {
        let target = self.ready[partition].load(Ordering::Acquire);
        if target == 0 || self.arrived[partition].load(Ordering::Acquire) >= target {
            return;
        }
        if self.recv_epoch.load(Ordering::Acquire) < target {
            return;
        }
        let (Some(src), Some(dst)) = (self.send_side.get(), self.recv_side.get()) else {
            return;
        };
        if self.claimed[partition]
            .compare_exchange(target - 1, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let offset = partition * self.per_partition;
        // SAFETY: the sender does not touch this partition until `arrived`
        // reaches `target`, and the receiver does not read it before then.
        unsafe { dst.copy_from(offset, src, offset, self.per_partition) };
        self.arrived[partition].store(target, Ordering::Release);
    }

    fn delivered(&self, partition: usize, epoch: u64) -> bool {
        self.arrived[partition].load(Ordering::Acquire) >= epoch
    }
}

/// Persistent request covering a whole buffer.
pub struct PersistentRequest {
    core: Arc<ChannelCore>,
    side: Side,
    epoch: AtomicU64,
    abort: AbortHandle,
}

impl PersistentRequest {
    pub(crate) fn new(core: Arc<ChannelCore>, side: Side, abort: AbortHandle) -> Self {
        Self {
            core,
            side,
            epoch: AtomicU64::new(0),
            abort,
        }
    }

    /// Activates the request for the next round.
    pub fn start(&self) {
        let epoch = self.core.start(self.side);
        self.epoch.store(epoch, Ordering::Release);
        if self.side == Side::Send {
            self.core.mark_ready(0, epoch);
        }
        self.core.progress(0);
    }

    /// Non-blocking completion check; an inactive request is complete.
    pub fn test(&self) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        if epoch == 0 {
            return true;
        }
        self.core.progress(0);
        self.core.delivered(0, epoch)
    }

    pub fn wait(&self) -> FabricResult<()> {
        spin_until(&self.abort, || self.test())
    }

    /// Times this endpoint has been started.
    #[cfg(test)]
    pub(crate) fn starts(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Partitioned request: the sender readies partitions one by one and the
/// receiver can observe each partition's arrival individually.
pub struct PartitionedRequest {
    core: Arc<ChannelCore>,
    side: Side,
    epoch: AtomicU64,
    abort: AbortHandle,
}

impl PartitionedRequest {
    pub(crate) fn new(core: Arc<ChannelCore>, side: Side, abort: AbortHandle) -> Self {
        Self {
            core,
            side,
            epoch: AtomicU64::new(0),
            abort,
        }
    }

    pub fn partitions(&self) -> usize {
        self.core.partitions
    }

    pub fn start(&self) {
        let epoch = self.core.start(self.side);
        self.epoch.store(epoch, Ordering::Release);
    }

    fn active_epoch(&self, partition: usize) -> FabricResult<u64> {
        if partition >= self.core.partitions {
            return Err(FabricError::Mismatch(format!(
                "partition {} out of range for {} partitions",
                partition, self.core.partitions
            )));
        }
        match self.epoch.load(Ordering::Acquire) {
            0 => Err(FabricError::Inactive),
            epoch => Ok(epoch),
        }
    }

    /// Marks `partition` ready to be transferred (sender only).
    pub fn pready(&self, partition: usize) -> FabricResult<()> {
        if self.side != Side::Send {
            return Err(FabricError::Mismatch("pready on a receive request".into()));
        }
        let epoch = self.active_epoch(partition)?;
        self.core.mark_ready(partition, epoch);
        self.core.progress(partition);
        Ok(())
    }

    /// Whether `partition` has landed in the receive buffer (receiver only).
    pub fn parrived(&self, partition: usize) -> FabricResult<bool> {
        if self.side != Side::Recv {
            return Err(FabricError::Mismatch("parrived on a send request".into()));
        }
        let epoch = self.active_epoch(partition)?;
        self.core.progress(partition);
        Ok(self.core.delivered(partition, epoch))
    }

    pub fn test(&self) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        if epoch == 0 {
            return true;
        }
        (0..self.core.partitions).all(|partition| {
            self.core.progress(partition);
            self.core.delivered(partition, epoch)
        })
    }

    pub fn wait(&self) -> FabricResult<()> {
        spin_until(&self.abort, || self.test())
    }
}
