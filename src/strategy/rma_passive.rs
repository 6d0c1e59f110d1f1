//! One-sided puts under a passive shared lock.
//!
//! The sender locks its buddy once at initialization and keeps the lock for
//! the strategy's whole lifetime. Rounds are delimited by two 0-byte
//! messages on the pair communicator: the receiver announces READY before
//! the sender may overwrite its memory, and the sender announces DONE once
//! every put of the round has been flushed. Receivers watch individual
//! partitions land through the window's per-slot arrival counters.

use super::{InitContext, TransferStrategy, WindowScope, DONE_TAG, READY_TAG};
use crate::error::FabricResult;
use crate::fabric::{BufferSlice, Communicator, Window};
use crate::sync::{spin_until, static_owner, Team};
use std::sync::atomic::{AtomicU64, Ordering};

pub(super) struct PassiveRma {
    scope: WindowScope,
    pair: Communicator,
    peer: usize,
    origin: BufferSlice,
    per_partition: usize,
    partitions: usize,
    windows: Vec<Window>,
    /// Rounds the receiver has announced so far.
    round: AtomicU64,
}

pub(super) fn initialize(ctx: &InitContext<'_>, scope: WindowScope) -> FabricResult<PassiveRma> {
    let (pair, peer) = ctx.pair_comm()?;
    let origin = ctx.region.whole();
    let per_partition = ctx.region.elements_per_partition();
    let exposed = (!ctx.role.is_sender()).then(|| origin.clone());

    let windows = (0..scope.window_count(ctx.threads))
        .map(|_| Window::create(&pair, exposed.clone(), per_partition))
        .collect::<FabricResult<Vec<_>>>()?;
    if ctx.role.is_sender() {
        for window in &windows {
            window.lock_shared(peer)?;
        }
    }

    Ok(PassiveRma {
        scope,
        pair,
        peer,
        origin,
        per_partition,
        partitions: ctx.region.partition_count(),
        windows,
        round: AtomicU64::new(0),
    })
}

impl PassiveRma {
    fn window_for(&self, partition: usize) -> &Window {
        match self.scope {
            WindowScope::PerThread => &self.windows[static_owner(partition, self.partitions, self.windows.len())],
            WindowScope::Shared => &self.windows[0],
        }
    }
}

impl TransferStrategy for PassiveRma {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        if team.is_master() {
            self.pair.recv_signal(self.peer, READY_TAG)?;
        }
        team.barrier()
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        let offset = partition * self.per_partition;
        self.window_for(partition)
            .put(&self.origin, offset, self.per_partition, self.peer, offset)
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        if self.scope == WindowScope::PerThread {
            for index in team.static_range(self.windows.len()) {
                self.windows[index].flush(self.peer)?;
            }
        }
        team.barrier()?;
        if team.is_master() {
            if self.scope == WindowScope::Shared {
                self.windows[0].flush(self.peer)?;
            }
            self.pair.send_signal(self.peer, DONE_TAG)?;
        }
        Ok(())
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        if team.is_master() {
            self.round.fetch_add(1, Ordering::AcqRel);
            self.pair.send_signal(self.peer, READY_TAG)?;
        }
        team.barrier()
    }

    fn receiver_poll_ready(&self, team: &Team<'_>, partition: usize) -> FabricResult<()> {
        let round = self.round.load(Ordering::Acquire);
        let window = self.window_for(partition);
        let mut failure = None;
        spin_until(team.abort_handle(), || match window.arrivals(partition) {
            Ok(landed) => landed >= round,
            Err(err) => {
                failure = Some(err);
                true
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()?;
        if team.is_master() {
            self.pair.recv_signal(self.peer, DONE_TAG)?;
        }
        Ok(())
    }

    fn held_locks(&self) -> usize {
        self.windows.iter().map(Window::held_locks).sum()
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        let this = *self;
        this.windows.into_iter().try_for_each(Window::free)
    }
}
