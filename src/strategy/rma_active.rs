//! One-sided puts inside post/start/complete/wait epochs.
//!
//! With a shared window the masters open and close the epoch around the
//! whole team's work. With per-thread windows every worker runs its own
//! epoch on its own window, so workers synchronise with their counterpart
//! on the other rank independently.

use super::{InitContext, TransferStrategy, WindowScope};
use crate::error::FabricResult;
use crate::fabric::{BufferSlice, Window};
use crate::sync::{static_owner, Team};

pub(super) struct ActiveRma {
    scope: WindowScope,
    peer: usize,
    origin: BufferSlice,
    per_partition: usize,
    partitions: usize,
    windows: Vec<Window>,
}

pub(super) fn initialize(ctx: &InitContext<'_>, scope: WindowScope) -> FabricResult<ActiveRma> {
    let (pair, peer) = ctx.pair_comm()?;
    let origin = ctx.region.whole();
    let per_partition = ctx.region.elements_per_partition();
    let exposed = (!ctx.role.is_sender()).then(|| origin.clone());

    let windows = (0..scope.window_count(ctx.threads))
        .map(|_| Window::create(&pair, exposed.clone(), per_partition))
        .collect::<FabricResult<Vec<_>>>()?;

    Ok(ActiveRma {
        scope,
        peer,
        origin,
        per_partition,
        partitions: ctx.region.partition_count(),
        windows,
    })
}

impl ActiveRma {
    /// Windows whose epochs this worker drives.
    fn owned<'a>(&'a self, team: &Team<'_>) -> &'a [Window] {
        match self.scope {
            WindowScope::PerThread => &self.windows[team.static_range(self.windows.len())],
            WindowScope::Shared if team.is_master() => &self.windows[..],
            WindowScope::Shared => &[],
        }
    }

    fn window_for(&self, partition: usize) -> &Window {
        match self.scope {
            WindowScope::PerThread => &self.windows[static_owner(partition, self.partitions, self.windows.len())],
            WindowScope::Shared => &self.windows[0],
        }
    }
}

impl TransferStrategy for ActiveRma {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        for window in self.owned(team) {
            window.start(&[self.peer])?;
        }
        team.barrier()
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        let offset = partition * self.per_partition;
        self.window_for(partition)
            .put(&self.origin, offset, self.per_partition, self.peer, offset)
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        if self.scope == WindowScope::Shared {
            team.barrier()?;
        }
        for window in self.owned(team) {
            window.complete()?;
        }
        if self.scope == WindowScope::PerThread {
            team.barrier()?;
        }
        Ok(())
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        for window in self.owned(team) {
            window.post(&[self.peer])?;
        }
        team.barrier()
    }

    fn receiver_poll_ready(&self, _team: &Team<'_>, _partition: usize) -> FabricResult<()> {
        Ok(())
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        for window in self.owned(team) {
            window.wait()?;
        }
        team.barrier()
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        let this = *self;
        this.windows.into_iter().try_for_each(Window::free)
    }
}
