//! One-sided puts between fences, one window per worker.

use super::{InitContext, TransferStrategy, WindowScope};
use crate::error::FabricResult;
use crate::fabric::{BufferSlice, Window};
use crate::sync::{static_owner, Team};

pub(super) struct FenceRma {
    peer: usize,
    origin: BufferSlice,
    per_partition: usize,
    partitions: usize,
    windows: Vec<Window>,
}

pub(super) fn initialize(ctx: &InitContext<'_>) -> FabricResult<FenceRma> {
    let (pair, peer) = ctx.pair_comm()?;
    let origin = ctx.region.whole();
    let per_partition = ctx.region.elements_per_partition();
    let exposed = (!ctx.role.is_sender()).then(|| origin.clone());

    let windows = (0..WindowScope::PerThread.window_count(ctx.threads))
        .map(|_| {
            let window = Window::create(&pair, exposed.clone(), per_partition)?;
            window.fence()?;
            Ok(window)
        })
        .collect::<FabricResult<Vec<_>>>()?;

    Ok(FenceRma {
        peer,
        origin,
        per_partition,
        partitions: ctx.region.partition_count(),
        windows,
    })
}

impl FenceRma {
    fn fence_owned(&self, team: &Team<'_>) -> FabricResult<()> {
        for index in team.static_range(self.windows.len()) {
            self.windows[index].fence()?;
        }
        Ok(())
    }

    fn open(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()?;
        self.fence_owned(team)
    }

    fn close(&self, team: &Team<'_>) -> FabricResult<()> {
        self.fence_owned(team)?;
        team.barrier()
    }
}

impl TransferStrategy for FenceRma {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.open(team)
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        let offset = partition * self.per_partition;
        let window = &self.windows[static_owner(partition, self.partitions, self.windows.len())];
        window.put(&self.origin, offset, self.per_partition, self.peer, offset)
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.close(team)
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.open(team)
    }

    fn receiver_poll_ready(&self, _team: &Team<'_>, _partition: usize) -> FabricResult<()> {
        Ok(())
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.close(team)
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        let this = *self;
        this.windows.into_iter().try_for_each(Window::free)
    }
}
