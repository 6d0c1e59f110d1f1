//! One partitioned request with per-partition readiness and arrival.

use super::{InitContext, TransferStrategy, DATA_TAG};
use crate::error::FabricResult;
use crate::fabric::PartitionedRequest;
use crate::sync::{spin_until, Team};

pub(super) struct Partitioned {
    request: PartitionedRequest,
}

pub(super) fn initialize(ctx: &InitContext<'_>) -> FabricResult<Partitioned> {
    let buffer = ctx.region.whole();
    let partitions = ctx.region.partition_count();
    let request = if ctx.role.is_sender() {
        ctx.comm.psend_init(buffer, partitions, ctx.buddy, DATA_TAG)?
    } else {
        ctx.comm.precv_init(buffer, partitions, ctx.buddy, DATA_TAG)?
    };
    Ok(Partitioned { request })
}

impl Partitioned {
    fn start_on_master(&self, team: &Team<'_>) -> FabricResult<()> {
        if team.is_master() {
            self.request.start();
        }
        team.barrier()
    }

    fn wait_on_master(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()?;
        if team.is_master() {
            self.request.wait()?;
        }
        Ok(())
    }
}

impl TransferStrategy for Partitioned {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.start_on_master(team)
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        self.request.pready(partition)
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.wait_on_master(team)
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.start_on_master(team)
    }

    fn receiver_poll_ready(&self, team: &Team<'_>, partition: usize) -> FabricResult<()> {
        let mut failure = None;
        spin_until(team.abort_handle(), || match self.request.parrived(partition) {
            Ok(arrived) => arrived,
            Err(err) => {
                failure = Some(err);
                true
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.wait_on_master(team)
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        self.request.wait()
    }
}
