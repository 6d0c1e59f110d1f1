//! One persistent request for the whole buffer.
//!
//! The receiver's master posts and completes its receive before the round's
//! work starts; the sender's master starts the send only after every worker
//! has produced its partitions. Nothing is communicated per partition.

use super::{InitContext, TransferStrategy, DATA_TAG};
use crate::error::FabricResult;
use crate::fabric::PersistentRequest;
use crate::sync::Team;

pub(super) struct SingleRequest {
    request: PersistentRequest,
}

pub(super) fn initialize(ctx: &InitContext<'_>) -> FabricResult<SingleRequest> {
    let buffer = ctx.region.whole();
    let request = if ctx.role.is_sender() {
        ctx.comm.send_init(buffer, ctx.buddy, DATA_TAG)?
    } else {
        ctx.comm.recv_init(buffer, ctx.buddy, DATA_TAG)?
    };
    Ok(SingleRequest { request })
}

impl TransferStrategy for SingleRequest {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, _partition: usize) -> FabricResult<()> {
        Ok(())
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()?;
        if team.is_master() {
            self.request.start();
            self.request.wait()?;
        }
        Ok(())
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        if team.is_master() {
            self.request.start();
            self.request.wait()?;
        }
        Ok(())
    }

    fn receiver_poll_ready(&self, _team: &Team<'_>, _partition: usize) -> FabricResult<()> {
        Ok(())
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        self.request.wait()
    }
}
