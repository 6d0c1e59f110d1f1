//! One persistent request per partition on a dedicated communicator.

use super::{InitContext, TransferStrategy, DATA_TAG};
use crate::error::{FabricError, FabricResult};
use crate::fabric::PersistentRequest;
use crate::sync::Team;

pub(super) struct MultiRequest {
    requests: Vec<PersistentRequest>,
}

pub(super) fn initialize(ctx: &InitContext<'_>) -> FabricResult<MultiRequest> {
    let comm = ctx.comm.dup()?;
    let requests = (0..ctx.region.partition_count())
        .map(|partition| {
            let slice = ctx
                .region
                .partition_slice(partition)
                .ok_or_else(|| FabricError::Mismatch(format!("partition {partition} outside the region")))?;
            let tag = DATA_TAG + partition as i32;
            if ctx.role.is_sender() {
                comm.send_init(slice, ctx.buddy, tag)
            } else {
                comm.recv_init(slice, ctx.buddy, tag)
            }
        })
        .collect::<FabricResult<Vec<_>>>()?;
    Ok(MultiRequest { requests })
}

impl MultiRequest {
    fn request(&self, partition: usize) -> FabricResult<&PersistentRequest> {
        self.requests.get(partition).ok_or_else(|| {
            FabricError::Mismatch(format!(
                "partition {partition} out of range for {} requests",
                self.requests.len()
            ))
        })
    }
}

impl TransferStrategy for MultiRequest {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        self.request(partition)?.start();
        Ok(())
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        for partition in team.static_range(self.requests.len()) {
            self.request(partition)?.wait()?;
        }
        team.barrier()
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()?;
        for partition in team.static_range(self.requests.len()) {
            self.request(partition)?.start();
        }
        Ok(())
    }

    fn receiver_poll_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        self.request(partition)?.wait()
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        team.barrier()
    }

    fn release(self: Box<Self>) -> FabricResult<()> {
        self.requests.iter().try_for_each(PersistentRequest::wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{launch, FabricConfig};
    use crate::region::TransferRegion;
    use crate::strategy::{buddy_of, drive_rounds, Role};

    #[test]
    fn test_each_partition_starts_once_per_round() {
        let rounds = 5;
        let starts = launch(2, FabricConfig::default(), |comm| {
            let region = TransferRegion::allocate(4, 16, 8)?;
            let strategy = initialize(&InitContext {
                comm: &comm,
                region: &region,
                role: Role::of(comm.rank(), comm.size()),
                buddy: buddy_of(comm.rank(), comm.size()),
                threads: 2,
            })?;
            drive_rounds(&comm, &strategy, 4, 2, rounds)?;
            let starts: Vec<u64> = strategy.requests.iter().map(PersistentRequest::starts).collect();
            Box::new(strategy).release()?;
            Ok(starts)
        })
        .unwrap();

        assert_eq!(starts, vec![vec![rounds as u64; 4]; 2]);
    }
}
