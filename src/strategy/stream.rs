//! Per-partition requests spread over per-thread stream contexts.
//!
//! Each worker gets its own stream-bound communicator so its requests never
//! share a matching context with another worker's. When a stream cannot be
//! reserved the worker falls back to a plain duplicate communicator; when
//! the fabric has no stream support at all the strategy degrades to a no-op
//! so the sweep can continue.

use super::{InitContext, TransferStrategy, DATA_TAG};
use crate::error::{FabricError, FabricResult};
use crate::fabric::{Communicator, PersistentRequest, Stream};
use crate::sync::{spin_until, static_owner, Team};
use tracing::{debug, warn};

pub(super) struct StreamRequests {
    requests: Vec<PersistentRequest>,
    // Held until release so the contexts stay valid.
    _thread_comms: Vec<Communicator>,
    _streams: Vec<Stream>,
}

pub(super) fn initialize(ctx: &InitContext<'_>) -> FabricResult<StreamRequests> {
    if !ctx.comm.capabilities().streams {
        warn!("Stream contexts are not supported by this fabric, the stream strategy will not communicate");
        return Ok(StreamRequests {
            requests: Vec::new(),
            _thread_comms: Vec::new(),
            _streams: Vec::new(),
        });
    }

    let mut streams = Vec::with_capacity(ctx.threads);
    let mut thread_comms = Vec::with_capacity(ctx.threads);
    for thread in 0..ctx.threads {
        let stream = match Stream::create(ctx.comm) {
            Ok(stream) => Some(stream),
            Err(err) => {
                debug!("Thread {} falls back to a plain context: {}", thread, err);
                None
            }
        };
        let comm = ctx.comm.stream_comm(stream.as_ref())?;
        if comm.is_stream_bound() {
            debug!("Thread {} communicates on its own stream context", thread);
        }
        thread_comms.push(comm);
        streams.extend(stream);
    }

    let partitions = ctx.region.partition_count();
    let requests = (0..partitions)
        .map(|partition| {
            let slice = ctx
                .region
                .partition_slice(partition)
                .ok_or_else(|| FabricError::Mismatch(format!("partition {partition} outside the region")))?;
            let comm = &thread_comms[static_owner(partition, partitions, ctx.threads)];
            let tag = DATA_TAG + partition as i32;
            if ctx.role.is_sender() {
                comm.send_init(slice, ctx.buddy, tag)
            } else {
                comm.recv_init(slice, ctx.buddy, tag)
            }
        })
        .collect::<FabricResult<Vec<_>>>()?;

    Ok(StreamRequests {
        requests,
        _thread_comms: thread_comms,
        _streams: streams,
    })
}

impl StreamRequests {
    fn drain(&self, team: &Team<'_>) -> FabricResult<()> {
        let owned = team.static_range(self.requests.len());
        spin_until(team.abort_handle(), || {
            self.requests[owned.clone()].iter().all(PersistentRequest::test)
        })
    }
}

impl TransferStrategy for StreamRequests {
    fn sender_prepare_round(&self, _team: &Team<'_>) -> FabricResult<()> {
        Ok(())
    }

    fn sender_signal_ready(&self, _team: &Team<'_>, partition: usize) -> FabricResult<()> {
        if let Some(request) = self.requests.get(partition) {
            request.start();
        }
        Ok(())
    }

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.drain(team)
    }

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()> {
        for partition in team.static_range(self.requests.len()) {
            self.requests[partition].start();
        }
        team.barrier()
    }

    fn receiver_poll_ready(&self, _team: &Team<'_>, _partition: usize) -> FabricResult<()> {
        Ok(())
    }

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()> {
        self.drain(team)
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
    fn test_each_partition_starts_once_per_round_on_its_owner_stream() {
        let rounds = 5;
        let results = launch(2, FabricConfig::default(), |comm| {
            let region = TransferRegion::allocate(4, 16, 8)?;
            let strategy = initialize(&InitContext {
                comm: &comm,
                region: &region,
                role: Role::of(comm.rank(), comm.size()),
                buddy: buddy_of(comm.rank(), comm.size()),
                threads: 2,
            })?;
            let bound = strategy._thread_comms.iter().all(Communicator::is_stream_bound);
            drive_rounds(&comm, &strategy, 4, 2, rounds)?;
            let starts: Vec<u64> = strategy.requests.iter().map(PersistentRequest::starts).collect();
            Box::new(strategy).release()?;
            Ok((bound, starts))
        })
        .unwrap();

        for (bound, starts) in results {
            assert!(bound);
            assert_eq!(starts, vec![rounds as u64; 4]);
        }
    }
}
