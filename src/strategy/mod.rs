//! # Communication Strategies
//!
//! A strategy decides how the payload of one round moves from a sender rank
//! to its buddy receiver rank. The orchestrator only knows the
//! [`TransferStrategy`] contract: three sender hooks, three receiver hooks and
//! a release, each invoked concurrently by every worker of the rank's team.
//!
//! ## Variants
//!
//! | Kind | Mechanism |
//! |------|-----------|
//! | `single` | one persistent request for the whole buffer |
//! | `multi` | one persistent request per partition |
//! | `stream` | per-partition requests on per-thread stream contexts |
//! | `part` | one partitioned request with per-partition ready/arrived |
//! | `rma` | puts under a passive shared lock, one window per thread |
//! | `rma-single` | puts under a passive shared lock, one shared window |
//! | `rma-active` | post/start/complete/wait epochs, one window per thread |
//! | `rma-single-active` | post/start/complete/wait epochs, one shared window |
//! | `rma-fence` | fence-delimited epochs, one window per thread |
//!
//! ## Lifecycle
//!
//! [`StrategyFactory::initialize`] is collective across the sender/receiver
//! pair and returns the boxed handle. Rounds then call the role's prepare,
//! per-partition signal or poll, and finalize hooks. `release` consumes the
//! handle, so a strategy can neither be used before initialization nor after
//! release.

mod multi;
mod partitioned;
mod rma_active;
mod rma_fence;
mod rma_passive;
mod single;
mod stream;

use crate::cli::StrategyKind;
use crate::error::{BenchError, FabricResult};
use crate::fabric::Communicator;
use crate::region::TransferRegion;
use crate::sync::Team;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tag of the data channels; per-partition channels use `DATA_TAG + p`.
pub(crate) const DATA_TAG: i32 = 1;
/// Receiver to sender: buffer ready for the next round.
pub(crate) const READY_TAG: i32 = 1;
/// Sender to receiver: all puts of the round flushed.
pub(crate) const DONE_TAG: i32 = 2;

/// Which side of a pair a rank plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Lower half of the group sends, upper half receives.
    pub fn of(rank: usize, size: usize) -> Role {
        if rank < size / 2 {
            Role::Sender
        } else {
            Role::Receiver
        }
    }

    pub fn is_sender(self) -> bool {
        self == Role::Sender
    }
}

/// Peer of `rank` in a group of `size` ranks.
pub fn buddy_of(rank: usize, size: usize) -> usize {
    (rank + size / 2) % size
}

/// Everything a strategy needs to set itself up for one payload size.
pub struct InitContext<'a> {
    pub comm: &'a Communicator,
    pub region: &'a TransferRegion,
    pub role: Role,
    /// Buddy's rank in `comm`.
    pub buddy: usize,
    /// Workers per rank.
    pub threads: usize,
}

impl InitContext<'_> {
    /// Two-rank communicator for this pair, and the buddy's rank in it.
    pub(crate) fn pair_comm(&self) -> FabricResult<(Communicator, usize)> {
        let me = self.comm.rank();
        let pair = self
            .comm
            .create_group(&[me.min(self.buddy), me.max(self.buddy)])?;
        let peer = usize::from(me < self.buddy);
        Ok((pair, peer))
    }
}

/// Per-round transfer protocol between a sender and its receiver.
///
/// Every hook is called by every worker of the rank's team with that
/// worker's [`Team`] view; partition hooks are only called for partitions in
/// the caller's static range.
pub trait TransferStrategy: Send + Sync {
    fn sender_prepare_round(&self, team: &Team<'_>) -> FabricResult<()>;

    /// Called once per owned partition after its payload is final.
    fn sender_signal_ready(&self, team: &Team<'_>, partition: usize) -> FabricResult<()>;

    fn sender_finalize_round(&self, team: &Team<'_>) -> FabricResult<()>;

    fn receiver_prepare_round(&self, team: &Team<'_>) -> FabricResult<()>;

    /// Returns once `partition` is known to have arrived, or immediately for
    /// variants that only learn about completion in finalize.
    fn receiver_poll_ready(&self, team: &Team<'_>, partition: usize) -> FabricResult<()>;

    fn receiver_finalize_round(&self, team: &Team<'_>) -> FabricResult<()>;

    /// Passive-target locks this rank currently holds.
    fn held_locks(&self) -> usize {
        0
    }

    /// Tears down requests, windows and stream contexts. Collective.
    fn release(self: Box<Self>) -> FabricResult<()>;
}

/// Creates strategy handles by kind.
pub struct StrategyFactory;

impl StrategyFactory {
    /// Collective initialization of `kind` for the pair described by `ctx`.
    ///
    /// ## Errors
    /// - [`BenchError::InvalidConfig`] for the `all` placeholder
    /// - [`BenchError::StrategyInit`] when the fabric refuses a request,
    ///   window or context
    pub fn initialize(kind: StrategyKind, ctx: &InitContext<'_>) -> Result<Box<dyn TransferStrategy>, BenchError> {
        debug!(
            "Initializing {} as {:?} with buddy {} ({} partitions)",
            kind,
            ctx.role,
            ctx.buddy,
            ctx.region.partition_count()
        );
        let handle: FabricResult<Box<dyn TransferStrategy>> = match kind {
            StrategyKind::Single => single::initialize(ctx).map(boxed),
            StrategyKind::Multi => multi::initialize(ctx).map(boxed),
            StrategyKind::Stream => stream::initialize(ctx).map(boxed),
            StrategyKind::Partitioned => partitioned::initialize(ctx).map(boxed),
            StrategyKind::Rma => rma_passive::initialize(ctx, WindowScope::PerThread).map(boxed),
            StrategyKind::RmaSingle => rma_passive::initialize(ctx, WindowScope::Shared).map(boxed),
            StrategyKind::RmaActive => rma_active::initialize(ctx, WindowScope::PerThread).map(boxed),
            StrategyKind::RmaSingleActive => rma_active::initialize(ctx, WindowScope::Shared).map(boxed),
            StrategyKind::RmaFence => rma_fence::initialize(ctx).map(boxed),
            StrategyKind::All => {
                return Err(BenchError::InvalidConfig(
                    "'all' must be expanded before initialization".into(),
                ))
            }
        };
        handle.map_err(|source| BenchError::StrategyInit {
            strategy: kind,
            source,
        })
    }

    /// Result file name for one strategy configuration; `partitions` is the
    /// total partition count of the rank.
    pub fn output_name(kind: StrategyKind, threads: usize, partitions: usize, noise_level: u32) -> String {
        format!(
            "{}_{}threads_{}parts_{}noise.txt",
            kind.output_prefix(),
            threads,
            partitions,
            noise_level
        )
    }
}

fn boxed<S: TransferStrategy + 'static>(strategy: S) -> Box<dyn TransferStrategy> {
    Box::new(strategy)
}

/// How many windows a one-sided strategy opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowScope {
    /// One window per worker; worker `t` only puts through window `t`.
    PerThread,
    /// One window shared by all workers; the master opens and closes epochs.
    Shared,
}

impl WindowScope {
    pub(crate) fn window_count(self, threads: usize) -> usize {
        match self {
            WindowScope::PerThread => threads.max(1),
            WindowScope::Shared => 1,
        }
    }
}

/// Round driver for strategy unit tests: a scoped team of `threads`
/// workers, each servicing its static share of the partitions.
#[cfg(test)]
pub(crate) fn drive_rounds(
    comm: &Communicator,
    strategy: &dyn TransferStrategy,
    partitions: usize,
    threads: usize,
    rounds: usize,
) -> FabricResult<()> {
    use crate::error::FabricError;
    use crate::sync::SpinBarrier;

    let role = Role::of(comm.rank(), comm.size());
    let barrier = SpinBarrier::new(threads);
    for _ in 0..rounds {
        comm.barrier()?;
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..threads)
                .map(|id| {
                    let barrier = &barrier;
                    scope.spawn(move || -> FabricResult<()> {
                        let team = Team::new(id, barrier, comm.abort_handle());
                        let owned = team.static_range(partitions);
                        if role.is_sender() {
                            strategy.sender_prepare_round(&team)?;
                            for partition in owned {
                                strategy.sender_signal_ready(&team, partition)?;
                            }
                            strategy.sender_finalize_round(&team)
                        } else {
                            strategy.receiver_prepare_round(&team)?;
                            for partition in owned {
                                strategy.receiver_poll_ready(&team, partition)?;
                            }
                            strategy.receiver_finalize_round(&team)
                        }
                    })
                })
                .collect();
            workers
                .into_iter()
                .try_for_each(|worker| worker.join().unwrap_or(Err(FabricError::Aborted)))
        })?;
        comm.barrier()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_split_group_in_half() {
        let roles: Vec<Role> = (0..4).map(|rank| Role::of(rank, 4)).collect();
        assert_eq!(roles, vec![Role::Sender, Role::Sender, Role::Receiver, Role::Receiver]);
    }

    #[test]
    fn test_buddy_is_an_involution_across_roles() {
        for size in (2..=16).step_by(2) {
            for rank in 0..size {
                let buddy = buddy_of(rank, size);
                assert_eq!(buddy_of(buddy, size), rank);
                assert_ne!(Role::of(rank, size), Role::of(buddy, size));
            }
        }
    }

    #[test]
    fn test_output_name() {
        assert_eq!(
            StrategyFactory::output_name(StrategyKind::RmaSingleActive, 4, 8, 10),
            "bw_rma_single_active_4threads_8parts_10noise.txt"
        );
        assert_eq!(
            StrategyFactory::output_name(StrategyKind::Partitioned, 1, 1, 0),
            "bw_part_1threads_1parts_0noise.txt"
        );
    }
}
