//! # In-Process Transport Fabric
//!
//! The benchmark drives message-passing primitives (persistent requests,
//! partitioned requests, one-sided windows and stream contexts) between a
//! group of peers. This module provides those primitives inside a single
//! process: every peer ("rank") runs on a dedicated OS thread named
//! `rank-<n>` and talks to the others exclusively through a [`Communicator`].
//!
//! ## Primitives
//!
//! - **Eager messages**: [`Communicator::send`] / [`Communicator::recv`] with
//!   tag and context matching, used for 0-byte handshakes and statistics.
//! - **Collectives**: barrier, sum-reduce, broadcast, split, group creation.
//! - **Channels**: [`PersistentRequest`] and [`PartitionedRequest`] move data
//!   directly from the sender's buffer into the receiver's buffer once both
//!   endpoints have started the same round.
//! - **Windows**: [`Window`] exposes a buffer to one-sided puts under a
//!   passive shared lock, post/start/complete/wait epochs, or fences.
//! - **Streams**: [`Stream`] reserves a per-thread transfer context; the
//!   capability can be disabled or exhausted, which callers must tolerate.
//!
//! ## Failure Model
//!
//! Blocking operations spin without timeouts. A rank that returns an error
//! or panics raises the world's [`AbortHandle`], which makes every other
//! rank's pending wait return [`FabricError::Aborted`].

pub mod buffer;
mod channel;
mod window;

pub use buffer::{BufferSlice, SharedBuffer};
pub use channel::{PartitionedRequest, PersistentRequest};
pub use window::Window;

use crate::error::{BenchError, FabricError, FabricResult};
use crate::sync::{spin_until, AbortHandle, AbortOnUnwind, SpinBarrier};
use channel::{ChannelCore, Side};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;
use window::WindowCore;

const TAG_SPLIT: i32 = -1;
const TAG_REDUCE: i32 = -2;
const TAG_BCAST: i32 = -3;

/// Capabilities of one fabric instance.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Whether stream contexts exist at all.
    pub streams: bool,
    /// Streams each rank may hold at the same time.
    pub max_streams_per_rank: usize,
    /// Let waits yield their time slice after a spin budget. Implied when
    /// there are more ranks than cores.
    pub oversubscribe: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            streams: true,
            max_streams_per_rank: crate::defaults::MAX_STREAMS_PER_RANK,
            oversubscribe: false,
        }
    }
}

impl FabricConfig {
    /// Marks the world oversubscribed when `ranks` ranks of `threads`
    /// workers each outnumber the host's cores.
    pub fn for_team(mut self, ranks: usize, threads: usize) -> Self {
        self.oversubscribe |= ranks.saturating_mul(threads) > num_cpus::get();
        self
    }
}

struct Envelope {
    context: u64,
    source: usize,
    tag: i32,
    payload: Vec<f64>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum Derivation {
    Dup,
    Split(usize),
    Group(Vec<usize>),
    Window,
    Stream,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct ContextKey {
    parent: u64,
    seq: u64,
    derivation: Derivation,
}

/// Registry entry of a derived context. Removed once every member's
/// communicator has been dropped.
#[derive(Debug)]
struct ContextEntry {
    id: u64,
    released: usize,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct ChannelKey {
    context: u64,
    source: usize,
    dest: usize,
    tag: i32,
}

/// State shared by every rank of one world.
struct WorldShared {
    size: usize,
    config: FabricConfig,
    abort: AbortHandle,
    mailboxes: Vec<Mutex<VecDeque<Envelope>>>,
    contexts: Mutex<HashMap<ContextKey, ContextEntry>>,
    next_context: AtomicU64,
    barriers: Mutex<HashMap<u64, Arc<SpinBarrier>>>,
    channels: Mutex<HashMap<ChannelKey, Vec<Arc<ChannelCore>>>>,
    windows: Mutex<HashMap<u64, Arc<WindowCore>>>,
    streams_in_use: Vec<AtomicUsize>,
}

impl WorldShared {
    fn new(size: usize, config: FabricConfig) -> Self {
        Self {
            size,
            abort: if config.oversubscribe || size > num_cpus::get() {
                AbortHandle::oversubscribed()
            } else {
                AbortHandle::new()
            },
            config,
            mailboxes: (0..size).map(|_| Mutex::new(VecDeque::new())).collect(),
            contexts: Mutex::new(HashMap::new()),
            // Context 0 is the world itself.
            next_context: AtomicU64::new(1),
            barriers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            streams_in_use: (0..size).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Maps a derivation to a context id every member agrees on.
    fn derive_context(&self, key: ContextKey) -> u64 {
        self.contexts
            .lock()
            .entry(key)
            .or_insert_with(|| ContextEntry {
                id: self.next_context.fetch_add(1, Ordering::Relaxed),
                released: 0,
            })
            .id
    }

    /// Records that one member dropped its communicator on `key`; the last
    /// of `participants` to do so clears the context's barrier and window.
    fn release_context(&self, key: &ContextKey, participants: usize) {
        let mut contexts = self.contexts.lock();
        let Some(entry) = contexts.get_mut(key) else {
            return;
        };
        entry.released += 1;
        if entry.released < participants {
            return;
        }
        let id = entry.id;
        contexts.remove(key);
        drop(contexts);

        self.barriers.lock().remove(&id);
        self.windows.lock().remove(&id);
    }

    #[cfg(test)]
    fn registry_sizes(&self) -> (usize, usize, usize) {
        (
            self.contexts.lock().len(),
            self.barriers.lock().len(),
            self.windows.lock().len(),
        )
    }

    fn barrier_for(&self, context: u64, participants: usize) -> Arc<SpinBarrier> {
        Arc::clone(
            self.barriers
                .lock()
                .entry(context)
                .or_insert_with(|| Arc::new(SpinBarrier::new(participants))),
        )
    }

    fn attach_channel(
        &self,
        key: ChannelKey,
        side: Side,
        partitions: usize,
        slice: BufferSlice,
    ) -> FabricResult<Arc<ChannelCore>> {
        let per_partition = slice.len() / partitions.max(1);
        let mut channels = self.channels.lock();
        let queue = channels.entry(key).or_default();

        // Pair with the oldest endpoint still waiting for this side.
        if let Some(position) = queue.iter().position(|core| !core.has_side(side)) {
            queue[position].check_shape(partitions, per_partition)?;
            let core = queue.remove(position);
            if queue.is_empty() {
                channels.remove(&key);
            }
            core.attach(side, slice)?;
            return Ok(core);
        }

        let core = Arc::new(ChannelCore::new(partitions, per_partition));
        core.attach(side, slice)?;
        queue.push(Arc::clone(&core));
        Ok(core)
    }

    fn window_core(&self, context: u64, participants: usize) -> Arc<WindowCore> {
        Arc::clone(
            self.windows
                .lock()
                .entry(context)
                .or_insert_with(|| Arc::new(WindowCore::new(participants))),
        )
    }
}

fn is_abort(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<FabricError>(), Some(FabricError::Aborted))
            || matches!(
                cause.downcast_ref::<BenchError>(),
                Some(BenchError::Fabric(FabricError::Aborted))
                    | Some(BenchError::StrategyInit {
                        source: FabricError::Aborted,
                        ..
                    })
            )
    })
}

/// Runs `body` once per rank of a new world of `size` ranks.
///
/// ## Parameters
/// - `size`: number of ranks; each runs on its own named OS thread
/// - `config`: fabric capabilities shared by all ranks
/// - `body`: per-rank entry point receiving the rank's world communicator
///
/// ## Returns
/// - `Ok(values)` with one value per rank, in rank order
/// - `Err` with the root-cause error when any rank failed; ranks that only
///   observed the resulting abort do not mask the original failure
pub fn launch<T, F>(size: usize, config: FabricConfig, body: F) -> anyhow::Result<Vec<T>>
where
    T: Send,
    F: Fn(Communicator) -> anyhow::Result<T> + Sync,
{
    if size == 0 {
        anyhow::bail!("cannot launch an empty process group");
    }

    let world = Arc::new(WorldShared::new(size, config));
    let abort = world.abort.clone();
    debug!("Launching process group of {} ranks", size);

    let outcomes: Vec<anyhow::Result<T>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for rank in 0..size {
            let world = Arc::clone(&world);
            let body = &body;
            let spawned = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let guard = AbortOnUnwind(world.abort.clone());
                    let result = body(Communicator::world(world, rank));
                    if result.is_err() {
                        guard.0.abort();
                    }
                    result
                });
            if spawned.is_err() {
                abort.abort();
            }
            handles.push(spawned);
        }

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, spawned)| match spawned {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(FabricError::RankPanicked(rank).into())),
                Err(err) => Err(FabricError::Spawn(err).into()),
            })
            .collect()
    });

    let mut values = Vec::with_capacity(size);
    let mut root_cause = None;
    let mut aborted = None;
    for outcome in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(err) if is_abort(&err) => {
                aborted.get_or_insert(err);
            }
            Err(err) => {
                root_cause.get_or_insert(err);
            }
        }
    }
    match root_cause.or(aborted) {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

/// A rank's handle on a group of ranks sharing one matching context.
///
/// Derived communicators (`dup`, `split`, `create_group`, stream and window
/// communicators) get context ids from a per-communicator derivation counter,
/// so every member must derive in the same order, as with MPI collectives.
pub struct Communicator {
    world: Arc<WorldShared>,
    /// `None` for the world communicator.
    key: Option<ContextKey>,
    context: u64,
    rank: usize,
    members: Arc<[usize]>,
    barrier: Arc<SpinBarrier>,
    derived: AtomicU64,
    stream_bound: bool,
}

impl Communicator {
    fn world(world: Arc<WorldShared>, rank: usize) -> Self {
        let members: Arc<[usize]> = (0..world.size).collect();
        let barrier = world.barrier_for(0, world.size);
        Self {
            world,
            key: None,
            context: 0,
            rank,
            members,
            barrier,
            derived: AtomicU64::new(0),
            stream_bound: false,
        }
    }

    fn derive(&self, derivation: Derivation, members: Arc<[usize]>) -> FabricResult<Communicator> {
        let me = self.world_rank();
        let rank = members
            .iter()
            .position(|&member| member == me)
            .ok_or(FabricError::InvalidRank {
                rank: me,
                size: members.len(),
            })?;
        let key = ContextKey {
            parent: self.context,
            seq: self.derived.fetch_add(1, Ordering::Relaxed),
            derivation,
        };
        let context = self.world.derive_context(key.clone());
        Ok(Communicator {
            barrier: self.world.barrier_for(context, members.len()),
            world: Arc::clone(&self.world),
            key: Some(key),
            context,
            rank,
            members,
            derived: AtomicU64::new(0),
            stream_bound: false,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    #[cfg(test)]
    fn context_id(&self) -> u64 {
        self.context
    }

    pub fn capabilities(&self) -> &FabricConfig {
        &self.world.config
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.world.abort
    }

    /// Terminates the whole process group.
    pub fn abort(&self) {
        self.world.abort.abort();
    }

    pub fn is_stream_bound(&self) -> bool {
        self.stream_bound
    }

    fn world_rank_of(&self, rank: usize) -> FabricResult<usize> {
        self.members
            .get(rank)
            .copied()
            .ok_or(FabricError::InvalidRank {
                rank,
                size: self.size(),
            })
    }

    /// Rank within this communicator of the given world rank.
    #[cfg(test)]
    fn rank_of_world(&self, world_rank: usize) -> Option<usize> {
        self.members.iter().position(|&member| member == world_rank)
    }

    pub fn barrier(&self) -> FabricResult<()> {
        self.barrier.wait(&self.world.abort).map(|_| ())
    }

    /// Eager send; returns once the message is queued at the destination.
    pub fn send(&self, dest: usize, tag: i32, payload: &[f64]) -> FabricResult<()> {
        if tag < 0 {
            return Err(FabricError::ReservedTag(tag));
        }
        self.send_raw(dest, tag, payload.to_vec())
    }

    /// Blocking receive of the oldest matching message.
    pub fn recv(&self, source: usize, tag: i32) -> FabricResult<Vec<f64>> {
        if tag < 0 {
            return Err(FabricError::ReservedTag(tag));
        }
        self.recv_raw(source, tag)
    }

    /// 0-byte control message.
    pub fn send_signal(&self, dest: usize, tag: i32) -> FabricResult<()> {
        self.send(dest, tag, &[])
    }

    pub fn recv_signal(&self, source: usize, tag: i32) -> FabricResult<()> {
        self.recv(source, tag).map(|_| ())
    }

    fn send_raw(&self, dest: usize, tag: i32, payload: Vec<f64>) -> FabricResult<()> {
        let dest = self.world_rank_of(dest)?;
        self.world.mailboxes[dest].lock().push_back(Envelope {
            context: self.context,
            source: self.world_rank(),
            tag,
            payload,
        });
        Ok(())
    }

    fn recv_raw(&self, source: usize, tag: i32) -> FabricResult<Vec<f64>> {
        let source = self.world_rank_of(source)?;
        let mailbox = &self.world.mailboxes[self.world_rank()];
        let context = self.context;
        let mut received = None;
        spin_until(&self.world.abort, || {
            let mut queue = mailbox.lock();
            match queue
                .iter()
                .position(|e| e.context == context && e.source == source && e.tag == tag)
            {
                Some(position) => {
                    received = queue.remove(position).map(|e| e.payload);
                    true
                }
                None => false,
            }
        })?;
        Ok(received.unwrap_or_default())
    }

    /// Element-wise sum of `values` across the group, delivered to `root`.
    ///
    /// Returns `Some(sum)` on the root and `None` elsewhere. The root adds
    /// contributions in rank order so the result is deterministic.
    pub fn reduce_sum(&self, values: &[f64], root: usize) -> FabricResult<Option<Vec<f64>>> {
        if self.rank != root {
            self.send_raw(root, TAG_REDUCE, values.to_vec())?;
            return Ok(None);
        }
        let mut sum = values.to_vec();
        for peer in (0..self.size()).filter(|&peer| peer != root) {
            let contribution = self.recv_raw(peer, TAG_REDUCE)?;
            if contribution.len() != sum.len() {
                return Err(FabricError::Mismatch(format!(
                    "reduce contribution of {} values from rank {}, expected {}",
                    contribution.len(),
                    peer,
                    sum.len()
                )));
            }
            sum.iter_mut().zip(contribution).for_each(|(acc, v)| *acc += v);
        }
        Ok(Some(sum))
    }

    /// Returns `values` from `root` on every rank.
    pub fn broadcast(&self, values: Vec<f64>, root: usize) -> FabricResult<Vec<f64>> {
        if self.rank == root {
            for peer in (0..self.size()).filter(|&peer| peer != root) {
                self.send_raw(peer, TAG_BCAST, values.clone())?;
            }
            Ok(values)
        } else {
            self.recv_raw(root, TAG_BCAST)
        }
    }

    /// New communicator with the same members and a fresh matching context.
    pub fn dup(&self) -> FabricResult<Communicator> {
        self.derive(Derivation::Dup, Arc::clone(&self.members))
    }

    /// Collective split; members with equal `color` form one communicator,
    /// ordered by their rank in `self`.
    pub fn split(&self, color: usize) -> FabricResult<Communicator> {
        for peer in (0..self.size()).filter(|&peer| peer != self.rank) {
            self.send_raw(peer, TAG_SPLIT, vec![color as f64])?;
        }
        let mut members = Vec::new();
        for peer in 0..self.size() {
            let peer_color = if peer == self.rank {
                color
            } else {
                self.recv_raw(peer, TAG_SPLIT)?
                    .first()
                    .copied()
                    .ok_or_else(|| FabricError::Mismatch(format!("empty split color from rank {peer}")))?
                    as usize
            };
            if peer_color == color {
                members.push(self.world_rank_of(peer)?);
            }
        }
        self.derive(Derivation::Split(color), members.into())
    }

    /// Communicator over `ranks` (numbered in `self`), which must include
    /// the caller. Only the listed ranks participate.
    pub fn create_group(&self, ranks: &[usize]) -> FabricResult<Communicator> {
        let members = ranks
            .iter()
            .map(|&rank| self.world_rank_of(rank))
            .collect::<FabricResult<Vec<_>>>()?;
        self.derive(Derivation::Group(members.clone()), members.into())
    }

    /// Communicator bound to a stream context, or a plain duplicate when
    /// `stream` is `None`.
    pub fn stream_comm(&self, stream: Option<&Stream>) -> FabricResult<Communicator> {
        let mut comm = self.derive(Derivation::Stream, Arc::clone(&self.members))?;
        comm.stream_bound = stream.is_some();
        Ok(comm)
    }

    fn channel_key(&self, source: usize, dest: usize, tag: i32) -> FabricResult<ChannelKey> {
        if tag < 0 {
            return Err(FabricError::ReservedTag(tag));
        }
        Ok(ChannelKey {
            context: self.context,
            source: self.world_rank_of(source)?,
            dest: self.world_rank_of(dest)?,
            tag,
        })
    }

    /// Persistent send of `buffer` to `dest`.
    pub fn send_init(&self, buffer: BufferSlice, dest: usize, tag: i32) -> FabricResult<PersistentRequest> {
        let key = self.channel_key(self.rank, dest, tag)?;
        let core = self.world.attach_channel(key, Side::Send, 1, buffer)?;
        Ok(PersistentRequest::new(core, Side::Send, self.world.abort.clone()))
    }

    /// Persistent receive into `buffer` from `source`.
    pub fn recv_init(&self, buffer: BufferSlice, source: usize, tag: i32) -> FabricResult<PersistentRequest> {
        let key = self.channel_key(source, self.rank, tag)?;
        let core = self.world.attach_channel(key, Side::Recv, 1, buffer)?;
        Ok(PersistentRequest::new(core, Side::Recv, self.world.abort.clone()))
    }

    /// Partitioned send of `buffer` split into `partitions` equal parts.
    pub fn psend_init(
        &self,
        buffer: BufferSlice,
        partitions: usize,
        dest: usize,
        tag: i32,
    ) -> FabricResult<PartitionedRequest> {
        check_partitioning(&buffer, partitions)?;
        let key = self.channel_key(self.rank, dest, tag)?;
        let core = self.world.attach_channel(key, Side::Send, partitions, buffer)?;
        Ok(PartitionedRequest::new(core, Side::Send, self.world.abort.clone()))
    }

    /// Partitioned receive matching [`Communicator::psend_init`].
    pub fn precv_init(
        &self,
        buffer: BufferSlice,
        partitions: usize,
        source: usize,
        tag: i32,
    ) -> FabricResult<PartitionedRequest> {
        check_partitioning(&buffer, partitions)?;
        let key = self.channel_key(source, self.rank, tag)?;
        let core = self.world.attach_channel(key, Side::Recv, partitions, buffer)?;
        Ok(PartitionedRequest::new(core, Side::Recv, self.world.abort.clone()))
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.world.release_context(&key, self.members.len());
        }
    }
}

fn check_partitioning(buffer: &BufferSlice, partitions: usize) -> FabricResult<()> {
    if partitions == 0 || buffer.len() % partitions != 0 {
        return Err(FabricError::Mismatch(format!(
            "{} elements cannot be split into {} partitions",
            buffer.len(),
            partitions
        )));
    }
    Ok(())
}

/// A per-thread transfer context reserved from the rank's stream budget.
pub struct Stream {
    world: Arc<WorldShared>,
    world_rank: usize,
}

impl Stream {
    /// Reserves a stream for the calling rank.
    ///
    /// Fails with [`FabricError::StreamUnavailable`] when the fabric has no
    /// stream support or the rank's budget is exhausted.
    pub fn create(comm: &Communicator) -> FabricResult<Stream> {
        let world = &comm.world;
        if !world.config.streams {
            return Err(FabricError::StreamUnavailable);
        }
        let world_rank = comm.world_rank();
        let in_use = &world.streams_in_use[world_rank];
        let limit = world.config.max_streams_per_rank;
        in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| FabricError::StreamUnavailable)?;
        Ok(Stream {
            world: Arc::clone(world),
            world_rank,
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.world.streams_in_use[self.world_rank].fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_collects_values_in_rank_order() {
        let ranks = launch(4, FabricConfig::default(), |comm| Ok(comm.rank() * 10)).unwrap();
        assert_eq!(ranks, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_failed_rank_aborts_group() {
        let result = launch(2, FabricConfig::default(), |comm| {
            if comm.rank() == 1 {
                anyhow::bail!("rank one failed");
            }
            // Would block forever without the abort.
            comm.barrier()?;
            Ok(())
        });
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "rank one failed", "root cause must win over the abort");
    }

    #[test]
    fn test_send_recv_matches_tag_and_source() {
        let received = launch(3, FabricConfig::default(), |comm| {
            match comm.rank() {
                0 => {
                    comm.send(2, 7, &[1.0])?;
                    comm.send(2, 8, &[2.0])?;
                    Ok(Vec::new())
                }
                1 => {
                    comm.send(2, 7, &[3.0])?;
                    Ok(Vec::new())
                }
                _ => {
                    let b = comm.recv(0, 8)?;
                    let c = comm.recv(1, 7)?;
                    let a = comm.recv(0, 7)?;
                    Ok(vec![a[0], b[0], c[0]])
                }
            }
        })
        .unwrap();
        assert_eq!(received[2], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_reserved_tags_rejected() {
        launch(1, FabricConfig::default(), |comm| {
            assert!(matches!(comm.send(0, -1, &[]), Err(FabricError::ReservedTag(-1))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reduce_and_broadcast() {
        let results = launch(4, FabricConfig::default(), |comm| {
            let value = comm.rank() as f64;
            let sum = comm.reduce_sum(&[value, 1.0], 0)?;
            let shared = comm.broadcast(sum.clone().unwrap_or_default(), 0)?;
            Ok((sum, shared))
        })
        .unwrap();
        assert_eq!(results[0].0, Some(vec![6.0, 4.0]));
        assert!(results[1..].iter().all(|(sum, _)| sum.is_none()));
        assert!(results.iter().all(|(_, shared)| shared == &vec![6.0, 4.0]));
    }

    #[test]
    fn test_split_groups_by_color() {
        let results = launch(4, FabricConfig::default(), |comm| {
            let half = comm.split(usize::from(comm.rank() >= 2))?;
            let sum = half.reduce_sum(&[comm.rank() as f64], 0)?;
            half.barrier()?;
            Ok((half.rank(), half.size(), sum))
        })
        .unwrap();
        assert_eq!(results[0], (0, 2, Some(vec![1.0])));
        assert_eq!(results[2], (0, 2, Some(vec![5.0])));
        assert_eq!(results[3], (1, 2, None));
    }

    #[test]
    fn test_dup_contexts_agree_and_isolate() {
        let contexts = launch(2, FabricConfig::default(), |comm| {
            let a = comm.dup()?;
            let b = comm.dup()?;
            assert_ne!(a.context_id(), b.context_id());
            if comm.rank() == 0 {
                b.send(1, 0, &[2.0])?;
                a.send(1, 0, &[1.0])?;
            } else {
                assert_eq!(a.recv(0, 0)?, vec![1.0]);
                assert_eq!(b.recv(0, 0)?, vec![2.0]);
            }
            Ok((a.context_id(), b.context_id()))
        })
        .unwrap();
        assert_eq!(contexts[0], contexts[1]);
    }

    #[test]
    fn test_create_group_pairs() {
        let results = launch(4, FabricConfig::default(), |comm| {
            let buddy = (comm.rank() + 2) % 4;
            let pair = comm.create_group(&[comm.rank().min(buddy), comm.rank().max(buddy)])?;
            pair.barrier()?;
            Ok((pair.size(), pair.rank(), pair.rank_of_world(buddy)))
        })
        .unwrap();
        assert_eq!(results[0], (2, 0, Some(1)));
        assert_eq!(results[2], (2, 1, Some(0)));
        assert_eq!(results[3], (2, 1, Some(0)));
    }

    #[test]
    fn test_stream_budget() {
        let config = FabricConfig {
            max_streams_per_rank: 1,
            ..FabricConfig::default()
        };
        launch(1, config, |comm| {
            let first = Stream::create(&comm)?;
            assert!(matches!(Stream::create(&comm), Err(FabricError::StreamUnavailable)));
            let bound = comm.stream_comm(Some(&first))?;
            assert!(bound.is_stream_bound());
            drop(first);
            assert!(Stream::create(&comm).is_ok());
            Ok(())
        })
        .unwrap();

        let disabled = FabricConfig {
            streams: false,
            max_streams_per_rank: 4,
            ..FabricConfig::default()
        };
        launch(1, disabled, |comm| {
            assert!(matches!(Stream::create(&comm), Err(FabricError::StreamUnavailable)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_waits_spin_unless_oversubscribed() {
        let policy = launch(1, FabricConfig::default(), |comm| Ok(comm.abort_handle().yields())).unwrap();
        assert_eq!(policy, vec![false]);

        let config = FabricConfig {
            oversubscribe: true,
            ..FabricConfig::default()
        };
        let policy = launch(2, config, |comm| Ok(comm.abort_handle().yields())).unwrap();
        assert_eq!(policy, vec![true, true]);

        assert!(!FabricConfig::default().for_team(1, 1).oversubscribe);
        assert!(FabricConfig::default().for_team(num_cpus::get() + 1, 1).oversubscribe);
        assert!(FabricConfig::default().for_team(1, num_cpus::get() + 1).oversubscribe);
    }

    #[test]
    fn test_dropped_contexts_leave_the_registry() {
        let sizes = launch(2, FabricConfig::default(), |comm| {
            for round in 0..5 {
                let dup = comm.dup()?;
                let alone = dup.split(comm.rank())?;
                let group = comm.create_group(&[0, 1])?;
                dup.barrier()?;
                alone.barrier()?;
                group.barrier()?;
                assert_eq!(alone.size(), 1, "round {round}");
            }
            comm.barrier()?;
            Ok(comm.world.registry_sizes())
        })
        .unwrap();
        // Only the world barrier survives.
        assert_eq!(sizes, vec![(0, 1, 0), (0, 1, 0)]);
    }

    #[test]
    fn test_context_outlives_early_release() {
        let sizes = launch(2, FabricConfig::default(), |comm| {
            let mut dup = Some(comm.dup()?);
            if comm.rank() == 0 {
                dup.take();
            }
            comm.barrier()?;
            let held = comm.world.registry_sizes();
            comm.barrier()?;
            drop(dup);
            comm.barrier()?;
            Ok((held, comm.world.registry_sizes()))
        })
        .unwrap();
        for (held, released) in sizes {
            assert_eq!(held, (1, 2, 0));
            assert_eq!(released, (0, 1, 0));
        }
    }

    #[test]
    fn test_late_member_joins_a_released_context() {
        let contexts = launch(2, FabricConfig::default(), |comm| {
            // Rank 0 derives and drops before rank 1 has derived at all.
            if comm.rank() == 0 {
                let id = comm.dup()?.context_id();
                comm.send_signal(1, 1)?;
                Ok(id)
            } else {
                comm.recv_signal(0, 1)?;
                Ok(comm.dup()?.context_id())
            }
        })
        .unwrap();
        assert_eq!(contexts[0], contexts[1]);
    }
}
