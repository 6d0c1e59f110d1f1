//! One-sided windows.
//!
//! A window is created collectively over a communicator; every member may
//! expose a buffer. Origins write into a target's exposed buffer with
//! [`Window::put`], which is only legal inside an access epoch: a passive
//! shared lock on the target, an active epoch opened with
//! [`Window::start`] (matched by the target's [`Window::post`]), or the
//! interval after a [`Window::fence`]. Puts copy synchronously, so a flush
//! only has to publish them; each put also bumps the arrival counter of the
//! target slots it covers so targets can watch individual partitions land.

use super::buffer::BufferSlice;
use super::{Communicator, Derivation};
use crate::error::{FabricError, FabricResult};
use crate::sync::spin_until;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Per-member target state.
pub(crate) struct TargetState {
    exposed: Option<BufferSlice>,
    slot_len: usize,
    slots: Box<[AtomicU64]>,
    shared_locks: AtomicUsize,
    posted: AtomicU64,
    completed: AtomicU64,
}

impl TargetState {
    fn new(exposed: Option<BufferSlice>, slot_len: usize) -> Self {
        let slot_len = slot_len.max(1);
        let len = exposed.as_ref().map_or(0, BufferSlice::len);
        Self {
            exposed,
            slot_len,
            slots: (0..(len + slot_len - 1) / slot_len)
                .map(|_| AtomicU64::new(0))
                .collect(),
            shared_locks: AtomicUsize::new(0),
            posted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }
}

pub(crate) struct WindowCore {
    targets: Box<[OnceLock<TargetState>]>,
    attached: AtomicUsize,
}

impl WindowCore {
    pub(crate) fn new(participants: usize) -> Self {
        Self {
            targets: (0..participants).map(|_| OnceLock::new()).collect(),
            attached: AtomicUsize::new(0),
        }
    }
}

/// This rank's handle on a one-sided window.
pub struct Window {
    core: Arc<WindowCore>,
    comm: Communicator,
    locks_held: Box<[AtomicBool]>,
    in_access: Box<[AtomicBool]>,
    access_epochs: AtomicU64,
    expected_completions: AtomicU64,
    fences: AtomicU64,
}

fn flags(n: usize) -> Box<[AtomicBool]> {
    (0..n).map(|_| AtomicBool::new(false)).collect()
}

impl Window {
    /// Collective creation over `comm`.
    ///
    /// ## Parameters
    /// - `comm`: communicator whose members all call `create`
    /// - `exposed`: memory this rank exposes, or `None` for a zero-size window
    /// - `slot_len`: elements per arrival slot (usually the partition length)
    pub fn create(comm: &Communicator, exposed: Option<BufferSlice>, slot_len: usize) -> FabricResult<Window> {
        let comm = comm.derive(Derivation::Window, Arc::clone(&comm.members))?;
        let participants = comm.size();
        let core = comm.world.window_core(comm.context, participants);

        core.targets[comm.rank()]
            .set(TargetState::new(exposed, slot_len))
            .map_err(|_| FabricError::Window("window slot attached twice".into()))?;
        if core.attached.fetch_add(1, Ordering::AcqRel) + 1 == participants {
            comm.world.windows.lock().remove(&comm.context);
        }
        comm.barrier()?;

        Ok(Window {
            core,
            locks_held: flags(participants),
            in_access: flags(participants),
            access_epochs: AtomicU64::new(0),
            expected_completions: AtomicU64::new(0),
            fences: AtomicU64::new(0),
            comm,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn target(&self, rank: usize) -> FabricResult<&TargetState> {
        self.core
            .targets
            .get(rank)
            .and_then(OnceLock::get)
            .ok_or(FabricError::InvalidRank {
                rank,
                size: self.core.targets.len(),
            })
    }

    fn local(&self) -> FabricResult<&TargetState> {
        self.target(self.comm.rank())
    }

    /// Passive-target shared lock on `target`.
    pub fn lock_shared(&self, target: usize) -> FabricResult<()> {
        let state = self.target(target)?;
        if self.locks_held[target].swap(true, Ordering::AcqRel) {
            return Err(FabricError::Window(format!("lock on rank {target} already held")));
        }
        state.shared_locks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn unlock(&self, target: usize) -> FabricResult<()> {
        let state = self.target(target)?;
        if !self.locks_held[target].swap(false, Ordering::AcqRel) {
            return Err(FabricError::Window(format!("no lock held on rank {target}")));
        }
        atomic::fence(Ordering::SeqCst);
        state.shared_locks.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of passive locks this rank currently holds.
    pub fn held_locks(&self) -> usize {
        self.locks_held
            .iter()
            .filter(|held| held.load(Ordering::Acquire))
            .count()
    }

    /// Number of origins currently holding a shared lock on this rank.
    pub fn lock_holders(&self) -> FabricResult<usize> {
        Ok(self.local()?.shared_locks.load(Ordering::Acquire))
    }

    fn may_access(&self, target: usize) -> bool {
        self.locks_held[target].load(Ordering::Acquire)
            || self.in_access[target].load(Ordering::Acquire)
            || self.fences.load(Ordering::Acquire) > 0
    }

    /// Writes `count` elements of `origin` (from `origin_at`) into the
    /// target's exposed memory at displacement `target_disp`.
    pub fn put(
        &self,
        origin: &BufferSlice,
        origin_at: usize,
        count: usize,
        target: usize,
        target_disp: usize,
    ) -> FabricResult<()> {
        let state = self.target(target)?;
        if !self.may_access(target) {
            return Err(FabricError::Window(format!(
                "put to rank {target} outside an access epoch"
            )));
        }
        let exposed = state
            .exposed
            .as_ref()
            .ok_or_else(|| FabricError::Window(format!("rank {target} exposes no memory")))?;
        if target_disp + count > exposed.len() || origin_at + count > origin.len() {
            return Err(FabricError::Window(format!(
                "put of {count} elements at displacement {target_disp} exceeds window of {}",
                exposed.len()
            )));
        }
        if count == 0 {
            return Ok(());
        }
        // SAFETY: origins only put into ranges the target is not reading
        // until the slot counter or the epoch tells it the put landed.
        unsafe { exposed.copy_from(target_disp, origin, origin_at, count) };
        let first = target_disp / state.slot_len;
        let last = (target_disp + count - 1) / state.slot_len;
        for slot in &state.slots[first..=last] {
            slot.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Completes all outstanding puts to `target` under a passive lock.
    pub fn flush(&self, target: usize) -> FabricResult<()> {
        if !self.locks_held[target].load(Ordering::Acquire) {
            return Err(FabricError::Window(format!("flush without a lock on rank {target}")));
        }
        atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    /// Number of puts that have landed in `slot` of this rank's memory.
    pub fn arrivals(&self, slot: usize) -> FabricResult<u64> {
        let state = self.local()?;
        state
            .slots
            .get(slot)
            .map(|counter| counter.load(Ordering::Acquire))
            .ok_or_else(|| FabricError::Window(format!("slot {slot} out of range")))
    }

    /// Opens an access epoch towards `targets`, waiting until each has
    /// posted a matching exposure epoch.
    pub fn start(&self, targets: &[usize]) -> FabricResult<()> {
        let epoch = self.access_epochs.fetch_add(1, Ordering::AcqRel) + 1;
        for &target in targets {
            let state = self.target(target)?;
            spin_until(self.comm.abort_handle(), || {
                state.posted.load(Ordering::Acquire) >= epoch
            })?;
            self.in_access[target].store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Closes the access epoch opened by [`Window::start`].
    pub fn complete(&self) -> FabricResult<()> {
        atomic::fence(Ordering::SeqCst);
        for (target, open) in self.in_access.iter().enumerate() {
            if open.swap(false, Ordering::AcqRel) {
                self.target(target)?.completed.fetch_add(1, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Opens an exposure epoch for `origins`.
    pub fn post(&self, origins: &[usize]) -> FabricResult<()> {
        for &origin in origins {
            self.target(origin)?;
        }
        self.expected_completions
            .fetch_add(origins.len() as u64, Ordering::AcqRel);
        self.local()?.posted.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Waits until every origin of the exposure epoch called `complete`.
    pub fn wait(&self) -> FabricResult<()> {
        let state = self.local()?;
        let expected = self.expected_completions.load(Ordering::Acquire);
        spin_until(self.comm.abort_handle(), || {
            state.completed.load(Ordering::Acquire) >= expected
        })
    }

    /// Collective fence over the window's members.
    pub fn fence(&self) -> FabricResult<()> {
        atomic::fence(Ordering::SeqCst);
        self.comm.barrier()?;
        self.fences.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Collective release; drops any passive locks still held.
    pub fn free(self) -> FabricResult<()> {
        for target in 0..self.locks_held.len() {
            if self.locks_held[target].load(Ordering::Acquire) {
                self.unlock(target)?;
            }
        }
        self.comm.barrier()
    }
}
