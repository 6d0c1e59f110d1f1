//! Spinning synchronisation primitives.
//!
//! Every wait in the timed path spins on the CPU instead of parking the
//! thread or yielding its time slice. Only a world launched as
//! oversubscribed (more spinning threads than cores) lets `SpinWait` yield
//! once a spin budget is spent. Each wait also observes the group-wide
//! [`AbortHandle`] so a failing rank can terminate the whole process group.

use crate::error::{FabricError, FabricResult};
use std::hint;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Spin iterations before an oversubscribed waiter yields its time slice.
const SPIN_BUDGET: u32 = 1 << 12;

/// Group-wide abort flag, the analogue of aborting a whole MPI job.
///
/// It also carries the group's waiting policy: whether waits may yield to
/// the scheduler at all.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    yields: bool,
}

impl AbortHandle {
    /// Handle whose waits never leave the CPU.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for an oversubscribed group: waits yield after the spin budget.
    pub fn oversubscribed() -> Self {
        Self {
            aborted: Arc::default(),
            yields: true,
        }
    }

    pub fn yields(&self) -> bool {
        self.yields
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn check(&self) -> FabricResult<()> {
        if self.is_aborted() {
            Err(FabricError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Raises the abort flag if the owning thread unwinds.
pub(crate) struct AbortOnUnwind(pub(crate) AbortHandle);

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

/// Busy-wait helper used by every blocking loop.
///
/// The default never yields. [`SpinWait::yielding`] gives up the time slice
/// once `SPIN_BUDGET` spins have passed.
#[derive(Debug, Default)]
pub struct SpinWait {
    spins: u32,
    yields: bool,
}

impl SpinWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn yielding() -> Self {
        Self {
            spins: 0,
            yields: true,
        }
    }

    /// Whether the next `spin` gives up the time slice.
    pub fn will_yield(&self) -> bool {
        self.yields && self.spins >= SPIN_BUDGET
    }

    pub fn spin(&mut self) {
        if self.will_yield() {
            thread::yield_now();
        } else {
            self.spins = self.spins.saturating_add(1);
            hint::spin_loop();
        }
    }
}

/// Spins until `ready` returns `true` or the group is aborted.
pub fn spin_until(abort: &AbortHandle, mut ready: impl FnMut() -> bool) -> FabricResult<()> {
    let mut wait = if abort.yields() {
        SpinWait::yielding()
    } else {
        SpinWait::new()
    };
    loop {
        if ready() {
            return Ok(());
        }
        abort.check()?;
        wait.spin();
    }
}

/// Reusable generation-counting barrier that never parks its waiters.
#[derive(Debug)]
pub struct SpinBarrier {
    count: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
}

impl SpinBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn participants(&self) -> usize {
        self.count
    }

    /// Blocks until `participants()` threads have arrived.
    ///
    /// Returns `true` for exactly one thread per generation (the last to
    /// arrive), mirroring `std::sync::BarrierWaitResult::is_leader`.
    pub fn wait(&self, abort: &AbortHandle) -> FabricResult<bool> {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.count {
            // Reset before publishing the new generation so early re-entrants
            // start counting from zero.
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return Ok(true);
        }
        spin_until(abort, || {
            self.generation.load(Ordering::Acquire) != generation
        })?;
        Ok(false)
    }
}

/// Contiguous block of `0..n` owned by `worker` under a static schedule.
///
/// Matches OpenMP's `schedule(static)` without a chunk size: the first
/// `n % workers` workers receive one extra item.
pub fn static_range(n: usize, workers: usize, worker: usize) -> Range<usize> {
    let workers = workers.max(1);
    let base = n / workers;
    let extra = n % workers;
    let start = worker * base + worker.min(extra);
    let len = base + usize::from(worker < extra);
    start.min(n)..(start + len).min(n)
}

/// Worker that owns `index` under [`static_range`].
pub fn static_owner(index: usize, n: usize, workers: usize) -> usize {
    let workers = workers.max(1);
    let base = n / workers;
    let extra = n % workers;
    let boundary = extra * (base + 1);
    if index < boundary {
        index / (base + 1)
    } else {
        extra + (index - boundary) / base.max(1)
    }
}

/// One worker's view of the thread team executing a timed round.
pub struct Team<'a> {
    id: usize,
    size: usize,
    barrier: &'a SpinBarrier,
    abort: &'a AbortHandle,
}

impl<'a> Team<'a> {
    pub fn new(id: usize, barrier: &'a SpinBarrier, abort: &'a AbortHandle) -> Self {
        Self {
            id,
            size: barrier.participants(),
            barrier,
            abort,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Worker 0 plays the role of the OpenMP master thread.
    pub fn is_master(&self) -> bool {
        self.id == 0
    }

    pub fn barrier(&self) -> FabricResult<()> {
        self.barrier.wait(self.abort).map(|_| ())
    }

    /// This worker's share of `0..n` under the static schedule.
    pub fn static_range(&self, n: usize) -> Range<usize> {
        static_range(n, self.size, self.id)
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        self.abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_static_range_covers_every_index_once() {
        for n in [0usize, 1, 3, 7, 8, 64] {
            for workers in 1..=5 {
                let mut seen = vec![0usize; n];
                for worker in 0..workers {
                    for i in static_range(n, workers, worker) {
                        seen[i] += 1;
                        assert_eq!(static_owner(i, n, workers), worker, "owner of {i} (n={n}, workers={workers})");
                    }
                }
                assert!(seen.iter().all(|&c| c == 1), "n={n}, workers={workers}: {seen:?}");
            }
        }
    }

    #[test]
    fn test_static_range_front_loads_remainder() {
        assert_eq!(static_range(10, 4, 0), 0..3);
        assert_eq!(static_range(10, 4, 1), 3..6);
        assert_eq!(static_range(10, 4, 2), 6..8);
        assert_eq!(static_range(10, 4, 3), 8..10);
    }

    #[test]
    fn test_spin_barrier_reusable_with_single_leader() {
        let barrier = SpinBarrier::new(4);
        let abort = AbortHandle::new();
        let leaders = AtomicUsize::new(0);
        let counter = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 0..50 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait(&abort).unwrap() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * 4);
                        barrier.wait(&abort).unwrap();
                    }
                });
            }
        });

        assert_eq!(leaders.load(Ordering::SeqCst), 50);
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_abort_releases_waiters() {
        let barrier = SpinBarrier::new(2);
        let abort = AbortHandle::new();

        thread::scope(|s| {
            let waiter = s.spawn(|| barrier.wait(&abort));
            abort.abort();
            let result = waiter.join().unwrap();
            assert!(matches!(result, Err(FabricError::Aborted)));
        });
    }

    #[test]
    fn test_spin_wait_never_yields_by_default() {
        let mut wait = SpinWait::new();
        for _ in 0..4 * SPIN_BUDGET {
            wait.spin();
            assert!(!wait.will_yield());
        }

        let mut yielding = SpinWait::yielding();
        for _ in 0..SPIN_BUDGET {
            assert!(!yielding.will_yield());
            yielding.spin();
        }
        assert!(yielding.will_yield());
    }

    #[test]
    fn test_abort_handle_carries_wait_policy() {
        assert!(!AbortHandle::new().yields());
        let handle = AbortHandle::oversubscribed();
        let clone = handle.clone();
        assert!(clone.yields());
        handle.abort();
        assert!(clone.is_aborted());
    }

    #[test]
    fn test_team_master_is_worker_zero() {
        let barrier = SpinBarrier::new(3);
        let abort = AbortHandle::new();
        let team = Team::new(0, &barrier, &abort);
        assert!(team.is_master());
        assert_eq!(team.size(), 3);
        assert_eq!(team.static_range(9), 0..3);
        assert!(!Team::new(2, &barrier, &abort).is_master());
    }
}
