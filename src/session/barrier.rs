use parking_lot::{Condvar, Mutex};

use crate::{HarnessError, Result};

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable N-party rendezvous. The last arriver of a generation is its leader.
///
/// Unlike `std::sync::Barrier` it can be aborted, which releases every current and
/// future waiter with [`HarnessError::Aborted`].
#[derive(Debug)]
pub struct PhaseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

/// Outcome of a successful [`PhaseBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseWait {
    leader: bool,
    generation: u64,
}

impl PhaseWait {
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Zero-based index of the generation this wait completed.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl PhaseBarrier {
    pub fn new(parties: usize) -> Result<Self> {
        if parties == 0 {
            return Err(HarnessError::InvalidConfig(
                "barrier needs at least one party".to_string(),
            ));
        }
        Ok(Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until `parties` threads have called `wait` for the current generation.
    pub fn wait(&self) -> Result<PhaseWait> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(HarnessError::Aborted);
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(PhaseWait {
                leader: true,
                generation,
            });
        }

        while state.generation == generation && !state.aborted {
            self.released.wait(&mut state);
        }

        if state.generation == generation {
            return Err(HarnessError::Aborted);
        }
        Ok(PhaseWait {
            leader: false,
            generation,
        })
    }

    /// Release every waiter with an error and make all later waits fail immediately.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.released.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Number of generations completed so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_parties_rejected() {
        assert!(PhaseBarrier::new(0).is_err());
    }

    #[test]
    fn test_single_party_never_blocks() {
        let barrier = PhaseBarrier::new(1).unwrap();
        for expected in 0..3 {
            let wait = barrier.wait().unwrap();
            assert!(wait.is_leader());
            assert_eq!(wait.generation(), expected);
        }
    }

    #[test]
    fn test_three_phases_hold_until_all_arrive() {
        const PARTIES: usize = 4;
        let barrier = PhaseBarrier::new(PARTIES).unwrap();
        let arrived = [
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
        ];
        let leaders = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..PARTIES {
                s.spawn(|| {
                    for phase in &arrived {
                        phase.fetch_add(1, Ordering::SeqCst);
                        let wait = barrier.wait().unwrap();
                        // Nobody leaves a phase before every party has entered it.
                        assert_eq!(phase.load(Ordering::SeqCst), PARTIES);
                        if wait.is_leader() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(leaders.load(Ordering::SeqCst), 3);
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn test_abort_releases_waiters() {
        let barrier = PhaseBarrier::new(3).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| barrier.wait());
            thread::sleep(Duration::from_millis(20));
            barrier.abort();
            assert!(matches!(waiter.join().unwrap(), Err(HarnessError::Aborted)));
        });

        assert!(barrier.is_aborted());
        assert!(matches!(barrier.wait(), Err(HarnessError::Aborted)));
    }
}
