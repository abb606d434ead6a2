//! Reusable phase gate for the shared-build round.
//!
//! Every participant arrives once per generation. The executor waits until
//! all of them have arrived, does the phase's exclusive work, then releases
//! the generation: the counter drops back to 0, the generation advances and
//! the verdict is published to the waiters. Aborting wakes everybody with an
//! error and poisons the gate for good.

use kt_types::{KtError, KtResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What the executor decided when releasing a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundVerdict {
    Continue,
    Stop,
}

#[derive(Debug)]
struct GateState {
    ready: usize,
    generation: u64,
    verdict: RoundVerdict,
    aborted: Option<String>,
}

#[derive(Debug)]
pub struct PhaseGate {
    name: &'static str,
    total: usize,
    state: Mutex<GateState>,
    released: Condvar,
}

impl PhaseGate {
    pub fn new(name: &'static str, total: usize) -> Self {
        Self {
            name,
            total,
            state: Mutex::new(GateState {
                ready: 0,
                generation: 0,
                verdict: RoundVerdict::Continue,
                aborted: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn ready(&self) -> usize {
        self.state.lock().ready
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted.is_some()
    }

    /// Arrive at the gate. Returns the generation arrived in.
    pub fn arrive(&self) -> KtResult<u64> {
        self.arrive_with(|| Ok(())).map(|(generation, ())| generation)
    }

    /// Run `work` while holding the gate lock and count the arrival only if
    /// it succeeds, so the side effect and the increment are one step.
    pub fn arrive_with<T, F>(&self, work: F) -> KtResult<(u64, T)>
    where
        F: FnOnce() -> KtResult<T>,
    {
        let mut state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return Err(KtError::aborted(reason.clone()));
        }
        if state.ready >= self.total {
            return Err(KtError::Internal(format!(
                "{} gate over-subscribed: {} of {} already arrived",
                self.name, state.ready, self.total
            )));
        }

        let value = work()?;
        state.ready += 1;
        debug!(gate = self.name, ready = state.ready, total = self.total, "arrived");
        if state.ready == self.total {
            self.released.notify_all();
        }
        Ok((state.generation, value))
    }

    /// Executor side: block until every participant has arrived.
    pub fn wait_for_all(&self) -> KtResult<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(KtError::aborted(reason.clone()));
            }
            if state.ready == self.total {
                return Ok(());
            }
            self.released.wait(&mut state);
        }
    }

    /// Executor side: reset the counter and open the next generation.
    pub fn release(&self, verdict: RoundVerdict) {
        let mut state = self.state.lock();
        state.ready = 0;
        state.generation += 1;
        state.verdict = verdict;
        debug!(gate = self.name, generation = state.generation, ?verdict, "released");
        self.released.notify_all();
    }

    /// Participant side: block until `generation` has been released.
    pub fn wait_release(&self, generation: u64) -> KtResult<RoundVerdict> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(KtError::aborted(reason.clone()));
            }
            if state.generation != generation {
                return Ok(state.verdict);
            }
            self.released.wait(&mut state);
        }
    }

    /// Wake every waiter with `SessionAborted`. The first reason sticks.
    pub fn abort(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            warn!(gate = self.name, reason, "gate aborted");
            state.aborted = Some(reason.to_string());
        }
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn single_participant_passes_straight_through() {
        let gate = PhaseGate::new("compile", 1);
        let generation = gate.arrive().unwrap();
        gate.wait_for_all().unwrap();
        gate.release(RoundVerdict::Stop);
        assert_eq!(gate.wait_release(generation).unwrap(), RoundVerdict::Stop);
        assert_eq!(gate.ready(), 0);
        assert_eq!(gate.generation(), 1);
    }

    #[test]
    fn participants_wait_for_the_executor_release() {
        let gate = PhaseGate::new("test", 4);
        let passed = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let generation = gate.arrive().unwrap();
                    let verdict = gate.wait_release(generation).unwrap();
                    assert_eq!(verdict, RoundVerdict::Continue);
                    passed.fetch_add(1, Ordering::SeqCst);
                });
            }

            gate.arrive().unwrap();
            gate.wait_for_all().unwrap();
            assert_eq!(passed.load(Ordering::SeqCst), 0);
            gate.release(RoundVerdict::Continue);
        });

        assert_eq!(passed.load(Ordering::SeqCst), 3);
        assert_eq!(gate.ready(), 0);
    }

    #[test]
    fn gate_is_reusable_across_generations() {
        let gate = PhaseGate::new("compile", 2);
        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..5 {
                    let generation = gate.arrive().unwrap();
                    gate.wait_release(generation).unwrap();
                }
            });
            for _ in 0..5 {
                gate.arrive().unwrap();
                gate.wait_for_all().unwrap();
                gate.release(RoundVerdict::Continue);
            }
        });
        assert_eq!(gate.generation(), 5);
    }

    #[test]
    fn failed_work_is_not_counted() {
        let gate = PhaseGate::new("compile", 2);
        let result =
            gate.arrive_with(|| -> KtResult<()> { Err(KtError::Internal("write failed".into())) });
        assert!(result.is_err());
        assert_eq!(gate.ready(), 0);
    }

    #[test]
    fn abort_wakes_waiters() {
        let gate = PhaseGate::new("compile", 3);
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let generation = gate.arrive().unwrap();
                gate.wait_release(generation)
            });
            let executor = s.spawn(|| {
                gate.arrive().unwrap();
                gate.wait_for_all()
            });

            while gate.ready() < 2 {
                thread::yield_now();
            }
            gate.abort("build failed");

            assert!(matches!(waiter.join().unwrap(), Err(KtError::SessionAborted { .. })));
            assert!(matches!(executor.join().unwrap(), Err(KtError::SessionAborted { .. })));
        });
        assert!(matches!(gate.arrive(), Err(KtError::SessionAborted { .. })));
    }
}
