//! One physical build per round, shared by every tuning worker.
//!
//! Round order is: every worker writes its proposal, the executor builds,
//! every worker measures, then the next round's writes start. The compile
//! gate separates writes from the build and the test gate separates
//! measurements from the next round's writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kt_types::KtResult;
use tracing::{error, info};

use crate::barrier::{PhaseGate, RoundVerdict};
use crate::toolchain::BuildTool;

/// A worker's part in the shared round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waits for everyone, builds, and decides when the session stops.
    Executor,
    Participant,
}

impl Role {
    pub fn for_index(index: usize) -> Self {
        if index == 0 {
            Role::Executor
        } else {
            Role::Participant
        }
    }
}

/// When the executor stops the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundLimits {
    /// Tuning rounds after the baseline round.
    pub max_rounds: usize,
    /// Wall-clock budget measured from coordinator creation.
    pub time_budget: Option<Duration>,
}

impl Default for RoundLimits {
    fn default() -> Self {
        Self {
            max_rounds: 12,
            time_budget: Some(Duration::from_secs(180)),
        }
    }
}

pub struct Coordinator {
    compile_ready: PhaseGate,
    test_ready: PhaseGate,
    build: Arc<dyn BuildTool>,
    limits: RoundLimits,
    started: Instant,
    completed_rounds: AtomicUsize,
    builds: AtomicUsize,
}

impl Coordinator {
    pub fn new(total_kernels: usize, build: Arc<dyn BuildTool>, limits: RoundLimits) -> Self {
        Self {
            compile_ready: PhaseGate::new("compile", total_kernels),
            test_ready: PhaseGate::new("test", total_kernels),
            build,
            limits,
            started: Instant::now(),
            completed_rounds: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn total_kernels(&self) -> usize {
        self.compile_ready.total()
    }

    /// Rounds released so far, baseline included.
    pub fn completed_rounds(&self) -> usize {
        self.completed_rounds.load(Ordering::SeqCst)
    }

    /// Shared builds run so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.compile_ready.is_aborted() || self.test_ready.is_aborted()
    }

    /// Publish this worker's proposal and wait for the shared build.
    ///
    /// `write` runs under the compile gate's lock together with the arrival
    /// count. Returns once the build that includes the write has finished.
    pub fn submit_proposal<F>(&self, role: Role, write: F) -> KtResult<()>
    where
        F: FnOnce() -> KtResult<()>,
    {
        let (generation, ()) = self.compile_ready.arrive_with(write)?;
        match role {
            Role::Executor => {
                self.compile_ready.wait_for_all()?;
                let round = self.completed_rounds();
                info!(round, kernels = self.total_kernels(), "all proposals written, building");
                if let Err(e) = self.build.build() {
                    error!(round, "shared build failed: {e}");
                    self.abort(&format!("shared build failed: {e}"));
                    return Err(e.into());
                }
                self.builds.fetch_add(1, Ordering::SeqCst);
                self.compile_ready.release(RoundVerdict::Continue);
                Ok(())
            }
            Role::Participant => self.compile_ready.wait_release(generation).map(|_| ()),
        }
    }

    /// Report this worker's measurement done and learn whether another round
    /// follows.
    pub fn finish_measurement(&self, role: Role) -> KtResult<RoundVerdict> {
        let generation = self.test_ready.arrive()?;
        match role {
            Role::Executor => {
                self.test_ready.wait_for_all()?;
                let released = self.completed_rounds.fetch_add(1, Ordering::SeqCst) + 1;
                let verdict = self.verdict_after(released);
                info!(round = released - 1, ?verdict, "all measurements done");
                self.test_ready.release(verdict);
                Ok(verdict)
            }
            Role::Participant => self.test_ready.wait_release(generation),
        }
    }

    /// `released` counts the baseline round too.
    fn verdict_after(&self, released: usize) -> RoundVerdict {
        let tuning_rounds = released.saturating_sub(1);
        if tuning_rounds >= self.limits.max_rounds {
            return RoundVerdict::Stop;
        }
        match self.limits.time_budget {
            Some(budget) if self.started.elapsed() >= budget => {
                info!(elapsed = ?self.started.elapsed(), "time budget exhausted");
                RoundVerdict::Stop
            }
            _ => RoundVerdict::Continue,
        }
    }

    /// Fail both gates so nobody waits on a round that will never finish.
    pub fn abort(&self, reason: &str) {
        self.compile_ready.abort(reason);
        self.test_ready.abort(reason);
    }
}
