//! Multi-kernel session manager.
//!
//! Spawns one worker thread per kernel around a single coordinator, keeps a
//! byte snapshot of the policy table, and puts it back whenever the session
//! fails.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use kt_data::{PolicySnapshot, PolicyStore};
use kt_optimizer::{ParameterSpace, SessionSummary, SessionVerdict, StrategyKind};
use kt_types::{internal_error, KtError, KtResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::TuneConfig;
use crate::coordinator::{Coordinator, Role, RoundLimits};
use crate::measure::OutputMarkers;
use crate::toolchain::{BuildTool, CmakeNinjaBuild, KernelRunner, SyntestsRunner};
use crate::worker::{KernelArtifacts, TuningEvent, TuningWorker, WorkerEnv};

/// Knobs the manager hands to every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub database_root: PathBuf,
    pub limits: RoundLimits,
    pub strategy: StrategyKind,
    pub seed: u64,
    pub coverage_dimension: Option<String>,
    pub markers: OutputMarkers,
}

impl ManagerOptions {
    pub fn from_config(config: &TuneConfig) -> Self {
        Self {
            database_root: config.database_root.clone(),
            limits: config.round_limits(),
            strategy: config.strategy.clone(),
            seed: config.seed,
            coverage_dimension: config.coverage_dimension.clone(),
            markers: config.markers.clone(),
        }
    }
}

/// What one tuning session produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: BTreeMap<String, SessionSummary>,
    /// Rounds released, baseline included.
    pub rounds: usize,
    pub builds: usize,
}

impl RunReport {
    pub fn improved(&self) -> impl Iterator<Item = &SessionSummary> {
        self.outcomes
            .values()
            .filter(|s| s.verdict == SessionVerdict::Improved)
    }
}

pub struct SessionManager {
    store: Arc<PolicyStore>,
    space: ParameterSpace,
    build: Arc<dyn BuildTool>,
    runner: Arc<dyn KernelRunner>,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(
        store: Arc<PolicyStore>,
        space: ParameterSpace,
        build: Arc<dyn BuildTool>,
        runner: Arc<dyn KernelRunner>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            store,
            space,
            build,
            runner,
            options,
        }
    }

    /// Manager over the real cmake/ninja build and `syntests` runner.
    pub fn from_config(config: &TuneConfig) -> KtResult<Self> {
        let space = ParameterSpace::declare();
        let store = PolicyStore::open(config.policy_path(), Some(space.columns.len()))?;
        let build = CmakeNinjaBuild::new(&config.kernel_root, config.build_dir())
            .with_install(config.install);
        let runner = SyntestsRunner::new(config.runner_path());
        Ok(Self::new(
            Arc::new(store),
            space,
            Arc::new(build),
            Arc::new(runner),
            ManagerOptions::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<dyn KernelRunner> {
        &self.runner
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Tune `kernels` together. The first kernel's worker is the executor.
    ///
    /// On any fatal error the policy table is restored to its state before
    /// the call and the root cause is returned.
    pub fn spawn(&self, kernels: &[String]) -> KtResult<RunReport> {
        let kernels = dedup(kernels);
        if kernels.is_empty() {
            info!("no kernels to tune");
            return Ok(RunReport::default());
        }

        fs::create_dir_all(&self.options.database_root)?;
        let snapshot = self.store.snapshot()?;
        info!(kernels = kernels.len(), executor = %kernels[0], "starting tuning session");

        let workers = kernels
            .iter()
            .enumerate()
            .map(|(index, kernel)| {
                let strategy = self.options.strategy.build(
                    &self.space,
                    self.options.seed.wrapping_add(index as u64),
                    self.options.coverage_dimension.as_deref(),
                )?;
                let artifacts = KernelArtifacts::new(&self.options.database_root, kernel);
                Ok(TuningWorker::new(kernel.clone(), Role::for_index(index), strategy, artifacts))
            })
            .collect::<KtResult<Vec<_>>>()?;

        let coordinator = Coordinator::new(kernels.len(), self.build.clone(), self.options.limits);
        let results = self.run_workers(&coordinator, workers);

        let mut outcomes = BTreeMap::new();
        let mut failures = Vec::new();
        for (kernel, result) in results {
            match result {
                Ok(summary) => {
                    outcomes.insert(kernel, summary);
                }
                Err(e) => failures.push((kernel, e)),
            }
        }

        if let Some(root_cause) = root_cause(failures) {
            error!("tuning session failed: {root_cause}");
            self.restore(&snapshot)?;
            return Err(root_cause);
        }

        let report = RunReport {
            outcomes,
            rounds: coordinator.completed_rounds(),
            builds: coordinator.builds(),
        };
        log_summary(&report);
        Ok(report)
    }

    fn run_workers(
        &self,
        coordinator: &Coordinator,
        workers: Vec<TuningWorker>,
    ) -> Vec<(String, KtResult<SessionSummary>)> {
        let (events_tx, events_rx) = unbounded();

        thread::scope(|s| {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|worker| {
                    let env = WorkerEnv {
                        store: &self.store,
                        coordinator,
                        runner: self.runner.as_ref(),
                        space: &self.space,
                        markers: &self.options.markers,
                        events: events_tx.clone(),
                    };
                    let kernel = worker.kernel().to_string();
                    let name = kernel.clone();
                    let handle = s.spawn(move || {
                        let _guard = AbortOnPanic(coordinator);
                        let result = worker.run(&env);
                        if let Err(e) = &result {
                            coordinator.abort(&format!("{name}: {e}"));
                        }
                        result
                    });
                    (kernel, handle)
                })
                .collect();
            drop(events_tx);

            for event in events_rx.iter() {
                log_event(&event);
            }

            handles
                .into_iter()
                .map(|(kernel, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(internal_error!("tuning worker for {kernel} panicked"))
                    });
                    (kernel, result)
                })
                .collect()
        })
    }

    fn restore(&self, snapshot: &PolicySnapshot) -> KtResult<()> {
        if self.store.is_sealed() {
            warn!("policy table already restored by the interrupt handler");
            return Ok(());
        }
        self.store.restore(snapshot)?;
        warn!(
            path = %self.store.path().display(),
            "policy table restored to its pre-session state"
        );
        Ok(())
    }
}

/// Aborts the coordinator if a worker thread unwinds, so the others do not
/// wait for it forever.
struct AbortOnPanic<'a>(&'a Coordinator);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort("a tuning worker panicked");
        }
    }
}

fn dedup(kernels: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    kernels
        .iter()
        .filter(|kernel| {
            let fresh = seen.insert(kernel.as_str());
            if !fresh {
                warn!(kernel = %kernel, "kernel listed twice, tuning it once");
            }
            fresh
        })
        .cloned()
        .collect()
}

/// The error that started the failure. Waiters woken by the abort only
/// report `SessionAborted`, so a fatal error wins over them, and they win
/// over a recoverable one.
fn root_cause(failures: Vec<(String, KtError)>) -> Option<KtError> {
    let mut aborted = None;
    let mut recoverable = None;
    for (kernel, e) in failures {
        match e {
            KtError::SessionAborted { .. } => {
                if aborted.is_none() {
                    aborted = Some(e);
                }
            }
            other if other.is_fatal() => {
                error!(kernel = %kernel, "worker failed: {other}");
                return Some(other);
            }
            other => {
                warn!(kernel = %kernel, "worker stopped on a recoverable error: {other}");
                if recoverable.is_none() {
                    recoverable = Some(other);
                }
            }
        }
    }
    aborted.or(recoverable)
}

fn log_event(event: &TuningEvent) {
    match event {
        TuningEvent::Started { kernel, row, appended } => {
            info!(kernel = %kernel, row, appended, "worker ready")
        }
        TuningEvent::BaselineMeasured { kernel, cost } => {
            info!(kernel = %kernel, cost, "baseline measured")
        }
        TuningEvent::TrialMeasured {
            kernel,
            round,
            cost,
            improved,
            parked,
        } => info!(kernel = %kernel, round, cost, improved, parked, "trial measured"),
        TuningEvent::Finished {
            kernel,
            verdict,
            best_cost,
        } => info!(kernel = %kernel, ?verdict, best_cost, "worker finished"),
    }
}

fn log_summary(report: &RunReport) {
    info!(
        kernels = report.outcomes.len(),
        improved = report.improved().count(),
        rounds = report.rounds,
        builds = report.builds,
        "tuning session complete"
    );
    for (kernel, summary) in &report.outcomes {
        info!(
            kernel = %kernel,
            verdict = ?summary.verdict,
            baseline_cost = ?summary.baseline_cost,
            best_cost = summary.best_cost,
            settings = %summary.final_settings.join(","),
            "kernel result"
        );
    }
}

/// Put the policy table back and exit with 130 when the process is
/// interrupted. The table stays sealed until exit, so a worker finishing a
/// measurement in the meantime cannot write its next proposal.
pub fn install_interrupt_restore(store: Arc<PolicyStore>) -> KtResult<()> {
    let snapshot = store.snapshot()?;
    ctrlc::set_handler(move || {
        warn!("interrupted, restoring policy table");
        if let Err(e) = store.restore_and_seal(&snapshot) {
            error!("failed to restore policy table: {e}");
        }
        std::process::exit(130);
    })
    .map_err(|e| internal_error!("failed to set Ctrl+C handler: {e}"))
}
