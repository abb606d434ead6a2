//! Per-kernel tuning worker.
//!
//! A worker owns one kernel's optimizer and session. It plays a baseline
//! round with the settings already in the policy table, then one round per
//! executor verdict until told to stop. Once its optimizer has converged the
//! worker parks: it keeps re-submitting its best settings so the shared round
//! count stays the same for everybody.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use kt_data::PolicyStore;
use kt_optimizer::{
    Configuration, ParameterSpace, SearchStrategy, SessionSummary, SessionVerdict, TuningSession,
};
use kt_types::{KtError, KtResult, PolicyRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::barrier::RoundVerdict;
use crate::coordinator::{Coordinator, Role};
use crate::measure::{measure_kernel, Diagnosis, OutputMarkers};
use crate::toolchain::KernelRunner;

/// Progress reported to the session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TuningEvent {
    Started {
        kernel: String,
        row: usize,
        appended: bool,
    },
    BaselineMeasured {
        kernel: String,
        cost: u64,
    },
    TrialMeasured {
        kernel: String,
        round: usize,
        cost: u64,
        improved: bool,
        parked: bool,
    },
    Finished {
        kernel: String,
        verdict: SessionVerdict,
        best_cost: u64,
    },
}

/// Per-kernel files under the database root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArtifacts {
    pub database: PathBuf,
    pub log: PathBuf,
    pub best: PathBuf,
}

impl KernelArtifacts {
    pub fn new<P: AsRef<Path>>(root: P, kernel: &str) -> Self {
        let root = root.as_ref();
        Self {
            database: root.join(format!("{kernel}.db")),
            log: root.join(format!("{kernel}_log.txt")),
            best: root.join(format!("{kernel}_best.txt")),
        }
    }

    /// Append one measurement: the settings line with its cost, the matched
    /// result lines, and a total line.
    pub fn append_log(
        &self,
        kernel: &str,
        settings: &[String],
        diagnosis: &Diagnosis,
    ) -> KtResult<()> {
        let cost = diagnosis.measurement.cost();
        let mut entry = format!("{kernel},{},{cost}\n", settings.join(","));
        for line in &diagnosis.result_lines {
            entry.push_str(line);
            entry.push('\n');
        }
        entry.push_str(&format!("[{kernel}]Total run: {cost} cycles\n"));

        let mut file = OpenOptions::new().create(true).append(true).open(&self.log)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    pub fn write_best(&self, summary: &SessionSummary) -> KtResult<()> {
        let headline = match summary.verdict {
            SessionVerdict::BaselineKept => "Original setting is better",
            SessionVerdict::Improved => "Find a better setting",
        };
        let text = format!(
            "{headline}\nThe best setting is: {}\nThe performance is: {}\n",
            summary.final_settings.join(","),
            summary.best_cost
        );
        fs::write(&self.best, text)?;
        Ok(())
    }

    pub fn write_database(&self, summary: &SessionSummary) -> KtResult<()> {
        fs::write(&self.database, serde_json::to_vec_pretty(summary)?)?;
        Ok(())
    }
}

/// Shared collaborators every worker of one run borrows.
pub struct WorkerEnv<'a> {
    pub store: &'a PolicyStore,
    pub coordinator: &'a Coordinator,
    pub runner: &'a dyn KernelRunner,
    pub space: &'a ParameterSpace,
    pub markers: &'a OutputMarkers,
    pub events: Sender<TuningEvent>,
}

impl WorkerEnv<'_> {
    fn emit(&self, event: TuningEvent) {
        // Best effort; the manager may have stopped listening.
        let _ = self.events.send(event);
    }
}

pub struct TuningWorker {
    kernel: String,
    role: Role,
    strategy: Box<dyn SearchStrategy>,
    artifacts: KernelArtifacts,
    parked: bool,
}

impl TuningWorker {
    pub fn new(
        kernel: impl Into<String>,
        role: Role,
        strategy: Box<dyn SearchStrategy>,
        artifacts: KernelArtifacts,
    ) -> Self {
        Self {
            kernel: kernel.into(),
            role,
            strategy,
            artifacts,
            parked: false,
        }
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the whole session for this kernel.
    pub fn run(mut self, env: &WorkerEnv<'_>) -> KtResult<SessionSummary> {
        let (found, appended) = env
            .store
            .find_or_append(&self.kernel, &env.space.default_settings())?;
        let row = found.row;
        info!(
            kernel = %self.kernel,
            row,
            appended,
            role = ?self.role,
            strategy = self.strategy.name(),
            "tuning worker started"
        );
        env.emit(TuningEvent::Started {
            kernel: self.kernel.clone(),
            row,
            appended,
        });

        let mut session = TuningSession::new(&self.kernel, found.record.settings);
        match self.drive(env, row, &mut session) {
            Ok(()) => {
                session.mark_completed();
                let summary = session.summary();
                self.artifacts.write_best(&summary)?;
                self.artifacts.write_database(&summary)?;
                info!(
                    kernel = %self.kernel,
                    verdict = ?summary.verdict,
                    best_cost = summary.best_cost,
                    rounds = summary.rounds,
                    "tuning worker finished"
                );
                env.emit(TuningEvent::Finished {
                    kernel: self.kernel.clone(),
                    verdict: summary.verdict,
                    best_cost: summary.best_cost,
                });
                Ok(summary)
            }
            Err(e) => {
                session.mark_aborted();
                if let Err(write_err) = self.artifacts.write_database(&session.summary()) {
                    warn!(kernel = %self.kernel, "could not record aborted session: {write_err}");
                }
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        env: &WorkerEnv<'_>,
        row: usize,
        session: &mut TuningSession,
    ) -> KtResult<()> {
        let baseline_settings = session.baseline_settings().to_vec();
        let baseline = self.play_round(env, row, &baseline_settings)?;
        session.record_baseline(&baseline.measurement);
        env.emit(TuningEvent::BaselineMeasured {
            kernel: self.kernel.clone(),
            cost: baseline.measurement.cost(),
        });
        let mut verdict = env.coordinator.finish_measurement(self.role)?;

        while verdict == RoundVerdict::Continue {
            let (settings, configuration) = self.next_candidate(env.space, session)?;
            let diagnosis = self.play_round(env, row, &settings)?;
            let cost = diagnosis.measurement.cost();
            if let Some(config) = &configuration {
                self.strategy.report(config, cost as f64);
            }

            let improved = session.record_trial(settings, configuration, diagnosis.measurement);
            debug!(
                kernel = %self.kernel,
                round = session.round(),
                cost,
                improved,
                "trial recorded"
            );
            env.emit(TuningEvent::TrialMeasured {
                kernel: self.kernel.clone(),
                round: session.round(),
                cost,
                improved,
                parked: self.parked,
            });
            verdict = env.coordinator.finish_measurement(self.role)?;
        }

        let record = PolicyRecord::new(&self.kernel, session.final_settings().to_vec());
        env.store.rewrite(row, &record)?;
        if session.baseline_is_still_best() {
            info!(kernel = %self.kernel, "original setting is better, restored");
        }
        Ok(())
    }

    /// A fresh proposal, or the best settings so far once parked.
    fn next_candidate(
        &mut self,
        space: &ParameterSpace,
        session: &TuningSession,
    ) -> KtResult<(Vec<String>, Option<Configuration>)> {
        if !self.parked && self.strategy.is_converged() {
            info!(kernel = %self.kernel, round = session.round(), "optimizer converged, parking");
            self.parked = true;
        }
        if self.parked {
            return Ok((session.best_settings().to_vec(), None));
        }
        let config = self.strategy.propose();
        Ok((space.decode(&config)?, Some(config)))
    }

    /// Write, wait for the shared build, measure, log.
    fn play_round(
        &self,
        env: &WorkerEnv<'_>,
        row: usize,
        settings: &[String],
    ) -> KtResult<Diagnosis> {
        let record = PolicyRecord::new(&self.kernel, settings.to_vec());
        env.coordinator
            .submit_proposal(self.role, || env.store.rewrite(row, &record).map_err(KtError::from))?;

        let diagnosis = measure_kernel(env.runner, &self.kernel, env.markers);
        self.artifacts.append_log(&self.kernel, settings, &diagnosis)?;
        Ok(diagnosis)
    }
}
