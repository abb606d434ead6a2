//! Change-driven tuning: pick the kernels touched since the last run, tune
//! them, and record the run in the ledger.

use std::collections::BTreeSet;

use chrono::Utc;
use kt_data::{build_index_from_dir, ChangeHistory, ChangeSelector, RunDir, RunLedger, Selection};
use kt_types::KtResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TuneConfig;
use crate::manager::{RunReport, SessionManager};
use crate::toolchain::KernelRunner;

/// Kernels chosen for one run and how they were found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningPlan {
    pub last_commit: Option<String>,
    pub selection: Selection,
    pub indexed_kernels: usize,
    pub malformed_lines: usize,
}

impl TuningPlan {
    pub fn kernels(&self) -> Vec<String> {
        self.selection.kernels.iter().cloned().collect()
    }
}

/// Work out which kernels need re-tuning.
pub fn plan_run<H: ChangeHistory>(
    config: &TuneConfig,
    history: H,
    runner: &dyn KernelRunner,
    ledger: &RunLedger,
) -> KtResult<TuningPlan> {
    let last_commit = ledger.last_tuned_commit()?;
    let report = build_index_from_dir(config.depfile_dir(), &config.index)?;
    if !report.malformed.is_empty() {
        warn!(count = report.malformed.len(), "skipped malformed dependency lines");
    }

    let available: BTreeSet<String> = runner.list()?.into_iter().collect();
    let selector = ChangeSelector::new(history, config.selection.clone());
    let selection = selector.select(last_commit.as_deref(), &report.graph, &available)?;

    Ok(TuningPlan {
        last_commit,
        indexed_kernels: report.graph.kernel_count(),
        malformed_lines: report.malformed.len(),
        selection,
    })
}

/// A finished change-driven run.
#[derive(Debug)]
pub struct ChangeDrivenRun {
    pub plan: TuningPlan,
    pub report: RunReport,
    pub run: RunDir,
}

/// Plan, open a ledger entry, tune, archive.
///
/// A failed session leaves its ledger entry without a commit, so the next
/// run still covers the changes this one did not get to.
pub fn run_change_driven<H: ChangeHistory>(
    config: &TuneConfig,
    history: H,
    manager: &SessionManager,
    ledger: &RunLedger,
) -> KtResult<ChangeDrivenRun> {
    let plan = plan_run(config, history, manager.runner().as_ref(), ledger)?;
    let run = ledger.begin_run(&plan.selection.window.to, Utc::now())?;
    run.record_changed_files(&plan.selection.window.changed_files)?;
    let depfiles = config.depfile_dir();
    if depfiles.is_dir() {
        run.archive_depfiles(&depfiles)?;
    }
    run.write_json("selection.json", &plan)?;

    let kernels = plan.kernels();
    info!(
        kernels = ?kernels,
        padded = plan.selection.padding().count(),
        "tuning selected kernels"
    );

    let report = match manager.spawn(&kernels) {
        Ok(report) => report,
        Err(e) => {
            run.mark_failed(&e.to_string())?;
            return Err(e);
        }
    };
    run.write_json("outcomes.json", &report)?;
    run.archive_policy(manager.store().path())?;

    Ok(ChangeDrivenRun { plan, report, run })
}
