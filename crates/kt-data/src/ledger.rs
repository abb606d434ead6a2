//! Per-run ledger of tuning sessions.
//!
//! Each run gets `<root>/logs/<unix timestamp>/` holding the commit it tuned,
//! the files that changed, the depfiles it indexed and a copy of the policy
//! table it produced. The newest run that did not fail supplies the commit
//! where the next run's diff window starts.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kt_types::KtResult;
use serde::Serialize;
use tracing::{debug, info, warn};

const COMMIT_FILE: &str = "commit_hash.txt";
const CHANGED_FILES: &str = "changed_files.txt";
const DEPFILE_DIR: &str = "depfiles";
const FAILURE_FILE: &str = "failure.txt";

#[derive(Debug, Clone)]
pub struct RunLedger {
    logs: PathBuf,
}

impl RunLedger {
    pub fn new<P: AsRef<Path>>(root: P) -> KtResult<Self> {
        let logs = root.as_ref().join("logs");
        fs::create_dir_all(&logs)?;
        Ok(Self { logs })
    }

    /// Run directories, newest first.
    pub fn runs(&self) -> KtResult<Vec<RunDir>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.logs)? {
            let path = entry?.path();
            let stamp = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok());
            if let (Some(stamp), true) = (stamp, path.is_dir()) {
                runs.push((stamp, path));
            }
        }
        runs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(runs.into_iter().map(|(_, path)| RunDir { path }).collect())
    }

    /// The most recent run directory, by timestamp name.
    pub fn latest_run(&self) -> KtResult<Option<RunDir>> {
        Ok(self.runs()?.into_iter().next())
    }

    /// Commit recorded by the most recent run that did not fail.
    pub fn last_tuned_commit(&self) -> KtResult<Option<String>> {
        for run in self.runs()? {
            match fs::read_to_string(run.path.join(COMMIT_FILE)) {
                Ok(commit) if !commit.trim().is_empty() => {
                    return Ok(Some(commit.trim().to_string()))
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(run = %run.path.display(), "skipping run without commit hash: {e}")
                }
            }
        }
        Ok(None)
    }

    /// Open a fresh run directory for `commit`.
    pub fn begin_run(&self, commit: &str, now: DateTime<Utc>) -> KtResult<RunDir> {
        let mut stamp = now.timestamp();
        let mut path = self.logs.join(stamp.to_string());
        while path.exists() {
            stamp += 1;
            path = self.logs.join(stamp.to_string());
        }
        fs::create_dir_all(&path)?;
        fs::write(path.join(COMMIT_FILE), commit)?;
        info!(run = %path.display(), commit, "tuning run started");
        Ok(RunDir { path })
    }
}

/// One run's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_changed_files(&self, files: &[String]) -> KtResult<()> {
        let mut text = files.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(self.path.join(CHANGED_FILES), text)?;
        Ok(())
    }

    /// Copy the build's depfiles so the selection can be audited later.
    pub fn archive_depfiles<P: AsRef<Path>>(&self, build_dep_dir: P) -> KtResult<PathBuf> {
        let target = self.path.join(DEPFILE_DIR);
        fs::create_dir_all(&target)?;
        for entry in fs::read_dir(build_dep_dir.as_ref())? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "d") {
                if let Some(name) = path.file_name() {
                    fs::copy(&path, target.join(name))?;
                }
            }
        }
        Ok(target)
    }

    /// Store any serializable summary (selection, outcomes) as pretty JSON.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> KtResult<()> {
        fs::write(self.path.join(name), serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    /// Forget this run's commit so the next run diffs from an earlier one.
    pub fn mark_failed(&self, reason: &str) -> KtResult<()> {
        let commit = self.path.join(COMMIT_FILE);
        if commit.exists() {
            fs::remove_file(&commit)?;
        }
        fs::write(self.path.join(FAILURE_FILE), format!("{reason}\n"))?;
        warn!(run = %self.path.display(), reason, "tuning run marked as failed");
        Ok(())
    }

    /// Keep a copy of the policy table the run ended with.
    pub fn archive_policy<P: AsRef<Path>>(&self, policy_path: P) -> KtResult<()> {
        let policy_path = policy_path.as_ref();
        let name = policy_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("policy.csv"));
        fs::copy(policy_path, self.path.join(name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_ledger_has_no_commit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path()).unwrap();
        assert!(ledger.latest_run().unwrap().is_none());
        assert_eq!(ledger.last_tuned_commit().unwrap(), None);
    }

    #[test]
    fn newest_run_supplies_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path()).unwrap();

        let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let second = Utc.timestamp_opt(1_700_000_500, 0).unwrap();
        ledger.begin_run("aaa111", first).unwrap();
        let run = ledger.begin_run("bbb222", second).unwrap();
        run.record_changed_files(&["dlc_kernels/gemm.cpp".to_string()]).unwrap();

        assert_eq!(ledger.latest_run().unwrap(), Some(run.clone()));
        assert_eq!(ledger.last_tuned_commit().unwrap().as_deref(), Some("bbb222"));
        assert_eq!(
            fs::read_to_string(run.path().join(CHANGED_FILES)).unwrap(),
            "dlc_kernels/gemm.cpp\n"
        );
    }

    #[test]
    fn same_second_runs_get_distinct_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path()).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let a = ledger.begin_run("a", now).unwrap();
        let b = ledger.begin_run("b", now).unwrap();
        assert_ne!(a, b);
        assert_eq!(ledger.last_tuned_commit().unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn failed_runs_do_not_supply_a_commit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path()).unwrap();

        ledger.begin_run("good", Utc.timestamp_opt(1_700_000_000, 0).unwrap()).unwrap();
        let bad = ledger.begin_run("bad", Utc.timestamp_opt(1_700_000_100, 0).unwrap()).unwrap();
        bad.mark_failed("shared build failed").unwrap();

        assert_eq!(ledger.latest_run().unwrap(), Some(bad.clone()));
        assert_eq!(ledger.last_tuned_commit().unwrap().as_deref(), Some("good"));
        assert!(bad.path().join(FAILURE_FILE).exists());
    }

    #[test]
    fn archives_depfiles_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let build = tempfile::tempdir().unwrap();
        fs::write(build.path().join("gemm.cpp.o.d"), "gemm.cpp.o: x").unwrap();
        fs::write(build.path().join("build.ninja"), "rule cc").unwrap();
        let policy = build.path().join("autotune_strategies.csv");
        fs::write(&policy, "gemm,topdown,topdown,pass,,no\n").unwrap();

        let ledger = RunLedger::new(dir.path()).unwrap();
        let run = ledger.begin_run("c", Utc::now()).unwrap();
        let archived = run.archive_depfiles(build.path()).unwrap();
        run.archive_policy(&policy).unwrap();

        assert!(archived.join("gemm.cpp.o.d").exists());
        assert!(!archived.join("build.ninja").exists());
        assert!(run.path().join("autotune_strategies.csv").exists());
    }
}
