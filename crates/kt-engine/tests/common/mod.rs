//! Fake toolchain for end-to-end tuning sessions.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kt_data::PolicyStore;
use kt_engine::{
    BuildTool, KernelRunner, ManagerOptions, OutputMarkers, RoundLimits, RunOutput, SessionManager,
};
use kt_optimizer::{ParameterSpace, StrategyKind};
use kt_types::{BuildError, KtResult, MeasurementError};
use parking_lot::Mutex;

pub const BASELINE: &str = "gemm,topdown,topdown,pass,,no\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Build { policy: String },
    Measure { kernel: String, policy: String },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Records the policy table at every build; optionally fails the n-th one.
pub struct FakeBuild {
    policy: PathBuf,
    events: EventLog,
    fail_on: Option<usize>,
    count: AtomicUsize,
}

impl FakeBuild {
    pub fn new(policy: &Path, events: EventLog) -> Self {
        Self {
            policy: policy.to_path_buf(),
            events,
            fail_on: None,
            count: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, build: usize) -> Self {
        self.fail_on = Some(build);
        self
    }
}

impl BuildTool for FakeBuild {
    fn build(&self) -> Result<(), BuildError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(n) {
            return Err(BuildError::StepFailed {
                step: "build".into(),
                status: Some(1),
                stderr: format!("injected failure on build {n}"),
            });
        }
        let policy = fs::read_to_string(&self.policy).unwrap();
        self.events.lock().push(Event::Build { policy });
        Ok(())
    }
}

pub type CostFn = dyn Fn(&str, &[String]) -> Option<u64> + Send + Sync;

/// Reads the kernel's row from the policy table and prices it with `cost`.
/// `None` makes the run print a failure line.
pub struct FakeRunner {
    policy: PathBuf,
    kernels: Vec<String>,
    cost: Box<CostFn>,
    events: EventLog,
}

impl FakeRunner {
    pub fn new<F>(policy: &Path, kernels: &[&str], events: EventLog, cost: F) -> Self
    where
        F: Fn(&str, &[String]) -> Option<u64> + Send + Sync + 'static,
    {
        Self {
            policy: policy.to_path_buf(),
            kernels: kernels.iter().map(|k| k.to_string()).collect(),
            cost: Box::new(cost),
            events,
        }
    }
}

impl KernelRunner for FakeRunner {
    fn run(&self, kernel: &str) -> Result<RunOutput, MeasurementError> {
        let policy = fs::read_to_string(&self.policy).unwrap();
        let settings = policy
            .lines()
            .map(|line| line.split(',').map(str::to_string).collect::<Vec<_>>())
            .find(|tokens| tokens[0] == kernel)
            .map(|tokens| tokens[1..].to_vec())
            .unwrap_or_default();
        self.events.lock().push(Event::Measure {
            kernel: kernel.to_string(),
            policy,
        });

        let stderr = match (self.cost)(kernel, &settings) {
            Some(cycles) => format!("running {kernel}\ncase0 xys0: {cycles} xys1: 0\n"),
            None => format!("running {kernel}\nresult check fail\n"),
        };
        Ok(RunOutput {
            status: Some(0),
            stdout: String::new(),
            stderr,
        })
    }

    fn list(&self) -> KtResult<Vec<String>> {
        Ok(self.kernels.clone())
    }
}

pub fn tokens(line: &str) -> Vec<String> {
    line.trim_end().split(',').skip(1).map(str::to_string).collect()
}

pub fn options(root: &Path, max_rounds: usize) -> ManagerOptions {
    ManagerOptions {
        database_root: root.join("db"),
        limits: RoundLimits {
            max_rounds,
            time_budget: None,
        },
        strategy: StrategyKind::Random,
        seed: 7,
        coverage_dimension: None,
        markers: OutputMarkers::default(),
    }
}

pub fn manager(
    policy: &Path,
    build: FakeBuild,
    runner: FakeRunner,
    options: ManagerOptions,
) -> SessionManager {
    let space = ParameterSpace::declare();
    let store = PolicyStore::open(policy, Some(space.columns.len())).unwrap();
    SessionManager::new(Arc::new(store), space, Arc::new(build), Arc::new(runner), options)
}

pub fn kernels(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}
