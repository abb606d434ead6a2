//! Tuning run configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kt_data::{IndexOptions, SelectionPolicy};
use kt_optimizer::StrategyKind;
use kt_types::{config_error, KtResult};
use serde::{Deserialize, Serialize};

use crate::coordinator::RoundLimits;
use crate::measure::OutputMarkers;

const POLICY_RELATIVE: &str = "dlc_src/opt_flag_data/autotune_strategies.csv";
const RUNNER_RELATIVE: &str = "syntests/syntests";

/// Everything a tuning run needs to know. Paths left unset are derived from
/// the kernel library root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    pub kernel_root: PathBuf,
    pub policy_path: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub runner_path: Option<PathBuf>,
    /// Directory holding the build's `*.d` files.
    pub depfile_dir: Option<PathBuf>,
    /// Where `<kernel>.db`, `<kernel>_log.txt` and `<kernel>_best.txt` go.
    pub database_root: PathBuf,
    /// Root of the run ledger (`<log_root>/logs/<timestamp>/`).
    pub log_root: PathBuf,
    /// Run `ninja install` after every build.
    pub install: bool,
    pub max_rounds: usize,
    pub time_budget_secs: Option<u64>,
    pub strategy: StrategyKind,
    pub seed: u64,
    /// Enumerated dimension whose full coverage counts as convergence.
    pub coverage_dimension: Option<String>,
    pub markers: OutputMarkers,
    pub selection: SelectionPolicy,
    pub index: IndexOptions,
}

impl Default for TuneConfig {
    fn default() -> Self {
        let limits = RoundLimits::default();
        Self {
            kernel_root: PathBuf::from("."),
            policy_path: None,
            build_dir: None,
            runner_path: None,
            depfile_dir: None,
            database_root: PathBuf::from("tuning_db"),
            log_root: PathBuf::from("."),
            install: false,
            max_rounds: limits.max_rounds,
            time_budget_secs: limits.time_budget.map(|d| d.as_secs()),
            strategy: StrategyKind::default(),
            seed: 0,
            coverage_dimension: Some("MIScheduler".to_string()),
            markers: OutputMarkers::default(),
            selection: SelectionPolicy::default(),
            index: IndexOptions::default(),
        }
    }
}

impl TuneConfig {
    pub fn new<P: AsRef<Path>>(kernel_root: P) -> Self {
        Self {
            kernel_root: kernel_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> KtResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read config {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KtResult<()> {
        if self.selection.lookback_commits == 0 {
            return Err(config_error!("lookback_commits must be at least 1"));
        }
        if self.markers.cycle_markers.is_empty() {
            return Err(config_error!("at least one cycle marker is required"));
        }
        if self.markers.failure.is_empty() {
            return Err(config_error!("failure marker must not be empty"));
        }
        Ok(())
    }

    pub fn with_database_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.database_root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_log_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.log_root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_policy_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.policy_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget_secs = budget.map(|d| d.as_secs());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_coverage_dimension(mut self, dimension: Option<&str>) -> Self {
        self.coverage_dimension = dimension.map(str::to_string);
        self
    }

    pub fn with_install(mut self, install: bool) -> Self {
        self.install = install;
        self
    }

    pub fn policy_path(&self) -> PathBuf {
        self.policy_path
            .clone()
            .unwrap_or_else(|| self.kernel_root.join(POLICY_RELATIVE))
    }

    pub fn build_dir(&self) -> PathBuf {
        self.build_dir
            .clone()
            .unwrap_or_else(|| self.kernel_root.join("build"))
    }

    pub fn runner_path(&self) -> PathBuf {
        self.runner_path
            .clone()
            .unwrap_or_else(|| self.build_dir().join(RUNNER_RELATIVE))
    }

    pub fn depfile_dir(&self) -> PathBuf {
        self.depfile_dir
            .clone()
            .unwrap_or_else(|| self.build_dir().join("dlc_src"))
    }

    pub fn round_limits(&self) -> RoundLimits {
        RoundLimits {
            max_rounds: self.max_rounds,
            time_budget: self.time_budget_secs.map(Duration::from_secs),
        }
    }
}
