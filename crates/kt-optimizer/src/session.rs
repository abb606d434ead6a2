//! Per-kernel tuning session: baseline, trials and the best result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::space::Configuration;

/// Cost charged for a candidate whose measurement failed.
pub const FAILURE_COST: u64 = 1 << 32;

/// Outcome of measuring one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurement {
    /// Summed cycle count.
    Cycles(u64),
    /// The run failed or produced no cycle counts.
    Failed { reason: String },
}

impl Measurement {
    /// Scalar cost fed to the optimizer; failures are maximal.
    pub fn cost(&self) -> u64 {
        match self {
            Self::Cycles(cycles) => *cycles,
            Self::Failed { .. } => FAILURE_COST,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Aborted,
}

/// Final decision for the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionVerdict {
    /// Nothing beat the baseline; the original settings are kept.
    BaselineKept,
    /// A measured candidate beat the baseline.
    Improved,
}

/// A single measured candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub round: usize,
    pub settings: Vec<String>,
    /// Raw optimizer proposal; `None` when a parked worker re-submitted its
    /// best settings.
    pub configuration: Option<Configuration>,
    pub measurement: Measurement,
    pub finished_at: DateTime<Utc>,
}

/// Serializable end-of-session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub kernel: String,
    pub verdict: SessionVerdict,
    pub baseline_settings: Vec<String>,
    pub baseline_cost: Option<u64>,
    pub final_settings: Vec<String>,
    pub best_cost: u64,
    pub rounds: usize,
    pub trials: Vec<Trial>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Tuning state of one kernel.
///
/// `baseline_is_still_best` starts true and drops permanently the first time
/// a candidate measures strictly cheaper than the baseline. That flag, not
/// the best-cost comparison, decides what gets persisted at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningSession {
    id: Uuid,
    kernel: String,
    state: SessionState,
    baseline_settings: Vec<String>,
    baseline_cost: Option<u64>,
    best_settings: Vec<String>,
    best_cost: u64,
    baseline_is_still_best: bool,
    round: usize,
    trials: Vec<Trial>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TuningSession {
    pub fn new(kernel: impl Into<String>, baseline_settings: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kernel: kernel.into(),
            state: SessionState::Pending,
            best_settings: baseline_settings.clone(),
            baseline_settings,
            baseline_cost: None,
            best_cost: FAILURE_COST,
            baseline_is_still_best: true,
            round: 0,
            trials: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn baseline_settings(&self) -> &[String] {
        &self.baseline_settings
    }

    pub fn baseline_cost(&self) -> Option<u64> {
        self.baseline_cost
    }

    pub fn best_settings(&self) -> &[String] {
        &self.best_settings
    }

    pub fn best_cost(&self) -> u64 {
        self.best_cost
    }

    pub fn baseline_is_still_best(&self) -> bool {
        self.baseline_is_still_best
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Record the cost of the settings found on disk at session start.
    pub fn record_baseline(&mut self, measurement: &Measurement) {
        let cost = measurement.cost();
        self.baseline_cost = Some(cost);
        self.best_cost = cost;
        self.best_settings = self.baseline_settings.clone();
        self.state = SessionState::Running;
    }

    /// Record a measured candidate. Returns true when it is the new best.
    pub fn record_trial(
        &mut self,
        settings: Vec<String>,
        configuration: Option<Configuration>,
        measurement: Measurement,
    ) -> bool {
        self.round += 1;
        let cost = measurement.cost();

        if self.baseline_is_still_best && self.baseline_cost.map_or(true, |base| cost < base) {
            self.baseline_is_still_best = false;
        }

        let improved = cost < self.best_cost;
        if improved {
            self.best_cost = cost;
            self.best_settings = settings.clone();
        }

        self.trials.push(Trial {
            number: self.trials.len(),
            round: self.round,
            settings,
            configuration,
            measurement,
            finished_at: Utc::now(),
        });
        improved
    }

    pub fn verdict(&self) -> SessionVerdict {
        if self.baseline_is_still_best {
            SessionVerdict::BaselineKept
        } else {
            SessionVerdict::Improved
        }
    }

    /// Settings to persist: the baseline unless something beat it.
    pub fn final_settings(&self) -> &[String] {
        match self.verdict() {
            SessionVerdict::BaselineKept => &self.baseline_settings,
            SessionVerdict::Improved => &self.best_settings,
        }
    }

    pub fn mark_completed(&mut self) {
        self.state = SessionState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_aborted(&mut self) {
        self.state = SessionState::Aborted;
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            kernel: self.kernel.clone(),
            verdict: self.verdict(),
            baseline_settings: self.baseline_settings.clone(),
            baseline_cost: self.baseline_cost,
            final_settings: self.final_settings().to_vec(),
            best_cost: match self.verdict() {
                SessionVerdict::BaselineKept => self.baseline_cost.unwrap_or(self.best_cost),
                SessionVerdict::Improved => self.best_cost,
            },
            rounds: self.round,
            trials: self.trials.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn session_lifecycle() {
        let mut session =
            TuningSession::new("gemm", tokens(&["topdown", "topdown", "pass", "", "no"]));
        assert_eq!(session.state(), SessionState::Pending);

        session.record_baseline(&Measurement::Cycles(1000));
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.best_cost(), 1000);

        session.mark_completed();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.summary().finished_at.is_some());
    }

    #[test]
    fn never_beating_baseline_keeps_baseline() {
        let baseline = tokens(&["topdown", "topdown", "pass", "", "no"]);
        let mut session = TuningSession::new("gemm", baseline.clone());
        session.record_baseline(&Measurement::Cycles(1000));

        let tie = tokens(&["bottomup", "topdown", "pass", "", "no"]);
        session.record_trial(tie, None, Measurement::Cycles(1000));
        let worse = tokens(&["bidirectional", "topdown", "pass", "", "no"]);
        session.record_trial(worse, None, Measurement::Cycles(1500));
        session.record_trial(
            tokens(&["bottomup", "bottomup", "disable", "0.0", "no"]),
            None,
            Measurement::Failed {
                reason: "test failed".into(),
            },
        );

        assert!(session.baseline_is_still_best());
        assert_eq!(session.verdict(), SessionVerdict::BaselineKept);
        assert_eq!(session.final_settings(), baseline.as_slice());
        assert_eq!(session.summary().best_cost, 1000);
        assert_eq!(session.round(), 3);
    }

    #[test]
    fn flag_flips_permanently_on_first_improvement() {
        let mut session = TuningSession::new("conv", tokens(&["a"]));
        session.record_baseline(&Measurement::Cycles(500));

        assert!(session.record_trial(tokens(&["b"]), None, Measurement::Cycles(400)));
        assert!(!session.baseline_is_still_best());

        // A later regression does not bring the baseline back.
        assert!(!session.record_trial(tokens(&["c"]), None, Measurement::Cycles(900)));
        assert!(!session.baseline_is_still_best());
        assert_eq!(session.final_settings(), tokens(&["b"]).as_slice());
        assert_eq!(session.best_cost(), 400);
    }

    #[test]
    fn failed_measurement_costs_the_maximum() {
        let failed = Measurement::Failed {
            reason: "no cycle lines".into(),
        };
        assert_eq!(failed.cost(), FAILURE_COST);
        assert!(failed.is_failure());
        assert_eq!(Measurement::Cycles(7).cost(), 7);
    }

    #[test]
    fn summary_serializes() {
        let mut session = TuningSession::new("softmax", tokens(&["x"]));
        session.record_baseline(&Measurement::Cycles(10));
        session.record_trial(tokens(&["y"]), Some(Configuration::new()), Measurement::Cycles(8));
        let json = serde_json::to_string(&session.summary()).unwrap();
        let back: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verdict, SessionVerdict::Improved);
        assert_eq!(back.trials.len(), 1);
    }
}
