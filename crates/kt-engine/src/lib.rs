//! # kt-engine
//!
//! Shared-build tuning of compiler settings for a kernel library. Every
//! selected kernel gets its own worker thread and optimizer; one build per
//! round serves all of them.

pub mod autotune;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod manager;
pub mod measure;
pub mod toolchain;
pub mod worker;

pub use autotune::{plan_run, run_change_driven, ChangeDrivenRun, TuningPlan};
pub use barrier::{PhaseGate, RoundVerdict};
pub use config::TuneConfig;
pub use coordinator::{Coordinator, Role, RoundLimits};
pub use manager::{install_interrupt_restore, ManagerOptions, RunReport, SessionManager};
pub use measure::{diagnose, measure_kernel, Diagnosis, OutputMarkers};
pub use toolchain::{BuildTool, CmakeNinjaBuild, KernelRunner, RunOutput, SyntestsRunner};
pub use worker::{KernelArtifacts, TuningEvent, TuningWorker, WorkerEnv};
