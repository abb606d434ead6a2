//! # kt-optimizer
//!
//! The tunable compiler-flag space and the optimizer side of a tuning run.
//!
//! Provides the parameter space descriptor with its decode rules into policy
//! tokens, propose/report search strategies (random, guided, coverage-capped),
//! and the per-kernel tuning session that tracks baseline and best results.

mod search;
mod session;
mod space;

pub use search::{CoverageStop, GuidedSearch, RandomSearch, SearchStrategy, StrategyKind};
pub use session::{
    Measurement, SessionState, SessionSummary, SessionVerdict, Trial, TuningSession, FAILURE_COST,
};
pub use space::{
    Column, Configuration, DecodeRule, Dimension, DimensionKind, ParameterSpace, ParameterValue,
};
