use thiserror::Error;

/// Main error type for kernel-tune
#[derive(Error, Debug)]
pub enum KtError {
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("Tuning session aborted: {reason}")]
    SessionAborted { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl KtError {
    /// Whether the error must end the whole tuning session.
    ///
    /// Measurement failures are the only recoverable kind: the worker turns
    /// them into a maximal cost and keeps going.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KtError::Measurement(_))
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        KtError::SessionAborted {
            reason: reason.into(),
        }
    }
}

/// Dependency-index errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Malformed dependency line {line_no}: {line:?}")]
    MalformedLine { line_no: usize, line: String },

    #[error("Failed to read dependency data from {path}: {message}")]
    ReadFailed { path: String, message: String },
}

/// Policy-table errors.
///
/// Every variant is fatal: once a read or write of the shared table goes
/// wrong, the integrity of the other kernels' rows cannot be vouched for.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy table IO failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Kernel not found in policy table: {kernel}")]
    NotFound { kernel: String },

    #[error("Policy row {row} out of range, table has {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("Policy row {row} belongs to {found}, expected {expected}")]
    RowMismatch {
        row: usize,
        expected: String,
        found: String,
    },

    #[error("Malformed policy row {row}: {message}")]
    MalformedRow { row: usize, message: String },

    #[error("Policy table {path} is sealed, no further writes are accepted")]
    Sealed { path: String },
}

/// Shared-build errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build step '{step}' exited with status {status:?}: {stderr}")]
    StepFailed {
        step: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Failed to launch build step '{step}': {message}")]
    Spawn { step: String, message: String },
}

/// Kernel measurement errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeasurementError {
    #[error("Test runner for {kernel} exited with status {status:?}")]
    RunFailed { kernel: String, status: Option<i32> },

    #[error("Test runner reported a failure for {kernel}")]
    TestFailed { kernel: String },

    #[error("No cycle counts found in test output for {kernel}")]
    NoCycleLines { kernel: String },

    #[error("Failed to launch test runner for {kernel}: {message}")]
    Spawn { kernel: String, message: String },
}

/// Result type alias for kernel-tune operations
pub type KtResult<T> = Result<T, KtError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::KtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::KtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::KtError::Config(format!($($arg)*))
    };
}
