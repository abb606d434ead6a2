//! Turning test-runner output into a cost.

use kt_optimizer::Measurement;
use kt_types::MeasurementError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::toolchain::{KernelRunner, RunOutput};

/// Markers the runner prints on its diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMarkers {
    pub failure: String,
    pub cycle_markers: Vec<String>,
}

impl Default for OutputMarkers {
    fn default() -> Self {
        Self {
            failure: "fail".to_string(),
            cycle_markers: vec!["xys0".to_string(), "xys1".to_string()],
        }
    }
}

/// Result of reading one run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub measurement: Measurement,
    /// Lines that carried every cycle marker.
    pub result_lines: Vec<String>,
}

/// Value after `marker:` on `line`, e.g. `xys0: 1200`.
fn marker_value(line: &str, marker: &str) -> Option<u64> {
    let (_, rest) = line.split_once(marker)?;
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Score the runner's diagnostic output.
///
/// Any line containing the failure marker fails the run. Every line holding
/// all cycle markers adds their values to the cost. No such line means the
/// run produced nothing to score.
pub fn diagnose(
    kernel: &str,
    output: &str,
    markers: &OutputMarkers,
) -> Result<Diagnosis, MeasurementError> {
    let mut cycles = 0u64;
    let mut result_lines = Vec::new();

    for line in output.lines() {
        if line.contains(&markers.failure) {
            return Err(MeasurementError::TestFailed {
                kernel: kernel.to_string(),
            });
        }
        if markers.cycle_markers.iter().all(|m| line.contains(m.as_str())) {
            for marker in &markers.cycle_markers {
                cycles = cycles.saturating_add(marker_value(line, marker).unwrap_or(0));
            }
            result_lines.push(line.to_string());
        }
    }

    if result_lines.is_empty() {
        return Err(MeasurementError::NoCycleLines {
            kernel: kernel.to_string(),
        });
    }
    Ok(Diagnosis {
        measurement: Measurement::Cycles(cycles),
        result_lines,
    })
}

/// Run and score one kernel. Measurement errors never escape: they become a
/// failed measurement with the maximal cost.
pub fn measure_kernel(
    runner: &dyn KernelRunner,
    kernel: &str,
    markers: &OutputMarkers,
) -> Diagnosis {
    let scored = runner
        .run(kernel)
        .and_then(|output: RunOutput| {
            let diagnosis = diagnose(kernel, &output.stderr, markers)?;
            if !output.success() {
                return Err(MeasurementError::RunFailed {
                    kernel: kernel.to_string(),
                    status: output.status,
                });
            }
            Ok(diagnosis)
        });

    match scored {
        Ok(diagnosis) => {
            debug!(kernel, cost = diagnosis.measurement.cost(), "kernel measured");
            diagnosis
        }
        Err(e) => {
            warn!(kernel, "measurement failed, charging maximal cost: {e}");
            Diagnosis {
                measurement: Measurement::Failed { reason: e.to_string() },
                result_lines: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_optimizer::FAILURE_COST;
    use kt_types::KtResult;

    #[test]
    fn sums_both_markers_over_all_result_lines() {
        let output = "starting gemm\n\
                      case 0 xys0: 100 xys1: 20\n\
                      case 1 xys0: 50 xys1: 5\n\
                      done\n";
        let diagnosis = diagnose("gemm", output, &OutputMarkers::default()).unwrap();
        assert_eq!(diagnosis.measurement, Measurement::Cycles(175));
        assert_eq!(diagnosis.result_lines.len(), 2);
    }

    #[test]
    fn lines_with_one_marker_are_ignored() {
        let output = "xys0: 999\ncase xys0: 1 xys1: 2\n";
        let diagnosis = diagnose("gemm", output, &OutputMarkers::default()).unwrap();
        assert_eq!(diagnosis.measurement, Measurement::Cycles(3));
    }

    #[test]
    fn failure_marker_fails_the_run() {
        let output = "case 0 xys0: 100 xys1: 20\ncompare fail at index 3\n";
        assert!(matches!(
            diagnose("gemm", output, &OutputMarkers::default()),
            Err(MeasurementError::TestFailed { .. })
        ));
    }

    #[test]
    fn no_cycle_lines_is_an_error() {
        assert!(matches!(
            diagnose("gemm", "nothing here\n", &OutputMarkers::default()),
            Err(MeasurementError::NoCycleLines { .. })
        ));
    }

    #[test]
    fn custom_markers() {
        let markers = OutputMarkers {
            failure: "ERROR".into(),
            cycle_markers: vec!["cycles".into()],
        };
        let diagnosis = diagnose("k", "run cycles: 42\n", &markers).unwrap();
        assert_eq!(diagnosis.measurement.cost(), 42);
    }

    struct Canned(Result<RunOutput, MeasurementError>);

    impl KernelRunner for Canned {
        fn run(&self, _kernel: &str) -> Result<RunOutput, MeasurementError> {
            self.0.clone()
        }

        fn list(&self) -> KtResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn runner_errors_become_maximal_cost() {
        let runner = Canned(Err(MeasurementError::Spawn {
            kernel: "gemm".into(),
            message: "no such file".into(),
        }));
        let diagnosis = measure_kernel(&runner, "gemm", &OutputMarkers::default());
        assert_eq!(diagnosis.measurement.cost(), FAILURE_COST);
        assert!(diagnosis.result_lines.is_empty());
    }

    #[test]
    fn nonzero_exit_is_a_failure() {
        let runner = Canned(Ok(RunOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "xys0: 1 xys1: 1\n".into(),
        }));
        let diagnosis = measure_kernel(&runner, "gemm", &OutputMarkers::default());
        assert!(diagnosis.measurement.is_failure());
    }
}
