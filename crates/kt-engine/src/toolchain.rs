//! External build tool and kernel test runner.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use kt_types::{BuildError, KtError, KtResult, MeasurementError};
use tracing::{debug, info};

/// The monolithic build every kernel shares.
pub trait BuildTool: Send + Sync {
    fn build(&self) -> Result<(), BuildError>;
}

/// Captured output of one kernel test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl From<Output> for RunOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs one kernel's tests against the current build.
pub trait KernelRunner: Send + Sync {
    fn run(&self, kernel: &str) -> Result<RunOutput, MeasurementError>;

    /// Kernels the runner knows about.
    fn list(&self) -> KtResult<Vec<String>>;
}

/// `cmake -G Ninja` configure, `ninja` build, optional `ninja install`.
#[derive(Debug, Clone)]
pub struct CmakeNinjaBuild {
    source_root: PathBuf,
    build_dir: PathBuf,
    install: bool,
}

impl CmakeNinjaBuild {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(source_root: P, build_dir: Q) -> Self {
        Self {
            source_root: source_root.as_ref().to_path_buf(),
            build_dir: build_dir.as_ref().to_path_buf(),
            install: false,
        }
    }

    pub fn with_install(mut self, install: bool) -> Self {
        self.install = install;
        self
    }

    fn configure_command(&self) -> Command {
        let mut cmd = Command::new("cmake");
        cmd.arg("-G")
            .arg("Ninja")
            .arg("-S")
            .arg(&self.source_root)
            .arg("-B")
            .arg(&self.build_dir);
        cmd
    }

    fn ninja_command(&self, target: Option<&str>) -> Command {
        let mut cmd = Command::new("ninja");
        cmd.arg("-C").arg(&self.build_dir);
        if let Some(target) = target {
            cmd.arg(target);
        }
        cmd
    }
}

impl BuildTool for CmakeNinjaBuild {
    fn build(&self) -> Result<(), BuildError> {
        run_step("configure", self.configure_command())?;
        run_step("build", self.ninja_command(None))?;
        if self.install {
            run_step("install", self.ninja_command(Some("install")))?;
        }
        info!(build_dir = %self.build_dir.display(), "shared build finished");
        Ok(())
    }
}

/// Run a build step to completion, failing on a non-zero exit.
pub fn run_step(step: &str, mut cmd: Command) -> Result<(), BuildError> {
    debug!(step, command = ?cmd, "running build step");
    let output = cmd.output().map_err(|e| BuildError::Spawn {
        step: step.to_string(),
        message: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }
    Err(BuildError::StepFailed {
        step: step.to_string(),
        status: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// The kernel library's `syntests` binary: `-t <kernel>` runs, `-l` lists.
#[derive(Debug, Clone)]
pub struct SyntestsRunner {
    binary: PathBuf,
}

impl SyntestsRunner {
    pub fn new<P: AsRef<Path>>(binary: P) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl KernelRunner for SyntestsRunner {
    fn run(&self, kernel: &str) -> Result<RunOutput, MeasurementError> {
        let output = Command::new(&self.binary)
            .arg("-t")
            .arg(kernel)
            .output()
            .map_err(|e| MeasurementError::Spawn {
                kernel: kernel.to_string(),
                message: e.to_string(),
            })?;
        Ok(output.into())
    }

    fn list(&self) -> KtResult<Vec<String>> {
        let output = Command::new(&self.binary).arg("-l").output()?;
        if !output.status.success() {
            return Err(KtError::Config(format!(
                "{} -l exited with status {:?}",
                self.binary.display(),
                output.status.code()
            )));
        }
        Ok(parse_kernel_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// One kernel per non-empty line.
pub fn parse_kernel_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
