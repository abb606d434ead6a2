//! Dependency index built from the build system's depfile output.
//!
//! Accepts make-style depfiles (`target: dep dep \` with backslash
//! continuations) as well as `ninja -t deps` listings (`target: #deps N, ...`
//! followed by indented dependency lines). Both maps of the graph come out of
//! a single pass and the graph is never updated incrementally.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use kt_types::{DependencyError, KtResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Knobs for turning depfile text into a kernel graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Only dependency tokens containing this marker are kept.
    pub source_marker: String,
    /// Kernel-name suffixes marking synonym or duplicate variants. Targets
    /// whose kernel name ends with one of these are left out of the graph.
    pub excluded_variants: Vec<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            source_marker: "dlc_kernels".to_string(),
            excluded_variants: Vec::new(),
        }
    }
}

impl IndexOptions {
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.source_marker = marker.into();
        self
    }

    pub fn exclude_variant(mut self, suffix: impl Into<String>) -> Self {
        self.excluded_variants.push(suffix.into());
        self
    }

    fn is_excluded(&self, kernel: &str) -> bool {
        self.excluded_variants
            .iter()
            .any(|suffix| !suffix.is_empty() && kernel.ends_with(suffix.as_str()))
    }
}

/// Bidirectional kernel/dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    kernel_deps: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_kernel(&mut self, kernel: &str) {
        self.kernel_deps.entry(kernel.to_string()).or_default();
    }

    pub fn add_edge(&mut self, kernel: &str, dependency: &str) {
        self.kernel_deps
            .entry(kernel.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(kernel.to_string());
    }

    pub fn kernels(&self) -> impl Iterator<Item = &str> {
        self.kernel_deps.keys().map(String::as_str)
    }

    /// Every dependency path known to the graph.
    pub fn dependency_paths(&self) -> impl Iterator<Item = &str> {
        self.dependents.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, kernel: &str) -> Option<&BTreeSet<String>> {
        self.kernel_deps.get(kernel)
    }

    pub fn dependents_of(&self, path: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(path)
    }

    pub fn kernel_count(&self) -> usize {
        self.kernel_deps.len()
    }

    pub fn edge_count(&self) -> usize {
        self.kernel_deps.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kernel_deps.is_empty()
    }
}

/// Outcome of one parse pass. Malformed lines were skipped, not fatal.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub graph: DependencyGraph,
    pub malformed: Vec<DependencyError>,
}

/// Kernel name of a build target: its file name up to the first `.`.
pub fn kernel_name_of(target: &str) -> &str {
    let file = target.rsplit(['/', '\\']).next().unwrap_or(target);
    file.split('.').next().unwrap_or(file)
}

/// Parse raw dependency text into a graph.
pub fn build_index(raw: &str, options: &IndexOptions) -> IndexReport {
    let mut report = IndexReport::default();
    // Kernels of the target whose dependency list is being read.
    let mut current: Option<Vec<String>> = None;
    let mut continued = false;

    for (idx, raw_line) in raw.lines().enumerate() {
        if raw_line.trim().is_empty() {
            current = None;
            continued = false;
            continue;
        }

        let indented = raw_line.starts_with(char::is_whitespace);
        let mut body = raw_line.trim();
        let continues = body.ends_with('\\');
        if continues {
            body = body.trim_end_matches('\\').trim_end();
        }

        if let (Some(kernels), true) = (current.as_ref(), continued || indented) {
            add_dependencies(&mut report.graph, kernels, body, options);
        } else if let Some((targets, deps)) = body.split_once(':') {
            let kernels: Vec<String> = targets
                .split_whitespace()
                .map(kernel_name_of)
                .filter(|kernel| !kernel.is_empty())
                .filter(|kernel| {
                    let excluded = options.is_excluded(kernel);
                    if excluded {
                        debug!(kernel, "skipping excluded kernel variant");
                    }
                    !excluded
                })
                .map(str::to_string)
                .collect();
            for kernel in &kernels {
                report.graph.add_kernel(kernel);
            }
            add_dependencies(&mut report.graph, &kernels, deps, options);
            current = Some(kernels);
        } else {
            let error = DependencyError::MalformedLine {
                line_no: idx + 1,
                line: raw_line.to_string(),
            };
            warn!("{error}; skipping");
            report.malformed.push(error);
            current = None;
        }

        continued = continues;
    }

    report
}

/// Index every `*.d` file in `dir`, in file-name order.
pub fn build_index_from_dir<P: AsRef<Path>>(
    dir: P,
    options: &IndexOptions,
) -> KtResult<IndexReport> {
    let dir = dir.as_ref();
    let read_failed = |message: String| DependencyError::ReadFailed {
        path: dir.display().to_string(),
        message,
    };

    let mut depfiles = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| read_failed(e.to_string()))? {
        let path = entry.map_err(|e| read_failed(e.to_string()))?.path();
        if path.extension().is_some_and(|ext| ext == "d") {
            depfiles.push(path);
        }
    }
    depfiles.sort();

    let mut raw = String::new();
    for path in &depfiles {
        let text = fs::read_to_string(path).map_err(|e| DependencyError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        raw.push_str(&text);
        // Blank line so one file's continuation never bleeds into the next.
        raw.push_str("\n\n");
    }

    let report = build_index(&raw, options);
    debug!(
        files = depfiles.len(),
        kernels = report.graph.kernel_count(),
        edges = report.graph.edge_count(),
        "dependency index built"
    );
    Ok(report)
}

fn add_dependencies(
    graph: &mut DependencyGraph,
    kernels: &[String],
    text: &str,
    options: &IndexOptions,
) {
    for token in text.split_whitespace() {
        if token == "\\" || !token.contains(options.source_marker.as_str()) {
            continue;
        }
        for kernel in kernels {
            graph.add_edge(kernel, token);
        }
    }
}
