//! Change-driven kernel selection.
//!
//! Diff the source history since the last tuning run, map the changed files
//! through the dependency graph to the kernels built from them, and pad a
//! too-small batch with randomly sampled kernels.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

use kt_types::{internal_error, KtResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::deps::DependencyGraph;

/// How a changed path is compared with a dependency path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMatch {
    /// The dependency path ends with the changed path at a `/` boundary.
    Suffix,
    /// Only the file names are compared.
    FileName,
}

impl Default for PathMatch {
    fn default() -> Self {
        Self::Suffix
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn path_matches(dependency: &str, changed: &str, mode: PathMatch) -> bool {
    let dependency = dependency.trim_start_matches("./");
    let changed = changed.trim_start_matches("./");
    if changed.is_empty() {
        return false;
    }
    match mode {
        PathMatch::Suffix => {
            dependency == changed
                || (dependency.ends_with(changed)
                    && dependency[..dependency.len() - changed.len()].ends_with('/'))
        }
        PathMatch::FileName => file_name(dependency) == file_name(changed),
    }
}

/// Kernels built from at least one changed path, restricted to the kernels
/// the test harness can run.
pub fn select_kernels(
    changed_paths: &[String],
    graph: &DependencyGraph,
    available: &BTreeSet<String>,
    mode: PathMatch,
) -> BTreeSet<String> {
    let mut selected = BTreeSet::new();
    for dependency in graph.dependency_paths() {
        if !changed_paths.iter().any(|changed| path_matches(dependency, changed, mode)) {
            continue;
        }
        if let Some(kernels) = graph.dependents_of(dependency) {
            selected.extend(kernels.iter().filter(|k| available.contains(*k)).cloned());
        }
    }
    selected
}

/// Grow `selected` to `min_batch` kernels by sampling without replacement
/// from the available kernels not selected yet. Deterministic for a seed.
pub fn pad_selection(
    selected: &BTreeSet<String>,
    available: &BTreeSet<String>,
    min_batch: usize,
    seed: u64,
) -> BTreeSet<String> {
    let mut padded = selected.clone();
    let needed = min_batch.saturating_sub(selected.len());
    if needed == 0 {
        return padded;
    }

    let candidates: Vec<&String> = available.iter().filter(|k| !selected.contains(*k)).collect();
    if candidates.len() < needed {
        warn!(
            needed,
            candidates = candidates.len(),
            "not enough available kernels to reach the minimum batch size"
        );
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    padded.extend(candidates.choose_multiple(&mut rng, needed).map(|k| (*k).clone()));
    padded
}

// ---------------------------------------------------------------------------
// Source history
// ---------------------------------------------------------------------------

/// Read access to the version history of the kernel sources.
pub trait ChangeHistory {
    /// Commit id of the working tree head.
    fn head(&self) -> KtResult<String>;

    /// Commit id `generations` first-parent steps before `commit`, or the
    /// oldest reachable commit when the history is shorter than that.
    fn ancestor_of(&self, commit: &str, generations: usize) -> KtResult<String>;

    /// Paths changed between two commits.
    fn changed_files(&self, from: &str, to: &str) -> KtResult<Vec<String>>;
}

/// [`ChangeHistory`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitHistory {
    repo: PathBuf,
}

impl GitHistory {
    pub fn new<P: AsRef<Path>>(repo: P) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
        }
    }

    fn git(&self, args: &[&str]) -> KtResult<String> {
        let output = Command::new("git").arg("-C").arg(&self.repo).args(args).output()?;
        if !output.status.success() {
            return Err(internal_error!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ChangeHistory for GitHistory {
    fn head(&self) -> KtResult<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn ancestor_of(&self, commit: &str, generations: usize) -> KtResult<String> {
        let skip = format!("--skip={generations}");
        let found = self.git(&["rev-list", "--first-parent", "--max-count=1", &skip, commit])?;
        let found = found.trim();
        if !found.is_empty() {
            return Ok(found.to_string());
        }
        let roots = self.git(&["rev-list", "--first-parent", "--max-parents=0", commit])?;
        roots
            .lines()
            .next()
            .map(|root| root.trim().to_string())
            .ok_or_else(|| internal_error!("no root commit reachable from {commit}"))
    }

    fn changed_files(&self, from: &str, to: &str) -> KtResult<Vec<String>> {
        let range = format!("{from}..{to}");
        Ok(self
            .git(&["diff", "--name-only", &range])?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Tunable constants of the selection heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Commits to look back when there is no previous run, and the step by
    /// which the diff window widens after an empty diff.
    pub lookback_commits: usize,
    /// How many times an empty window may be widened.
    pub max_widen_steps: usize,
    /// Changed paths outside this prefix never trigger re-tuning.
    pub kernel_path_prefix: String,
    pub min_batch_size: usize,
    pub seed: u64,
    pub match_mode: PathMatch,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            lookback_commits: 5,
            max_widen_steps: 1,
            kernel_path_prefix: "dlc_kernels/".to_string(),
            min_batch_size: 1,
            seed: 0,
            match_mode: PathMatch::Suffix,
        }
    }
}

impl SelectionPolicy {
    pub fn with_min_batch(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_lookback(mut self, commits: usize, widen_steps: usize) -> Self {
        self.lookback_commits = commits.max(1);
        self.max_widen_steps = widen_steps;
        self
    }
}

/// The commit range a selection was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeWindow {
    pub from: String,
    pub to: String,
    pub changed_files: Vec<String>,
    pub kernel_files: Vec<String>,
    /// Number of times the window had to be widened.
    pub widened: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub window: ChangeWindow,
    /// Kernels reached from changed files.
    pub changed_kernels: BTreeSet<String>,
    /// Final batch, including padding.
    pub kernels: BTreeSet<String>,
}

impl Selection {
    pub fn padding(&self) -> impl Iterator<Item = &String> {
        self.kernels.difference(&self.changed_kernels)
    }
}

pub struct ChangeSelector<H: ChangeHistory> {
    history: H,
    policy: SelectionPolicy,
}

impl<H: ChangeHistory> ChangeSelector<H> {
    pub fn new(history: H, policy: SelectionPolicy) -> Self {
        Self { history, policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    fn kernel_files(&self, changed: &[String]) -> Vec<String> {
        changed
            .iter()
            .filter(|path| path.starts_with(&self.policy.kernel_path_prefix))
            .cloned()
            .collect()
    }

    /// Work out the diff window, widening it while it holds no kernel file.
    /// Each widening step moves the lower bound `lookback_commits` further
    /// back from the current one.
    pub fn resolve_window(&self, last_commit: Option<&str>) -> KtResult<ChangeWindow> {
        let head = self.history.head()?;
        let lookback = self.policy.lookback_commits.max(1);
        let from = match last_commit {
            Some(commit) => commit.to_string(),
            None => self.history.ancestor_of(&head, lookback)?,
        };

        let changed_files = self.history.changed_files(&from, &head)?;
        let mut window = ChangeWindow {
            kernel_files: self.kernel_files(&changed_files),
            from,
            to: head,
            changed_files,
            widened: 0,
        };

        while window.kernel_files.is_empty() && window.widened < self.policy.max_widen_steps {
            info!(from = %window.from, "no kernel files changed in window, looking further back");
            let candidate = match self.history.ancestor_of(&window.from, lookback) {
                Ok(commit) => commit,
                Err(e) => {
                    warn!("cannot widen change window: {e}");
                    break;
                }
            };
            if candidate == window.from {
                info!(from = %window.from, "change window already reaches the oldest commit");
                break;
            }

            window.changed_files = self.history.changed_files(&candidate, &window.to)?;
            window.kernel_files = self.kernel_files(&window.changed_files);
            window.from = candidate;
            window.widened += 1;
        }

        Ok(window)
    }

    /// Full selection: window, graph lookup, padding.
    pub fn select(
        &self,
        last_commit: Option<&str>,
        graph: &DependencyGraph,
        available: &BTreeSet<String>,
    ) -> KtResult<Selection> {
        let window = self.resolve_window(last_commit)?;
        let policy = &self.policy;
        let changed_kernels =
            select_kernels(&window.kernel_files, graph, available, policy.match_mode);
        let kernels =
            pad_selection(&changed_kernels, available, policy.min_batch_size, policy.seed);

        info!(
            from = %window.from,
            to = %window.to,
            kernel_files = window.kernel_files.len(),
            changed = changed_kernels.len(),
            selected = kernels.len(),
            "kernel selection complete"
        );
        Ok(Selection {
            window,
            changed_kernels,
            kernels,
        })
    }
}

/// In-memory history, handy for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHistory {
    /// Commit ids, oldest first; the last one is head.
    pub commits: Vec<String>,
    /// Files changed by each commit, keyed by commit id.
    pub changes: HashMap<String, Vec<String>>,
}

impl StaticHistory {
    pub fn push_commit(mut self, id: &str, files: &[&str]) -> Self {
        self.commits.push(id.to_string());
        self.changes
            .insert(id.to_string(), files.iter().map(|f| f.to_string()).collect());
        self
    }

    fn position(&self, commit: &str) -> KtResult<usize> {
        self.commits
            .iter()
            .position(|c| c == commit)
            .ok_or_else(|| internal_error!("unknown commit {commit}"))
    }
}

impl ChangeHistory for StaticHistory {
    fn head(&self) -> KtResult<String> {
        self.commits
            .last()
            .cloned()
            .ok_or_else(|| internal_error!("empty history"))
    }

    fn ancestor_of(&self, commit: &str, generations: usize) -> KtResult<String> {
        let position = self.position(commit)?;
        Ok(self.commits[position.saturating_sub(generations)].clone())
    }

    fn changed_files(&self, from: &str, to: &str) -> KtResult<Vec<String>> {
        let (from, to) = (self.position(from)?, self.position(to)?);
        let mut files = BTreeSet::new();
        for commit in self.commits.iter().take(to + 1).skip(from + 1) {
            if let Some(changed) = self.changes.get(commit) {
                files.extend(changed.iter().cloned());
            }
        }
        Ok(files.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{build_index, IndexOptions};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn two_kernel_graph() -> DependencyGraph {
        build_index(
            concat!(
                "A.cpp.o: /repo/dlc_kernels/f.src /repo/dlc_kernels/a.cpp\n",
                "B.cpp.o: /repo/dlc_kernels/b.cpp\n",
            ),
            &IndexOptions::default(),
        )
        .graph
    }

    #[test]
    fn suffix_match_respects_component_boundary() {
        assert!(path_matches("/repo/dlc_kernels/f.src", "dlc_kernels/f.src", PathMatch::Suffix));
        assert!(!path_matches("/repo/dlc_kernels/xf.src", "f.src", PathMatch::Suffix));
        assert!(path_matches("/repo/dlc_kernels/xf.src", "xf.src", PathMatch::FileName));
        assert!(!path_matches("/repo/a.h", "", PathMatch::FileName));
    }

    #[test]
    fn selects_only_available_kernels_with_changed_edges() {
        let graph = two_kernel_graph();
        let changed = vec!["dlc_kernels/f.src".to_string()];

        assert_eq!(
            select_kernels(&changed, &graph, &set(&["A", "B"]), PathMatch::Suffix),
            set(&["A"])
        );
        assert!(select_kernels(&changed, &graph, &set(&["B"]), PathMatch::Suffix).is_empty());
    }

    #[test]
    fn padding_reaches_min_batch_without_duplicates() {
        let available = set(&["a", "b", "c", "d", "e", "f"]);
        let padded = pad_selection(&set(&["c"]), &available, 4, 7);
        assert_eq!(padded.len(), 4);
        assert!(padded.contains("c"));
        assert!(padded.is_subset(&available));

        // Same seed, same batch.
        assert_eq!(pad_selection(&set(&["c"]), &available, 4, 7), padded);
        // Not enough candidates: take them all.
        assert_eq!(pad_selection(&set(&["c"]), &available, 10, 7), available);
        // Already large enough: unchanged.
        assert_eq!(pad_selection(&set(&["a", "b"]), &available, 1, 7), set(&["a", "b"]));
    }

    #[test]
    fn pads_single_changed_kernel_to_batch_of_two() {
        let history = StaticHistory::default()
            .push_commit("c0", &[])
            .push_commit("c1", &["dlc_kernels/f.src", "docs/readme.md"]);
        let policy = SelectionPolicy::default().with_min_batch(2).with_seed(3);
        let selector = ChangeSelector::new(history, policy);

        let selection = selector
            .select(Some("c0"), &two_kernel_graph(), &set(&["A", "B"]))
            .unwrap();
        assert_eq!(selection.changed_kernels, set(&["A"]));
        assert_eq!(selection.kernels, set(&["A", "B"]));
        assert_eq!(selection.padding().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(selection.window.kernel_files, vec!["dlc_kernels/f.src".to_string()]);
    }

    #[test]
    fn empty_window_widens_further_back() {
        let mut history = StaticHistory::default().push_commit("c0", &[]);
        history = history.push_commit("c1", &["dlc_kernels/f.src"]);
        for i in 2..=7 {
            history = history.push_commit(&format!("c{i}"), &["docs/notes.md"]);
        }
        let selector = ChangeSelector::new(history, SelectionPolicy::default());

        // Last run tuned c6; only docs changed since.
        let window = selector.resolve_window(Some("c6")).unwrap();
        assert_eq!(window.widened, 1);
        assert_eq!(window.from, "c1");
        assert!(window.kernel_files.is_empty());

        let policy = SelectionPolicy::default().with_lookback(3, 2);
        let selector = ChangeSelector::new(selector.history, policy);
        let window = selector.resolve_window(Some("c6")).unwrap();
        assert_eq!(window.from, "c0");
        assert_eq!(window.widened, 2);
        assert_eq!(window.kernel_files, vec!["dlc_kernels/f.src".to_string()]);

        let policy = SelectionPolicy::default().with_lookback(7, 1);
        let selector = ChangeSelector::new(selector.history, policy);
        let window = selector.resolve_window(Some("c6")).unwrap();
        assert_eq!(window.from, "c0");
        assert_eq!(window.widened, 1);
        assert_eq!(window.kernel_files, vec!["dlc_kernels/f.src".to_string()]);
    }

    #[test]
    fn widening_moves_back_from_an_old_last_commit() {
        let mut history = StaticHistory::default()
            .push_commit("c0", &[])
            .push_commit("c1", &["dlc_kernels/f.src"]);
        for i in 2..=20 {
            history = history.push_commit(&format!("c{i}"), &["docs/notes.md"]);
        }
        let selector = ChangeSelector::new(history, SelectionPolicy::default());

        // The last run is far older than head~5; widening must still go
        // further back from c2, never forward.
        let window = selector.resolve_window(Some("c2")).unwrap();
        assert_eq!(window.from, "c0");
        assert_eq!(window.to, "c20");
        assert_eq!(window.widened, 1);
        assert_eq!(window.kernel_files, vec!["dlc_kernels/f.src".to_string()]);
    }

    #[test]
    fn widening_stops_at_the_oldest_commit() {
        let history = StaticHistory::default()
            .push_commit("c0", &[])
            .push_commit("c1", &["docs/notes.md"]);
        let selector = ChangeSelector::new(history, SelectionPolicy::default().with_lookback(5, 3));

        let window = selector.resolve_window(Some("c1")).unwrap();
        assert_eq!(window.from, "c0");
        assert_eq!(window.widened, 1);
        assert!(window.kernel_files.is_empty());
    }

    #[test]
    fn no_previous_run_starts_from_lookback() {
        let mut history = StaticHistory::default();
        for i in 0..=6 {
            history = history.push_commit(&format!("c{i}"), &["dlc_kernels/k.cpp"]);
        }
        let selector = ChangeSelector::new(history, SelectionPolicy::default());
        let window = selector.resolve_window(None).unwrap();
        assert_eq!(window.from, "c1");
        assert_eq!(window.widened, 0);
    }
}
