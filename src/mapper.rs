//! Lookups across a whole project reference graph.
//!
//! [`ProjectReferenceMap`] loads every configuration reachable from a root
//! configuration and folds their local source/output tables into global maps.
//! A compile session consults these maps to swap a referenced project's
//! declaration output for its original source, or the other way around.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::DiGraph;
use serde::Deserialize;

use crate::config::{ConfigHost, OutputDescriptor, ResolvedConfig, SourceDescriptor};
use crate::engine::{Scheduler, Unit};
use crate::error::ConfigError;
use crate::paths;
use crate::reference::ReferenceUnit;

/// Knobs of a single load.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderOptions {
    /// How many reference hops are followed from the root.
    pub max_depth: usize,
    /// When set, paths below `node_modules` are not followed to their
    /// symlink targets.
    pub preserve_symlinks: bool,
    /// Record the declaration output directories of referenced projects, the
    /// session prefers their sources over the built declarations.
    pub use_source_of_project_reference_redirect: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_depth: usize::MAX,
            preserve_symlinks: false,
            use_source_of_project_reference_redirect: false,
        }
    }
}

/// Maps built from a fully loaded project reference graph.
pub struct ProjectReferenceMap {
    root: Arc<ResolvedConfig>,
    host: Arc<dyn ConfigHost>,
    options: LoaderOptions,
    scheduler: Scheduler<ReferenceUnit>,
    /// References of the root, in declaration order.
    root_references: Vec<Utf8PathBuf>,
    config_to_resolved: HashMap<Utf8PathBuf, Option<Arc<ResolvedConfig>>>,
    references_of: HashMap<Utf8PathBuf, Vec<Utf8PathBuf>>,
    source_to_output: HashMap<Utf8PathBuf, OutputDescriptor>,
    output_to_source: HashMap<Utf8PathBuf, SourceDescriptor>,
    output_dirs: HashSet<Utf8PathBuf>,
    /// Symlinked lookups resolved so far, keyed by the real path.
    realpath_to_source: Mutex<HashMap<Utf8PathBuf, Option<SourceDescriptor>>>,
}

impl ProjectReferenceMap {
    /// Resolves the root configuration through `host` and loads its graph.
    pub fn load(
        root: impl AsRef<Utf8Path>,
        host: Arc<dyn ConfigHost>,
        options: LoaderOptions,
    ) -> Result<Self, ConfigError> {
        let path = paths::normalize(root.as_ref());
        let root = host
            .resolve(&path)
            .ok_or_else(|| ConfigError::NotFound(path.clone()))?;

        Ok(Self::new(root, host, options))
    }

    /// Loads the graph below an already resolved root configuration.
    pub fn new(root: Arc<ResolvedConfig>, host: Arc<dyn ConfigHost>, options: LoaderOptions) -> Self {
        let span = tracing::info_span!("project_references", root = %root.config_path());
        let _enter = span.enter();

        let scheduler = Scheduler::new(options.max_depth);
        let mut units: Vec<_> = root
            .reference_paths()
            .map(|path| ReferenceUnit::new(path, Arc::clone(&host)))
            .collect();

        scheduler.run_and_wait(&mut units);

        let mut config_to_resolved = HashMap::new();
        let mut references_of = HashMap::new();
        let mut source_to_output = HashMap::new();
        let mut output_to_source = HashMap::new();
        let mut output_dirs = HashSet::new();

        let root_references = scheduler.visit(&units, |unit, children| {
            let path = unit.key();
            let resolved = unit.resolved().cloned();
            config_to_resolved.insert(path.clone(), resolved.clone());

            let Some(config) = resolved else {
                return;
            };

            // The root is never treated as a dependency of itself.
            if config.config_path() == root.config_path() {
                return;
            }

            references_of.insert(path, children);
            for (source, output) in config.source_to_output() {
                source_to_output.insert(source.clone(), output.clone());
            }
            for (output, source) in config.output_to_source() {
                output_to_source.insert(output.clone(), source.clone());
            }

            if options.use_source_of_project_reference_redirect
                && let Some(dir) = config.declaration_dir()
            {
                output_dirs.insert(dir.to_owned());
            }
        });

        tracing::info!(
            configs = config_to_resolved.len(),
            outputs = output_to_source.len(),
            "project references loaded"
        );

        Self {
            root,
            host,
            options,
            scheduler,
            root_references,
            config_to_resolved,
            references_of,
            source_to_output,
            output_to_source,
            output_dirs,
            realpath_to_source: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Arc<ResolvedConfig> {
        &self.root
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// The scheduler that loaded the graph, with its per-configuration records.
    pub fn scheduler(&self) -> &Scheduler<ReferenceUnit> {
        &self.scheduler
    }

    /// Configurations directly referenced by `config`, as reported by the
    /// ordered walk over the graph.
    pub fn direct_references(&self, config: &Utf8Path) -> Option<&[Utf8PathBuf]> {
        if config == self.root.config_path() {
            return Some(&self.root_references);
        }

        self.references_of.get(config).map(Vec::as_slice)
    }

    pub fn resolved_config(&self, config: &Utf8Path) -> Option<&Arc<ResolvedConfig>> {
        match self.config_to_resolved.get(config) {
            Some(resolved) => resolved.as_ref(),
            None if config == self.root.config_path() => Some(&self.root),
            None => None,
        }
    }

    /// Every configuration that resolved, sorted by path.
    pub fn resolved_configs(&self) -> Vec<(&Utf8Path, &Arc<ResolvedConfig>)> {
        let mut configs: Vec<_> = self
            .config_to_resolved
            .iter()
            .filter_map(|(path, resolved)| Some((path.as_path(), resolved.as_ref()?)))
            .collect();

        configs.sort_by_key(|(path, _)| *path);
        configs
    }

    /// Configurations that were loaded but could not be resolved, sorted.
    /// References cut off by the depth budget are not included.
    pub fn unresolved(&self) -> Vec<&Utf8Path> {
        let mut missing: Vec<_> = self
            .config_to_resolved
            .iter()
            .filter(|(path, resolved)| resolved.is_none() && self.scheduler.has_run(path))
            .map(|(path, _)| path.as_path())
            .collect();

        missing.sort();
        missing
    }

    pub fn output_for(&self, source: &Utf8Path) -> Option<&OutputDescriptor> {
        self.source_to_output.get(source)
    }

    /// Source that produced the declaration file at `output`.
    ///
    /// Paths under `node_modules` that miss the direct lookup are retried with
    /// their symlinks followed, unless symlinks are preserved.
    pub fn source_for(&self, output: &Utf8Path) -> Option<SourceDescriptor> {
        if let Some(source) = self.output_to_source.get(output) {
            return Some(source.clone());
        }

        if self.options.preserve_symlinks || !paths::has_node_modules_segment(output) {
            return None;
        }

        let real = self.host.realpath(output);
        let mut cache = self
            .realpath_to_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        cache
            .entry(real)
            .or_insert_with_key(|real| {
                tracing::trace!(%output, %real, "following symlink");
                self.output_to_source.get(real).cloned()
            })
            .clone()
    }

    /// Whether `path` is a source file of some referenced project.
    pub fn is_project_reference_source(&self, path: &Utf8Path) -> bool {
        self.output_for(path).is_some()
    }

    /// Whether `dir` is, contains, or lies inside the declaration output
    /// directory of a referenced project. Only tracked with
    /// `use_source_of_project_reference_redirect`.
    pub fn is_reference_output_directory(&self, dir: &Utf8Path) -> bool {
        self.output_dirs
            .iter()
            .any(|out| out.starts_with(dir) || dir.starts_with(out))
    }

    /// Groups of configurations that reference each other in a loop. Edges
    /// declared `circular` are ignored.
    pub fn reference_cycles(&self) -> Vec<Vec<Utf8PathBuf>> {
        let configs: Vec<&ResolvedConfig> = self
            .config_to_resolved
            .values()
            .flatten()
            .map(Arc::as_ref)
            .chain(std::iter::once(&*self.root))
            .collect();

        let mut graph = DiGraph::<&Utf8Path, ()>::new();
        let mut nodes = HashMap::new();

        for config in &configs {
            for path in std::iter::once(config.config_path()).chain(config.reference_paths()) {
                nodes.entry(path).or_insert_with(|| graph.add_node(path));
            }
        }

        for config in &configs {
            let from = nodes[config.config_path()];
            for reference in config.references().iter().filter(|r| !r.circular) {
                graph.update_edge(from, nodes[reference.path.as_path()], ());
            }
        }

        let mut cycles: Vec<Vec<Utf8PathBuf>> = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
            .map(|scc| {
                let mut paths: Vec<_> = scc.iter().map(|&i| graph[i].to_path_buf()).collect();
                paths.sort();
                paths
            })
            .collect();

        cycles.sort();
        cycles
    }
}
