use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{ConfigHost, ResolvedConfig};
use crate::engine::{Unit, WorkQueue};
use crate::paths;

/// One project configuration in the reference graph.
///
/// Running it resolves the configuration through the host. Its children are
/// the configurations it references.
pub struct ReferenceUnit {
    path: Utf8PathBuf,
    host: Arc<dyn ConfigHost>,
    /// Unset until run, `None` inside when resolution failed.
    resolved: OnceLock<Option<Arc<ResolvedConfig>>>,
}

impl ReferenceUnit {
    pub fn new(path: impl AsRef<Utf8Path>, host: Arc<dyn ConfigHost>) -> Arc<Self> {
        Arc::new(Self {
            path: paths::normalize(path.as_ref()),
            host,
            resolved: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn has_run(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// The configuration, absent before `run` and when it failed to resolve.
    pub fn resolved(&self) -> Option<&Arc<ResolvedConfig>> {
        self.resolved.get().and_then(Option::as_ref)
    }
}

impl Unit for ReferenceUnit {
    type Key = Utf8PathBuf;

    fn key(&self) -> Self::Key {
        self.path.clone()
    }

    fn run(&self, queue: &WorkQueue<'_, '_>) {
        let resolved = self.host.resolve(&self.path);

        match &resolved {
            Some(config) => {
                tracing::debug!(path = %self.path, references = config.references().len(), "resolved project");

                // Table derivation does not gate discovery, let it overlap
                // with the siblings.
                if !config.tables_ready() {
                    let config = Arc::clone(config);
                    queue.spawn(move || {
                        config.tables();
                    });
                }
            }
            None => tracing::warn!(path = %self.path, "project reference could not be resolved"),
        }

        if self.resolved.set(resolved).is_err() {
            tracing::error!(path = %self.path, "project reference ran twice");
        }
    }

    fn sub_units(&self) -> Vec<Arc<Self>> {
        let Some(resolved) = self.resolved.get() else {
            panic!("sub units of '{}' requested before it ran", self.path);
        };

        resolved
            .iter()
            .flat_map(|config| config.reference_paths())
            .map(|path| ReferenceUnit::new(path, Arc::clone(&self.host)))
            .collect()
    }
}
