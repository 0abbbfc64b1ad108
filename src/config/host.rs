use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::config::{ConfigFile, MATCH_OPTIONS, ResolvedConfig, Selection};
use crate::error::ConfigError;
use crate::paths;

/// Access to configuration files.
///
/// Resolution failures are not errors at this level, the reference graph
/// records them as missing configurations and carries on.
pub trait ConfigHost: Send + Sync {
    fn resolve(&self, path: &Utf8Path) -> Option<Arc<ResolvedConfig>>;

    /// Target of `path` with every symlink followed.
    fn realpath(&self, path: &Utf8Path) -> Utf8PathBuf {
        path.to_owned()
    }
}

/// Reads configurations from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsHost;

impl FsHost {
    pub fn load(&self, path: &Utf8Path) -> Result<ResolvedConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        let file = ConfigFile::parse(path, &text)?;
        let selection = Selection::new(path, &file)?;

        let mut sources = selection.files.clone();
        for pattern in &selection.include {
            for entry in glob::glob_with(pattern, MATCH_OPTIONS)? {
                let entry = Utf8PathBuf::try_from(entry?)?;
                if entry.is_file() && selection.accepts(&entry) {
                    sources.push(paths::normalize(&entry));
                }
            }
        }

        Ok(ResolvedConfig::new(path, file, sources))
    }
}

impl ConfigHost for FsHost {
    fn resolve(&self, path: &Utf8Path) -> Option<Arc<ResolvedConfig>> {
        match self.load(path) {
            Ok(config) => Some(Arc::new(config)),
            Err(err) => {
                tracing::warn!(%path, "{err}");
                None
            }
        }
    }

    fn realpath(&self, path: &Utf8Path) -> Utf8PathBuf {
        path.canonicalize_utf8().unwrap_or_else(|_| path.to_owned())
    }
}

/// Keeps configurations and sources in memory. Useful for embedding and for
/// driving the loader without touching the disk.
#[derive(Debug, Default)]
pub struct MemoryHost {
    files: BTreeMap<Utf8PathBuf, String>,
    links: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    reads: Mutex<HashMap<Utf8PathBuf, usize>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<Utf8Path>, text: impl Into<String>) -> Self {
        self.add_file(path, text);
        self
    }

    pub fn with_symlink(mut self, link: impl AsRef<Utf8Path>, target: impl AsRef<Utf8Path>) -> Self {
        self.add_symlink(link, target);
        self
    }

    pub fn add_file(&mut self, path: impl AsRef<Utf8Path>, text: impl Into<String>) {
        self.files.insert(paths::normalize(path.as_ref()), text.into());
    }

    /// Makes the directory or file `link` point at `target`.
    pub fn add_symlink(&mut self, link: impl AsRef<Utf8Path>, target: impl AsRef<Utf8Path>) {
        self.links.insert(
            paths::normalize(link.as_ref()),
            paths::normalize(target.as_ref()),
        );
    }

    /// How many times the configuration at `path` was loaded.
    pub fn read_count(&self, path: impl AsRef<Utf8Path>) -> usize {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    pub fn load(&self, path: &Utf8Path) -> Result<ResolvedConfig, ConfigError> {
        let path = paths::normalize(path);
        *self
            .reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_default() += 1;

        let text = self
            .files
            .get(&path)
            .ok_or_else(|| ConfigError::NotFound(path.clone()))?;
        let file = ConfigFile::parse(&path, text)?;
        let selection = Selection::new(&path, &file)?;

        let include = selection
            .include
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut sources = selection.files.clone();
        sources.extend(
            self.files
                .keys()
                .filter(|file| include.iter().any(|p| p.matches_with(file.as_str(), MATCH_OPTIONS)))
                .filter(|file| selection.accepts(file))
                .cloned(),
        );

        Ok(ResolvedConfig::new(&path, file, sources))
    }
}

impl ConfigHost for MemoryHost {
    fn resolve(&self, path: &Utf8Path) -> Option<Arc<ResolvedConfig>> {
        match self.load(path) {
            Ok(config) => Some(Arc::new(config)),
            Err(err) => {
                tracing::warn!(%path, "{err}");
                None
            }
        }
    }

    fn realpath(&self, path: &Utf8Path) -> Utf8PathBuf {
        let path = paths::normalize(path);

        // Longest link first, nested links shadow their parents.
        let link = self
            .links
            .iter()
            .filter(|(link, _)| path.starts_with(link))
            .max_by_key(|(link, _)| link.as_str().len());

        let Some((link, target)) = link else {
            return path;
        };

        match path.strip_prefix(link) {
            Ok(rest) if rest.as_str().is_empty() => target.clone(),
            Ok(rest) => paths::normalize(&target.join(rest)),
            Err(_) => path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_host_selects_sources() {
        let host = MemoryHost::new()
            .with_file(
                "/repo/lib/tsconfig.json",
                r#"{ "include": ["src"], "compilerOptions": { "outDir": "dist" } }"#,
            )
            .with_file("/repo/lib/src/index.ts", "")
            .with_file("/repo/lib/src/readme.md", "")
            .with_file("/repo/lib/test/index.ts", "")
            .with_file("/repo/other/src/index.ts", "");

        let config = host.resolve(Utf8Path::new("/repo/lib/tsconfig.json")).unwrap();

        assert_eq!(config.sources(), &[Utf8PathBuf::from("/repo/lib/src/index.ts")]);
        assert_eq!(host.read_count("/repo/lib/tsconfig.json"), 1);
    }

    #[test]
    fn test_memory_host_explicit_files() {
        let host = MemoryHost::new().with_file(
            "/repo/lib/tsconfig.json",
            r#"{ "files": ["a.ts", "./sub/../b.ts"] }"#,
        );

        let config = host.resolve(Utf8Path::new("/repo/lib/tsconfig.json")).unwrap();

        assert_eq!(
            config.sources(),
            &[
                Utf8PathBuf::from("/repo/lib/a.ts"),
                Utf8PathBuf::from("/repo/lib/b.ts"),
            ]
        );
    }

    #[test]
    fn test_memory_host_missing_and_invalid() {
        let host = MemoryHost::new().with_file("/repo/bad/tsconfig.json", "{ not json");

        assert!(host.resolve(Utf8Path::new("/repo/none/tsconfig.json")).is_none());
        assert!(host.resolve(Utf8Path::new("/repo/bad/tsconfig.json")).is_none());
        assert!(matches!(
            host.load(Utf8Path::new("/repo/none/tsconfig.json")),
            Err(ConfigError::NotFound(_))
        ));
        assert!(matches!(
            host.load(Utf8Path::new("/repo/bad/tsconfig.json")),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn test_memory_host_realpath() {
        let host = MemoryHost::new()
            .with_symlink("/repo/app/node_modules/lib", "/repo/lib")
            .with_symlink("/repo/app/node_modules/lib/nested", "/elsewhere");

        assert_eq!(
            host.realpath(Utf8Path::new("/repo/app/node_modules/lib/dist/index.d.ts")),
            "/repo/lib/dist/index.d.ts"
        );
        assert_eq!(
            host.realpath(Utf8Path::new("/repo/app/node_modules/lib/nested/a.d.ts")),
            "/elsewhere/a.d.ts"
        );
        assert_eq!(host.realpath(Utf8Path::new("/repo/app/node_modules/lib")), "/repo/lib");
        assert_eq!(host.realpath(Utf8Path::new("/repo/app/src/a.ts")), "/repo/app/src/a.ts");
    }

    #[test]
    fn test_fs_host_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();

        fs::create_dir_all(root.join("lib/src")).unwrap();
        fs::create_dir_all(root.join("lib/dist")).unwrap();
        fs::write(
            root.join("lib/tsconfig.json"),
            r#"{ "references": [{ "path": "../core" }], "compilerOptions": { "rootDir": "src", "outDir": "dist" } }"#,
        )
        .unwrap();
        fs::write(root.join("lib/src/index.ts"), "export {}").unwrap();
        fs::write(root.join("lib/dist/index.d.ts"), "export {}").unwrap();

        let config = FsHost.load(&root.join("lib/tsconfig.json")).unwrap();

        assert_eq!(config.sources(), &[root.join("lib/src/index.ts")]);
        assert_eq!(
            config.reference_paths().collect::<Vec<_>>(),
            vec![root.join("core/tsconfig.json").as_path()]
        );
        assert_eq!(
            config.source_to_output()[&root.join("lib/src/index.ts")].declaration,
            root.join("lib/dist/index.d.ts")
        );

        assert!(FsHost.resolve(&root.join("core/tsconfig.json")).is_none());
        assert!(matches!(
            FsHost.load(&root.join("core/tsconfig.json")),
            Err(ConfigError::Read(..))
        ));
    }

    #[test]
    fn test_hosts_agree_on_single_star() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
        let config = r#"{ "include": ["src/*.ts"] }"#;
        let files = ["pkg/src/a.ts", "pkg/src/nested/b.ts"];

        let mut memory = MemoryHost::new().with_file(root.join("pkg/tsconfig.json"), config);
        fs::create_dir_all(root.join("pkg/src/nested")).unwrap();
        fs::write(root.join("pkg/tsconfig.json"), config).unwrap();
        for file in files {
            fs::write(root.join(file), "export {}").unwrap();
            memory.add_file(root.join(file), "export {}");
        }

        let on_disk = FsHost.load(&root.join("pkg/tsconfig.json")).unwrap();
        let in_memory = memory.load(&root.join("pkg/tsconfig.json")).unwrap();

        assert_eq!(on_disk.sources(), &[root.join("pkg/src/a.ts")]);
        assert_eq!(in_memory.sources(), on_disk.sources());
    }

    #[test]
    fn test_fs_host_escapes_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();

        fs::create_dir_all(root.join("pkg[1]/src")).unwrap();
        fs::write(root.join("pkg[1]/tsconfig.json"), r#"{ "include": ["src"] }"#).unwrap();
        fs::write(root.join("pkg[1]/src/index.ts"), "export {}").unwrap();

        let config = FsHost.load(&root.join("pkg[1]/tsconfig.json")).unwrap();

        assert_eq!(config.sources(), &[root.join("pkg[1]/src/index.ts")]);
    }
}
