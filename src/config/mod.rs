//! Project configuration files and the tables derived from them.
//!
//! A configuration is a JSON document shaped like a `tsconfig.json`:
//!
//! ```json
//! {
//!   "include": ["src"],
//!   "references": [{ "path": "../core" }],
//!   "compilerOptions": { "rootDir": "src", "outDir": "dist" }
//! }
//! ```
//!
//! Only the parts relevant to the reference graph are understood: the source
//! selection, the references and the options deciding where declaration
//! output is written.

mod host;

use std::collections::HashMap;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};
use serde::Deserialize;

pub use crate::config::host::{ConfigHost, FsHost, MemoryHost};
use crate::error::ConfigError;
use crate::paths;

/// Raw contents of a configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub files: Option<Vec<Utf8PathBuf>>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub references: Vec<ProjectReference>,
    pub compiler_options: CompilerOptions,
}

impl ConfigFile {
    pub fn parse(path: &Utf8Path, text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerOptions {
    pub root_dir: Option<Utf8PathBuf>,
    pub out_dir: Option<Utf8PathBuf>,
    pub declaration_dir: Option<Utf8PathBuf>,
    pub composite: bool,
    pub declaration: Option<bool>,
}

/// A `references` entry as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectReference {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub circular: bool,
}

/// A reference after its path was resolved against the referencing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub path: Utf8PathBuf,
    /// Cycles through this edge are intentional and not reported.
    pub circular: bool,
}

/// Where a source file's declaration output ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub source: Utf8PathBuf,
    pub declaration: Utf8PathBuf,
    /// Configuration owning the source.
    pub config: Utf8PathBuf,
}

/// Which source file produced a declaration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub source: Utf8PathBuf,
    pub config: Utf8PathBuf,
}

/// Source to output lookups of a single configuration.
#[derive(Debug, Default)]
pub struct OutputTables {
    pub source_to_output: HashMap<Utf8PathBuf, OutputDescriptor>,
    pub output_to_source: HashMap<Utf8PathBuf, SourceDescriptor>,
}

impl OutputTables {
    fn derive(config: &ResolvedConfig) -> Self {
        let mut tables = Self::default();

        for source in &config.sources {
            let Some(declaration) = config.declaration_output(source) else {
                continue;
            };

            tables.output_to_source.insert(
                declaration.clone(),
                SourceDescriptor {
                    source: source.clone(),
                    config: config.path.clone(),
                },
            );
            tables.source_to_output.insert(
                source.clone(),
                OutputDescriptor {
                    source: source.clone(),
                    declaration,
                    config: config.path.clone(),
                },
            );
        }

        tracing::debug!(config = %config.path, outputs = tables.output_to_source.len(), "derived output tables");
        tables
    }
}

/// A configuration file that was found and parsed, with every path in it made
/// absolute.
#[derive(Debug)]
pub struct ResolvedConfig {
    path: Utf8PathBuf,
    sources: Vec<Utf8PathBuf>,
    root_dir: Utf8PathBuf,
    out_dir: Option<Utf8PathBuf>,
    declaration_dir: Option<Utf8PathBuf>,
    composite: bool,
    references: Vec<ResolvedReference>,
    tables: OnceLock<OutputTables>,
}

impl ResolvedConfig {
    pub fn new(path: &Utf8Path, file: ConfigFile, mut sources: Vec<Utf8PathBuf>) -> Self {
        let path = paths::normalize(path);
        let dir = paths::config_dir(&path);
        let absolute = |p: &Utf8Path| paths::normalize(&dir.join(p));

        sources.sort();
        sources.dedup();

        let options = file.compiler_options;
        let references = file
            .references
            .iter()
            .map(|reference| ResolvedReference {
                path: paths::resolve_reference(&path, &reference.path),
                circular: reference.circular,
            })
            .collect();

        Self {
            root_dir: options.root_dir.as_deref().map_or_else(|| dir.clone(), absolute),
            out_dir: options.out_dir.as_deref().map(absolute),
            declaration_dir: options.declaration_dir.as_deref().map(absolute),
            composite: options.composite,
            sources,
            references,
            tables: OnceLock::new(),
            path,
        }
    }

    /// The file this configuration was read from.
    pub fn config_path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn sources(&self) -> &[Utf8PathBuf] {
        &self.sources
    }

    pub fn references(&self) -> &[ResolvedReference] {
        &self.references
    }

    pub fn reference_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.references.iter().map(|r| r.path.as_path())
    }

    pub fn composite(&self) -> bool {
        self.composite
    }

    pub fn out_dir(&self) -> Option<&Utf8Path> {
        self.out_dir.as_deref()
    }

    /// Directory receiving declaration files, `outDir` when no dedicated
    /// `declarationDir` is set.
    pub fn declaration_dir(&self) -> Option<&Utf8Path> {
        self.declaration_dir.as_deref().or(self.out_dir.as_deref())
    }

    pub fn source_to_output(&self) -> &HashMap<Utf8PathBuf, OutputDescriptor> {
        &self.tables().source_to_output
    }

    pub fn output_to_source(&self) -> &HashMap<Utf8PathBuf, SourceDescriptor> {
        &self.tables().output_to_source
    }

    /// Output tables, derived on first access and cached afterwards.
    pub fn tables(&self) -> &OutputTables {
        self.tables.get_or_init(|| OutputTables::derive(self))
    }

    pub fn tables_ready(&self) -> bool {
        self.tables.get().is_some()
    }

    /// Path of the declaration file emitted for `source`, if it emits one.
    pub fn declaration_output(&self, source: &Utf8Path) -> Option<Utf8PathBuf> {
        let name = declaration_file_name(source.file_name()?)?;

        let Some(dir) = self.declaration_dir() else {
            return Some(source.with_file_name(name));
        };

        let Ok(relative) = source.strip_prefix(&self.root_dir) else {
            tracing::trace!(%source, root_dir = %self.root_dir, "source outside of rootDir");
            return None;
        };

        Some(paths::normalize(&dir.join(relative).with_file_name(name)))
    }
}

/// Declaration files and non-TypeScript sources produce no declaration.
fn declaration_file_name(name: &str) -> Option<String> {
    const DECLARATIONS: [&str; 3] = [".d.ts", ".d.mts", ".d.cts"];
    const EMITTING: [(&str, &str); 4] = [
        (".tsx", ".d.ts"),
        (".ts", ".d.ts"),
        (".mts", ".d.mts"),
        (".cts", ".d.cts"),
    ];

    if DECLARATIONS.iter().any(|ext| name.ends_with(ext)) {
        return None;
    }

    EMITTING
        .iter()
        .find_map(|(ext, dts)| name.strip_suffix(ext).map(|stem| format!("{stem}{dts}")))
}

/// Whether a file can be part of a project at all.
pub(crate) fn is_source_file(path: &Utf8Path) -> bool {
    matches!(path.extension(), Some("ts" | "tsx" | "mts" | "cts"))
}

/// Glob options shared by every host, `*` and `?` never cross a `/`.
pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Source selection of one configuration, shared by the hosts.
pub(crate) struct Selection {
    pub files: Vec<Utf8PathBuf>,
    pub include: Vec<String>,
    exclude: Vec<Pattern>,
    exclude_node_modules: bool,
    out_dirs: Vec<Utf8PathBuf>,
}

impl Selection {
    pub fn new(path: &Utf8Path, file: &ConfigFile) -> Result<Self, ConfigError> {
        let dir = paths::config_dir(path);
        let absolute = |p: &Utf8Path| paths::normalize(&dir.join(p));

        let include = match (&file.files, &file.include) {
            (_, Some(include)) => include.iter().map(|p| expand_pattern(&dir, p)).collect(),
            (None, None) => vec![expand_pattern(&dir, "**/*")],
            (Some(_), None) => Vec::new(),
        };

        let exclude = file
            .exclude
            .iter()
            .flatten()
            .map(|p| Pattern::new(&expand_pattern(&dir, p)))
            .collect::<Result<_, _>>()?;

        let options = &file.compiler_options;
        let out_dirs = [&options.out_dir, &options.declaration_dir]
            .into_iter()
            .flatten()
            .map(|p| absolute(p))
            .collect();

        Ok(Self {
            files: file.files.iter().flatten().map(|p| absolute(p)).collect(),
            include,
            exclude,
            exclude_node_modules: file.exclude.is_none(),
            out_dirs,
        })
    }

    /// Whether a file matched by `include` belongs to the project.
    pub fn accepts(&self, path: &Utf8Path) -> bool {
        is_source_file(path)
            && !(self.exclude_node_modules && paths::has_node_modules_segment(path))
            && !self.exclude.iter().any(|p| p.matches_with(path.as_str(), MATCH_OPTIONS))
            && !self.out_dirs.iter().any(|d| path.starts_with(d))
    }
}

/// Absolute glob for an include or exclude entry. Entries naming a directory
/// select everything below it. The configuration directory itself is matched
/// literally.
fn expand_pattern(dir: &Utf8Path, pattern: &str) -> String {
    let dir = paths::normalize(dir);
    let joined = dir.join(pattern);
    let is_glob = pattern.contains(['*', '?', '[']);
    let has_extension = joined.file_name().is_some_and(|name| name.contains('.'));

    let mut path = paths::normalize(&joined);
    if !(is_glob || has_extension) {
        path.push("**/*");
    }

    // `..` in the entry may climb above the directory.
    let base = dir
        .ancestors()
        .find(|ancestor| path.starts_with(ancestor))
        .unwrap_or(Utf8Path::new(""));
    let rest = path.strip_prefix(base).unwrap_or(path.as_path());
    let base = Pattern::escape(base.as_str());

    match (base.is_empty(), rest.as_str().is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => base,
        (false, false) => Utf8Path::new(&base).join(rest).into_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(text: &str, sources: &[&str]) -> ResolvedConfig {
        let path = Utf8Path::new("/repo/lib/tsconfig.json");
        let file = ConfigFile::parse(path, text).unwrap();
        ResolvedConfig::new(path, file, sources.iter().map(Utf8PathBuf::from).collect())
    }

    #[test]
    fn test_declaration_names() {
        assert_eq!(declaration_file_name("a.ts").as_deref(), Some("a.d.ts"));
        assert_eq!(declaration_file_name("a.tsx").as_deref(), Some("a.d.ts"));
        assert_eq!(declaration_file_name("a.mts").as_deref(), Some("a.d.mts"));
        assert_eq!(declaration_file_name("a.cts").as_deref(), Some("a.d.cts"));
        assert_eq!(declaration_file_name("a.d.ts"), None);
        assert_eq!(declaration_file_name("a.js"), None);
    }

    #[test]
    fn test_references_resolve_against_config() {
        let config = config(
            r#"{ "references": [{ "path": "../core" }, { "path": "./tsconfig.test.json", "circular": true }] }"#,
            &[],
        );

        assert_eq!(
            config.references(),
            &[
                ResolvedReference {
                    path: "/repo/core/tsconfig.json".into(),
                    circular: false,
                },
                ResolvedReference {
                    path: "/repo/lib/tsconfig.test.json".into(),
                    circular: true,
                },
            ]
        );
    }

    #[test]
    fn test_output_tables_with_root_and_out_dir() {
        let config = config(
            r#"{ "compilerOptions": { "rootDir": "src", "outDir": "dist" } }"#,
            &[
                "/repo/lib/src/index.ts",
                "/repo/lib/src/nested/util.mts",
                "/repo/lib/src/types.d.ts",
                "/repo/lib/other/outside.ts",
            ],
        );

        assert!(!config.tables_ready());

        let output = &config.source_to_output()[Utf8Path::new("/repo/lib/src/index.ts")];
        assert_eq!(output.declaration, "/repo/lib/dist/index.d.ts");
        assert_eq!(output.config, "/repo/lib/tsconfig.json");

        let source = &config.output_to_source()[Utf8Path::new("/repo/lib/dist/nested/util.d.mts")];
        assert_eq!(source.source, "/repo/lib/src/nested/util.mts");

        assert!(config.tables_ready());
        assert_eq!(config.source_to_output().len(), 2);
    }

    #[test]
    fn test_declaration_dir_takes_precedence() {
        let config = config(
            r#"{ "compilerOptions": { "outDir": "dist", "declarationDir": "types" } }"#,
            &["/repo/lib/index.ts"],
        );

        assert_eq!(config.declaration_dir(), Some(Utf8Path::new("/repo/lib/types")));
        assert_eq!(
            config.declaration_output(Utf8Path::new("/repo/lib/index.ts")).unwrap(),
            "/repo/lib/types/index.d.ts"
        );
    }

    #[test]
    fn test_output_next_to_source_without_out_dir() {
        let config = config("{}", &["/repo/lib/src/a.tsx"]);

        assert_eq!(config.declaration_dir(), None);
        assert_eq!(
            config.declaration_output(Utf8Path::new("/repo/lib/src/a.tsx")).unwrap(),
            "/repo/lib/src/a.d.ts"
        );
    }

    #[test]
    fn test_selection_defaults() {
        let path = Utf8Path::new("/repo/lib/tsconfig.json");
        let file = ConfigFile::parse(path, r#"{ "compilerOptions": { "outDir": "dist" } }"#).unwrap();
        let selection = Selection::new(path, &file).unwrap();

        assert_eq!(selection.include, vec!["/repo/lib/**/*".to_string()]);
        assert!(selection.accepts(Utf8Path::new("/repo/lib/src/a.ts")));
        assert!(!selection.accepts(Utf8Path::new("/repo/lib/dist/a.d.ts")));
        assert!(!selection.accepts(Utf8Path::new("/repo/lib/node_modules/x/a.ts")));
        assert!(!selection.accepts(Utf8Path::new("/repo/lib/src/a.js")));
    }

    #[test]
    fn test_selection_explicit_exclude() {
        let path = Utf8Path::new("/repo/lib/tsconfig.json");
        let file = ConfigFile::parse(path, r#"{ "include": ["src"], "exclude": ["src/**/*.test.ts"] }"#).unwrap();
        let selection = Selection::new(path, &file).unwrap();

        assert_eq!(selection.include, vec!["/repo/lib/src/**/*".to_string()]);
        assert!(selection.accepts(Utf8Path::new("/repo/lib/src/a.ts")));
        assert!(!selection.accepts(Utf8Path::new("/repo/lib/src/a.test.ts")));
    }

    #[test]
    fn test_single_star_exclude_stays_in_directory() {
        let path = Utf8Path::new("/repo/lib/tsconfig.json");
        let file = ConfigFile::parse(path, r#"{ "include": ["src"], "exclude": ["src/*.test.ts"] }"#).unwrap();
        let selection = Selection::new(path, &file).unwrap();

        assert!(!selection.accepts(Utf8Path::new("/repo/lib/src/a.test.ts")));
        assert!(selection.accepts(Utf8Path::new("/repo/lib/src/nested/b.test.ts")));
    }

    #[test]
    fn test_config_directory_is_literal() {
        let path = Utf8Path::new("/repo/[lib]/tsconfig.json");
        let file = ConfigFile::parse(path, r#"{ "include": ["src"], "exclude": ["src/*.test.ts"] }"#).unwrap();
        let selection = Selection::new(path, &file).unwrap();

        let include = Pattern::new(&selection.include[0]).unwrap();
        assert!(include.matches_with("/repo/[lib]/src/a.ts", MATCH_OPTIONS));
        assert!(!include.matches_with("/repo/l/src/a.ts", MATCH_OPTIONS));

        assert!(selection.accepts(Utf8Path::new("/repo/[lib]/src/a.ts")));
        assert!(!selection.accepts(Utf8Path::new("/repo/[lib]/src/a.test.ts")));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = ConfigFile::parse(Utf8Path::new("/repo/tsconfig.json"), "{ nope").unwrap_err();
        assert!(err.to_string().contains("/repo/tsconfig.json"));
    }
}
