//! Lexical path helpers shared by the configuration hosts and the reference
//! units. Nothing in here touches the file system.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Name looked up when a project reference points at a directory.
pub const DEFAULT_CONFIG_NAME: &str = "tsconfig.json";

/// Collapses `.` and `..` segments without consulting the file system.
///
/// Leading `..` segments of a relative path are kept, `..` directly below the
/// root is dropped.
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match out.components().next_back() {
                Some(Utf8Component::Normal(_)) => {
                    out.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_str()),
        }
    }

    if out.as_str().is_empty() {
        out.push(".");
    }

    out
}

/// Resolves a reference declared inside `config` into the path of the
/// referenced configuration file.
pub fn resolve_reference(config: &Utf8Path, reference: &Utf8Path) -> Utf8PathBuf {
    let base = config.parent().unwrap_or(Utf8Path::new(""));
    let joined = base.join(reference);

    match joined.extension() {
        Some("json") => normalize(&joined),
        _ => normalize(&joined.join(DEFAULT_CONFIG_NAME)),
    }
}

/// Directory holding `config`, normalized.
pub fn config_dir(config: &Utf8Path) -> Utf8PathBuf {
    normalize(config.parent().unwrap_or(Utf8Path::new(".")))
}

/// Whether any segment of `path` is a `node_modules` directory.
pub fn has_node_modules_segment(path: &Utf8Path) -> bool {
    path.components().any(|c| c.as_str() == "node_modules")
}
