//! Interface definition search paths
//!
//! The harness never searches the filesystem itself: the binaries resolve
//! the schema file here and hand the resolved path to bootstrap.

use std::path::{Path, PathBuf};

use super::properties::Properties;
use super::{Error, Result};

/// Name used for platform data directories
const APP_NAME: &str = "proxy-harness";

/// Directory name holding interface definitions in a source checkout
const SCHEMA_DIR_NAME: &str = "schema";

/// Environment variable overriding the schema directory
pub const SCHEMA_DIR_ENV: &str = "PROXY_HARNESS_SCHEMA_DIR";

/// How many parent directories to walk when looking for `schema/`
const MAX_ANCESTORS: usize = 4;

/// Candidate directories for interface definitions, most specific first
///
/// Order: the `Test.SchemaDir` property, the `PROXY_HARNESS_SCHEMA_DIR`
/// environment variable, a `schema/` directory in the current directory or
/// one of its parents, the same next to the executable, and finally the
/// platform data directory.
pub fn schema_search_dirs(props: &Properties) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(dir) = props.get("Test.SchemaDir") {
        dirs.push(PathBuf::from(dir));
    }

    if let Ok(dir) = std::env::var(SCHEMA_DIR_ENV) {
        if !dir.is_empty() {
            dirs.push(PathBuf::from(dir));
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        push_ancestors(&mut dirs, &cwd);
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        push_ancestors(&mut dirs, &exe_dir);
    }

    if let Some(data) = data_dir() {
        dirs.push(data.join(SCHEMA_DIR_NAME));
    }

    dirs.dedup();
    dirs
}

fn push_ancestors(dirs: &mut Vec<PathBuf>, start: &Path) {
    for ancestor in start.ancestors().take(MAX_ANCESTORS + 1) {
        dirs.push(ancestor.join(SCHEMA_DIR_NAME));
    }
}

/// Resolve an interface definition file by name
pub fn resolve_schema(name: &str, props: &Properties) -> Result<PathBuf> {
    let dirs = schema_search_dirs(props);
    find_in(name, &dirs).ok_or_else(|| {
        let searched: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
        Error::schema_not_found(name, &searched)
    })
}

/// First directory in `dirs` containing a file called `name`
pub fn find_in(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().map(|d| d.join(name)).find(|p| p.is_file())
}

/// Get the platform data directory
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.local/share/proxy-harness/`
/// - macOS: `~/Library/Application Support/proxy-harness/`
/// - Windows: `%APPDATA%\proxy-harness\`
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_dir_comes_first() {
        let mut props = Properties::new();
        props.set("Test.SchemaDir", "/opt/schemas");
        let dirs = schema_search_dirs(&props);
        assert_eq!(dirs[0], PathBuf::from("/opt/schemas"));
    }

    #[test]
    fn test_resolve_from_property_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Test.yaml"), "module: Test\n").unwrap();

        let mut props = Properties::new();
        props.set("Test.SchemaDir", &dir.path().display().to_string());
        let path = resolve_schema("Test.yaml", &props).unwrap();
        assert_eq!(path, dir.path().join("Test.yaml"));
    }

    #[test]
    fn test_resolve_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = find_in("Missing.yaml", &[dir.path().to_path_buf()]);
        assert!(result.is_none());
    }
}
