//! Executable search path resolution
//!
//! Services never inherit the operator's interactive `PATH`. The resolver scans a
//! fixed list of system directories, the current `PATH`, and the per-user install
//! locations that version managers (nvm, volta, bun, cargo) write to, so that a
//! runtime installed during this session can be located from a fresh process.

use std::path::{Path, PathBuf};

/// Search path every service descriptor starts from
pub const BASE_SEARCH_PATH: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// Locates executables on disk.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    candidates: Vec<PathBuf>,
}

impl PathResolver {
    /// Resolver over an explicit list of directories, in priority order.
    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut resolver = Self::default();
        for dir in dirs {
            resolver.push(dir.into());
        }
        resolver
    }

    /// Resolver over system directories, `PATH` and user tool locations.
    pub fn system() -> Self {
        let mut resolver = Self::with_dirs(BASE_SEARCH_PATH.iter().map(PathBuf::from));

        if let Some(path) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path) {
                resolver.push(dir);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for relative in [".local/bin", ".cargo/bin", ".bun/bin", ".volta/bin"] {
                resolver.push(home.join(relative));
            }
            for dir in nvm_node_bins(&home.join(".nvm/versions/node")) {
                resolver.push(dir);
            }
        }

        resolver.push(PathBuf::from("/snap/bin"));
        resolver
    }

    fn push(&mut self, dir: PathBuf) {
        if !dir.as_os_str().is_empty() && !self.candidates.contains(&dir) {
            self.candidates.push(dir);
        }
    }

    /// Directories searched, in priority order.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Absolute path of `binary`, if any candidate directory contains it.
    pub fn resolve(&self, binary: &str) -> Option<PathBuf> {
        let direct = Path::new(binary);
        if direct.is_absolute() {
            return is_executable(direct).then(|| direct.to_path_buf());
        }
        self.candidates
            .iter()
            .map(|dir| dir.join(binary))
            .find(|candidate| is_executable(candidate))
    }

    /// The base search path as a `PATH` value.
    pub fn base_search_path() -> String {
        BASE_SEARCH_PATH.join(":")
    }

    /// Base search path extended with the directories holding `binaries`.
    ///
    /// Binaries that cannot be resolved are skipped; the caller decides whether
    /// that is fatal.
    pub fn expanded_search_path(&self, binaries: &[String]) -> String {
        let mut entries: Vec<String> = BASE_SEARCH_PATH.iter().map(|s| s.to_string()).collect();
        for binary in binaries {
            if let Some(parent) = self.resolve(binary).as_deref().and_then(Path::parent) {
                let entry = parent.display().to_string();
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        entries.join(":")
    }
}

fn nvm_node_bins(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut versions: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join("bin"))
        .filter(|bin| bin.is_dir())
        .collect();
    // Newest version first
    versions.sort();
    versions.reverse();
    versions
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_executable(path: &Path) {
        std::fs::write(path, "#!/bin/sh\n").expect("write");
        let mut perms = std::fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }

    #[test]
    fn test_resolve_finds_executable_in_order() {
        let first = tempdir().expect("tempdir");
        let second = tempdir().expect("tempdir");
        write_executable(&second.path().join("node"));

        let resolver = PathResolver::with_dirs([first.path(), second.path()]);
        assert_eq!(resolver.resolve("node"), Some(second.path().join("node")));
        assert_eq!(resolver.resolve("npm"), None);
    }

    #[test]
    fn test_non_executable_files_are_ignored() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("node"), "data").expect("write");

        let resolver = PathResolver::with_dirs([dir.path()]);
        assert_eq!(resolver.resolve("node"), None);
    }

    #[test]
    fn test_expanded_search_path_appends_binary_dirs_once() {
        let dir = tempdir().expect("tempdir");
        write_executable(&dir.path().join("node"));
        write_executable(&dir.path().join("npm"));

        let resolver = PathResolver::with_dirs([dir.path()]);
        let expanded =
            resolver.expanded_search_path(&["node".to_string(), "npm".to_string(), "bun".to_string()]);

        let expected = format!("{}:{}", PathResolver::base_search_path(), dir.path().display());
        assert_eq!(expanded, expected);
    }

    #[test]
    fn test_duplicate_dirs_collapse() {
        let resolver = PathResolver::with_dirs(["/usr/bin", "/usr/bin", ""]);
        assert_eq!(resolver.candidates().len(), 1);
    }

    #[test]
    fn test_nvm_versions_sorted_newest_first() {
        let root = tempdir().expect("tempdir");
        for version in ["v18.0.0", "v20.1.0"] {
            std::fs::create_dir_all(root.path().join(version).join("bin")).expect("mkdir");
        }
        let bins = nvm_node_bins(root.path());
        assert_eq!(bins[0], root.path().join("v20.1.0/bin"));
    }
}
