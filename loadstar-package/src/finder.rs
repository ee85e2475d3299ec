//! Memoized upward search for package manifests

use crate::PackageManifest;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default manifest file name
pub const DEFAULT_MANIFEST_NAME: &str = "package.json";

/// Finds the nearest manifest above a path, remembering the answer for every
/// directory it walked through so later lookups from the same or nested
/// directories do not touch the filesystem again.
#[derive(Debug)]
pub struct ManifestFinder {
    file_name: String,
    /// directory -> nearest manifest at or above it (None = none up to the root)
    directories: FxHashMap<PathBuf, Option<PathBuf>>,
    /// manifest path -> parsed manifest (None = missing or malformed)
    manifests: FxHashMap<PathBuf, Option<Arc<PackageManifest>>>,
    probes: usize,
}

impl Default for ManifestFinder {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_NAME)
    }
}

impl ManifestFinder {
    /// Create a finder looking for manifests named `file_name`
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            directories: FxHashMap::default(),
            manifests: FxHashMap::default(),
            probes: 0,
        }
    }

    /// The manifest file name this finder looks for
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Find the nearest manifest for a file or directory path.
    ///
    /// Files (and paths that look like files) start the search in their
    /// parent directory.
    pub fn find_manifest(&mut self, start: &Path) -> Option<PathBuf> {
        let start = absolutize(start);
        let dir = search_start(&start);
        self.find_from_dir(&dir)
    }

    /// Find the nearest manifest at or above `dir`
    pub fn find_from_dir(&mut self, dir: &Path) -> Option<PathBuf> {
        let mut walked = Vec::new();
        let mut found = None;

        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if let Some(cached) = self.directories.get(ancestor) {
                trace!("Manifest lookup memo hit for {:?}", ancestor);
                found = cached.clone();
                break;
            }

            walked.push(ancestor.to_path_buf());
            self.probes += 1;

            let candidate = ancestor.join(&self.file_name);
            if candidate.is_file() {
                found = Some(candidate);
                break;
            }
        }

        for walked_dir in walked {
            self.directories.insert(walked_dir, found.clone());
        }

        found
    }

    /// Parse the manifest at `path`. Missing or malformed manifests yield
    /// `None`; the outcome is memoized either way.
    pub fn manifest_at(&mut self, path: &Path) -> Option<Arc<PackageManifest>> {
        if let Some(cached) = self.manifests.get(path) {
            return cached.clone();
        }

        let parsed = if path.is_file() {
            match PackageManifest::from_file(path) {
                Ok(manifest) => Some(Arc::new(manifest)),
                Err(e) => {
                    debug!("Ignoring malformed manifest: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.manifests.insert(path.to_path_buf(), parsed.clone());
        parsed
    }

    /// The manifest directly inside `dir`, if any
    pub fn manifest_in(&mut self, dir: &Path) -> Option<Arc<PackageManifest>> {
        let path = dir.join(&self.file_name);
        self.manifest_at(&path)
    }

    /// Nearest manifest path together with its parsed contents
    pub fn nearest(&mut self, start: &Path) -> Option<(PathBuf, Arc<PackageManifest>)> {
        let path = self.find_manifest(start)?;
        let manifest = self.manifest_at(&path)?;
        Some((path, manifest))
    }

    /// Number of directories stat'ed so far
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    /// Number of directories with a memoized answer
    pub fn memoized_dirs(&self) -> usize {
        self.directories.len()
    }

    /// Forget everything (used when modules are reloaded from disk)
    pub fn clear(&mut self) {
        self.directories.clear();
        self.manifests.clear();
        debug!("Cleared manifest lookup cache");
    }
}

/// Directory the upward search begins in
fn search_start(start: &Path) -> PathBuf {
    if start.is_dir() {
        return start.to_path_buf();
    }
    if start.is_file() || start.extension().is_some() {
        if let Some(parent) = start.parent() {
            return parent.to_path_buf();
        }
    }
    start.to_path_buf()
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_finds_manifest_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("package.json"), r#"{"name": "root"}"#).unwrap();
        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let mut finder = ManifestFinder::default();
        let found = finder.find_manifest(&nested.join("file.js")).unwrap();
        assert_eq!(found, root.join("package.json"));

        let manifest = finder.manifest_at(&found).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("root"));
    }

    #[test]
    fn test_lookup_is_memoized_per_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("package.json"), "{}").unwrap();
        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let mut finder = ManifestFinder::default();
        finder.find_from_dir(&nested);
        let after_first = finder.probe_count();
        // nested, a, root
        assert_eq!(after_first, 3);

        finder.find_from_dir(&nested);
        finder.find_from_dir(&root.join("a"));
        assert_eq!(finder.probe_count(), after_first);

        // A sibling only scans itself before reaching memoized ground
        let sibling = root.join("c");
        fs::create_dir_all(&sibling).unwrap();
        finder.find_from_dir(&sibling);
        assert_eq!(finder.probe_count(), after_first + 1);
    }

    #[test]
    fn test_malformed_manifest_is_soft_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("package.json");
        fs::write(&path, "{ broken").unwrap();

        let mut finder = ManifestFinder::default();
        assert_eq!(finder.find_from_dir(temp_dir.path()), Some(path.clone()));
        assert!(finder.manifest_at(&path).is_none());
        assert!(finder.nearest(temp_dir.path()).is_none());
    }

    #[test]
    fn test_clear_forgets_memo() {
        let temp_dir = TempDir::new().unwrap();
        let mut finder = ManifestFinder::default();
        finder.find_from_dir(temp_dir.path());
        assert!(finder.memoized_dirs() > 0);

        finder.clear();
        assert_eq!(finder.memoized_dirs(), 0);
    }
}
