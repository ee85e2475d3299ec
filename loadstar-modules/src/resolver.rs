//! Built-in specifier resolution

use crate::hooks::{ResolutionContext, ResolveOutput};
use crate::{LoaderConfig, ModuleError, ModuleFormat, ModuleKind, Result};
use loadstar_package::{ManifestFinder, ModuleType};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, trace};
use url::Url;

/// Canonical id prefix of built-in modules
pub const BUILTIN_PREFIX: &str = "builtin:";

const NODE_PREFIX: &str = "node:";

/// Turns specifiers into canonical module ids
pub struct ModuleResolver {
    config: Rc<LoaderConfig>,
    manifests: RefCell<ManifestFinder>,
    builtins: RefCell<FxHashSet<String>>,
}

impl ModuleResolver {
    /// Create a resolver for the given configuration
    pub fn new(config: Rc<LoaderConfig>) -> Self {
        let manifests = ManifestFinder::new(config.manifest_name.clone());
        Self {
            config,
            manifests: RefCell::new(manifests),
            builtins: RefCell::new(FxHashSet::default()),
        }
    }

    /// Make `name` resolvable as a built-in module
    pub fn register_builtin(&self, name: &str) {
        self.builtins.borrow_mut().insert(name.to_string());
    }

    /// Built-in name addressed by `specifier`, if it is a built-in form
    pub fn builtin_name<'a>(&self, specifier: &'a str) -> Option<&'a str> {
        if let Some(name) = specifier.strip_prefix(BUILTIN_PREFIX) {
            return Some(name);
        }
        if self.config.node_compat {
            if let Some(name) = specifier.strip_prefix(NODE_PREFIX) {
                return Some(name);
            }
        }
        self.builtins
            .borrow()
            .contains(specifier)
            .then_some(specifier)
    }

    /// Resolve `specifier` without consulting hooks
    pub fn resolve(&self, specifier: &str, context: &ResolutionContext) -> Result<ResolveOutput> {
        validate_specifier(specifier)?;

        if let Some(name) = self.builtin_name(specifier) {
            if self.builtins.borrow().contains(name) {
                trace!("Resolved '{}' to built-in {}", specifier, name);
                return Ok(ResolveOutput::new(format!("{}{}", BUILTIN_PREFIX, name))
                    .with_format(ModuleFormat::Virtual));
            }
            return Err(self.not_found(specifier, context));
        }

        let resolved = if let Some(url) = parse_url(specifier) {
            if url.scheme() != "file" {
                return Err(ModuleError::InvalidSpecifier {
                    specifier: specifier.to_string(),
                    reason: format!("'{}:' URLs are only loadable through a hook", url.scheme()),
                });
            }
            let path = url.to_file_path().map_err(|()| ModuleError::InvalidSpecifier {
                specifier: specifier.to_string(),
                reason: "file URL must name a local absolute path".to_string(),
            })?;
            self.resolve_path(&path, &context.conditions)
        } else if is_path_like(specifier) {
            let path = context.base_path.join(specifier);
            self.resolve_path(&path, &context.conditions)
        } else {
            self.resolve_bare(specifier, context)
        };

        let path = resolved.ok_or_else(|| self.not_found(specifier, context))?;
        let path = canonical(&path);
        let format = self.format_for(&path);
        debug!("Resolved '{}' to {}", specifier, path.display());
        Ok(ResolveOutput::new(path.to_string_lossy().into_owned()).with_format(format))
    }

    fn not_found(&self, specifier: &str, context: &ResolutionContext) -> ModuleError {
        ModuleError::ModuleNotFound {
            specifier: specifier.to_string(),
            base: context.base_path.display().to_string(),
        }
    }

    /// File, then file plus each extension, then directory entry
    fn resolve_path(&self, path: &Path, conditions: &[String]) -> Option<PathBuf> {
        self.resolve_file(path).or_else(|| {
            if path.is_dir() {
                self.resolve_directory(path, conditions)
            } else {
                None
            }
        })
    }

    fn resolve_file(&self, path: &Path) -> Option<PathBuf> {
        trace!("Probing {}", path.display());
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        self.config.extensions.iter().find_map(|ext| {
            let mut candidate = OsString::from(path.as_os_str());
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            candidate.is_file().then_some(candidate)
        })
    }

    /// Manifest entry point, then the index file
    fn resolve_directory(&self, dir: &Path, conditions: &[String]) -> Option<PathBuf> {
        let manifest = self.manifests.borrow_mut().manifest_in(dir);
        if let Some(entry) = manifest.and_then(|m| m.entry_point(conditions)) {
            let target = dir.join(entry);
            let found = self.resolve_file(&target).or_else(|| {
                if target.is_dir() {
                    self.resolve_file(&target.join(&self.config.index_name))
                } else {
                    None
                }
            });
            if found.is_some() {
                return found;
            }
            debug!("Entry point of {} missing, falling back to index", dir.display());
        }
        self.resolve_file(&dir.join(&self.config.index_name))
    }

    /// Walk dependency directories from the base upward, then search paths.
    /// The closest package directory with the name decides the outcome.
    fn resolve_bare(&self, specifier: &str, context: &ResolutionContext) -> Option<PathBuf> {
        let (package, subpath) = split_package_specifier(specifier);

        for ancestor in context.base_path.ancestors() {
            for dep_dir in &self.config.dependency_dirs {
                if ancestor.file_name().map_or(false, |n| n == dep_dir.as_str()) {
                    continue;
                }
                let package_dir = ancestor.join(dep_dir).join(package);
                if package_dir.is_dir() {
                    return self.resolve_in_package(&package_dir, subpath, &context.conditions);
                }
                // Single-file package, e.g. node_modules/name.js
                if subpath.is_none() {
                    if let Some(found) = self.resolve_file(&package_dir) {
                        return Some(found);
                    }
                }
            }
        }

        self.config.search_paths.iter().find_map(|search_path| {
            self.resolve_path(&search_path.join(specifier), &context.conditions)
        })
    }

    fn resolve_in_package(
        &self,
        package_dir: &Path,
        subpath: Option<&str>,
        conditions: &[String],
    ) -> Option<PathBuf> {
        let manifest = self.manifests.borrow_mut().manifest_in(package_dir);
        if let Some(manifest) = manifest.filter(|m| m.exports.is_some()) {
            let key = match subpath {
                Some(sub) => format!("./{}", sub),
                None => ".".to_string(),
            };
            // Subpaths missing from an exports map are not reachable
            let Some(target) = manifest.resolve_export(&key, conditions) else {
                debug!("'{}' is not exported by {}", key, package_dir.display());
                return None;
            };
            return self.resolve_file(&package_dir.join(target));
        }

        match subpath {
            Some(sub) => self.resolve_path(&package_dir.join(sub), conditions),
            None => self.resolve_directory(package_dir, conditions),
        }
    }

    /// Binary for configured binary extensions, script otherwise
    pub fn format_for(&self, path: &Path) -> ModuleFormat {
        if self.config.is_binary_extension(path) {
            ModuleFormat::Binary
        } else {
            ModuleFormat::Script
        }
    }

    /// Module system of a script: by extension, else the nearest manifest's `type`
    pub fn module_kind(&self, path: &Path) -> ModuleKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some("mjs") => return ModuleKind::Esm,
            Some("cjs") => return ModuleKind::CommonJs,
            _ => {}
        }
        match self.manifests.borrow_mut().nearest(path) {
            Some((_, manifest)) if manifest.module_type() == ModuleType::Module => ModuleKind::Esm,
            _ => ModuleKind::CommonJs,
        }
    }

    /// Nearest manifest at or above `start`
    pub fn find_package_manifest(&self, start: &Path) -> Option<PathBuf> {
        self.manifests.borrow_mut().find_manifest(start)
    }

    /// Directories stat'ed by the manifest finder so far
    pub fn manifest_probe_count(&self) -> usize {
        self.manifests.borrow().probe_count()
    }

    /// Forget memoized manifest lookups
    pub fn clear_manifest_cache(&self) {
        self.manifests.borrow_mut().clear();
    }
}

fn validate_specifier(specifier: &str) -> Result<()> {
    let reason = if specifier.is_empty() {
        "specifier is empty"
    } else if specifier.contains('\0') {
        "specifier contains a null byte"
    } else {
        return Ok(());
    };
    Err(ModuleError::InvalidSpecifier {
        specifier: specifier.to_string(),
        reason: reason.to_string(),
    })
}

fn is_path_like(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || Path::new(specifier).is_absolute()
}

/// URL form of `specifier`; one-letter schemes are drive letters, not URLs
fn parse_url(specifier: &str) -> Option<Url> {
    Url::parse(specifier)
        .ok()
        .filter(|url| url.scheme().len() >= 2)
}

/// `name/sub` -> (`name`, `sub`); `@scope/name/sub` -> (`@scope/name`, `sub`)
fn split_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    let name_end = if specifier.starts_with('@') {
        specifier
            .match_indices('/')
            .nth(1)
            .map(|(i, _)| i)
    } else {
        specifier.find('/')
    };
    match name_end {
        Some(i) => (&specifier[..i], Some(&specifier[i + 1..]).filter(|s| !s.is_empty())),
        None => (specifier, None),
    }
}

/// Canonical form of an existing path; lexical cleanup if that fails
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    })
}
