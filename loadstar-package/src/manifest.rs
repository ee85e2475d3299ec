//! Package manifest (package.json) model

use crate::{PackageError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Module system a package's plain `.js` files are written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ModuleType {
    /// `require`/`module.exports` modules (the default when `type` is absent)
    #[default]
    CommonJs,
    /// `import`/`export` modules (`"type": "module"`)
    Module,
}

/// The fields of a package manifest the loader cares about.
///
/// Unknown fields are ignored; every known field is optional so that partial
/// manifests still drive resolution as far as they can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Package version, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Raw `type` field (`"module"` or `"commonjs"`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Main entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,

    /// ESM entry point, only honored under the `import` condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Conditional/subpath exports map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<Value>,
}

impl PackageManifest {
    /// Load and validate a manifest file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|error| PackageError::Io {
            path: path.to_path_buf(),
            error,
        })?;

        Self::from_str(&content).map_err(|e| PackageError::InvalidManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Parse a manifest from a JSON string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests whose fields are present but unusable
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(PackageError::InvalidManifest {
                    path: PathBuf::new(),
                    message: "Package name cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The package's module type; anything other than `"module"` is CommonJS
    pub fn module_type(&self) -> ModuleType {
        match self.kind.as_deref() {
            Some("module") => ModuleType::Module,
            _ => ModuleType::CommonJs,
        }
    }

    /// The version parsed as semver, if it is one
    pub fn semver(&self) -> Option<semver::Version> {
        self.version
            .as_deref()
            .and_then(|v| semver::Version::parse(v).ok())
    }

    /// Entry point for the package root (`"."`) under the given conditions
    pub fn entry_point(&self, conditions: &[String]) -> Option<String> {
        if let Some(target) = self.resolve_export(".", conditions) {
            return Some(target);
        }
        if conditions.iter().any(|c| c == "import") {
            if let Some(module) = &self.module {
                return Some(module.clone());
            }
        }
        self.main.clone()
    }

    /// Look up `subpath` (`"."` or `"./x"`) in the `exports` field
    pub fn resolve_export(&self, subpath: &str, conditions: &[String]) -> Option<String> {
        let exports = self.exports.as_ref()?;
        match exports {
            Value::String(target) => (subpath == ".").then(|| target.clone()),
            Value::Object(map) if map.keys().any(|k| k.starts_with('.')) => map
                .get(subpath)
                .and_then(|target| resolve_target(target, conditions)),
            Value::Object(_) | Value::Array(_) if subpath == "." => {
                resolve_target(exports, conditions)
            }
            _ => None,
        }
    }
}

/// Resolve one exports target. Conditions are tried in the caller's order,
/// then `default`; `null` targets are explicit exclusions.
fn resolve_target(target: &Value, conditions: &[String]) -> Option<String> {
    match target {
        Value::String(path) => Some(path.clone()),
        Value::Array(items) => items.iter().find_map(|t| resolve_target(t, conditions)),
        Value::Object(map) => conditions
            .iter()
            .map(String::as_str)
            .chain(std::iter::once("default"))
            .find_map(|condition| {
                map.get(condition)
                    .and_then(|t| resolve_target(t, conditions))
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_manifest_parsing() {
        let json = r#"{
            "name": "test-package",
            "version": "1.2.3",
            "type": "module",
            "main": "lib/index.js",
            "dependencies": { "foo": "^1.0.0" }
        }"#;

        let manifest = PackageManifest::from_str(json).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("test-package"));
        assert_eq!(manifest.module_type(), ModuleType::Module);
        assert_eq!(manifest.semver(), Some(semver::Version::new(1, 2, 3)));
        assert_eq!(manifest.entry_point(&conds(&["require"])).as_deref(), Some("lib/index.js"));
    }

    #[test]
    fn test_malformed_manifest_is_error() {
        assert!(PackageManifest::from_str("{ not json").is_err());
        assert!(PackageManifest::from_str(r#"{"name": "  "}"#).is_err());
    }

    #[test]
    fn test_missing_type_defaults_to_commonjs() {
        let manifest = PackageManifest::from_str(r#"{"name": "plain", "version": "not-semver"}"#).unwrap();
        assert_eq!(manifest.module_type(), ModuleType::CommonJs);
        assert!(manifest.semver().is_none());
    }

    #[test]
    fn test_conditional_exports() {
        let manifest = PackageManifest::from_str(
            r#"{
                "name": "dual",
                "exports": {
                    ".": { "import": "./esm/index.mjs", "require": "./cjs/index.js" },
                    "./feature": "./lib/feature.js",
                    "./hidden": null
                }
            }"#,
        )
        .unwrap();

        assert_eq!(
            manifest.entry_point(&conds(&["import"])).as_deref(),
            Some("./esm/index.mjs")
        );
        assert_eq!(
            manifest.entry_point(&conds(&["require"])).as_deref(),
            Some("./cjs/index.js")
        );
        assert_eq!(
            manifest.resolve_export("./feature", &[]).as_deref(),
            Some("./lib/feature.js")
        );
        assert!(manifest.resolve_export("./hidden", &conds(&["require"])).is_none());
        assert!(manifest.resolve_export("./missing", &[]).is_none());
    }

    #[test]
    fn test_module_field_only_under_import() {
        let manifest = PackageManifest::from_str(
            r#"{"name": "m", "main": "main.js", "module": "module.mjs"}"#,
        )
        .unwrap();

        assert_eq!(manifest.entry_point(&conds(&["import"])).as_deref(), Some("module.mjs"));
        assert_eq!(manifest.entry_point(&conds(&["require"])).as_deref(), Some("main.js"));
    }

    #[test]
    fn test_string_exports_only_match_root() {
        let manifest = PackageManifest::from_str(r#"{"name": "s", "exports": "./only.js"}"#).unwrap();
        assert_eq!(manifest.resolve_export(".", &[]).as_deref(), Some("./only.js"));
        assert!(manifest.resolve_export("./other", &[]).is_none());
    }
}
