use loadstar_package::{ManifestFinder, ModuleType};
use std::fs;
use tempfile::TempDir;

fn write(root: &std::path::Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn test_nested_package_shadows_outer() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write(root, "package.json", r#"{"name": "outer", "type": "module"}"#);
    write(root, "vendor/inner/package.json", r#"{"name": "inner", "version": "0.3.1"}"#);
    write(root, "vendor/inner/lib/a.js", "");
    write(root, "src/b.js", "");

    let mut finder = ManifestFinder::default();

    let (path, inner) = finder.nearest(&root.join("vendor/inner/lib/a.js")).unwrap();
    assert_eq!(path, root.join("vendor/inner/package.json"));
    assert_eq!(inner.name.as_deref(), Some("inner"));
    assert_eq!(inner.module_type(), ModuleType::CommonJs);
    assert_eq!(inner.semver().unwrap().minor, 3);

    let (path, outer) = finder.nearest(&root.join("src/b.js")).unwrap();
    assert_eq!(path, root.join("package.json"));
    assert_eq!(outer.module_type(), ModuleType::Module);

    // Second lookup is answered from the memo
    let probes = finder.probe_count();
    finder.nearest(&root.join("src/b.js")).unwrap();
    assert_eq!(finder.probe_count(), probes);
}

#[test]
fn test_custom_manifest_name() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write(root, "package.json", r#"{"name": "ignored"}"#);
    write(root, "app/loadstar.json", r#"{"name": "app", "main": "start.js"}"#);

    let mut finder = ManifestFinder::new("loadstar.json");
    let (_, manifest) = finder.nearest(&root.join("app/start.js")).unwrap();
    assert_eq!(manifest.main.as_deref(), Some("start.js"));
    assert_eq!(finder.find_manifest(&root.join("other.js")), None);
}
