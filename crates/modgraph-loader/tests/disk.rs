//! Loading from disk: file fetching, manifests and configuration files

use std::fs;
use std::path::Path;

use modgraph_loader::{
    BuildError, FetchError, LoadError, Loader, LoaderConfig, ManifestError, Value,
};
use tempfile::TempDir;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_import_path_from_disk() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "src/main.mjs",
        "import { double } from './lib/math.js'; export const answer = double(21);",
    );
    write(
        temp.path(),
        "src/lib/math.js",
        "export function double(n) { return n * 2; }",
    );

    let loader = Loader::new();
    let namespace = loader
        .import_path(temp.path().join("src/main.mjs"))
        .await
        .unwrap();
    assert_eq!(namespace.get("answer"), Some(Value::from(42.0)));
    assert_eq!(loader.cache().len(), 2);
}

#[test]
fn test_import_path_without_runtime() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "main.js", "import d from './dep.js'; export const answer = d + 1;");
    write(temp.path(), "dep.js", "export default 41;");

    let loader = Loader::new();
    let namespace =
        futures::executor::block_on(loader.import_path(temp.path().join("main.js"))).unwrap();
    assert_eq!(namespace.get("answer"), Some(Value::from(42.0)));
}

#[tokio::test]
async fn test_builtin_host_modules_from_disk() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "main.js",
        "import { max, floor } from 'math'; export const biggest = floor(max(1, 5.5, 3));",
    );

    let loader = Loader::new();
    let namespace = loader
        .import_path(temp.path().join("main.js"))
        .await
        .unwrap();
    assert_eq!(namespace.get("biggest"), Some(Value::from(5.0)));
}

#[tokio::test]
async fn test_missing_file() {
    let temp = TempDir::new().unwrap();
    let loader = Loader::new();

    let err = loader
        .import_path(temp.path().join("absent.js"))
        .await
        .unwrap_err();
    match err {
        LoadError::Fetch(e) => assert!(matches!(*e, FetchError::NotFound { .. })),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_unknown_extension() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "notes.txt", "export default 1;");

    let err = Loader::new()
        .import_path(temp.path().join("notes.txt"))
        .await
        .unwrap_err();
    match err {
        LoadError::Fetch(e) => assert!(matches!(*e, FetchError::UnknownContentKind { .. })),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_manifest_dependencies_resolve() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "package.json",
        r#"{ "name": "app", "dependencies": { "greeting": "^1.0.0" } }"#,
    );
    write(
        temp.path(),
        "node_modules/greeting/package.json",
        r#"{ "name": "greeting", "main": "lib/greeting.js" }"#,
    );
    write(
        temp.path(),
        "node_modules/greeting/lib/greeting.js",
        "export default 'hello';",
    );
    write(
        temp.path(),
        "main.js",
        "import greeting from 'greeting'; export const message = greeting + ' world';",
    );

    let loader = Loader::builder()
        .manifest(temp.path().join("package.json"))
        .build()
        .unwrap();
    let namespace = loader
        .import_path(temp.path().join("main.js"))
        .await
        .unwrap();
    assert_eq!(
        namespace.get("message").unwrap().as_str(),
        Some("hello world")
    );
}

#[test]
fn test_manifest_with_missing_package() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "package.json",
        r#"{ "devDependencies": { "not-installed": "1" } }"#,
    );

    let err = Loader::builder()
        .manifest(temp.path().join("package.json"))
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        BuildError::Manifest(ManifestError::PackageNotFound { .. })
    ));
}

#[tokio::test]
async fn test_config_file() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "modgraph.toml",
        r#"
manifest = "package.json"
host_modules = false

[extensions]
".jsm" = "text/x-module"

[content_kinds]
"text/x-module" = "script-source"

[imports]
config = "file:///unused/config.js"
"#,
    );
    write(
        temp.path(),
        "package.json",
        r#"{ "dependencies": { "util": "1" } }"#,
    );
    write(temp.path(), "node_modules/util/package.json", "{}");
    write(
        temp.path(),
        "node_modules/util/index.js",
        "export const name = 'util';",
    );
    write(
        temp.path(),
        "main.jsm",
        "import { name } from 'util'; export const loaded = name;",
    );

    let loader = Loader::from_config_file(temp.path().join("modgraph.toml")).unwrap();
    assert!(loader.resolve("math", "file:///a.js").is_err());
    assert_eq!(
        loader.resolve("config", "file:///a.js").unwrap().as_str(),
        "file:///unused/config.js"
    );

    let namespace = loader
        .import_path(temp.path().join("main.jsm"))
        .await
        .unwrap();
    assert_eq!(namespace.get("loaded").unwrap().as_str(), Some("util"));
}

#[test]
fn test_config_rejects_unknown_keys() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "modgraph.toml", "[imports]\na = \"file:///a.js\"\n[cache]\nsize = 1\n");

    let err = Loader::from_config_file(temp.path().join("modgraph.toml"))
        .err()
        .unwrap();
    assert!(matches!(err, BuildError::Config(_)));

    assert!(LoaderConfig::from_str("timeout = 5").is_err());
}
