// tests/common/mod.rs

//! Shared test fixtures for integration tests.

use std::fs;
use std::path::{Path, PathBuf};
use stratum::BuildConfig;
use tempfile::TempDir;

/// Create a small Python project in a temp directory.
///
/// Returns (TempDir, context_dir) - keep the TempDir alive to prevent
/// cleanup.
pub fn setup_project() -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let context = temp_dir.path().join("project");

    fs::create_dir_all(context.join("src")).unwrap();
    fs::write(context.join("src/main.py"), "print('hello')\n").unwrap();
    fs::write(context.join("src/helpers.py"), "def helper():\n    return 1\n").unwrap();
    fs::write(
        context.join("pyproject.toml"),
        "[project]\nname = \"demo\"\nversion = \"0.1\"\n",
    )
    .unwrap();

    (temp_dir, context)
}

/// A scratch (no base image) build config against the fixture project.
pub fn scratch_config(context: &Path, output: &Path) -> BuildConfig {
    BuildConfig {
        tag: "localhost:5000/demo:v1".to_string(),
        context_dir: context.to_path_buf(),
        output_dir: output.to_path_buf(),
        entrypoint: Some(vec![
            "python".to_string(),
            "-m".to_string(),
            "app".to_string(),
        ]),
        use_cache: false,
        ..Default::default()
    }
}

/// Read and parse a JSON document from the output layout.
pub fn read_json(path: &Path) -> serde_json::Value {
    let data = fs::read(path).unwrap_or_else(|e| panic!("missing {}: {e}", path.display()));
    serde_json::from_slice(&data).unwrap_or_else(|e| panic!("bad JSON in {}: {e}", path.display()))
}

/// Path of a blob inside an output layout.
pub fn blob_path(output: &Path, digest: &str) -> PathBuf {
    output
        .join("blobs")
        .join("sha256")
        .join(digest.strip_prefix("sha256:").expect("digest prefix"))
}
