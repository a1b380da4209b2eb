// src/project.rs

//! Project inspection and file selection
//!
//! Pure functions over the context directory: which files go into the
//! application layer, what the default entrypoint is, and where
//! dependencies live on the host. No network, no side effects.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Candidate directories tried for the default include set, in order
const DEFAULT_INCLUDE_DIRS: [&str; 3] = ["src", "app", "package"];

/// Candidate top-level files tried for the default include set
const DEFAULT_INCLUDE_FILES: [&str; 3] = ["pyproject.toml", "requirements.txt", "setup.cfg"];

/// Virtual environment directory names probed for dependency discovery
const VENV_DIRS: [&str; 3] = ["venv", ".venv", "env"];

/// Default include paths for a context directory
///
/// The first existing subset of the well-known project entries; the whole
/// context when none of them exist.
pub fn default_include_paths(context_dir: &Path) -> Vec<String> {
    let mut paths = Vec::new();
    for name in DEFAULT_INCLUDE_DIRS {
        if context_dir.join(name).is_dir() {
            paths.push(name.to_string());
        }
    }
    for name in DEFAULT_INCLUDE_FILES {
        if context_dir.join(name).is_file() {
            paths.push(name.to_string());
        }
    }
    if paths.is_empty() {
        paths.push(".".to_string());
    }
    paths
}

/// Expand include paths to `(absolute, context-relative)` file pairs
///
/// Directories are walked recursively in file-name order so the selection
/// is stable across hosts; single files pass through unchanged.
pub fn collect_files(context_dir: &Path, include_paths: &[String]) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut files = Vec::new();

    for include in include_paths {
        let abs = context_dir.join(include);
        if abs.is_dir() {
            for entry in WalkDir::new(&abs).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    Error::IoError(format!("failed to walk {}: {e}", abs.display()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(context_dir)
                    .map_err(|e| {
                        Error::IoError(format!(
                            "path {} escapes context: {e}",
                            entry.path().display()
                        ))
                    })?
                    .to_path_buf();
                files.push((entry.path().to_path_buf(), rel));
            }
        } else if abs.is_file() {
            files.push((abs.clone(), PathBuf::from(include)));
        } else {
            debug!("include path {} does not exist, skipping", abs.display());
        }
    }

    Ok(files)
}

/// Default entrypoint for a project
///
/// Reads `[project.scripts]` from `pyproject.toml` and runs the first
/// script target as a module when it is a plain module path. Falls back
/// to `python -m app`.
pub fn detect_entrypoint(context_dir: &Path) -> Vec<String> {
    let fallback = vec!["python".to_string(), "-m".to_string(), "app".to_string()];

    let pyproject = context_dir.join("pyproject.toml");
    let Ok(text) = std::fs::read_to_string(&pyproject) else {
        return fallback;
    };
    let Ok(doc) = text.parse::<toml::Table>() else {
        return fallback;
    };

    let target = doc
        .get("project")
        .and_then(|p| p.get("scripts"))
        .and_then(|s| s.as_table())
        .and_then(|scripts| scripts.values().next())
        .and_then(|v| v.as_str());

    match target {
        // `module:function` targets need an installed console script; only
        // plain module paths are runnable with -m
        Some(module) if !module.contains(':') => {
            vec!["python".to_string(), "-m".to_string(), module.to_string()]
        }
        _ => fallback,
    }
}

/// Discover dependency files for the dependency layer
///
/// Prefers a populated virtual environment (`site-packages` files under
/// `venv|.venv|env`); falls back to the requirements manifest alone.
pub fn find_dependencies(
    context_dir: &Path,
    requirements_file: &str,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut deps = Vec::new();

    for venv in VENV_DIRS {
        let lib_dir = context_dir.join(venv).join("lib");
        if !lib_dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&lib_dir).sort_by_file_name() {
            let entry = entry
                .map_err(|e| Error::IoError(format!("failed to walk {}: {e}", lib_dir.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.path().components().any(|c| c.as_os_str() == "site-packages") {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(context_dir)
                .map_err(|e| {
                    Error::IoError(format!("path {} escapes context: {e}", entry.path().display()))
                })?
                .to_path_buf();
            deps.push((entry.path().to_path_buf(), rel));
        }
        break;
    }

    if deps.is_empty() {
        let req = context_dir.join(requirements_file);
        if req.is_file() {
            deps.push((req, PathBuf::from(requirements_file)));
        }
    }

    Ok(deps)
}
