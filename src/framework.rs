// src/framework.rs

//! Web framework detection
//!
//! Scans the context tree for well-known framework imports and fills
//! build-config fields that the user left unset: entrypoint, exposed
//! ports, and a `framework` label. A configured value always wins over a
//! detected one.

use crate::config::BuildConfig;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;
use walkdir::WalkDir;

/// A detected framework and the defaults it implies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkHints {
    pub name: &'static str,
    pub entrypoint: Vec<String>,
    pub exposed_ports: Vec<u16>,
}

/// Detect the web framework used by a project, if any
pub fn detect_framework(context_dir: &Path) -> Option<FrameworkHints> {
    detect_fastapi(context_dir)
        .or_else(|| detect_flask(context_dir))
        .or_else(|| detect_django(context_dir))
}

/// Fill unset config fields from framework detection
///
/// Each field is only touched when the user did not set it; in
/// particular the `framework` label never overwrites an existing one.
pub fn apply_framework_hints(config: &mut BuildConfig) {
    let Some(hints) = detect_framework(&config.context_dir) else {
        return;
    };
    debug!("detected {} project", hints.name);

    if config.entrypoint.is_none() {
        config.entrypoint = Some(hints.entrypoint);
    }
    if config.exposed_ports.is_empty() {
        config.exposed_ports = hints.exposed_ports;
    }
    if !config.labels.contains_key("framework") {
        config
            .labels
            .insert("framework".to_string(), hints.name.to_lowercase());
    }
}

fn python_sources(context_dir: &Path) -> impl Iterator<Item = std::path::PathBuf> {
    WalkDir::new(context_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "py"))
}

fn detect_fastapi(context_dir: &Path) -> Option<FrameworkHints> {
    static APP_VAR: OnceLock<Regex> = OnceLock::new();
    let app_var = APP_VAR.get_or_init(|| Regex::new(r"(\w+)\s*=\s*FastAPI\(").unwrap());

    for path in python_sources(context_dir) {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if !content.contains("from fastapi import") || !content.contains("FastAPI") {
            continue;
        }

        // uvicorn wants `package.module:variable`
        let variable = app_var
            .captures(&content)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "app".to_string());
        let module = path
            .strip_prefix(context_dir)
            .ok()?
            .with_extension("")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(".");

        return Some(FrameworkHints {
            name: "FastAPI",
            entrypoint: vec![
                "uvicorn".to_string(),
                format!("{module}:{variable}"),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
            exposed_ports: vec![8000],
        });
    }
    None
}

fn detect_flask(context_dir: &Path) -> Option<FrameworkHints> {
    for path in python_sources(context_dir) {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if content.contains("from flask import") && content.contains("Flask") {
            return Some(FrameworkHints {
                name: "Flask",
                entrypoint: vec![
                    "flask".to_string(),
                    "run".to_string(),
                    "--host=0.0.0.0".to_string(),
                    "--port=5000".to_string(),
                ],
                exposed_ports: vec![5000],
            });
        }
    }
    None
}

fn detect_django(context_dir: &Path) -> Option<FrameworkHints> {
    let manage = context_dir.join("manage.py");
    let content = std::fs::read_to_string(manage).ok()?;
    if !content.to_lowercase().contains("django") {
        return None;
    }
    Some(FrameworkHints {
        name: "Django",
        entrypoint: vec![
            "python".to_string(),
            "manage.py".to_string(),
            "runserver".to_string(),
            "0.0.0.0:8000".to_string(),
        ],
        exposed_ports: vec![8000],
    })
}
