// src/progress.rs

//! Build progress observation
//!
//! The builder reports what it is doing through a `BuildObserver` instead
//! of printing; callers pick an implementation per output mode. All
//! methods default to no-ops so observers implement only what they show.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Receiver for build and push lifecycle events
pub trait BuildObserver {
    fn pull_layer_start(&self, _index: usize, _total: usize, _digest: &str) {}
    fn pull_layer_done(&self, _index: usize, _total: usize, _digest: &str) {}
    fn push_layer_start(&self, _index: usize, _total: usize, _digest: &str) {}
    fn push_layer_skipped(&self, _index: usize, _total: usize, _digest: &str) {}
    fn push_manifest(&self, _reference: &str, _digest: &str) {}
    fn build_done(&self, _tag: &str, _manifest_digest: &str) {}
}

/// No-op observer for embedding and tests
#[derive(Debug, Default)]
pub struct SilentObserver;

impl BuildObserver for SilentObserver {}

/// Observer that forwards events to tracing
#[derive(Debug, Default)]
pub struct LogObserver;

impl BuildObserver for LogObserver {
    fn pull_layer_start(&self, index: usize, total: usize, digest: &str) {
        info!("pulling layer {}/{} ({})", index, total, short(digest));
    }

    fn push_layer_start(&self, index: usize, total: usize, digest: &str) {
        info!("pushing layer {}/{} ({})", index, total, short(digest));
    }

    fn push_layer_skipped(&self, index: usize, total: usize, digest: &str) {
        info!("layer {}/{} already present ({})", index, total, short(digest));
    }

    fn push_manifest(&self, reference: &str, digest: &str) {
        info!("pushing manifest {} ({})", reference, short(digest));
    }

    fn build_done(&self, tag: &str, manifest_digest: &str) {
        info!("built {} ({})", tag, short(manifest_digest));
    }
}

/// Interactive observer with a spinner per in-flight transfer
pub struct CliObserver {
    active: Mutex<Option<ProgressBar>>,
}

impl CliObserver {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    fn start_spinner(&self, message: String) {
        let bar = ProgressBar::new_spinner().with_message(message);
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .expect("Invalid spinner template"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut active) = self.active.lock() {
            if let Some(previous) = active.take() {
                previous.finish_and_clear();
            }
            *active = Some(bar);
        }
    }

    fn finish(&self, message: String) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(bar) = active.take() {
                bar.finish_with_message(message);
            } else {
                println!("{message}");
            }
        }
    }
}

impl Default for CliObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildObserver for CliObserver {
    fn pull_layer_start(&self, index: usize, total: usize, digest: &str) {
        self.start_spinner(format!("pulling layer {index}/{total} ({})", short(digest)));
    }

    fn pull_layer_done(&self, index: usize, total: usize, digest: &str) {
        self.finish(format!("pulled layer {index}/{total} ({})", short(digest)));
    }

    fn push_layer_start(&self, index: usize, total: usize, digest: &str) {
        self.start_spinner(format!("pushing layer {index}/{total} ({})", short(digest)));
    }

    fn push_layer_skipped(&self, index: usize, total: usize, digest: &str) {
        self.finish(format!(
            "layer {index}/{total} already present ({})",
            short(digest)
        ));
    }

    fn push_manifest(&self, reference: &str, digest: &str) {
        self.finish(format!("pushing manifest {reference} ({})", short(digest)));
    }

    fn build_done(&self, tag: &str, manifest_digest: &str) {
        self.finish(format!("built {tag} ({})", short(manifest_digest)));
    }
}

/// Abbreviate a digest for display
fn short(digest: &str) -> &str {
    digest.get(..19).unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest() {
        assert_eq!(short("sha256:0123456789abcdef"), "sha256:0123456789ab");
        assert_eq!(short("short"), "short");
    }

    #[test]
    fn test_silent_observer_accepts_all_events() {
        let observer = SilentObserver;
        observer.pull_layer_start(1, 2, "sha256:abc");
        observer.pull_layer_done(1, 2, "sha256:abc");
        observer.push_layer_start(1, 2, "sha256:abc");
        observer.push_layer_skipped(1, 2, "sha256:abc");
        observer.push_manifest("tag", "sha256:abc");
        observer.build_done("tag", "sha256:abc");
    }
}
