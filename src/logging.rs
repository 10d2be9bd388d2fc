// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub(crate) const LOG_ENV: &str = "ASK_AI_LOG";

const DEFAULT_LEVEL: &str = "info";

fn build_filter(env_value: Option<String>, configured: Option<&str>) -> EnvFilter {
    env_value
        .as_deref()
        .into_iter()
        .chain(configured)
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LEVEL))
}

/// Send tracing output to `path`. The terminal belongs to the TUI, so
/// nothing is written to stdout or stderr. Returns false if the log file
/// could not be opened, in which case logging stays off.
pub(crate) fn init(path: &Path, level: Option<&str>) -> bool {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && fs::create_dir_all(parent).is_err()
    {
        return false;
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(path) else {
        return false;
    };

    let filter = build_filter(std::env::var(LOG_ENV).ok(), level);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .is_ok()
}
