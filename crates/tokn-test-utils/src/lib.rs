//! Test doubles shared by the tokn crates.

pub mod fixtures;
pub mod flows;
pub mod transport;

pub use tokn_core::traits::StaticCredentials;
pub use transport::{Scripted, ScriptedTransport};

use std::path::PathBuf;

/// Write `content` to a `tokn.toml` inside a fresh temporary directory.
///
/// Keep the returned `TempDir` alive for as long as the file is needed.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("tokn.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}

/// Parse a TOML string into a config, panicking with the error on failure.
pub fn config_from(content: &str) -> tokn_core::config::AppConfig {
    tokn_core::config::AppConfig::from_toml(content).expect("valid test config")
}
